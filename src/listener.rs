//! Network endpoints. Each one is an axum server whose only handler is a
//! fallback that dispatches through the current routing table.

use std::net::SocketAddr;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use switchyard_sdk::{Request as ModuleRequest, RequestUrl, Response as ModuleResponse};

use crate::error::EngineError;
use crate::resolver::{self, RequestTarget, SharedRoutes};
use crate::settings::EndpointConfig;

#[derive(Clone)]
struct DispatchState {
    routes: SharedRoutes,
    secure: bool,
    port: u16,
    max_body: usize,
}

pub struct Listener {
    endpoint: EndpointConfig,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Listener {
    /// Bind the endpoint and start serving. A bind failure leaves the
    /// endpoint disabled; the caller decides whether that is fatal.
    pub async fn start(endpoint: EndpointConfig, routes: SharedRoutes, max_body: usize) -> Result<Self, EngineError> {
        Self::start_within(endpoint, routes, max_body, Duration::ZERO).await
    }

    /// Like [`Listener::start`], but while the address is still held (by a
    /// listener that was just closed) keep retrying for up to `retry_for`.
    pub async fn start_within(
        endpoint: EndpointConfig,
        routes: SharedRoutes,
        max_body: usize,
        retry_for: Duration,
    ) -> Result<Self, EngineError> {
        let tcp = bind(endpoint, retry_for).await?;
        let local_addr = tcp.local_addr().map_err(|source| EngineError::EndpointBind {
            addr: endpoint.addr().to_string(),
            source,
        })?;

        let state = DispatchState {
            routes,
            secure: endpoint.secure,
            port: local_addr.port(),
            max_body,
        };
        let router = Router::new()
            .fallback(dispatch)
            .with_state(state)
            .layer(TraceLayer::new_for_http());

        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        let task = tokio::spawn(async move {
            let served = axum::serve(tcp, router.into_make_service_with_connect_info::<SocketAddr>())
                .with_graceful_shutdown(async move { stop.cancelled().await })
                .await;
            if let Err(e) = served {
                tracing::error!("Endpoint {} stopped with error: {}", endpoint, e);
            }
        });

        tracing::info!("Listening on {}", endpoint);
        Ok(Self {
            endpoint,
            local_addr,
            cancel,
            task,
        })
    }

    pub fn endpoint(&self) -> EndpointConfig {
        self.endpoint
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting new connections without waiting. Open requests keep
    /// draining; `stop` still has to be called.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Stop accepting and wait up to `bound` for open requests to finish.
    /// Past the bound the server is aborted when `force` is set, otherwise
    /// it is left to drain on its own.
    pub async fn stop(mut self, bound: Duration, force: bool) {
        self.cancel.cancel();
        match tokio::time::timeout(bound, &mut self.task).await {
            Ok(_) => tracing::info!("Endpoint {} stopped", self.endpoint),
            Err(_) if force => {
                tracing::warn!("Endpoint {} did not drain within {:?}, closing it", self.endpoint, bound);
                self.task.abort();
            }
            Err(_) => {
                tracing::info!("Endpoint {} closed for new connections, still draining", self.endpoint);
            }
        }
    }
}

async fn bind(endpoint: EndpointConfig, retry_for: Duration) -> Result<tokio::net::TcpListener, EngineError> {
    let deadline = tokio::time::Instant::now() + retry_for;
    loop {
        match tokio::net::TcpListener::bind(endpoint.addr()).await {
            Ok(tcp) => return Ok(tcp),
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && tokio::time::Instant::now() < deadline => {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Err(source) => {
                return Err(EngineError::EndpointBind {
                    addr: endpoint.addr().to_string(),
                    source,
                })
            }
        }
    }
}

async fn dispatch(
    State(state): State<DispatchState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    req: axum::extract::Request,
) -> Response {
    let (parts, body) = req.into_parts();

    let host = request_host(&parts);
    let path = parts.uri.path().to_string();
    let target = RequestTarget {
        https: state.secure,
        host: &host,
        port: state.port,
        path: &path,
    };

    let Some(routed) = resolver::route(&state.routes, &target) else {
        tracing::debug!("No hook for {}{}", host, path);
        return EngineError::NoModuleForUrl(path).into_response();
    };

    let body = match axum::body::to_bytes(body, state.max_body).await {
        Ok(bytes) => bytes.to_vec(),
        Err(e) => {
            tracing::warn!("Rejected request body for {} from {}: {}", path, remote, e);
            return StatusCode::PAYLOAD_TOO_LARGE.into_response();
        }
    };

    let url = RequestUrl {
        https: state.secure,
        host: host.clone(),
        port: state.port,
        path: path.clone(),
        query: parts.uri.query().map(str::to_string),
        base_path: routed.hook.base_path.clone(),
        sub_path: routed.hook.sub_path.clone(),
    };
    let request = ModuleRequest {
        method: parts.method.as_str().to_string(),
        url: url.clone(),
        headers: parts
            .headers
            .iter()
            .map(|(k, v)| (k.as_str().to_string(), String::from_utf8_lossy(v.as_bytes()).into_owned()))
            .collect(),
        remote_addr: Some(remote.to_string()),
        body,
    };

    let boundary = routed.guard.boundary();
    let response = match boundary.handle(request).await {
        Ok(resp) => into_http(resp).unwrap_or_else(|e| {
            tracing::error!(
                "[{}] Response for {} from {} could not be produced: {}",
                boundary.name(),
                url.to_url_string(),
                remote,
                e
            );
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }),
        Err(e) => {
            let err = EngineError::RequestHandling {
                url: url.to_url_string(),
                remote: remote.to_string(),
                message: e.to_string(),
            };
            tracing::error!("[{}] {}", boundary.name(), err);
            err.into_response()
        }
    };
    drop(routed);
    response
}

/// Host header (or absolute-form authority) without the port, lowercased.
fn request_host(parts: &axum::http::request::Parts) -> String {
    let raw = parts
        .headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| parts.uri.host())
        .unwrap_or("");
    strip_port(raw).to_ascii_lowercase()
}

fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        // [v6]:port
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

fn into_http(resp: ModuleResponse) -> Result<Response, axum::http::Error> {
    let mut builder = axum::http::Response::builder().status(resp.status);
    for (name, value) in resp.headers {
        builder = builder.header(name, value);
    }
    builder.body(Body::from(resp.body))
}
