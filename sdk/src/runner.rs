//! Module host runner: the part of a module process that speaks the wire
//! protocol and drives the module through its lifecycle.
//!
//! Module code runs on blocking tasks, so a slow `handle` never stalls frame
//! reading and a panic inside the module becomes an error reply instead of
//! taking the process down.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};

use crate::module::{InitContext, Module, ModuleLogger, SettingsSaver};
use crate::protocol::{
    FailureStage, HostCall, HostFrame, InitParams, ModuleFrame, Outcome, RemoteError, ReplyBody,
};
use crate::registry::ModuleRegistry;

/// Entry point for a module binary. Returns when the host closes stdin.
pub fn serve(registry: ModuleRegistry) -> ExitCode {
    // stdout는 프로토콜 전용, 모듈 로그는 stderr로
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to start module runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(registry, tokio::io::stdin(), tokio::io::stdout())) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("Module runner stopped: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Shortcut for binaries that carry exactly one module.
pub fn serve_module<M: Module + Default>(type_name: &str) -> ExitCode {
    serve(ModuleRegistry::new().register::<M>(type_name))
}

struct Runner {
    registry: ModuleRegistry,
    module: Option<Arc<dyn Module>>,
    shut_down: Arc<AtomicBool>,
    out: mpsc::UnboundedSender<ModuleFrame>,
}

/// Run the protocol loop over arbitrary streams.
pub async fn run<R, W>(registry: ModuleRegistry, input: R, output: W) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, out_rx) = mpsc::unbounded_channel::<ModuleFrame>();
    let (finish_tx, finish_rx) = oneshot::channel::<()>();
    let writer = tokio::spawn(write_frames(output, out_rx, finish_rx));

    let mut runner = Runner {
        registry,
        module: None,
        shut_down: Arc::new(AtomicBool::new(false)),
        out: out_tx,
    };

    let mut lines = BufReader::new(input).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<HostFrame>(&line) {
            Ok(frame) => runner.dispatch(frame).await,
            Err(e) => {
                tracing::warn!("Unreadable frame from host: {}", e);
                // id만이라도 읽히면 에러로 응답
                if let Some(id) = serde_json::from_str::<serde_json::Value>(&line)
                    .ok()
                    .and_then(|v| v.get("id").and_then(|id| id.as_u64()))
                {
                    runner.reply_err(id, RemoteError::new(FailureStage::Protocol, e.to_string()));
                }
            }
        }
    }

    // stdin EOF: 호스트가 경계를 정리하는 중. 아직 shutdown 안 했으면 여기서.
    runner.shutdown_module().await;
    drop(runner);
    let _ = finish_tx.send(());
    writer.await??;
    Ok(())
}

async fn write_frames<W>(
    mut output: W,
    mut rx: mpsc::UnboundedReceiver<ModuleFrame>,
    mut finish: oneshot::Receiver<()>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;
            frame = rx.recv() => match frame {
                Some(frame) => write_frame(&mut output, &frame).await?,
                None => break,
            },
            _ = &mut finish => {
                while let Ok(frame) = rx.try_recv() {
                    write_frame(&mut output, &frame).await?;
                }
                break;
            }
        }
    }
    output.flush().await?;
    Ok(())
}

async fn write_frame<W: AsyncWrite + Unpin>(output: &mut W, frame: &ModuleFrame) -> Result<()> {
    let mut line = serde_json::to_vec(frame)?;
    line.push(b'\n');
    output.write_all(&line).await?;
    output.flush().await?;
    Ok(())
}

impl Runner {
    async fn dispatch(&mut self, frame: HostFrame) {
        let id = frame.id;
        match frame.call {
            HostCall::Init(params) => {
                let outcome = self.init(params).await;
                self.reply(id, outcome);
            }
            HostCall::Shutdown => {
                self.shutdown_module().await;
                self.reply(id, Outcome::Ok(ReplyBody::Done));
            }
            call => {
                let module = match self.live_module(call.label()) {
                    Ok(m) => m,
                    Err(e) => return self.reply_err(id, e),
                };
                let out = self.out.clone();
                tokio::spawn(async move {
                    let outcome = call_module(module, call).await;
                    let _ = out.send(ModuleFrame::Reply { id, outcome });
                });
            }
        }
    }

    fn live_module(&self, call: &str) -> Result<Arc<dyn Module>, RemoteError> {
        let stage = if call == "handle" {
            FailureStage::Handle
        } else {
            FailureStage::Protocol
        };
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(RemoteError::new(stage, format!("{} called after shutdown", call)));
        }
        self.module
            .clone()
            .ok_or_else(|| RemoteError::new(stage, format!("{} called before init", call)))
    }

    async fn init(&mut self, params: InitParams) -> Outcome {
        if self.module.is_some() {
            return Outcome::Err(RemoteError::new(FailureStage::Init, "init called more than once"));
        }

        let registration = match self.registry.resolve(params.module_type.as_deref()) {
            Ok(r) => r,
            Err(e) => return Outcome::Err(RemoteError::new(FailureStage::NameResolution, e.to_string())),
        };
        let module_type = registration.type_name().to_string();

        let mut module = match registration.construct() {
            Ok(m) => m,
            Err(e) => return Outcome::Err(RemoteError::from_anyhow(FailureStage::Construction, &e)),
        };

        let ctx = InitContext {
            name: params.name.clone(),
            settings: params.settings,
            saver: SettingsSaver::new(self.out.clone()),
            log: ModuleLogger::new(self.out.clone()),
            binary_path: PathBuf::from(params.binary_path),
            original_binary_path: PathBuf::from(params.original_binary_path),
        };

        let joined = tokio::task::spawn_blocking(move || {
            let result = module.init(ctx);
            (module, result)
        })
        .await;

        match joined {
            Ok((module, Ok(()))) => {
                let module: Arc<dyn Module> = Arc::from(module);
                let module_name = module.name();
                tracing::info!("Module '{}' ({}) initialized as '{}'", params.name, module_type, module_name);
                self.module = Some(module);
                Outcome::Ok(ReplyBody::Ready {
                    module_name,
                    module_type,
                })
            }
            Ok((_, Err(e))) => Outcome::Err(RemoteError::from_anyhow(FailureStage::Init, &e)),
            Err(join) => Outcome::Err(RemoteError::new(FailureStage::Init, panic_message(join))),
        }
    }

    async fn shutdown_module(&mut self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(module) = self.module.clone() {
            if let Err(join) = tokio::task::spawn_blocking(move || module.shutdown()).await {
                tracing::error!("Module shutdown failed: {}", panic_message(join));
            }
        }
    }

    fn reply(&self, id: u64, outcome: Outcome) {
        let _ = self.out.send(ModuleFrame::Reply { id, outcome });
    }

    fn reply_err(&self, id: u64, err: RemoteError) {
        self.reply(id, Outcome::Err(err));
    }
}

async fn call_module(module: Arc<dyn Module>, call: HostCall) -> Outcome {
    let stage = if matches!(call, HostCall::Handle(_)) {
        FailureStage::Handle
    } else {
        FailureStage::Protocol
    };
    let joined = tokio::task::spawn_blocking(move || match call {
        HostCall::Handle(req) => module.handle(req).map(ReplyBody::Response),
        HostCall::FileFilters => Ok(ReplyBody::FileFilters {
            filters: module.file_filters_to_monitor(),
        }),
        HostCall::MustReinitialize => Ok(ReplyBody::Flag {
            value: module.must_reinitialize(),
        }),
        other => Err(anyhow::anyhow!("unexpected call '{}'", other.label())),
    })
    .await;

    match joined {
        Ok(Ok(body)) => Outcome::Ok(body),
        Ok(Err(e)) => Outcome::Err(RemoteError::from_anyhow(stage, &e)),
        Err(join) => Outcome::Err(RemoteError::new(stage, panic_message(join))),
    }
}

fn panic_message(err: tokio::task::JoinError) -> String {
    if !err.is_panic() {
        return format!("module task cancelled: {}", err);
    }
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("module panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("module panicked: {}", s)
    } else {
        "module panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{Request, RequestUrl, Response};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    static SHUTDOWNS: AtomicUsize = AtomicUsize::new(0);

    #[derive(Default)]
    struct Shouty {
        greeting: String,
    }

    impl Module for Shouty {
        fn name(&self) -> String {
            "Shouty".into()
        }
        fn init(&mut self, ctx: InitContext) -> anyhow::Result<()> {
            self.greeting = ctx.settings["greeting"].as_str().unwrap_or("hi").to_string();
            ctx.saver.save_value(json!({"greeting": self.greeting}));
            Ok(())
        }
        fn handle(&self, req: Request) -> anyhow::Result<Response> {
            if req.url.path == "/panic" {
                panic!("boom");
            }
            if req.url.path == "/fail" {
                anyhow::bail!("no such thing");
            }
            Ok(Response::text(self.greeting.to_uppercase()))
        }
        fn file_filters_to_monitor(&self) -> Vec<String> {
            vec!["/srv/shouty/*.txt".into()]
        }
        fn shutdown(&self) {
            SHUTDOWNS.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn handle_frame(id: u64, path: &str) -> String {
        let frame = HostFrame {
            id,
            call: HostCall::Handle(Request {
                method: "GET".into(),
                url: RequestUrl {
                    path: path.into(),
                    ..Default::default()
                },
                ..Default::default()
            }),
        };
        serde_json::to_string(&frame).unwrap()
    }

    #[tokio::test]
    async fn lifecycle_over_streams() {
        let (mut host_in, module_out) = tokio::io::duplex(64 * 1024);
        let (module_in, host_out) = tokio::io::duplex(64 * 1024);
        let registry = ModuleRegistry::new().register::<Shouty>("Shouty");
        let task = tokio::spawn(run(registry, module_in, module_out));

        let mut host_out = host_out;
        let init = HostFrame {
            id: 1,
            call: HostCall::Init(InitParams {
                name: "shout".into(),
                module_type: None,
                binary_path: "/tmp/x".into(),
                original_binary_path: "/opt/x".into(),
                settings: json!({"greeting": "hello"}),
            }),
        };
        let mut script = String::new();
        script.push_str(&serde_json::to_string(&init).unwrap());
        script.push('\n');
        for (id, path) in [(2, "/"), (3, "/fail"), (4, "/panic")] {
            script.push_str(&handle_frame(id, path));
            script.push('\n');
        }
        script.push_str(&serde_json::to_string(&HostFrame { id: 5, call: HostCall::FileFilters }).unwrap());
        script.push('\n');
        host_out.write_all(script.as_bytes()).await.unwrap();

        let mut lines = BufReader::new(&mut host_in).lines();
        let mut replies = std::collections::HashMap::new();
        let mut saved = None;
        while replies.len() < 5 {
            let line = lines.next_line().await.unwrap().unwrap();
            match serde_json::from_str::<ModuleFrame>(&line).unwrap() {
                ModuleFrame::Reply { id, outcome } => {
                    replies.insert(id, outcome);
                }
                ModuleFrame::SaveSettings { settings } => saved = Some(settings),
                ModuleFrame::Log { .. } => {}
            }
        }

        assert!(matches!(
            replies.get(&1),
            Some(Outcome::Ok(ReplyBody::Ready { module_name, .. })) if module_name == "Shouty"
        ));
        assert_eq!(saved, Some(json!({"greeting": "hello"})));
        match replies.get(&2) {
            Some(Outcome::Ok(ReplyBody::Response(resp))) => assert_eq!(resp.body, b"HELLO".to_vec()),
            other => panic!("unexpected reply: {:?}", other),
        }
        match replies.get(&3) {
            Some(Outcome::Err(e)) => {
                assert_eq!(e.stage, FailureStage::Handle);
                assert_eq!(e.message, "no such thing");
            }
            other => panic!("unexpected reply: {:?}", other),
        }
        match replies.get(&4) {
            Some(Outcome::Err(e)) => assert!(e.message.contains("boom")),
            other => panic!("unexpected reply: {:?}", other),
        }
        match replies.get(&5) {
            Some(Outcome::Ok(ReplyBody::FileFilters { filters })) => {
                assert_eq!(filters, &vec!["/srv/shouty/*.txt".to_string()])
            }
            other => panic!("unexpected reply: {:?}", other),
        }

        // closing stdin triggers the controlled shutdown
        let before = SHUTDOWNS.load(Ordering::SeqCst);
        drop(host_out);
        task.await.unwrap().unwrap();
        assert_eq!(SHUTDOWNS.load(Ordering::SeqCst), before + 1);
    }

    #[tokio::test]
    async fn calls_before_init_are_rejected() {
        let (mut host_in, module_out) = tokio::io::duplex(16 * 1024);
        let (module_in, mut host_out) = tokio::io::duplex(16 * 1024);
        let task = tokio::spawn(run(ModuleRegistry::new(), module_in, module_out));

        host_out
            .write_all(format!("{}\n", handle_frame(9, "/")).as_bytes())
            .await
            .unwrap();
        let mut lines = BufReader::new(&mut host_in).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        match serde_json::from_str::<ModuleFrame>(&line).unwrap() {
            ModuleFrame::Reply { id: 9, outcome: Outcome::Err(e) } => {
                assert!(e.message.contains("before init"));
            }
            other => panic!("unexpected frame: {:?}", other),
        }
        drop(host_out);
        task.await.unwrap().unwrap();
    }
}
