//! Isolation boundaries: one module instance in its own process, running from
//! its own staged copy of the binary.

pub mod proxy;
pub mod staging;
pub mod state_machine;
pub mod watch;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use switchyard_sdk::protocol::InitParams;
use switchyard_sdk::{FailureStage, Request, Response};

use crate::error::EngineError;
use crate::settings::{HookConfig, ModuleConfig};
use proxy::{ModuleProxy, ProxyError, SaveSink};
use state_machine::{State, StateMachine, TransitionError};
use watch::FileWatchers;

static NEXT_BOUNDARY_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone)]
pub struct BoundaryOptions {
    /// Limit for init / shutdown / poll calls into the module
    pub call_timeout: Duration,
    /// How long a disposed module may take to exit on its own
    pub dispose_wait: Duration,
}

impl Default for BoundaryOptions {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(120),
            dispose_wait: Duration::from_secs(5),
        }
    }
}

pub struct Boundary {
    id: u64,
    config: ModuleConfig,
    module_name: String,
    module_type: String,
    staging_dir: PathBuf,
    proxy: ModuleProxy,
    watchers: Mutex<FileWatchers>,
    in_flight: AtomicUsize,
    state: Mutex<StateMachine>,
    shut_down: AtomicBool,
    options: BoundaryOptions,
}

impl std::fmt::Debug for Boundary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Boundary")
            .field("id", &self.id)
            .field("name", &self.config.name)
            .field("module_name", &self.module_name)
            .field("state", &self.state())
            .finish()
    }
}

/// Build a boundary for `config`: stage the binary, start the module process,
/// run its `init`, then start watching for changes. The result is `Created`;
/// nothing is routed to it until the caller activates it.
pub async fn create(
    config: &ModuleConfig,
    staging_root: &Path,
    on_save: SaveSink,
    options: &BoundaryOptions,
) -> Result<Boundary, EngineError> {
    let id = NEXT_BOUNDARY_ID.fetch_add(1, Ordering::SeqCst);
    let name = config.name.as_str();
    let staging_dir = staging::allocate(staging_root)?;

    let staged = match staging::stage_binary(&config.binary, &staging_dir) {
        Ok(p) => p,
        Err(e) => {
            staging::remove(&staging_dir);
            return Err(construction_error(name, "failed to stage module binary", e.chain().map(|c| c.to_string()).collect()));
        }
    };

    let proxy = match ModuleProxy::spawn(&staged, &staging_dir, name, on_save) {
        Ok(p) => p,
        Err(e) => {
            staging::remove(&staging_dir);
            return Err(construction_error(name, "failed to start module process", vec![e.to_string()]));
        }
    };

    let params = InitParams {
        name: name.to_string(),
        module_type: config.module_type.clone(),
        binary_path: staged.display().to_string(),
        original_binary_path: config.binary.display().to_string(),
        settings: config.settings.clone(),
    };
    let ready = match proxy.init(params, options.call_timeout).await {
        Ok(ready) => ready,
        Err(e) => {
            proxy.terminate(options.dispose_wait).await;
            staging::remove(&staging_dir);
            return Err(match e {
                ProxyError::Remote(remote) => EngineError::module_init(name, &remote),
                other => EngineError::ModuleInitialization {
                    module: name.to_string(),
                    stage: FailureStage::Init,
                    message: other.to_string(),
                    causes: Vec::new(),
                },
            });
        }
    };

    let mut filters = match proxy.file_filters(options.call_timeout).await {
        Ok(filters) => filters,
        Err(e) => {
            tracing::warn!("[{}] Could not read monitor filters from module: {}", name, e);
            Vec::new()
        }
    };
    filters.extend(config.monitor.iter().cloned());
    let binary_dir = config
        .binary
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let watchers = FileWatchers::start(binary_dir, &filters, name);

    tracing::info!(
        "Boundary #{} created for '{}' ({} / {}) in {}",
        id,
        name,
        ready.module_name,
        ready.module_type,
        staging_dir.display()
    );

    Ok(Boundary {
        id,
        config: config.clone(),
        module_name: ready.module_name,
        module_type: ready.module_type,
        staging_dir,
        proxy,
        watchers: Mutex::new(watchers),
        in_flight: AtomicUsize::new(0),
        state: Mutex::new(StateMachine::new()),
        shut_down: AtomicBool::new(false),
        options: options.clone(),
    })
}

fn construction_error(module: &str, message: &str, causes: Vec<String>) -> EngineError {
    EngineError::ModuleInitialization {
        module: module.to_string(),
        stage: FailureStage::Construction,
        message: message.to_string(),
        causes,
    }
}

impl Boundary {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Configured instance name
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Name the module reported for itself
    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    pub fn module_type(&self) -> &str {
        &self.module_type
    }

    pub fn config(&self) -> &ModuleConfig {
        &self.config
    }

    pub fn hooks(&self) -> &[HookConfig] {
        &self.config.hooks
    }

    pub fn state(&self) -> State {
        self.state.lock().map(|s| s.state).unwrap_or(State::Disposed)
    }

    fn transition(&self, to: State) -> Result<(), TransitionError> {
        match self.state.lock() {
            Ok(mut sm) => sm.transition(to),
            Err(poisoned) => poisoned.into_inner().transition(to),
        }
    }

    pub fn activate(&self) -> Result<(), TransitionError> {
        self.transition(State::Active)
    }

    pub fn retire(&self) -> Result<(), TransitionError> {
        self.transition(State::Retiring)
    }

    /// OS process id of the module, while it runs.
    pub fn pid(&self) -> Option<u32> {
        self.proxy.pid()
    }

    pub fn is_alive(&self) -> bool {
        self.proxy.is_alive()
    }

    /// Count a request against this boundary until the guard is dropped.
    pub fn enter(self: &Arc<Self>) -> RequestGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        RequestGuard {
            boundary: Arc::clone(self),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// A dead module process has nothing left to drain.
    pub fn has_active_connections(&self) -> bool {
        self.proxy.is_alive() && self.in_flight() > 0
    }

    pub async fn handle(&self, req: Request) -> Result<Response, ProxyError> {
        self.proxy.handle(req).await
    }

    /// Why this boundary should be rebuilt, if it should.
    pub async fn must_reinitialize(&self) -> Option<String> {
        if !self.proxy.is_alive() {
            return Some("module process exited".to_string());
        }
        let changed = self.watchers.lock().ok().and_then(|w| w.changed());
        if let Some(path) = changed {
            return Some(format!("file changed: {}", path.display()));
        }
        match self.proxy.must_reinitialize(self.options.call_timeout).await {
            Ok(true) => Some("module requested reinitialization".to_string()),
            Ok(false) => None,
            Err(ProxyError::ProcessExited) => Some("module process exited".to_string()),
            Err(e) => {
                tracing::warn!("[{}] must_reinitialize failed: {}", self.name(), e);
                None
            }
        }
    }

    /// Call the module's shutdown hook. Runs at most once.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) || !self.proxy.is_alive() {
            return;
        }
        if let Err(e) = self.proxy.shutdown(self.options.call_timeout).await {
            tracing::warn!("[{}] Module shutdown failed: {}", self.name(), e);
        }
    }

    /// Tear everything down. Failures are logged, never returned.
    pub async fn dispose(&self) {
        if self.state() == State::Disposed {
            return;
        }
        if let Err(e) = self.transition(State::Disposed) {
            let err = EngineError::Disposal {
                boundary: self.id,
                message: e.to_string(),
            };
            tracing::warn!("{}", err);
        }
        if let Ok(mut w) = self.watchers.lock() {
            w.stop();
        }
        self.proxy.terminate(self.options.dispose_wait).await;
        staging::remove(&self.staging_dir);
        tracing::info!("Boundary #{} for '{}' disposed", self.id, self.name());
    }
}

/// Held for the lifetime of one routed request.
pub struct RequestGuard {
    boundary: Arc<Boundary>,
}

impl RequestGuard {
    pub fn boundary(&self) -> &Arc<Boundary> {
        &self.boundary
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.boundary.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
