//! Engine orchestrator: owns the active and retiring boundaries and the
//! listeners, and runs the reconciliation tick that swaps them.
//!
//! Locking:
//! - `control` (async) is held for a whole tick, so two ticks never overlap.
//! - `shared` (sync) guards the boundary sets and listeners. It is only held
//!   for the swap itself, never across an await.

pub mod saves;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::boundary::{self, staging, Boundary, BoundaryOptions};
use crate::error::EngineError;
use crate::listener::Listener;
use crate::resolver::{RoutingTable, SharedRoutes};
use crate::settings::{ConfigWatcher, EndpointConfig, HookConfig, ModuleConfig, Settings};
use saves::PendingSaves;

pub const CHECK_INTERVAL_ENV: &str = "SWITCHYARD_CHECK_INTERVAL_MS";

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Period of the reconciliation tick
    pub check_interval: Duration,
    pub heartbeat_interval: Duration,
    /// How long a stopping listener may take to drain
    pub listener_stop_bound: Duration,
    pub boundary: BoundaryOptions,
}

impl Default for EngineOptions {
    fn default() -> Self {
        let check_interval = if cfg!(debug_assertions) {
            Duration::from_secs(1)
        } else {
            Duration::from_secs(10)
        };
        Self {
            check_interval,
            heartbeat_interval: Duration::from_secs(30),
            listener_stop_bound: Duration::from_secs(5),
            boundary: BoundaryOptions::default(),
        }
    }
}

impl EngineOptions {
    /// Defaults, with the check interval overridable from the environment.
    pub fn from_env() -> Self {
        let mut options = Self::default();
        if let Ok(raw) = std::env::var(CHECK_INTERVAL_ENV) {
            match raw.trim().parse::<u64>() {
                Ok(ms) if ms > 0 => options.check_interval = Duration::from_millis(ms),
                _ => tracing::warn!("Ignoring invalid {}='{}'", CHECK_INTERVAL_ENV, raw),
            }
        }
        options
    }
}

struct Control {
    settings: Settings,
    watcher: ConfigWatcher,
    first_run: bool,
}

#[derive(Default)]
struct Shared {
    active: Vec<Arc<Boundary>>,
    retiring: Vec<Arc<Boundary>>,
    listeners: HashMap<EndpointConfig, Listener>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BoundaryInfo {
    pub id: u64,
    pub name: String,
    pub module_name: String,
    pub module_type: String,
    pub pid: Option<u32>,
    pub hooks: Vec<HookConfig>,
    pub in_flight: usize,
    pub alive: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub active: Vec<BoundaryInfo>,
    pub retiring: Vec<u64>,
    pub endpoints: Vec<SocketAddr>,
}

impl EngineSnapshot {
    pub fn active_named(&self, name: &str) -> Option<&BoundaryInfo> {
        self.active.iter().find(|b| b.name == name)
    }
}

pub struct Engine {
    settings_path: PathBuf,
    options: EngineOptions,
    routes: SharedRoutes,
    saves: PendingSaves,
    control: tokio::sync::Mutex<Control>,
    shared: Mutex<Shared>,
    fatal: CancellationToken,
    fatal_error: Mutex<Option<EngineError>>,
}

impl Engine {
    pub fn new(settings_path: impl Into<PathBuf>, options: EngineOptions) -> Arc<Self> {
        let settings_path = settings_path.into();
        Arc::new(Self {
            control: tokio::sync::Mutex::new(Control {
                settings: Settings::default(),
                watcher: ConfigWatcher::new(&settings_path),
                first_run: true,
            }),
            settings_path,
            options,
            routes: Arc::new(RwLock::new(Arc::new(RoutingTable::default()))),
            saves: PendingSaves::new(),
            shared: Mutex::new(Shared::default()),
            fatal: CancellationToken::new(),
            fatal_error: Mutex::new(None),
        })
    }

    pub fn settings_path(&self) -> &Path {
        &self.settings_path
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    fn shared(&self) -> MutexGuard<'_, Shared> {
        match self.shared.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn publish_routes(&self, active: &[Arc<Boundary>]) {
        let table = Arc::new(RoutingTable::from_boundaries(active));
        match self.routes.write() {
            Ok(mut routes) => *routes = table,
            Err(poisoned) => *poisoned.into_inner() = table,
        }
    }

    /// In-memory settings as of the last tick.
    pub async fn settings(&self) -> Settings {
        self.control.lock().await.settings.clone()
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        let shared = self.shared();
        let mut endpoints: Vec<SocketAddr> = shared.listeners.values().map(|l| l.local_addr()).collect();
        endpoints.sort();
        EngineSnapshot {
            active: shared
                .active
                .iter()
                .map(|b| BoundaryInfo {
                    id: b.id(),
                    name: b.name().to_string(),
                    module_name: b.module_name().to_string(),
                    module_type: b.module_type().to_string(),
                    pid: b.pid(),
                    hooks: b.hooks().to_vec(),
                    in_flight: b.in_flight(),
                    alive: b.is_alive(),
                })
                .collect(),
            retiring: shared.retiring.iter().map(|b| b.id()).collect(),
            endpoints,
        }
    }

    /// One reconciliation pass. Only engine-scoped (fatal) failures are
    /// returned; module failures are logged and stay local to the module.
    pub async fn tick(&self) -> Result<(), EngineError> {
        let mut ctl = self.control.lock().await;

        let mut reinit = false;
        if ctl.first_run {
            ctl.settings = match Settings::load_or_init(&self.settings_path) {
                Ok(settings) => settings,
                Err(e) => {
                    tracing::error!("Failed to initialize settings: {:#}", e);
                    Settings::default()
                }
            };
            ctl.watcher.mark_current();
            reinit = true;
        } else if ctl.watcher.has_changed() {
            match ctl.watcher.reload() {
                Ok(settings) => {
                    tracing::info!("Settings file {} changed, reinitializing", self.settings_path.display());
                    ctl.settings = settings;
                    reinit = true;
                }
                // 깨진 설정으로 교체하지 않음
                Err(e) => tracing::error!("{}; keeping the current settings", e),
            }
        }

        self.persist_pending_saves(&mut ctl);

        if reinit {
            self.reinitialize_globally(&mut ctl).await?;
        } else {
            self.check_per_module_reinit(&ctl).await?;
        }
        self.reconcile_retiring().await;
        Ok(())
    }

    fn persist_pending_saves(&self, ctl: &mut Control) {
        if self.saves.is_empty() {
            return;
        }
        if self.saves.apply_to(&mut ctl.settings) == 0 {
            return;
        }
        match ctl.settings.save(&self.settings_path) {
            Ok(()) => {
                // 우리가 쓴 변경은 재초기화 대상이 아님
                ctl.watcher.mark_current();
                tracing::info!("Persisted module settings to {}", self.settings_path.display());
            }
            Err(e) => tracing::error!("Failed to persist module settings: {:#}", e),
        }
    }

    async fn create_boundary(&self, config: &ModuleConfig, root: &Path) -> Result<Boundary, EngineError> {
        let sink = self.saves.sink_for(&config.name);
        boundary::create(config, root, sink, &self.options.boundary).await
    }

    async fn reinitialize_globally(&self, ctl: &mut Control) -> Result<(), EngineError> {
        let settings = ctl.settings.clone();
        let first_run = ctl.first_run;
        let root = settings.staging_root();
        staging::ensure_root(&root)?;
        if first_run {
            staging::sweep_stale(&root);
        }

        // 1. 새 경계 생성 (락 밖에서)
        let previous: Vec<Arc<Boundary>> = self.shared().active.clone();
        let mut next: Vec<Arc<Boundary>> = Vec::new();
        let mut kept: HashSet<u64> = HashSet::new();
        for module in &settings.modules {
            match self.create_boundary(module, &root).await {
                Ok(b) => next.push(Arc::new(b)),
                Err(e) if e.is_fatal() => {
                    for b in &next {
                        if !kept.contains(&b.id()) {
                            b.dispose().await;
                        }
                    }
                    return Err(e);
                }
                Err(e) => {
                    tracing::error!("{}", e);
                    let fallback = previous
                        .iter()
                        .find(|b| b.name() == module.name && !kept.contains(&b.id()));
                    if let Some(old) = fallback {
                        tracing::warn!("[{}] Keeping boundary #{} in service", module.name, old.id());
                        kept.insert(old.id());
                        next.push(Arc::clone(old));
                    }
                }
            }
        }

        // 2. 새 엔드포인트 바인드.
        // 같은 주소를 잡고 있는 옛 리스너는 먼저 닫아야 바인드 가능
        let desired: BTreeSet<EndpointConfig> = settings.server.endpoints.iter().copied().collect();
        let released: Vec<Listener> = {
            let mut shared = self.shared();
            let replaced: Vec<EndpointConfig> = shared
                .listeners
                .keys()
                .filter(|old| {
                    !desired.contains(old)
                        && desired
                            .iter()
                            .any(|new| !shared.listeners.contains_key(new) && new.conflicts_with(old))
                })
                .copied()
                .collect();
            replaced.iter().filter_map(|e| shared.listeners.remove(e)).collect()
        };
        for listener in &released {
            tracing::info!("Releasing {} for its replacement", listener.endpoint());
            listener.close();
        }

        let running: HashSet<EndpointConfig> = self.shared().listeners.keys().copied().collect();
        let mut started = Vec::new();
        for endpoint in desired.iter().filter(|e| !running.contains(e)) {
            let retry_for = if released.iter().any(|old| endpoint.conflicts_with(&old.endpoint())) {
                self.options.listener_stop_bound
            } else {
                Duration::ZERO
            };
            match Listener::start_within(*endpoint, self.routes.clone(), settings.server.max_request_body, retry_for)
                .await
            {
                Ok(listener) => started.push(listener),
                Err(e) => tracing::error!("{}", e),
            }
        }

        // 3. 스위치오버: 경계 집합, 라우팅 테이블, 리스너를 한 번에
        let (retired, stopped, listening) = {
            let mut shared = self.shared();
            for b in &next {
                if !kept.contains(&b.id()) {
                    if let Err(e) = b.activate() {
                        tracing::warn!("[{}] {}", b.name(), e);
                    }
                }
            }
            let old = std::mem::replace(&mut shared.active, next);
            let retired: Vec<Arc<Boundary>> = old.into_iter().filter(|b| !kept.contains(&b.id())).collect();
            for b in &retired {
                if let Err(e) = b.retire() {
                    tracing::warn!("[{}] {}", b.name(), e);
                }
                shared.retiring.push(Arc::clone(b));
            }
            self.publish_routes(&shared.active);

            let gone: Vec<EndpointConfig> = shared
                .listeners
                .keys()
                .filter(|e| !desired.contains(e))
                .copied()
                .collect();
            let mut stopped: Vec<Listener> = gone.iter().filter_map(|e| shared.listeners.remove(e)).collect();
            stopped.extend(released);
            for listener in started {
                shared.listeners.insert(listener.endpoint(), listener);
            }
            (retired, stopped, shared.listeners.len())
        };

        tracing::info!(
            "Global reinitialization done: {} module(s) active, {} retiring, {} endpoint(s)",
            self.shared().active.len(),
            retired.len(),
            listening
        );

        // 4. 은퇴한 경계에 shutdown 신호, 옛 리스너 정지.
        for b in &retired {
            // Busy retirees get shutdown later in reconcile_retiring, once drained,
            // so handle never runs after shutdown.
            if b.in_flight() == 0 {
                b.shutdown().await;
            }
        }
        for listener in stopped {
            listener.stop(self.options.listener_stop_bound, false).await;
        }

        ctl.first_run = false;
        if first_run && listening == 0 && !desired.is_empty() {
            return Err(EngineError::Startup("no endpoint could be bound".to_string()));
        }
        Ok(())
    }

    async fn check_per_module_reinit(&self, ctl: &Control) -> Result<(), EngineError> {
        let active: Vec<Arc<Boundary>> = self.shared().active.clone();
        let root = ctl.settings.staging_root();

        for old in active {
            let Some(reason) = old.must_reinitialize().await else {
                continue;
            };
            tracing::info!("[{}] Reinitializing boundary #{}: {}", old.name(), old.id(), reason);

            let config = ctl
                .settings
                .module(old.name())
                .cloned()
                .unwrap_or_else(|| old.config().clone());
            let replacement = match self.create_boundary(&config, &root).await {
                Ok(b) => Arc::new(b),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    tracing::error!("{}; boundary #{} stays in service", e, old.id());
                    continue;
                }
            };

            let swapped = {
                let mut shared = self.shared();
                match shared.active.iter().position(|b| b.id() == old.id()) {
                    Some(idx) => {
                        if let Err(e) = replacement.activate() {
                            tracing::warn!("[{}] {}", replacement.name(), e);
                        }
                        shared.active[idx] = Arc::clone(&replacement);
                        if let Err(e) = old.retire() {
                            tracing::warn!("[{}] {}", old.name(), e);
                        }
                        shared.retiring.push(Arc::clone(&old));
                        self.publish_routes(&shared.active);
                        true
                    }
                    None => false,
                }
            };

            if swapped {
                tracing::info!(
                    "[{}] Boundary #{} replaced by #{}",
                    old.name(),
                    old.id(),
                    replacement.id()
                );
                // busy: shutdown waits for reconcile_retiring
                if old.in_flight() == 0 {
                    old.shutdown().await;
                }
            } else {
                replacement.dispose().await;
            }
        }
        Ok(())
    }

    async fn reconcile_retiring(&self) {
        let drained: Vec<Arc<Boundary>> = {
            let mut shared = self.shared();
            let (drained, busy): (Vec<_>, Vec<_>) = std::mem::take(&mut shared.retiring)
                .into_iter()
                .partition(|b| !b.has_active_connections());
            shared.retiring = busy;
            drained
        };
        for b in drained {
            b.shutdown().await;
            b.dispose().await;
        }
    }

    /// Drain listeners, then shut down and dispose every boundary.
    pub async fn shutdown(&self) {
        let _ctl = self.control.lock().await;

        let listeners: Vec<Listener> = self.shared().listeners.drain().map(|(_, l)| l).collect();
        for listener in listeners {
            listener.stop(self.options.listener_stop_bound, true).await;
        }

        let (active, retiring) = {
            let mut shared = self.shared();
            let active = std::mem::take(&mut shared.active);
            let retiring = std::mem::take(&mut shared.retiring);
            self.publish_routes(&[]);
            (active, retiring)
        };
        for b in &active {
            b.shutdown().await;
        }
        for b in active.iter().chain(retiring.iter()) {
            b.dispose().await;
        }
        tracing::info!("Engine stopped");
    }

    fn fail(&self, err: EngineError) {
        tracing::error!("Fatal engine error: {}", err);
        if let Ok(mut slot) = self.fatal_error.lock() {
            slot.get_or_insert(err);
        }
        self.fatal.cancel();
    }

    fn heartbeat(&self) {
        let snap = self.snapshot();
        tracing::info!(
            "Heartbeat: {} active, {} retiring, listening on {:?}",
            snap.active.len(),
            snap.retiring.len(),
            snap.endpoints
        );
        for b in snap.active.iter().filter(|b| !b.alive) {
            tracing::warn!("[{}] Boundary #{} ({}) has no running module process", b.name, b.id, b.module_type);
        }
    }

    /// Spawn the periodic check and heartbeat tasks.
    pub fn start(self: &Arc<Self>, stop: CancellationToken) {
        let engine = Arc::clone(self);
        let token = stop.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(engine.options.check_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = engine.tick().await {
                            engine.fail(e);
                            break;
                        }
                    }
                }
            }
        });

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(engine.options.heartbeat_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = interval.tick() => engine.heartbeat(),
                }
            }
        });
    }

    /// Run until `stop` resolves or a fatal error occurs, then shut down.
    pub async fn run_until<F>(self: &Arc<Self>, stop: F) -> Result<(), EngineError>
    where
        F: Future<Output = ()>,
    {
        if let Err(e) = self.tick().await {
            self.fail(e);
        } else {
            let tasks = CancellationToken::new();
            self.start(tasks.clone());
            tokio::select! {
                _ = stop => tracing::info!("Shutdown requested"),
                _ = self.fatal.cancelled() => {}
            }
            tasks.cancel();
        }

        self.shutdown().await;
        match self.fatal_error.lock().ok().and_then(|mut e| e.take()) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn write_settings(path: &Path, settings: &Settings) {
        settings.save(path).unwrap();
    }

    fn base_settings(dir: &Path, port: u16) -> Settings {
        Settings {
            server: crate::settings::ServerSettings {
                endpoints: vec![EndpointConfig {
                    bind: "127.0.0.1".parse().unwrap(),
                    port,
                    secure: false,
                }],
                ..Default::default()
            },
            temp_folder: Some(dir.join("stage")),
            ..Default::default()
        }
    }

    #[test]
    fn check_interval_depends_on_build() {
        let opts = EngineOptions::default();
        assert!(opts.check_interval <= Duration::from_secs(10));
        assert_eq!(opts.listener_stop_bound, Duration::from_secs(5));
        assert_eq!(opts.boundary.call_timeout, Duration::from_secs(120));
    }

    #[tokio::test]
    async fn first_tick_brings_up_endpoint_without_modules() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let port = free_port();
        write_settings(&path, &base_settings(dir.path(), port));

        let engine = Engine::new(&path, EngineOptions::default());
        engine.tick().await.unwrap();
        let snap = engine.snapshot();
        assert!(snap.active.is_empty());
        assert_eq!(snap.endpoints.len(), 1);
        assert_eq!(snap.endpoints[0].port(), port);

        let resp = reqwest::get(format!("http://127.0.0.1:{}/x", port)).await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);

        engine.shutdown().await;
        assert!(engine.snapshot().endpoints.is_empty());
    }

    #[tokio::test]
    async fn missing_module_binary_leaves_module_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let mut settings = base_settings(dir.path(), free_port());
        settings.modules.push(ModuleConfig {
            name: "ghost".into(),
            binary: dir.path().join("bin").join("ghost"),
            hooks: vec![HookConfig {
                path: Some("/ghost".into()),
                ..Default::default()
            }],
            ..Default::default()
        });
        write_settings(&path, &settings);

        let engine = Engine::new(&path, EngineOptions::default());
        engine.tick().await.unwrap();
        assert!(engine.snapshot().active.is_empty());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn first_run_without_any_endpoint_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        write_settings(&path, &base_settings(dir.path(), port));

        let engine = Engine::new(&path, EngineOptions::default());
        let err = engine.tick().await.unwrap_err();
        assert!(err.is_fatal());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn missing_settings_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf").join("settings.json");
        let engine = Engine::new(&path, EngineOptions::default());
        // default endpoint 0.0.0.0:8080 may be taken on the test machine;
        // either way the file must exist afterwards
        let _ = engine.tick().await;
        assert!(path.exists());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn broken_reload_keeps_previous_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let port = free_port();
        write_settings(&path, &base_settings(dir.path(), port));

        let engine = Engine::new(&path, EngineOptions::default());
        engine.tick().await.unwrap();

        std::fs::write(&path, "{ broken").unwrap();
        let f = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        f.set_modified(std::time::SystemTime::now() + Duration::from_secs(10)).unwrap();

        engine.tick().await.unwrap();
        assert_eq!(engine.settings().await.server.endpoints[0].port, port);
        assert_eq!(engine.snapshot().endpoints.len(), 1);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn run_until_stops_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        write_settings(&path, &base_settings(dir.path(), free_port()));
        let engine = Engine::new(&path, EngineOptions::default());
        let result = engine.run_until(tokio::time::sleep(Duration::from_millis(200))).await;
        assert!(result.is_ok());
        assert!(engine.snapshot().endpoints.is_empty());
    }
}
