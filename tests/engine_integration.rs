//! End-to-end tests: a real engine, real listeners and the demo module binary.
//! Reconciliation is driven by `Engine::tick()` instead of the timer.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde_json::{json, Value};
use switchyard::boundary::BoundaryOptions;
use switchyard::settings::{EndpointConfig, HookConfig, HookProtocol, ModuleConfig, ServerSettings, Settings};
use switchyard::{Engine, EngineOptions};
use tempfile::TempDir;

struct Fixture {
    dir: TempDir,
    bin: PathBuf,
    settings_path: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let bin_dir = dir.path().join("bin");
        fs::create_dir(&bin_dir).unwrap();
        let bin = bin_dir.join(format!("switchyard-demo{}", std::env::consts::EXE_SUFFIX));
        fs::copy(env!("CARGO_BIN_EXE_switchyard-demo"), &bin).unwrap();
        let settings_path = dir.path().join("settings.json");
        Self { dir, bin, settings_path }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn settings(&self, port: u16, modules: Vec<ModuleConfig>) -> Settings {
        Settings {
            server: ServerSettings {
                endpoints: vec![endpoint(port)],
                ..Default::default()
            },
            modules,
            temp_folder: Some(self.path("stage")),
            ..Default::default()
        }
    }

    fn module(&self, name: &str, module_type: &str, hook: &str, settings: Value) -> ModuleConfig {
        ModuleConfig {
            name: name.into(),
            binary: self.bin.clone(),
            module_type: Some(module_type.into()),
            hooks: vec![HookConfig {
                path: Some(hook.into()),
                ..Default::default()
            }],
            settings,
            ..Default::default()
        }
    }

    /// Write settings with an mtime guaranteed to differ from the last one.
    fn write(&self, settings: &Settings, bump_secs: u64) {
        settings.save(&self.settings_path).unwrap();
        touch(&self.settings_path, bump_secs);
    }

    fn engine(&self) -> Arc<Engine> {
        Engine::new(&self.settings_path, options())
    }

    fn stage_dirs(&self) -> usize {
        fs::read_dir(self.path("stage")).map(|d| d.count()).unwrap_or(0)
    }
}

fn options() -> EngineOptions {
    EngineOptions {
        listener_stop_bound: Duration::from_secs(5),
        boundary: BoundaryOptions {
            call_timeout: Duration::from_secs(30),
            dispose_wait: Duration::from_secs(2),
        },
        ..Default::default()
    }
}

fn endpoint(port: u16) -> EndpointConfig {
    EndpointConfig {
        bind: "127.0.0.1".parse().unwrap(),
        port,
        secure: false,
    }
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn touch(path: &Path, secs: u64) {
    let f = fs::OpenOptions::new().write(true).open(path).unwrap();
    f.set_modified(SystemTime::now() + Duration::from_secs(secs)).unwrap();
}

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}

struct Reply {
    status: u16,
    body: String,
    pid: Option<u32>,
}

async fn get(port: u16, path_and_query: &str) -> Result<Reply, reqwest::Error> {
    let resp = client()
        .get(format!("http://127.0.0.1:{}{}", port, path_and_query))
        .send()
        .await?;
    let status = resp.status().as_u16();
    let pid = resp
        .headers()
        .get("x-module-pid")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok());
    let body = resp.text().await?;
    Ok(Reply { status, body, pid })
}

fn active_id(engine: &Engine, name: &str) -> Option<u64> {
    engine.snapshot().active_named(name).map(|b| b.id)
}

/// Tick until the named module runs in a different boundary.
async fn tick_until_replaced(engine: &Engine, name: &str, old: u64) -> u64 {
    for _ in 0..100 {
        engine.tick().await.unwrap();
        if let Some(id) = active_id(engine, name) {
            if id != old {
                return id;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("boundary #{} of '{}' was never replaced", old, name);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn healthy_module_serves_and_broken_module_is_absent() {
    let fx = Fixture::new();
    let port = free_port();
    fx.write(
        &fx.settings(
            port,
            vec![
                fx.module("echo", "Echo", "/echo", json!({"greeting": "hello"})),
                fx.module("broken", "FailingInit", "/broken", Value::Null),
            ],
        ),
        0,
    );

    let engine = fx.engine();
    engine.tick().await.unwrap();

    let snap = engine.snapshot();
    assert_eq!(snap.active.len(), 1);
    assert_eq!(snap.active[0].name, "echo");
    assert_eq!(snap.active[0].module_name, "Echo");
    assert_eq!(snap.active[0].module_type, "Echo");

    let reply = get(port, "/echo/hi").await.unwrap();
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, "hello /hi");

    assert_eq!(get(port, "/broken").await.unwrap().status, 404);

    // a throwing handler yields a generic 500 and the module keeps serving
    let failed = get(port, "/echo/x?fail=1").await.unwrap();
    assert_eq!(failed.status, 500);
    assert!(!failed.body.contains("asked to fail"));
    assert_eq!(get(port, "/echo").await.unwrap().status, 200);

    engine.shutdown().await;
    assert_eq!(fx.stage_dirs(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ambiguous_binary_without_module_type_is_absent() {
    let fx = Fixture::new();
    let port = free_port();
    let mut module = fx.module("any", "Echo", "/any", Value::Null);
    module.module_type = None;
    fx.write(&fx.settings(port, vec![module]), 0);

    let engine = fx.engine();
    engine.tick().await.unwrap();
    assert!(engine.snapshot().active.is_empty());
    assert_eq!(get(port, "/any").await.unwrap().status, 404);
    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn touching_the_binary_swaps_the_boundary() {
    let fx = Fixture::new();
    let port = free_port();
    fx.write(
        &fx.settings(port, vec![fx.module("echo", "Echo", "/echo", json!({"greeting": "hi"}))]),
        0,
    );
    let engine = fx.engine();
    engine.tick().await.unwrap();

    let before = get(port, "/echo").await.unwrap();
    assert_eq!(before.status, 200);
    let old = active_id(&engine, "echo").unwrap();

    touch(&fx.bin, 5);
    let new = tick_until_replaced(&engine, "echo", old).await;
    assert_ne!(new, old);

    let after = get(port, "/echo").await.unwrap();
    assert_eq!(after.status, 200);
    assert_eq!(after.body, "hi ");
    assert_ne!(after.pid, before.pid);

    // old boundary had nothing in flight, so it is already gone
    engine.tick().await.unwrap();
    assert!(engine.snapshot().retiring.is_empty());
    assert_eq!(fx.stage_dirs(), 1);
    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn in_flight_request_finishes_on_the_retiring_boundary() {
    let fx = Fixture::new();
    let port = free_port();
    fx.write(
        &fx.settings(port, vec![fx.module("echo", "Echo", "/echo", json!({"greeting": "slow"}))]),
        0,
    );
    let engine = fx.engine();
    engine.tick().await.unwrap();

    let old = active_id(&engine, "echo").unwrap();
    let old_pid = get(port, "/echo").await.unwrap().pid;

    let slow = tokio::spawn(async move { get(port, "/echo/slow?ms=3000").await });
    tokio::time::sleep(Duration::from_millis(400)).await;

    touch(&fx.bin, 5);
    let new = tick_until_replaced(&engine, "echo", old).await;
    assert_ne!(new, old);

    // still draining: not disposed while the request runs
    let snap = engine.snapshot();
    assert_eq!(snap.retiring, vec![old]);

    let reply = slow.await.unwrap().unwrap();
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, "slow /slow");
    assert_eq!(reply.pid, old_pid);

    engine.tick().await.unwrap();
    assert!(engine.snapshot().retiring.is_empty());

    let fresh = get(port, "/echo").await.unwrap();
    assert_ne!(fresh.pid, old_pid);
    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn moving_the_endpoint_keeps_in_flight_requests() {
    let fx = Fixture::new();
    let first = free_port();
    let second = free_port();
    let modules = vec![fx.module("echo", "Echo", "/echo", json!({"greeting": "moved"}))];
    fx.write(&fx.settings(first, modules.clone()), 0);

    let engine = fx.engine();
    engine.tick().await.unwrap();
    assert_eq!(get(first, "/echo").await.unwrap().status, 200);

    let slow = tokio::spawn(async move { get(first, "/echo/x?ms=1500").await });
    tokio::time::sleep(Duration::from_millis(300)).await;

    fx.write(&fx.settings(second, modules), 10);
    engine.tick().await.unwrap();

    let reply = slow.await.unwrap().unwrap();
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, "moved /x");

    assert!(get(first, "/echo").await.is_err());
    let moved = get(second, "/echo").await.unwrap();
    assert_eq!(moved.status, 200);

    let snap = engine.snapshot();
    assert_eq!(snap.endpoints.len(), 1);
    assert_eq!(snap.endpoints[0].port(), second);
    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_port_endpoint_changes_rebind_in_place() {
    let fx = Fixture::new();
    let port = free_port();
    let mut module = fx.module("tls", "Echo", "/tls", json!({"greeting": "secure"}));
    module.hooks[0].protocol = HookProtocol::Https;
    let mut settings = fx.settings(port, vec![module]);
    fx.write(&settings, 0);

    let engine = fx.engine();
    engine.tick().await.unwrap();
    // https-only hook on a plain endpoint
    assert_eq!(get(port, "/tls").await.unwrap().status, 404);

    settings.server.endpoints[0].secure = true;
    fx.write(&settings, 10);
    engine.tick().await.unwrap();
    assert_eq!(engine.snapshot().endpoints.len(), 1);
    let reply = get(port, "/tls").await.unwrap();
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, "secure ");

    settings.server.endpoints[0].bind = "0.0.0.0".parse().unwrap();
    fx.write(&settings, 20);
    engine.tick().await.unwrap();
    let snap = engine.snapshot();
    assert_eq!(snap.endpoints.len(), 1);
    assert!(snap.endpoints[0].ip().is_unspecified());
    assert_eq!(snap.endpoints[0].port(), port);
    assert_eq!(get(port, "/tls").await.unwrap().status, 200);
    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn module_watch_filter_triggers_a_swap() {
    let fx = Fixture::new();
    let port = free_port();
    let content = fx.path("content");
    fs::create_dir(&content).unwrap();
    fs::write(content.join("index.html"), "v1").unwrap();
    let filter = format!("{}/*.html", content.display());
    fx.write(
        &fx.settings(
            port,
            vec![fx.module("site", "Echo", "/site", json!({"greeting": "site", "watch": [filter]}))],
        ),
        0,
    );
    let engine = fx.engine();
    engine.tick().await.unwrap();
    let old = active_id(&engine, "site").unwrap();

    // not covered by the filter
    fs::write(content.join("notes.txt"), "x").unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    engine.tick().await.unwrap();
    assert_eq!(active_id(&engine, "site"), Some(old));

    fs::write(content.join("index.html"), "v2").unwrap();
    tick_until_replaced(&engine, "site", old).await;
    assert_eq!(get(port, "/site").await.unwrap().body, "site ");
    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn module_save_is_persisted_without_reinitializing() {
    let fx = Fixture::new();
    let port = free_port();
    fx.write(
        &fx.settings(
            port,
            vec![
                fx.module("echo", "Echo", "/echo", json!({"greeting": "before"})),
                fx.module("other", "Echo", "/other", json!({"greeting": "untouched"})),
            ],
        ),
        0,
    );
    let engine = fx.engine();
    engine.tick().await.unwrap();
    let echo_id = active_id(&engine, "echo").unwrap();
    let other_id = active_id(&engine, "other").unwrap();

    let reply = get(port, "/echo?save=after").await.unwrap();
    assert_eq!(reply.status, 200);

    engine.tick().await.unwrap();
    engine.tick().await.unwrap();

    let on_disk = Settings::load(&fx.settings_path).unwrap();
    assert_eq!(
        on_disk.module("echo").unwrap().settings,
        json!({"greeting": "after", "watch": []})
    );
    assert_eq!(on_disk.module("other").unwrap().settings, json!({"greeting": "untouched"}));

    assert_eq!(active_id(&engine, "echo"), Some(echo_id));
    assert_eq!(active_id(&engine, "other"), Some(other_id));
    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unchanged_settings_reinitialize_to_the_same_routes() {
    let fx = Fixture::new();
    let port = free_port();
    let settings = fx.settings(
        port,
        vec![
            fx.module("echo", "Echo", "/echo", json!({"greeting": "same"})),
            fx.module("jump", "Redirect", "/jump", json!({"target": "http://example.com/"})),
        ],
    );
    fx.write(&settings, 0);
    let engine = fx.engine();
    engine.tick().await.unwrap();

    let first = engine.snapshot();
    assert_eq!(first.active.len(), 2);

    touch(&fx.settings_path, 20);
    engine.tick().await.unwrap();
    let second = engine.snapshot();

    let hooks = |s: &switchyard::EngineSnapshot| {
        let mut v: Vec<(String, Vec<switchyard::settings::HookConfig>)> =
            s.active.iter().map(|b| (b.name.clone(), b.hooks.clone())).collect();
        v.sort_by(|a, b| a.0.cmp(&b.0));
        v
    };
    assert_eq!(hooks(&first), hooks(&second));
    for b in &second.active {
        assert!(first.active.iter().all(|old| old.id != b.id));
    }
    assert!(second.retiring.is_empty());
    assert_eq!(fx.stage_dirs(), 2);

    assert_eq!(get(port, "/echo").await.unwrap().body, "same ");
    let redirect = client()
        .get(format!("http://127.0.0.1:{}/jump/a/b", port))
        .send()
        .await
        .unwrap();
    assert_eq!(redirect.status().as_u16(), 302);
    assert_eq!(redirect.headers()["location"], "http://example.com/a/b");
    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_reinit_keeps_the_previous_boundary() {
    let fx = Fixture::new();
    let port = free_port();
    let mut module = fx.module("echo", "Echo", "/echo", json!({"greeting": "kept"}));
    fx.write(&fx.settings(port, vec![module.clone()]), 0);
    let engine = fx.engine();
    engine.tick().await.unwrap();
    let old = active_id(&engine, "echo").unwrap();

    // same name, now pointing at an implementation whose init throws
    module.module_type = Some("FailingInit".into());
    fx.write(&fx.settings(port, vec![module]), 10);
    engine.tick().await.unwrap();

    assert_eq!(active_id(&engine, "echo"), Some(old));
    assert_eq!(get(port, "/echo").await.unwrap().body, "kept ");
    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn module_flag_rebuilds_only_that_module() {
    let fx = Fixture::new();
    let port = free_port();
    let flag = fx.path("reinit.flag");
    fx.write(
        &fx.settings(
            port,
            vec![
                fx.module("echo", "Echo", "/echo", json!({"greeting": "a", "reinit_flag": flag})),
                fx.module("other", "Echo", "/other", json!({"greeting": "b"})),
            ],
        ),
        0,
    );
    let engine = fx.engine();
    engine.tick().await.unwrap();
    let echo = active_id(&engine, "echo").unwrap();
    let other = active_id(&engine, "other").unwrap();

    fs::write(&flag, b"now").unwrap();
    engine.tick().await.unwrap();

    assert_ne!(active_id(&engine, "echo"), Some(echo));
    assert_eq!(active_id(&engine, "other"), Some(other));
    assert!(!flag.exists());
    assert_eq!(get(port, "/echo").await.unwrap().status, 200);
    engine.shutdown().await;
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn crashed_module_is_replaced() {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let fx = Fixture::new();
    let port = free_port();
    fx.write(
        &fx.settings(port, vec![fx.module("echo", "Echo", "/echo", json!({"greeting": "phoenix"}))]),
        0,
    );
    let engine = fx.engine();
    engine.tick().await.unwrap();
    let old = active_id(&engine, "echo").unwrap();
    let pid = get(port, "/echo").await.unwrap().pid.unwrap();
    assert_eq!(engine.snapshot().active_named("echo").unwrap().pid, Some(pid));

    kill(Pid::from_raw(pid as i32), Signal::SIGKILL).unwrap();
    tick_until_replaced(&engine, "echo", old).await;

    let reply = get(port, "/echo").await.unwrap();
    assert_eq!(reply.status, 200);
    assert_ne!(reply.pid, Some(pid));
    engine.shutdown().await;
}
