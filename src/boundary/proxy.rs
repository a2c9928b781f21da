//! Host side of the module process: spawns the staged binary and multiplexes
//! calls over its stdin/stdout.
//!
//! - Calls are correlated with replies by id, so `handle` calls run concurrently
//! - `save_settings` and `log` frames are forwarded as they arrive
//! - stderr lines are relayed to `tracing` with the module name
//! - process exit fails every pending call with [`ProxyError::ProcessExited`]

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, watch};

use switchyard_sdk::protocol::{HostCall, HostFrame, InitParams, LogLevel, ModuleFrame, Outcome, ReplyBody};
use switchyard_sdk::{RemoteError, Request, Response};

/// Receives settings blobs a module asks the host to persist.
pub type SaveSink = Arc<dyn Fn(Value) + Send + Sync>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProxyError {
    #[error("Failed to spawn module process '{path}': {message}")]
    Spawn { path: String, message: String },

    #[error("Module process exited")]
    ProcessExited,

    #[error("Call '{call}' timed out after {secs}s")]
    Timeout { call: &'static str, secs: u64 },

    #[error("Unexpected reply to '{0}'")]
    UnexpectedReply(&'static str),

    #[error("Encoding error: {0}")]
    Encode(String),

    #[error("{0}")]
    Remote(RemoteError),
}

type ReplySender = oneshot::Sender<Result<ReplyBody, ProxyError>>;

#[derive(Default)]
struct PendingCalls {
    calls: HashMap<u64, ReplySender>,
    closed: bool,
}

impl PendingCalls {
    fn fail_all(&mut self) {
        self.closed = true;
        for (_, tx) in self.calls.drain() {
            let _ = tx.send(Err(ProxyError::ProcessExited));
        }
    }
}

/// Module-reported details after a successful `init`.
#[derive(Debug, Clone)]
pub struct ReadyInfo {
    pub module_name: String,
    pub module_type: String,
}

pub struct ModuleProxy {
    label: String,
    pid: Option<u32>,
    writer_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    pending: Arc<Mutex<PendingCalls>>,
    next_id: AtomicU64,
    running_rx: watch::Receiver<bool>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl ModuleProxy {
    /// Start `binary` with `working_dir` as its current directory.
    pub fn spawn(binary: &Path, working_dir: &Path, label: &str, on_save: SaveSink) -> Result<Self, ProxyError> {
        let mut cmd = Command::new(binary);
        cmd.current_dir(working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Windows: hide console window
        crate::utils::apply_creation_flags(&mut cmd);

        let mut child = cmd.spawn().map_err(|e| ProxyError::Spawn {
            path: binary.display().to_string(),
            message: e.to_string(),
        })?;
        let pid = child.id();

        let pending = Arc::new(Mutex::new(PendingCalls::default()));
        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<String>();
        let (running_tx, running_rx) = watch::channel(true);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        // ── stdout reader ────────────────────────────────────
        if let Some(stdout) = child.stdout.take() {
            let pending = pending.clone();
            let label = label.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    match serde_json::from_str::<ModuleFrame>(&line) {
                        Ok(ModuleFrame::Reply { id, outcome }) => {
                            let tx = pending.lock().ok().and_then(|mut p| p.calls.remove(&id));
                            if let Some(tx) = tx {
                                let result = match outcome {
                                    Outcome::Ok(body) => Ok(body),
                                    Outcome::Err(e) => Err(ProxyError::Remote(e)),
                                };
                                let _ = tx.send(result);
                            }
                        }
                        Ok(ModuleFrame::SaveSettings { settings }) => {
                            tracing::info!("[{}] Module requested a settings save", label);
                            on_save(settings);
                        }
                        Ok(ModuleFrame::Log { level, message }) => relay_log(&label, level, &message),
                        // 프레임이 아닌 stdout 출력
                        Err(_) => tracing::info!(module = %label, "{}", line),
                    }
                }
                if let Ok(mut p) = pending.lock() {
                    p.fail_all();
                }
            });
        }

        // ── stderr reader ────────────────────────────────────
        if let Some(stderr) = child.stderr.take() {
            let label = label.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::info!(module = %label, "{}", line);
                }
            });
        }

        // ── stdin writer ─────────────────────────────────────
        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                while let Some(line) = writer_rx.recv().await {
                    if stdin.write_all(line.as_bytes()).await.is_err() {
                        break;
                    }
                    if stdin.flush().await.is_err() {
                        break;
                    }
                }
                // stdin drop → 모듈 쪽 EOF
            });
        }

        // ── process waiter ───────────────────────────────────
        {
            let label = label.to_string();
            let pending = pending.clone();
            tokio::spawn(async move {
                let status = tokio::select! {
                    status = child.wait() => status,
                    _ = kill_rx => {
                        let _ = child.start_kill();
                        child.wait().await
                    }
                };
                match status {
                    Ok(status) => tracing::info!("[{}] Module process exited with {}", label, status),
                    Err(e) => tracing::warn!("[{}] Failed to wait for module process: {}", label, e),
                }
                if let Ok(mut p) = pending.lock() {
                    p.fail_all();
                }
                let _ = running_tx.send(false);
            });
        }

        tracing::debug!("[{}] Module process started with PID {:?}", label, pid);

        Ok(Self {
            label: label.to_string(),
            pid,
            writer_tx: Mutex::new(Some(writer_tx)),
            pending,
            next_id: AtomicU64::new(1),
            running_rx,
            kill_tx: Mutex::new(Some(kill_tx)),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_alive(&self) -> bool {
        *self.running_rx.borrow()
    }

    pub async fn call(&self, call: HostCall, timeout: Option<Duration>) -> Result<ReplyBody, ProxyError> {
        let label = call.label();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let line = serde_json::to_string(&HostFrame { id, call })
            .map_err(|e| ProxyError::Encode(e.to_string()))?
            + "\n";

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().map_err(|_| ProxyError::ProcessExited)?;
            if pending.closed {
                return Err(ProxyError::ProcessExited);
            }
            pending.calls.insert(id, tx);
        }

        let sent = self
            .writer_tx
            .lock()
            .ok()
            .and_then(|w| w.as_ref().map(|w| w.send(line).is_ok()))
            .unwrap_or(false);
        if !sent {
            self.forget(id);
            return Err(ProxyError::ProcessExited);
        }

        let reply = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(reply) => reply,
                Err(_) => {
                    self.forget(id);
                    return Err(ProxyError::Timeout {
                        call: label,
                        secs: limit.as_secs(),
                    });
                }
            },
            None => rx.await,
        };
        reply.unwrap_or(Err(ProxyError::ProcessExited))
    }

    fn forget(&self, id: u64) {
        if let Ok(mut p) = self.pending.lock() {
            p.calls.remove(&id);
        }
    }

    pub async fn init(&self, params: InitParams, timeout: Duration) -> Result<ReadyInfo, ProxyError> {
        match self.call(HostCall::Init(params), Some(timeout)).await? {
            ReplyBody::Ready { module_name, module_type } => Ok(ReadyInfo { module_name, module_type }),
            _ => Err(ProxyError::UnexpectedReply("init")),
        }
    }

    pub async fn handle(&self, req: Request) -> Result<Response, ProxyError> {
        match self.call(HostCall::Handle(req), None).await? {
            ReplyBody::Response(resp) => Ok(resp),
            _ => Err(ProxyError::UnexpectedReply("handle")),
        }
    }

    pub async fn file_filters(&self, timeout: Duration) -> Result<Vec<String>, ProxyError> {
        match self.call(HostCall::FileFilters, Some(timeout)).await? {
            ReplyBody::FileFilters { filters } => Ok(filters),
            _ => Err(ProxyError::UnexpectedReply("file_filters")),
        }
    }

    pub async fn must_reinitialize(&self, timeout: Duration) -> Result<bool, ProxyError> {
        match self.call(HostCall::MustReinitialize, Some(timeout)).await? {
            ReplyBody::Flag { value } => Ok(value),
            _ => Err(ProxyError::UnexpectedReply("must_reinitialize")),
        }
    }

    pub async fn shutdown(&self, timeout: Duration) -> Result<(), ProxyError> {
        match self.call(HostCall::Shutdown, Some(timeout)).await? {
            ReplyBody::Done => Ok(()),
            _ => Err(ProxyError::UnexpectedReply("shutdown")),
        }
    }

    /// Close the module's stdin, wait for it to exit, and kill it if it doesn't.
    pub async fn terminate(&self, wait: Duration) {
        if let Ok(mut w) = self.writer_tx.lock() {
            w.take();
        }
        if self.wait_exit(wait).await {
            return;
        }

        #[cfg(unix)]
        {
            use nix::sys::signal::{self, Signal};
            use nix::unistd::Pid;

            if let Some(pid) = self.pid {
                tracing::warn!("[{}] Module did not exit after stdin closed, sending SIGTERM", self.label);
                if signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM).is_ok()
                    && self.wait_exit(Duration::from_secs(1)).await
                {
                    return;
                }
            }
        }

        tracing::warn!("[{}] Killing module process", self.label);
        if let Some(kill) = self.kill_tx.lock().ok().and_then(|mut k| k.take()) {
            let _ = kill.send(());
        }
        self.wait_exit(Duration::from_secs(5)).await;
    }

    async fn wait_exit(&self, limit: Duration) -> bool {
        let mut rx = self.running_rx.clone();
        let exited = matches!(
            tokio::time::timeout(limit, rx.wait_for(|running| !*running)).await,
            Ok(Ok(_))
        );
        exited
    }
}

fn relay_log(label: &str, level: LogLevel, message: &str) {
    match level {
        LogLevel::Error => tracing::error!(module = %label, "{}", message),
        LogLevel::Warn => tracing::warn!(module = %label, "{}", message),
        LogLevel::Info => tracing::info!(module = %label, "{}", message),
        LogLevel::Debug => tracing::debug!(module = %label, "{}", message),
        LogLevel::Trace => tracing::trace!(module = %label, "{}", message),
    }
}
