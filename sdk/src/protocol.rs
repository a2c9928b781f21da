//! Wire protocol between the host and a module process.
//!
//! One JSON object per line. The host writes [`HostFrame`]s to the module's
//! stdin; the module writes [`ModuleFrame`]s to its stdout. stdout is reserved
//! for frames, so module code must log through `tracing` (stderr) or the
//! [`ModuleLogger`](crate::ModuleLogger) instead of printing.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::http::{Request, Response};

/// A call from the host, correlated with its reply by `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostFrame {
    pub id: u64,
    pub call: HostCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostCall {
    Init(InitParams),
    Handle(Request),
    FileFilters,
    MustReinitialize,
    Shutdown,
}

impl HostCall {
    /// Short label used in log lines and error messages.
    pub fn label(&self) -> &'static str {
        match self {
            HostCall::Init(_) => "init",
            HostCall::Handle(_) => "handle",
            HostCall::FileFilters => "file_filters",
            HostCall::MustReinitialize => "must_reinitialize",
            HostCall::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitParams {
    /// Configured instance name
    pub name: String,
    /// Explicit implementation type; `None` means "the only one in the binary"
    #[serde(default)]
    pub module_type: Option<String>,
    /// Path of the staged copy that is actually running
    pub binary_path: String,
    /// Path of the binary the operator configured
    pub original_binary_path: String,
    #[serde(default)]
    pub settings: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModuleFrame {
    Reply { id: u64, outcome: Outcome },
    /// Module asks the host to persist a new settings blob for it
    SaveSettings { settings: Value },
    Log { level: LogLevel, message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Ok(ReplyBody),
    Err(RemoteError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum ReplyBody {
    Ready {
        module_name: String,
        module_type: String,
    },
    Response(Response),
    FileFilters { filters: Vec<String> },
    Flag { value: bool },
    Done,
}

/// Which call inside the module failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Construction,
    NameResolution,
    Init,
    Handle,
    Shutdown,
    Protocol,
}

impl std::fmt::Display for FailureStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureStage::Construction => "construction",
            FailureStage::NameResolution => "name resolution",
            FailureStage::Init => "init",
            FailureStage::Handle => "handle",
            FailureStage::Shutdown => "shutdown",
            FailureStage::Protocol => "protocol",
        };
        f.write_str(s)
    }
}

/// Error raised inside the module, with its full cause chain flattened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub stage: FailureStage,
    pub message: String,
    #[serde(default)]
    pub causes: Vec<String>,
}

impl RemoteError {
    pub fn new(stage: FailureStage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            causes: Vec::new(),
        }
    }

    /// Flatten an `anyhow::Error` chain: the outermost context becomes the
    /// message, everything below it the causes.
    pub fn from_anyhow(stage: FailureStage, err: &anyhow::Error) -> Self {
        let mut chain = err.chain().map(|e| e.to_string());
        let message = chain.next().unwrap_or_default();
        Self {
            stage,
            message,
            causes: chain.collect(),
        }
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} failed: {}", self.stage, self.message)?;
        for cause in &self.causes {
            write!(f, ": {}", cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for RemoteError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}
