//! The contract every module implements.

use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;

use crate::http::{Request, Response};
use crate::protocol::{LogLevel, ModuleFrame};

/// A request handler loaded by the host into its own process.
///
/// Lifecycle, driven by the host through the runner:
/// `init` exactly once, then any number of concurrent `handle` calls and
/// `must_reinitialize` polls, then `shutdown` exactly once. `handle` is never
/// called before `init` returns or after `shutdown`.
pub trait Module: Send + Sync + 'static {
    /// Human-readable module name, reported to the host after `init`.
    fn name(&self) -> String;

    fn init(&mut self, ctx: InitContext) -> anyhow::Result<()>;

    /// Extra path patterns (e.g. `/srv/site/*.html`) whose changes should
    /// rebuild this module. The binary's own directory is always watched.
    fn file_filters_to_monitor(&self) -> Vec<String> {
        Vec::new()
    }

    fn handle(&self, req: Request) -> anyhow::Result<Response>;

    /// Polled by the host on every reconciliation tick.
    fn must_reinitialize(&self) -> bool {
        false
    }

    fn shutdown(&self) {}
}

/// Everything a module receives at `init`.
pub struct InitContext {
    /// Configured instance name (not necessarily unique across restarts)
    pub name: String,
    pub settings: Value,
    pub saver: SettingsSaver,
    pub log: ModuleLogger,
    pub binary_path: PathBuf,
    pub original_binary_path: PathBuf,
}

impl InitContext {
    /// Deserialize the settings blob, falling back to `T::default()` when it is
    /// missing or does not fit `T`.
    pub fn settings_as<T: DeserializeOwned + Default>(&self) -> T {
        if self.settings.is_null() {
            return T::default();
        }
        match serde_json::from_value(self.settings.clone()) {
            Ok(v) => v,
            Err(e) => {
                self.log.warn(format!(
                    "Settings for '{}' could not be read ({}); using defaults",
                    self.name, e
                ));
                T::default()
            }
        }
    }
}

/// Asks the host to persist a new settings blob for this module.
///
/// The host writes it to the settings file on its next tick without
/// reinitializing anything.
#[derive(Clone)]
pub struct SettingsSaver {
    tx: UnboundedSender<ModuleFrame>,
}

impl SettingsSaver {
    pub(crate) fn new(tx: UnboundedSender<ModuleFrame>) -> Self {
        Self { tx }
    }

    pub fn save_value(&self, settings: Value) {
        let _ = self.tx.send(ModuleFrame::SaveSettings { settings });
    }

    pub fn save<T: Serialize>(&self, settings: &T) -> anyhow::Result<()> {
        let value = serde_json::to_value(settings)?;
        self.save_value(value);
        Ok(())
    }
}

/// Log sink that forwards to the host's logger.
#[derive(Clone)]
pub struct ModuleLogger {
    tx: UnboundedSender<ModuleFrame>,
}

impl ModuleLogger {
    pub(crate) fn new(tx: UnboundedSender<ModuleFrame>) -> Self {
        Self { tx }
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let _ = self.tx.send(ModuleFrame::Log {
            level,
            message: message.into(),
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }
}
