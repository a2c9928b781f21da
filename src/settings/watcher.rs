//! Detects edits to the settings file by modification time.

use std::path::PathBuf;
use std::time::SystemTime;

use super::Settings;
use crate::error::EngineError;

pub struct ConfigWatcher {
    path: PathBuf,
    last_seen: Option<SystemTime>,
}

impl ConfigWatcher {
    /// A watcher that has seen nothing yet, so the first check reports a change.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_seen: None,
        }
    }

    pub fn current_mtime(&self) -> Option<SystemTime> {
        std::fs::metadata(&self.path).and_then(|m| m.modified()).ok()
    }

    /// True when the file's mtime differs from the last one recorded.
    pub fn has_changed(&self) -> bool {
        match self.current_mtime() {
            Some(mtime) => self.last_seen != Some(mtime),
            None => false,
        }
    }

    /// Record the file's current mtime as seen, e.g. right after the host
    /// wrote the file itself.
    pub fn mark_current(&mut self) {
        self.last_seen = self.current_mtime();
    }

    /// Re-read the file. The mtime is recorded even when parsing fails so a
    /// broken file is reported once, not on every tick.
    pub fn reload(&mut self) -> Result<Settings, EngineError> {
        let mtime = self.current_mtime();
        let result = Settings::load(&self.path);
        self.last_seen = mtime;
        result
    }
}
