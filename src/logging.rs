//! tracing subscriber setup for the host process.

use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

use crate::settings::LogSettings;

pub const DEFAULT_FILTER: &str = "info";

/// Filter precedence: `RUST_LOG`, then the settings file, then `info`.
pub fn build_filter(log: &LogSettings) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    if let Some(directive) = log.filter.as_deref() {
        match EnvFilter::try_new(directive) {
            Ok(filter) => return filter,
            Err(e) => eprintln!("Invalid log filter '{}' in settings: {}", directive, e),
        }
    }
    EnvFilter::new(DEFAULT_FILTER)
}

/// Install the global subscriber. Safe to call more than once; later calls
/// are ignored.
pub fn init(log: &LogSettings) {
    let filter = build_filter(log);

    if let Some(path) = log.file.as_ref() {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            let _ = std::fs::create_dir_all(parent);
        }
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .try_init();
                return;
            }
            Err(e) => eprintln!("Cannot open log file {}: {}; logging to stderr", path.display(), e),
        }
    }

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
