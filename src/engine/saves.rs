//! Settings blobs modules asked the host to persist, applied on the next tick.

use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::boundary::proxy::SaveSink;
use crate::settings::Settings;

#[derive(Debug, Clone, PartialEq)]
pub struct PendingSave {
    pub module: String,
    pub settings: Value,
}

/// Arrival-ordered queue shared between module readers and the engine.
#[derive(Clone, Default)]
pub struct PendingSaves {
    queue: Arc<Mutex<Vec<PendingSave>>>,
}

impl PendingSaves {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, module: &str, settings: Value) {
        let mut queue = match self.queue.lock() {
            Ok(q) => q,
            Err(poisoned) => poisoned.into_inner(),
        };
        queue.push(PendingSave {
            module: module.to_string(),
            settings,
        });
    }

    /// Sink handed to one module's boundary.
    pub fn sink_for(&self, module: &str) -> SaveSink {
        let saves = self.clone();
        let module = module.to_string();
        Arc::new(move |settings| saves.push(&module, settings))
    }

    pub fn take(&self) -> Vec<PendingSave> {
        match self.queue.lock() {
            Ok(mut q) => std::mem::take(&mut *q),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().map(|q| q.is_empty()).unwrap_or(true)
    }

    /// Apply queued saves in order. Returns how many matched a configured
    /// module; later saves for the same module win.
    pub fn apply_to(&self, settings: &mut Settings) -> usize {
        let mut applied = 0;
        for save in self.take() {
            if settings.apply_module_save(&save.module, save.settings) {
                applied += 1;
            } else {
                tracing::warn!("Dropping settings save for '{}': module is no longer configured", save.module);
            }
        }
        applied
    }
}
