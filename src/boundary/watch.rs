//! File-change watchers attached to a boundary.
//!
//! Watchers only raise a flag; the reconciliation tick decides what to do
//! with it.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use notify::event::{AccessKind, AccessMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};

/// One watched directory plus an optional file-name pattern.
#[derive(Debug, Clone)]
struct WatchRule {
    dir: PathBuf,
    pattern: Option<glob::Pattern>,
}

impl WatchRule {
    /// `dir` itself, `dir/file` or `dir/*.ext`. Only `*` and `?` are
    /// wildcards; brackets in a file name are literal.
    fn parse(filter: &str) -> Option<Self> {
        let path = Path::new(filter);
        if path.is_dir() {
            return Some(Self { dir: canonical(path), pattern: None });
        }
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty())?;
        let name = path.file_name()?.to_str()?;
        let pattern = glob::Pattern::new(&wildcards_only(name)).ok()?;
        Some(Self { dir: canonical(dir), pattern: Some(pattern) })
    }

    fn matches(&self, path: &Path) -> bool {
        if path.parent() != Some(self.dir.as_path()) {
            return false;
        }
        match (&self.pattern, path.file_name().and_then(|n| n.to_str())) {
            (None, _) => true,
            (Some(p), Some(name)) => p.matches(name),
            (Some(_), None) => false,
        }
    }
}

/// Escape everything in `name` except `*` and `?`.
fn wildcards_only(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            '*' | '?' => out.push(c),
            _ => out.push_str(&glob::Pattern::escape(c.encode_utf8(&mut [0u8; 4]))),
        }
    }
    out
}

fn canonical(p: &Path) -> PathBuf {
    std::fs::canonicalize(p).unwrap_or_else(|_| p.to_path_buf())
}

#[derive(Default)]
struct ChangeState {
    count: AtomicU64,
    last: Mutex<Option<PathBuf>>,
}

pub struct FileWatchers {
    watcher: Option<RecommendedWatcher>,
    state: Arc<ChangeState>,
    watched: Vec<PathBuf>,
}

impl FileWatchers {
    /// Watch the binary's directory (every change counts) plus the given
    /// filters. Directories that don't exist are skipped with a warning.
    pub fn start(binary_dir: &Path, filters: &[String], label: &str) -> Self {
        let mut rules = vec![WatchRule { dir: canonical(binary_dir), pattern: None }];
        for filter in filters {
            match WatchRule::parse(filter) {
                Some(rule) => rules.push(rule),
                None => tracing::warn!("[{}] Ignoring unusable monitor filter '{}'", label, filter),
            }
        }

        let state = Arc::new(ChangeState::default());
        let matcher_rules = rules.clone();
        let matcher_state = state.clone();
        let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let Ok(event) = res else { return };
            if !counts_as_change(&event.kind) {
                return;
            }
            if let Some(path) = event.paths.iter().find(|p| matcher_rules.iter().any(|r| r.matches(p))) {
                matcher_state.count.fetch_add(1, Ordering::SeqCst);
                if let Ok(mut last) = matcher_state.last.lock() {
                    *last = Some(path.clone());
                }
            }
        });

        let mut watcher = match watcher {
            Ok(w) => w,
            Err(e) => {
                tracing::warn!("[{}] File watcher unavailable: {}", label, e);
                return Self { watcher: None, state, watched: Vec::new() };
            }
        };

        let mut watched: Vec<PathBuf> = Vec::new();
        for rule in &rules {
            if watched.contains(&rule.dir) {
                continue;
            }
            if !rule.dir.is_dir() {
                tracing::warn!("[{}] Monitored directory {} does not exist", label, rule.dir.display());
                continue;
            }
            match watcher.watch(&rule.dir, RecursiveMode::NonRecursive) {
                Ok(()) => watched.push(rule.dir.clone()),
                Err(e) => tracing::warn!("[{}] Cannot watch {}: {}", label, rule.dir.display(), e),
            }
        }

        Self { watcher: Some(watcher), state, watched }
    }

    /// Path of the most recent relevant change, if anything changed at all.
    pub fn changed(&self) -> Option<PathBuf> {
        if self.state.count.load(Ordering::SeqCst) == 0 {
            return None;
        }
        let last = self.state.last.lock().ok().and_then(|l| l.clone());
        Some(last.unwrap_or_default())
    }

    pub fn watched_dirs(&self) -> &[PathBuf] {
        &self.watched
    }

    pub fn stop(&mut self) {
        if let Some(mut watcher) = self.watcher.take() {
            for dir in self.watched.drain(..) {
                let _ = watcher.unwatch(&dir);
            }
        }
    }
}

impl Drop for FileWatchers {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Reads (including the host's own staging copy) are not changes.
fn counts_as_change(kind: &EventKind) -> bool {
    match kind {
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => true,
        EventKind::Access(_) => false,
        _ => true,
    }
}
