//! Private working copies of module binaries.
//!
//! Every boundary runs from its own `switchyard-stage-N` directory so the
//! operator can overwrite the original binary while the old copy keeps running.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};

use crate::error::EngineError;

pub const STAGE_PREFIX: &str = "switchyard-stage-";

/// Sibling files copied along with the binary
const SUPPORT_EXTENSIONS: &[&str] = &["so", "dylib", "dll", "pdb"];

static NEXT_STAGE: AtomicU64 = AtomicU64::new(1);

pub fn ensure_root(root: &Path) -> Result<(), EngineError> {
    fs::create_dir_all(root).map_err(|source| EngineError::DirectoryCreation {
        path: root.display().to_string(),
        source,
    })
}

/// Create a fresh, never-before-used staging directory under `root`.
pub fn allocate(root: &Path) -> Result<PathBuf, EngineError> {
    ensure_root(root)?;
    loop {
        let n = NEXT_STAGE.fetch_add(1, Ordering::SeqCst);
        let dir = root.join(format!("{}{}", STAGE_PREFIX, n));
        match fs::create_dir(&dir) {
            Ok(()) => return Ok(dir),
            // 이전 실행의 잔재, 다음 번호로
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(source) => {
                return Err(EngineError::DirectoryCreation {
                    path: dir.display().to_string(),
                    source,
                })
            }
        }
    }
}

/// Copy `binary` and its support files into `dir`; returns the staged binary.
pub fn stage_binary(binary: &Path, dir: &Path) -> Result<PathBuf> {
    let file_name = binary
        .file_name()
        .with_context(|| format!("Module binary path '{}' has no file name", binary.display()))?;
    let staged = dir.join(file_name);
    fs::copy(binary, &staged)
        .with_context(|| format!("Failed to copy '{}' to '{}'", binary.display(), staged.display()))?;

    if let Some(source_dir) = binary.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Ok(entries) = fs::read_dir(source_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                let is_support = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| SUPPORT_EXTENSIONS.contains(&e))
                    .unwrap_or(false);
                if !is_support || !path.is_file() {
                    continue;
                }
                if let Some(name) = path.file_name() {
                    if let Err(e) = fs::copy(&path, dir.join(name)) {
                        tracing::warn!("Failed to stage support file {}: {}", path.display(), e);
                    }
                }
            }
        }
    }

    Ok(staged)
}

/// Remove leftovers of earlier runs. Best effort; returns how many were removed.
pub fn sweep_stale(root: &Path) -> usize {
    let Ok(entries) = fs::read_dir(root) else {
        return 0;
    };
    let mut removed = 0;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let is_stage = name.to_str().map(|n| n.starts_with(STAGE_PREFIX)).unwrap_or(false);
        if !is_stage {
            continue;
        }
        match fs::remove_dir_all(entry.path()) {
            Ok(()) => removed += 1,
            Err(e) => tracing::debug!("Could not sweep {}: {}", entry.path().display(), e),
        }
    }
    if removed > 0 {
        tracing::info!("Swept {} stale staging directories from {}", removed, root.display());
    }
    removed
}

/// Delete a staging directory, logging instead of failing.
pub fn remove(dir: &Path) {
    if let Err(e) = fs::remove_dir_all(dir) {
        if e.kind() != ErrorKind::NotFound {
            tracing::warn!("Failed to remove staging directory {}: {}", dir.display(), e);
        }
    }
}
