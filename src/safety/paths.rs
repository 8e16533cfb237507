//! Path confinement for writes into an environment root.
//!
//! Callers hand in relative paths from untrusted requests. A path is accepted
//! only if it names something strictly below the root and no existing
//! component along the way is a symlink.

use crate::config::types::{Result, SandboxError};
use std::path::{Component, Path, PathBuf};

/// Resolve `relative` below `root`, rejecting anything that could escape it.
pub fn resolve_within(root: &Path, relative: &str) -> Result<PathBuf> {
    if relative.is_empty() {
        return Err(SandboxError::Filesystem("empty path".to_string()));
    }
    if relative.contains('\0') {
        return Err(SandboxError::Filesystem(format!(
            "path contains NUL byte: {:?}",
            relative
        )));
    }

    let mut clean = PathBuf::new();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(SandboxError::Filesystem(format!(
                    "path escapes environment root: {}",
                    relative
                )))
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(SandboxError::Filesystem(format!(
                    "absolute paths are not allowed: {}",
                    relative
                )))
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(SandboxError::Filesystem(format!(
            "path names the environment root itself: {}",
            relative
        )));
    }

    let mut current = root.to_path_buf();
    for part in clean.iter() {
        current.push(part);
        match std::fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(SandboxError::Filesystem(format!(
                    "refusing to follow symlink at {}",
                    current.display()
                )));
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => break,
            Err(e) => {
                return Err(SandboxError::Filesystem(format!(
                    "cannot inspect {}: {}",
                    current.display(),
                    e
                )))
            }
        }
    }

    Ok(root.join(clean))
}

/// Total size in bytes of regular files under `path`, without following symlinks.
pub fn tree_size(path: &Path) -> Result<u64> {
    let meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    if !meta.is_dir() {
        return Ok(if meta.is_file() { meta.len() } else { 0 });
    }

    let mut total = 0u64;
    let mut pending = vec![path.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let meta = entry.path().symlink_metadata()?;
            if meta.is_dir() {
                pending.push(entry.path());
            } else if meta.is_file() {
                total += meta.len();
            }
        }
    }
    Ok(total)
}
