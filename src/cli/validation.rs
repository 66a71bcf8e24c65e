use crate::error::{MirrorError, Result};
use std::path::{Path, PathBuf};

/// Resolve the source directory to an absolute path. If that fails the path
/// is used as given and the later stat reports the problem.
pub fn resolve_source(path: &Path) -> PathBuf {
    match std::fs::canonicalize(path) {
        Ok(resolved) => resolved,
        Err(e) => {
            tracing::warn!("Failed to resolve {}: {}", path.display(), e);
            path.to_path_buf()
        }
    }
}

pub fn validate_mountpoint(path: &Path) -> Result<()> {
    let meta = std::fs::metadata(path).map_err(|e| MirrorError::Mountpoint {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    if !meta.is_dir() {
        return Err(MirrorError::Mountpoint {
            path: path.to_path_buf(),
            reason: "Mountpoint is not a directory".to_string(),
        });
    }

    Ok(())
}
