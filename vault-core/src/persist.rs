//! Atomic file replacement
//!
//! Every durable write goes to a uniquely named sibling temp file first and is
//! then renamed over the target, so readers never observe a torn file.

use std::path::{Path, PathBuf};

use crate::error::Result;

/// Prefix of in-flight temp files. Directory scans must skip these.
pub(crate) const TEMP_PREFIX: &str = ".tmp-";

fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{}{}-{}", TEMP_PREFIX, uuid::Uuid::new_v4(), name))
}

/// Atomically replace `path` with `bytes` (blocking)
pub(crate) fn write_atomic_blocking(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = temp_path_for(path);
    if let Err(e) = std::fs::write(&tmp, bytes) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

/// Atomically replace `path` with `bytes`
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = temp_path_for(path);
    if let Err(e) = tokio::fs::write(&tmp, bytes).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}
