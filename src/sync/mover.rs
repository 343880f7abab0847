//! Moving files into the sync folder.

use crate::error::{Result, StoreError};
use crate::temp_file::{temp_path_for, TempFileGuard};
use std::io;
use std::path::Path;
use tokio::fs;

/// Move `src` to `dst`, creating `dst`'s parent.
///
/// Tries a rename first; when that fails (typically a cross-filesystem move)
/// the data is copied to `dst.tmp`, synced, renamed onto `dst` and the source
/// is removed.
pub async fn move_file(src: &Path, dst: &Path) -> Result<()> {
    let meta = fs::metadata(src)
        .await
        .map_err(|e| StoreError::io("stat", src, e))?;
    if meta.is_dir() {
        return Err(StoreError::io(
            "move",
            src,
            io::Error::new(io::ErrorKind::InvalidInput, "source is a directory"),
        ));
    }

    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| StoreError::io("create directory", parent, e))?;
    }

    if same_file(src, dst).await {
        return Ok(());
    }

    match fs::rename(src, dst).await {
        Ok(()) => return Ok(()),
        Err(e) => tracing::debug!(
            "rename {} -> {} failed ({}), falling back to copy",
            src.display(),
            dst.display(),
            e
        ),
    }

    let temp = temp_path_for(dst);
    let guard = TempFileGuard::new(&temp);

    fs::copy(src, &temp)
        .await
        .map_err(|e| StoreError::io("copy", src, e))?;
    let file = fs::OpenOptions::new()
        .write(true)
        .open(&temp)
        .await
        .map_err(|e| StoreError::io("open", &temp, e))?;
    file.sync_all()
        .await
        .map_err(|e| StoreError::io("sync", &temp, e))?;
    drop(file);

    fs::rename(&temp, dst)
        .await
        .map_err(|e| StoreError::io("rename", &temp, e))?;
    guard.defuse();

    fs::remove_file(src)
        .await
        .map_err(|e| StoreError::io("remove", src, e))?;

    Ok(())
}

async fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a).await, fs::canonicalize(b).await) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
