//! RAII cleanup for in-progress temp files.

use std::path::{Path, PathBuf};

/// Removes the file at `path` on drop unless [`defuse`](TempFileGuard::defuse) was called.
#[derive(Debug)]
pub struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            armed: true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Keep the file (it has been renamed into place).
    pub fn defuse(mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!("Removed temp file {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove temp file {}: {}", self.path.display(), e),
        }
    }
}

/// `name` -> `name.tmp`, next to the original.
pub fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Whether `path` is one of our in-progress temp files.
pub fn is_temp_path(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "tmp")
}
