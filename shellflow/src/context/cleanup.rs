//! Registry of output paths removed when a stage fails.

use parking_lot::RwLock;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// Paths a failed stage must not leave behind, removed in LIFO order.
///
/// The registry is shared by the scheduler and the stage's run contexts. It
/// can be disabled, in which case `run_all` keeps every file for inspection.
#[derive(Debug)]
pub struct CleanupRegistry {
    paths: RwLock<Vec<PathBuf>>,
    enabled: AtomicBool,
}

impl Default for CleanupRegistry {
    fn default() -> Self {
        Self::new(true)
    }
}

impl CleanupRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        Self {
            paths: RwLock::new(Vec::new()),
            enabled: AtomicBool::new(enabled),
        }
    }

    /// Registers a path. Registering the same path twice is a no-op.
    pub fn register(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        let mut paths = self.paths.write();
        if !paths.contains(&path) {
            paths.push(path);
        }
    }

    /// Registers several paths in order.
    pub fn register_all<I, P>(&self, paths: I)
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        for path in paths {
            self.register(path);
        }
    }

    /// Enables or disables removal.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Returns true if `run_all` will remove files.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Returns the number of registered paths.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.paths.read().len()
    }

    /// Returns the registered paths in registration order.
    #[must_use]
    pub fn paths(&self) -> Vec<PathBuf> {
        self.paths.read().clone()
    }

    /// Forgets every registered path without touching the filesystem.
    pub fn clear(&self) {
        self.paths.write().clear();
    }

    /// Removes every registered path that exists, newest first.
    ///
    /// Returns the removed paths. Removal errors are logged and do not stop
    /// the remaining removals. The registry is empty afterwards.
    pub async fn run_all(&self) -> Vec<PathBuf> {
        let paths = std::mem::take(&mut *self.paths.write());
        if !self.is_enabled() {
            debug!(count = paths.len(), "cleanup disabled, keeping outputs");
            return Vec::new();
        }

        let mut removed = Vec::new();
        for path in paths.into_iter().rev() {
            match remove_path(&path).await {
                Ok(true) => {
                    debug!(path = %path.display(), "removed output of failed stage");
                    removed.push(path);
                }
                Ok(false) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove output"),
            }
        }
        removed
    }
}

async fn remove_path(path: &Path) -> std::io::Result<bool> {
    let metadata = match tokio::fs::symlink_metadata(path).await {
        Ok(m) => m,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    if metadata.is_dir() {
        tokio::fs::remove_dir_all(path).await?;
    } else {
        tokio::fs::remove_file(path).await?;
    }
    Ok(true)
}
