//! Exclusive connection registry.
//!
//! One physical store must never be opened by two backends at the same time.
//! The registry is an explicit, constructed object passed into
//! [`crate::Backend::open`]; there is no process-wide static. Callers that
//! manage several databases share a single registry.

use crate::error::{StorageError, StorageResult};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Registry of active physical connections.
///
/// Maps a connection identifier (the database name) to the set of filesystem
/// paths it currently holds open. Registration fails while any identifier
/// holds the same path, which enforces the single-writer invariant on the
/// physical store.
///
/// Cloning is cheap and shares the underlying table.
#[derive(Debug, Default, Clone)]
pub struct ConnectionRegistry {
    inner: Arc<Mutex<HashMap<String, HashSet<PathBuf>>>>,
}

impl ConnectionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `(identifier, path)` as active.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::AlreadyActive`] if the path is already held by
    /// any identifier.
    pub fn register(&self, identifier: &str, path: &Path) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        if inner.values().any(|paths| paths.contains(path)) {
            return Err(StorageError::AlreadyActive {
                path: path.to_path_buf(),
            });
        }
        inner
            .entry(identifier.to_string())
            .or_default()
            .insert(path.to_path_buf());
        Ok(())
    }

    /// Releases a previously registered `(identifier, path)` pair.
    ///
    /// Releasing a pair that was never registered is a no-op.
    pub fn release(&self, identifier: &str, path: &Path) {
        let mut inner = self.inner.lock();
        if let Some(paths) = inner.get_mut(identifier) {
            paths.remove(path);
            if paths.is_empty() {
                inner.remove(identifier);
            }
        }
    }

    /// Checks whether any identifier currently holds the path.
    #[must_use]
    pub fn is_active(&self, path: &Path) -> bool {
        self.inner
            .lock()
            .values()
            .any(|paths| paths.contains(path))
    }
}
