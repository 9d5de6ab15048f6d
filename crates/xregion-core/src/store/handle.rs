//! Process-wide store handle with open-on-first-use and explicit teardown.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::info;

use super::{StoreError, TransactionStore};

/// Lazily-opened [`TransactionStore`] shared by every phase of one process.
///
/// The database file is opened the first time [`StoreHandle::get`] is
/// called. [`StoreHandle::shutdown`] checkpoints the WAL and drops the
/// handle's connection; a later `get` reopens it.
#[derive(Debug)]
pub struct StoreHandle {
    path: PathBuf,
    store: Mutex<Option<TransactionStore>>,
}

impl StoreHandle {
    /// Creates a handle for the database at `path` without opening it.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            store: Mutex::new(None),
        }
    }

    /// Database file this handle opens.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the shared store, opening it on first use.
    pub fn get(&self) -> Result<TransactionStore, StoreError> {
        let mut slot = self
            .store
            .lock()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))?;
        if let Some(store) = slot.as_ref() {
            return Ok(store.clone());
        }
        let store = TransactionStore::open(&self.path)?;
        info!(path = %self.path.display(), "transaction store opened");
        *slot = Some(store.clone());
        Ok(store)
    }

    /// Returns `true` while a connection is held.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.store.lock().is_ok_and(|slot| slot.is_some())
    }

    /// Checkpoints the WAL and releases the handle's connection.
    ///
    /// Clones previously returned by [`StoreHandle::get`] keep the
    /// connection alive until they are dropped.
    pub fn shutdown(&self) -> Result<(), StoreError> {
        let taken = self
            .store
            .lock()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))?
            .take();
        if let Some(store) = taken {
            store.checkpoint()?;
            info!(path = %self.path.display(), "transaction store closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_on_first_use_and_reopens_after_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let handle = StoreHandle::new(dir.path().join("xregion.db"));
        assert!(!handle.is_open());

        let store = handle.get().unwrap();
        store.register_region("r1", 1).unwrap();
        assert!(handle.is_open());
        drop(store);

        handle.shutdown().unwrap();
        assert!(!handle.is_open());
        handle.shutdown().unwrap();

        let reopened = handle.get().unwrap();
        assert!(reopened.regions().unwrap().contains("r1"));
    }
}
