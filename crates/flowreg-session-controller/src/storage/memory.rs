//! In-memory run storage.

use std::sync::RwLock;

use async_trait::async_trait;
use flowreg_session_core::{RemoteRun, RunStorage, StorageError};

/// In-memory storage implementation.
///
/// Useful for tests and single-invocation flows.
/// Data is lost on exit.
#[derive(Default)]
pub struct MemoryStorage {
    run: RwLock<Option<RemoteRun>>,
}

impl MemoryStorage {
    /// Create a new in-memory storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStorage for MemoryStorage {
    async fn load(&self) -> Result<Option<RemoteRun>, StorageError> {
        Ok(self
            .run
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .clone())
    }

    async fn save(&self, run: &RemoteRun) -> Result<(), StorageError> {
        *self
            .run
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))? = Some(run.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.run
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .take();
        Ok(())
    }
}
