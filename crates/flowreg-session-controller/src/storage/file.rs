//! JSON file run storage.

use std::path::PathBuf;

use async_trait::async_trait;
use flowreg_session_core::{RemoteRun, RunStorage, StorageError};

/// Stores the most recent run as pretty-printed JSON.
///
/// Writes go to a sibling temp file first and are renamed into place, so a
/// crash never leaves a truncated state file.
#[derive(Debug, Clone)]
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RunStorage for FileStorage {
    async fn load(&self) -> Result<Option<RemoteRun>, StorageError> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&text)?))
    }

    async fn save(&self, run: &RemoteRun) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let text = serde_json::to_string_pretty(run)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, text).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        tracing::debug!(path = %self.path.display(), run = %run.run_name, "Saved run state");
        Ok(())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        match tokio::fs::remove_file(&self.path).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use flowreg_session_core::JobHandle;

    use super::*;
    use crate::storage::MemoryStorage;

    fn run() -> RemoteRun {
        RemoteRun {
            run_name: "run_20260101_000000".to_string(),
            remote_run_dir: "~/runs/run_20260101_000000".to_string(),
            local_bundle_dir: PathBuf::from("/tmp/flowreg-session/run_20260101_000000"),
            config_filename: "session_config.yaml".to_string(),
            num_tasks: 8,
            stage1_job: Some(JobHandle::new("11")),
            stage23_job: None,
            upload_warnings: vec!["Local input discovery found 0 files.".to_string()],
            host_alias: "deigo".to_string(),
        }
    }

    async fn exercise(storage: &dyn RunStorage) {
        assert_eq!(storage.load().await.unwrap(), None);
        storage.save(&run()).await.unwrap();
        assert_eq!(storage.load().await.unwrap(), Some(run()));

        let mut updated = run();
        updated.stage23_job = Some(JobHandle::new("12"));
        storage.save(&updated).await.unwrap();
        assert_eq!(storage.load().await.unwrap(), Some(updated));

        storage.clear().await.unwrap();
        assert_eq!(storage.load().await.unwrap(), None);
        storage.clear().await.unwrap();
    }

    #[tokio::test]
    async fn file_storage_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("state/last_run.json"));
        exercise(&storage).await;
    }

    #[test]
    fn memory_storage_lifecycle() {
        tokio_test::block_on(exercise(&MemoryStorage::new()));
    }

    #[tokio::test]
    async fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("last_run.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = FileStorage::new(path).load().await.unwrap_err();
        assert!(matches!(err, StorageError::Corrupt(_)));
    }
}
