use std::{path::PathBuf, time::Duration};

use flowreg_session_core::{ConfigError, StorageError, TransportError};
use flowreg_session_slurm::SlurmError;
use thiserror::Error;

/// Submission controller error.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("A submission is already in progress")]
    AlreadyRunning,
    #[error("No remote run directory available. Upload first.")]
    NotUploaded,
    #[error("No submitted jobs to query.")]
    NoJobs,
    #[error("Invalid remote profile: {0}")]
    InvalidProfile(String),
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Jobs still running after {0:?}")]
    Timeout(Duration),
    #[error("Jobs did not complete: {0}")]
    JobsFailed(String),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("Slurm error: {0}")]
    Slurm(#[from] SlurmError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ControllerError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io { path, source }
    }

    /// Steps the user can take to fix the error, if any are known.
    #[must_use]
    pub fn hint(&self) -> Option<String> {
        match self {
            Self::Transport(e) | Self::Slurm(SlurmError::InvalidPath(e)) => e.hint(),
            Self::NotUploaded => Some("Upload a configuration before submitting.".to_string()),
            Self::NoJobs => Some("Submit the uploaded run first.".to_string()),
            Self::Timeout(_) | Self::Cancelled => Some(
                "Submitted jobs keep running on the cluster; check them with `status` \
                 or stop them with `cancel`."
                    .to_string(),
            ),
            _ => None,
        }
    }
}
