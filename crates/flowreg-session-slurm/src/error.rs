use flowreg_session_core::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SlurmError {
    #[error("Could not parse sbatch output: {0}")]
    UnparsableSubmit(String),

    #[error("Invalid job id: {0:?}")]
    InvalidJobId(String),

    #[error("Invalid remote path: {0}")]
    InvalidPath(#[from] TransportError),
}
