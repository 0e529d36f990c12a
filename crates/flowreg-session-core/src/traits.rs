//! Core traits for remote transport and run-state storage.

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

use crate::{RemoteProfile, RemoteRun};

/// Captured output of a successful remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Standard output, trimmed.
    pub stdout: String,
    /// Standard error, trimmed.
    pub stderr: String,
}

/// Broad class of a transport failure, used to pick a user-facing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The host could not be reached.
    Connectivity,
    /// The host was reached but refused our identity or its own key changed.
    Authentication,
    /// A file transfer did not complete.
    Transfer,
    /// The remote command ran and failed.
    RemoteExecution,
    /// Something failed on this machine.
    Local,
}

/// Transport error.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Authentication failed for '{host}': {detail}")]
    AuthenticationFailed { host: String, detail: String },
    #[error("Host key verification failed for '{host}': {detail}")]
    HostKeyVerification { host: String, detail: String },
    #[error("Host '{host}' unreachable: {detail}")]
    HostUnreachable { host: String, detail: String },
    #[error("Transfer interrupted: {detail}")]
    TransferInterrupted { detail: String },
    #[error("Transfer failed (rsync exit {code}): {detail}")]
    TransferFailed { code: i32, detail: String },
    #[error("Command failed (exit {code}): {command}\n{stderr}")]
    RemoteCommand {
        command: String,
        code: i32,
        stderr: String,
    },
    #[error("Unexpected output from '{command}': {output}")]
    UnexpectedOutput { command: String, output: String },
    #[error("Executable not found: {0}")]
    ExecutableNotFound(String),
    #[error("Invalid command: {0}")]
    InvalidCommand(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Classify the error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::AuthenticationFailed { .. } | Self::HostKeyVerification { .. } => {
                ErrorKind::Authentication
            }
            Self::HostUnreachable { .. } => ErrorKind::Connectivity,
            Self::TransferInterrupted { .. } | Self::TransferFailed { .. } => ErrorKind::Transfer,
            Self::RemoteCommand { .. } | Self::UnexpectedOutput { .. } => {
                ErrorKind::RemoteExecution
            }
            Self::ExecutableNotFound(_) | Self::InvalidCommand(_) | Self::Io(_) => ErrorKind::Local,
        }
    }

    /// Steps the user can take to fix the error, if any are known.
    ///
    /// Interactive SSH prompts are disabled (`BatchMode=yes`), so host keys
    /// and passphrases have to be settled in a terminal first.
    #[must_use]
    pub fn hint(&self) -> Option<String> {
        let accept = |host: &str| {
            format!("ssh -o StrictHostKeyChecking=accept-new {host} \"echo connected\"")
        };
        match self {
            Self::AuthenticationFailed { host, .. } | Self::HostUnreachable { host, .. } => {
                Some(format!(
                    "SSH interactive prompts are disabled (BatchMode=yes).\n\n\
                     Run this once in a terminal, then retry:\n\
                     1) Accept key + test login: {}",
                    accept(host)
                ))
            }
            Self::HostKeyVerification { host, .. } => Some(format!(
                "SSH interactive prompts are disabled (BatchMode=yes).\n\n\
                 Run these once in a terminal, then retry:\n\
                 1) Accept key + test login: {accept}\n\
                 2) If key changed, clear stale key: ssh-keygen -R {host}\n\
                 3) Retry login test: {accept}",
                accept = accept(host)
            )),
            Self::ExecutableNotFound(program) => {
                Some(format!("Install '{program}' or add it to PATH."))
            }
            _ => None,
        }
    }
}

/// Remote execution and file transfer against a `RemoteProfile`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Check that the host is reachable and accepts our credentials.
    ///
    /// Returns the remote reply.
    async fn test_connection(&self, target: &RemoteProfile) -> Result<String, TransportError>;

    /// Copy a local file or directory to `remote_path` on the target.
    ///
    /// A directory upload mirrors its contents into `remote_path`; uploading
    /// identical content again changes nothing.
    async fn upload(
        &self,
        target: &RemoteProfile,
        local_path: &Path,
        remote_path: &str,
    ) -> Result<(), TransportError>;

    /// Run a shell command on the target; a non-zero exit is an error.
    async fn execute(
        &self,
        target: &RemoteProfile,
        command: &str,
    ) -> Result<ExecOutput, TransportError>;
}

/// Storage error.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Corrupt run state: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("Storage error: {0}")]
    Internal(String),
}

/// Persistence for the most recent remote run.
#[async_trait]
pub trait RunStorage: Send + Sync {
    /// Load the stored run, if any.
    async fn load(&self) -> Result<Option<RemoteRun>, StorageError>;

    /// Replace the stored run.
    async fn save(&self, run: &RemoteRun) -> Result<(), StorageError>;

    /// Forget the stored run.
    async fn clear(&self) -> Result<(), StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_key_hint_mentions_keygen() {
        let err = TransportError::HostKeyVerification {
            host: "deigo".to_string(),
            detail: "Host key verification failed.".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::Authentication);
        let hint = err.hint().unwrap();
        assert!(hint.contains("ssh-keygen -R deigo"));
        assert!(hint.contains("StrictHostKeyChecking=accept-new deigo"));
    }

    #[test]
    fn remote_command_has_no_hint() {
        let err = TransportError::RemoteCommand {
            command: "sbatch x".to_string(),
            code: 1,
            stderr: "boom".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::RemoteExecution);
        assert!(err.hint().is_none());
    }
}
