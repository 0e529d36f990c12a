//! `Transport` over the system `ssh` and `rsync` binaries.

use std::path::Path;

use async_trait::async_trait;
use flowreg_session_core::{ExecOutput, RemoteProfile, Transport, TransportError};

use crate::{
    classify::{classify_rsync_failure, classify_ssh_failure},
    command::{CommandParts, rsync_upload_command, ssh_command},
    runner::{CommandOutput, CommandRunner, ProcessRunner},
};

/// Remote command used to check connectivity.
pub const CONNECTIVITY_COMMAND: &str = "echo connected";
const CONNECTIVITY_REPLY: &str = "connected";

/// Default `ConnectTimeout` for ssh, in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u32 = 15;

/// SSH/rsync transport.
///
/// Authentication is delegated entirely to the SSH client configuration of
/// the current user.
#[derive(Debug, Clone)]
pub struct SshTransport<R = ProcessRunner> {
    runner: R,
    connect_timeout_secs: Option<u32>,
}

impl Default for SshTransport<ProcessRunner> {
    fn default() -> Self {
        Self::new(ProcessRunner)
    }
}

impl<R: CommandRunner> SshTransport<R> {
    /// Create a transport that spawns through `runner`.
    #[must_use]
    pub fn new(runner: R) -> Self {
        Self {
            runner,
            connect_timeout_secs: Some(DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }

    /// Override the ssh connect timeout; `None` uses the client default.
    #[must_use]
    pub fn with_connect_timeout(mut self, secs: Option<u32>) -> Self {
        self.connect_timeout_secs = secs;
        self
    }

    /// Access the underlying runner.
    #[must_use]
    pub const fn runner(&self) -> &R {
        &self.runner
    }

    async fn spawn(&self, parts: &CommandParts) -> Result<CommandOutput, TransportError> {
        self.runner.run(parts).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                TransportError::ExecutableNotFound(parts.program.clone())
            } else {
                TransportError::Io(e)
            }
        })
    }
}

#[async_trait]
impl<R: CommandRunner> Transport for SshTransport<R> {
    async fn test_connection(&self, target: &RemoteProfile) -> Result<String, TransportError> {
        let output = self.execute(target, CONNECTIVITY_COMMAND).await?;
        if output.stdout.lines().any(|l| l.trim() == CONNECTIVITY_REPLY) {
            tracing::info!(host = %target.host_alias, "SSH connection verified");
            Ok(output.stdout)
        } else {
            Err(TransportError::UnexpectedOutput {
                command: CONNECTIVITY_COMMAND.to_string(),
                output: output.stdout,
            })
        }
    }

    async fn upload(
        &self,
        target: &RemoteProfile,
        local_path: &Path,
        remote_path: &str,
    ) -> Result<(), TransportError> {
        if !local_path.exists() {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("local path does not exist: {}", local_path.display()),
            )));
        }
        let parts = rsync_upload_command(
            &target.host_alias,
            local_path,
            remote_path,
            self.connect_timeout_secs,
        );
        tracing::debug!(host = %target.host_alias, local = %local_path.display(), remote_path, "Uploading");
        let output = self.spawn(&parts).await?;
        if output.success() {
            Ok(())
        } else {
            tracing::warn!(code = ?output.code, stderr = %output.stderr.trim(), "rsync failed");
            Err(classify_rsync_failure(
                &target.host_alias,
                output.code,
                &output.stderr,
            ))
        }
    }

    async fn execute(
        &self,
        target: &RemoteProfile,
        command: &str,
    ) -> Result<ExecOutput, TransportError> {
        let parts = ssh_command(&target.host_alias, command, self.connect_timeout_secs)?;
        tracing::debug!(host = %target.host_alias, command, "Running remote command");
        let output = self.spawn(&parts).await?;
        if output.success() {
            Ok(ExecOutput {
                stdout: output.stdout.trim().to_string(),
                stderr: output.stderr.trim().to_string(),
            })
        } else {
            tracing::warn!(code = ?output.code, stderr = %output.stderr.trim(), "ssh command failed");
            Err(classify_ssh_failure(
                &target.host_alias,
                command,
                output.code,
                &output.stderr,
            ))
        }
    }
}
