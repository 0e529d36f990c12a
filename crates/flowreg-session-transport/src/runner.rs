//! Process execution seam.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::{command::CommandParts, resolve::resolve_executable_path};

/// Exit status and captured output of a finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` if the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Successful output with the given stdout.
    #[must_use]
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with the given exit code and stderr.
    #[must_use]
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    #[must_use]
    pub const fn success(&self) -> bool {
        matches!(self.code, Some(0))
    }
}

/// Runs a command to completion and captures its output.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `parts`.
    ///
    /// A non-zero exit is reported in `CommandOutput::code`, not as an error.
    /// A missing program is an `io::ErrorKind::NotFound` error.
    async fn run(&self, parts: &CommandParts) -> std::io::Result<CommandOutput>;
}

/// Runs commands as real child processes.
///
/// Stdin is closed, and the child is killed if the returned future is
/// dropped, so aborting a caller aborts the transfer.
#[derive(Debug, Default, Clone)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, parts: &CommandParts) -> std::io::Result<CommandOutput> {
        let program = resolve_executable_path(&parts.program).await.ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("executable not found: {}", parts.program),
            )
        })?;

        tracing::debug!(command = %parts.display(), "Spawning process");
        let output = Command::new(program)
            .args(&parts.args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_program_is_not_found() {
        let parts = CommandParts::new("flowreg-session-no-such-binary", vec![]);
        let err = ProcessRunner.run(&parts).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn captures_exit_code_and_output() {
        let parts = CommandParts::new(
            "sh",
            vec!["-c".to_string(), "echo out; echo err >&2; exit 3".to_string()],
        );
        let output = ProcessRunner.run(&parts).await.unwrap();
        assert_eq!(output.code, Some(3));
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
        assert!(!output.success());
    }
}
