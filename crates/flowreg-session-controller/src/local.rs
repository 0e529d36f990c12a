//! Local pipeline runner.

use std::{
    path::PathBuf,
    process::Stdio,
    sync::Arc,
};

use command_group::AsyncCommandGroup;
use flowreg_session_core::{ConfigError, MsgStore, SessionConfig, SessionEvent};
use flowreg_session_slurm::{PipelineStage, pipeline_snippet};
use flowreg_session_transport::resolve_executable_path;
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Command,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Environment variable naming the Python interpreter.
pub const PYTHON_ENV_VAR: &str = "FLOWREG_SESSION_PYTHON";
pub const DEFAULT_PYTHON: &str = "python";

/// Local run error.
#[derive(Debug, Error)]
pub enum LocalRunError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("Python interpreter not found: {0}")]
    InterpreterNotFound(String),
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Pipeline exited with {0}")]
    Exited(String),
    #[error("Local run cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy)]
enum OutputStream {
    Stdout,
    Stderr,
}

/// Runs pipeline stages in a child Python process on this machine.
///
/// The child gets its own process group so cancelling also stops any
/// workers it forked. Output lines are published to the runner's
/// `MsgStore` as they arrive.
pub struct LocalRunner {
    python: String,
    scratch_dir: PathBuf,
    msg_store: Arc<MsgStore>,
}

impl LocalRunner {
    #[must_use]
    pub fn new(python: impl Into<String>) -> Self {
        Self {
            python: python.into(),
            scratch_dir: std::env::temp_dir().join("flowreg-session"),
            msg_store: Arc::new(MsgStore::new()),
        }
    }

    /// Write temporary configs under `dir`.
    #[must_use]
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    #[must_use]
    pub fn msg_store(&self) -> Arc<MsgStore> {
        Arc::clone(&self.msg_store)
    }

    /// Run `stage` for `config` until it exits or `cancel` fires.
    ///
    /// `Finished` is published on every path, failures included.
    ///
    /// # Errors
    /// Returns `Exited` on a non-zero exit, `Cancelled` after cancellation,
    /// or config/spawn errors.
    pub async fn run(
        &self,
        config: &SessionConfig,
        stage: PipelineStage,
        cancel: &CancellationToken,
    ) -> Result<(), LocalRunError> {
        let result = self.run_stage(config, stage, cancel).await;
        match &result {
            Ok(()) => self.msg_store.push_progress("Local run finished"),
            Err(e) => {
                tracing::error!(error = %e, "Local run failed");
                self.msg_store.push(SessionEvent::Error(e.to_string()));
            }
        }
        self.msg_store.push_finished();
        result
    }

    async fn run_stage(
        &self,
        config: &SessionConfig,
        stage: PipelineStage,
        cancel: &CancellationToken,
    ) -> Result<(), LocalRunError> {
        config.validate()?;
        let config_path = self
            .scratch_dir
            .join(format!("local_{}.yaml", Uuid::new_v4().simple()));
        // the child runs from an unrelated directory
        config.absolutized().save(&config_path, false).await?;

        let source = pipeline_snippet(stage, &config_path.to_string_lossy());
        self.msg_store
            .push_progress(format!("Running {stage:?} locally with {}", self.python));
        let result = self.run_source(&source, cancel).await;

        if let Err(e) = tokio::fs::remove_file(&config_path).await {
            tracing::debug!(path = %config_path.display(), "Failed to remove temp config: {e}");
        }
        result
    }

    async fn run_source(&self, source: &str, cancel: &CancellationToken) -> Result<(), LocalRunError> {
        let program = resolve_executable_path(&self.python)
            .await
            .ok_or_else(|| LocalRunError::InterpreterNotFound(self.python.clone()))?;

        let mut command = Command::new(&program);
        command
            .arg("-u")
            .arg("-c")
            .arg(source)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = command.group_spawn().map_err(|source| LocalRunError::Spawn {
            program: program.display().to_string(),
            source,
        })?;
        tracing::info!(program = %program.display(), pid = ?child.id(), "Started local run");

        let mut forwarders = Vec::with_capacity(2);
        if let Some(stdout) = child.inner().stdout.take() {
            forwarders.push(tokio::spawn(forward_lines(
                stdout,
                Arc::clone(&self.msg_store),
                OutputStream::Stdout,
            )));
        }
        if let Some(stderr) = child.inner().stderr.take() {
            forwarders.push(tokio::spawn(forward_lines(
                stderr,
                Arc::clone(&self.msg_store),
                OutputStream::Stderr,
            )));
        }

        let exit = tokio::select! {
            status = child.wait() => Some(status),
            () = cancel.cancelled() => None,
        };
        let outcome = match exit {
            Some(status) => {
                let status = status?;
                if status.success() {
                    Ok(())
                } else {
                    Err(LocalRunError::Exited(status.to_string()))
                }
            }
            None => {
                tracing::info!("Cancelling local run");
                if let Err(e) = child.start_kill() {
                    tracing::debug!("Failed to kill process group: {e}");
                }
                let _ = child.wait().await;
                Err(LocalRunError::Cancelled)
            }
        };

        for forwarder in forwarders {
            let _ = forwarder.await;
        }
        outcome
    }
}

async fn forward_lines<R>(reader: R, store: Arc<MsgStore>, stream: OutputStream)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buffer = String::new();
    loop {
        buffer.clear();
        match reader.read_line(&mut buffer).await {
            Ok(0) => break, // EOF
            Ok(_) => {
                let line = buffer.trim_end_matches(['\r', '\n']);
                match stream {
                    OutputStream::Stdout => store.push_stdout(line),
                    OutputStream::Stderr => store.push_stderr(line),
                }
            }
            Err(e) => {
                tracing::error!("Error reading {stream:?}: {e}");
                break;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::{os::unix::fs::PermissionsExt, path::Path, time::Duration};

    use super::*;

    /// Stand-in interpreter: a shell script that ignores its arguments.
    fn fake_python(dir: &Path, body: &str) -> String {
        let path = dir.join("python");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn runner(dir: &tempfile::TempDir, body: &str) -> LocalRunner {
        LocalRunner::new(fake_python(dir.path(), body)).with_scratch_dir(dir.path().join("scratch"))
    }

    #[tokio::test]
    async fn streams_output_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(&dir, "echo 'stage 1 done'\necho 'careful' >&2");
        runner
            .run(&SessionConfig::new("/data"), PipelineStage::Stage1, &CancellationToken::new())
            .await
            .unwrap();

        let history = runner.msg_store().get_history();
        assert!(history.contains(&SessionEvent::Stdout("stage 1 done".to_string())));
        assert!(history.contains(&SessionEvent::Stderr("careful".to_string())));
        assert_eq!(history.last(), Some(&SessionEvent::Finished));
        let leftovers = std::fs::read_dir(dir.path().join("scratch")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn temp_config_carries_absolute_paths() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = dir.path().join("scratch");
        let runner = runner(&dir, &format!("cat {}/local_*.yaml", scratch.display()));
        let mut config = SessionConfig::new("/data/exp");
        config.output_root = Some("out".into());
        config.center = Some("refs/center.npy".into());
        runner
            .run(&config, PipelineStage::All, &CancellationToken::new())
            .await
            .unwrap();

        let lines: Vec<String> = runner
            .msg_store()
            .get_history()
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::Stdout(line) => Some(line),
                _ => None,
            })
            .collect();
        assert!(lines.contains(&"root: /data/exp".to_string()));
        assert!(lines.contains(&"output_root: /data/exp/out".to_string()));
        assert!(lines.contains(&"center: /data/exp/refs/center.npy".to_string()));
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(&dir, "exit 3");
        let err = runner
            .run(&SessionConfig::new("/data"), PipelineStage::All, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LocalRunError::Exited(_)));
    }

    #[tokio::test]
    async fn cancel_kills_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(&dir, "sleep 30");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let result = tokio::time::timeout(
            Duration::from_secs(10),
            runner.run(&SessionConfig::new("/data"), PipelineStage::Stage2, &cancel),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(LocalRunError::Cancelled)));
    }

    #[tokio::test]
    async fn missing_interpreter() {
        let dir = tempfile::tempdir().unwrap();
        let runner = LocalRunner::new("flowreg-session-no-such-python")
            .with_scratch_dir(dir.path());
        let err = runner
            .run(&SessionConfig::new("/data"), PipelineStage::All, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LocalRunError::InterpreterNotFound(_)));
    }

    #[tokio::test]
    async fn invalid_config_never_spawns() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(&dir, "exit 0");
        let mut config = SessionConfig::new("/data");
        config.pattern = String::new();
        let err = runner
            .run(&config, PipelineStage::All, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LocalRunError::Config(_)));
        let history = runner.msg_store().get_history();
        assert_eq!(history.len(), 2);
        assert!(matches!(history[0], SessionEvent::Error(_)));
        assert!(!dir.path().join("scratch").exists());
    }
}
