//! Submission controller: validate, upload, submit, and poll a remote run.

use std::{
    future::Future,
    path::PathBuf,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use chrono::Local;
use flowreg_session_core::{
    JobHandle, JobState, MsgStore, PathMapping, RemoteProfile, RemoteRun, RunStorage,
    SessionConfig, SessionEvent, SubmissionState, Transport, TransportError,
};
use flowreg_session_slurm::{
    STAGE1_SCRIPT, STAGE23_SCRIPT, StatusReport, cancel_command, parse_job_id, sacct_command,
    squeue_command, submit_command, tail_log_command,
};
use flowreg_session_transport::{
    RemoteDirectoryListing, list_remote_directories, list_remote_directory, quote_remote_path,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{bundle, discovery, error::ControllerError};

/// Polling cadence for `poll_until_terminal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Clears the in-flight flag when a `run` ends, however it ends.
struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Drives one remote target through
/// `Idle → Validating → Uploading → Submitting → Polling → {Succeeded, Failed}`.
///
/// Single-flow: a second `run` while one is in flight fails with
/// `AlreadyRunning`. Progress goes to the controller's `MsgStore`.
pub struct SubmissionController<T, S>
where
    T: Transport,
    S: RunStorage,
{
    id: Uuid,
    transport: T,
    storage: S,
    profile: RemoteProfile,
    mappings: Vec<PathMapping>,
    bundle_root: PathBuf,
    msg_store: Arc<MsgStore>,
    state: Mutex<SubmissionState>,
    in_flight: AtomicBool,
}

impl<T, S> SubmissionController<T, S>
where
    T: Transport,
    S: RunStorage,
{
    /// Create a controller for `profile`.
    #[must_use]
    pub fn new(transport: T, storage: S, profile: RemoteProfile, mappings: Vec<PathMapping>) -> Self {
        Self {
            id: Uuid::new_v4(),
            transport,
            storage,
            profile,
            mappings,
            bundle_root: bundle::default_bundle_root(),
            msg_store: Arc::new(MsgStore::new()),
            state: Mutex::new(SubmissionState::Idle),
            in_flight: AtomicBool::new(false),
        }
    }

    /// Place local bundles under `root` instead of the system temp dir.
    #[must_use]
    pub fn with_bundle_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.bundle_root = root.into();
        self
    }

    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub const fn profile(&self) -> &RemoteProfile {
        &self.profile
    }

    #[must_use]
    pub fn msg_store(&self) -> Arc<MsgStore> {
        Arc::clone(&self.msg_store)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SubmissionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, next: SubmissionState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if next != SubmissionState::Failed && next.predecessor() != Some(*state) {
            tracing::warn!(session = %self.id, from = ?*state, to = ?next, "Out-of-order transition");
        }
        *state = next;
        drop(state);
        tracing::info!(session = %self.id, state = ?next, "Submission state changed");
        self.msg_store.push(SessionEvent::State(next));
    }

    /// The stored run, or `NotUploaded`.
    ///
    /// # Errors
    /// Returns `NotUploaded` if nothing was uploaded yet.
    pub async fn current_run(&self) -> Result<RemoteRun, ControllerError> {
        self.storage
            .load()
            .await?
            .filter(|run| !run.remote_run_dir.trim().is_empty())
            .ok_or(ControllerError::NotUploaded)
    }

    /// Drop the stored run so the next `submit` needs a fresh upload.
    /// Remote files and jobs are untouched.
    ///
    /// # Errors
    /// Returns storage errors.
    pub async fn forget_run(&self) -> Result<Option<RemoteRun>, ControllerError> {
        let run = self.storage.load().await?;
        self.storage.clear().await?;
        if let Some(run) = &run {
            tracing::info!(session = %self.id, run = %run.run_name, "Forgot run state");
        }
        Ok(run)
    }

    /// Check that the remote alias is reachable.
    ///
    /// # Errors
    /// Returns `InvalidProfile` or the classified transport error.
    pub async fn test_connection(&self) -> Result<String, ControllerError> {
        self.profile
            .validate()
            .map_err(ControllerError::InvalidProfile)?;
        self.msg_store
            .push_progress(format!("Testing SSH connection to {}", self.profile.host_alias));
        let reply = self.transport.test_connection(&self.profile).await?;
        self.msg_store.push_progress("SSH connection OK");
        Ok(reply)
    }

    /// Prepare the run bundle for `config` and mirror it into a new remote
    /// run directory.
    ///
    /// # Errors
    /// Returns config, I/O, or transport errors.
    pub async fn upload(&self, config: &SessionConfig) -> Result<RemoteRun, ControllerError> {
        config.validate()?;
        self.profile
            .validate()
            .map_err(ControllerError::InvalidProfile)?;

        let (num_tasks, warnings) = discovery::array_size(config).await;
        for warning in &warnings {
            tracing::warn!(session = %self.id, "{warning}");
            self.msg_store.push_warning(warning.clone());
        }

        let run_name = bundle::run_name(Local::now());
        let mut run = bundle::prepare_bundle(
            &self.bundle_root,
            &run_name,
            config,
            &self.profile,
            &self.mappings,
            num_tasks,
        )
        .await?;
        run.upload_warnings = warnings;

        self.msg_store
            .push_progress(format!("Creating {}", run.remote_run_dir));
        let mkdir = format!("mkdir -p {}", quote_remote_path(&run.remote_run_dir)?);
        self.transport.execute(&self.profile, &mkdir).await?;

        self.msg_store.push_progress(format!(
            "Uploading {} to {}:{}",
            run.local_bundle_dir.display(),
            self.profile.host_alias,
            run.remote_run_dir
        ));
        self.transport
            .upload(&self.profile, &run.local_bundle_dir, &run.remote_run_dir)
            .await?;

        self.storage.save(&run).await?;
        tracing::info!(session = %self.id, run = %run.run_name, num_tasks, "Uploaded run bundle");
        Ok(run)
    }

    /// Submit stage 1 and the dependent stage 2+3 job for the uploaded run.
    ///
    /// # Errors
    /// Returns `NotUploaded` without a prior upload, or transport, Slurm, or
    /// storage errors.
    pub async fn submit(&self) -> Result<RemoteRun, ControllerError> {
        let mut run = self.current_run().await?;
        if run.host_alias != self.profile.host_alias {
            return Err(ControllerError::InvalidProfile(format!(
                "run {} was uploaded to {}, not {}",
                run.run_name, run.host_alias, self.profile.host_alias
            )));
        }
        if run.is_submitted() {
            self.msg_store.push_warning(format!(
                "Run {} was already submitted; submitting again",
                run.run_name
            ));
        }

        self.msg_store.push_progress("Submitting stage 1 array job");
        let stage1 = self.sbatch(&run, STAGE1_SCRIPT, None).await?;
        run.stage1_job = Some(stage1.clone());
        run.stage23_job = None;
        self.storage.save(&run).await?;

        let script = bundle::write_stage23_script(&run, stage1.as_str(), &self.profile).await?;
        let remote_script = format!("{}/{STAGE23_SCRIPT}", run.remote_run_dir.trim_end_matches('/'));
        self.transport
            .upload(&self.profile, &script, &remote_script)
            .await?;

        self.msg_store
            .push_progress(format!("Submitting stage 2+3 after job {stage1}"));
        let stage23 = self.sbatch(&run, STAGE23_SCRIPT, Some(&stage1)).await?;
        run.stage23_job = Some(stage23.clone());
        self.storage.save(&run).await?;

        tracing::info!(session = %self.id, %stage1, %stage23, "Submitted jobs");
        self.msg_store.push(SessionEvent::Submitted { stage1, stage23 });
        Ok(run)
    }

    async fn sbatch(
        &self,
        run: &RemoteRun,
        script: &str,
        after_ok: Option<&JobHandle>,
    ) -> Result<JobHandle, ControllerError> {
        let command = submit_command(&run.remote_run_dir, script, after_ok)?;
        let output = self.transport.execute(&self.profile, &command).await?;
        Ok(parse_job_id(&output.stdout)?)
    }

    /// Query `squeue` and `sacct` for the run's jobs.
    ///
    /// A failing `sacct` (accounting disabled, say) is reported as
    /// unavailable rather than failing the refresh.
    ///
    /// # Errors
    /// Returns `NoJobs` before submission, or transport errors.
    pub async fn refresh_status(&self) -> Result<StatusReport, ControllerError> {
        let jobs = self.current_run().await?.job_handles();
        if jobs.is_empty() {
            return Err(ControllerError::NoJobs);
        }

        let squeue = self
            .transport
            .execute(&self.profile, &squeue_command(&jobs)?)
            .await?
            .stdout;
        let sacct = match self
            .transport
            .execute(&self.profile, &sacct_command(&jobs)?)
            .await
        {
            Ok(output) => Some(output.stdout),
            Err(e @ (TransportError::RemoteCommand { .. } | TransportError::UnexpectedOutput { .. })) => {
                tracing::debug!(error = %e, "sacct unavailable");
                None
            }
            Err(e) => return Err(e.into()),
        };
        Ok(StatusReport::from_output(&jobs, squeue, sacct))
    }

    /// Refresh until every job is terminal or one of them failed.
    ///
    /// Jobs are left running on timeout or cancellation.
    ///
    /// # Errors
    /// Returns `Timeout`, `Cancelled`, or refresh errors.
    pub async fn poll_until_terminal(
        &self,
        settings: PollSettings,
        cancel: &CancellationToken,
    ) -> Result<StatusReport, ControllerError> {
        let started = tokio::time::Instant::now();
        let mut last: Vec<(JobHandle, JobState)> = Vec::new();
        loop {
            let report = cancellable(cancel, self.refresh_status()).await?;
            for (job, state) in &report.jobs {
                if !last.iter().any(|(j, s)| j == job && s == state) {
                    tracing::info!(session = %self.id, %job, %state, "Job state");
                    self.msg_store.push(SessionEvent::JobState {
                        job: job.clone(),
                        state: *state,
                    });
                }
            }
            last.clone_from(&report.jobs);

            if report.all_terminal() || report.any_unsuccessful() {
                return Ok(report);
            }
            let elapsed = started.elapsed();
            if elapsed >= settings.timeout {
                return Err(ControllerError::Timeout(settings.timeout));
            }
            let wait = settings.interval.min(settings.timeout - elapsed);
            tokio::select! {
                () = tokio::time::sleep(wait) => {}
                () = cancel.cancelled() => return Err(ControllerError::Cancelled),
            }
        }
    }

    /// Tail the newest Slurm log of the run.
    ///
    /// # Errors
    /// Returns `NotUploaded` or transport errors.
    pub async fn tail_latest_log(&self, lines: u32) -> Result<String, ControllerError> {
        let run = self.current_run().await?;
        let command = tail_log_command(&run.remote_run_dir, lines)?;
        Ok(self.transport.execute(&self.profile, &command).await?.stdout)
    }

    /// Cancel `jobs`, or the run's jobs when `jobs` is empty. Returns the
    /// jobs passed to `scancel`; nothing to cancel is not an error.
    ///
    /// # Errors
    /// Returns transport, Slurm, or storage errors.
    pub async fn cancel_jobs(&self, jobs: &[JobHandle]) -> Result<Vec<JobHandle>, ControllerError> {
        let jobs = if jobs.is_empty() {
            self.storage
                .load()
                .await?
                .map(|run| run.job_handles())
                .unwrap_or_default()
        } else {
            jobs.to_vec()
        };
        let Some(command) = cancel_command(&jobs)? else {
            tracing::debug!(session = %self.id, "Nothing to cancel");
            return Ok(Vec::new());
        };
        self.transport.execute(&self.profile, &command).await?;
        tracing::info!(session = %self.id, ?jobs, "Cancelled jobs");
        self.msg_store
            .push_progress(format!("Cancelled {}", command.trim_start_matches("scancel ")));
        Ok(jobs
            .into_iter()
            .filter(|j| !j.as_str().trim().is_empty())
            .collect())
    }

    /// List one remote directory.
    ///
    /// # Errors
    /// Returns transport errors.
    pub async fn list_directory(&self, dir: &str) -> Result<RemoteDirectoryListing, ControllerError> {
        Ok(list_remote_directory(&self.transport, &self.profile, dir).await?)
    }

    /// List directories below `start_dir` (default: the base directory).
    ///
    /// # Errors
    /// Returns transport errors.
    pub async fn list_directories(
        &self,
        start_dir: Option<&str>,
        max_depth: u32,
        limit: u32,
    ) -> Result<Vec<String>, ControllerError> {
        Ok(list_remote_directories(&self.transport, &self.profile, start_dir, max_depth, limit).await?)
    }

    /// Validate, upload, submit, and poll `config` to completion.
    ///
    /// Any failure moves the controller to `Failed` and is returned as is;
    /// nothing is retried. Cancelling drops the in-flight ssh/rsync child.
    ///
    /// # Errors
    /// Returns `AlreadyRunning` if a run is in flight, `JobsFailed` if a job
    /// did not complete, or the error of the failing step.
    pub async fn run(
        &self,
        config: &SessionConfig,
        poll: PollSettings,
        cancel: &CancellationToken,
    ) -> Result<StatusReport, ControllerError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ControllerError::AlreadyRunning);
        }
        let _guard = FlightGuard(&self.in_flight);

        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = SubmissionState::Idle;
        let result = self.run_steps(config, poll, cancel).await;
        match &result {
            Ok(_) => self.transition(SubmissionState::Succeeded),
            Err(e) => {
                tracing::error!(session = %self.id, error = %e, "Submission failed");
                self.transition(SubmissionState::Failed);
                self.msg_store.push(SessionEvent::Error(e.to_string()));
            }
        }
        self.msg_store.push_finished();
        result
    }

    async fn run_steps(
        &self,
        config: &SessionConfig,
        poll: PollSettings,
        cancel: &CancellationToken,
    ) -> Result<StatusReport, ControllerError> {
        self.transition(SubmissionState::Validating);
        cancellable(cancel, self.test_connection()).await?;

        self.transition(SubmissionState::Uploading);
        cancellable(cancel, self.upload(config)).await?;

        self.transition(SubmissionState::Submitting);
        cancellable(cancel, self.submit()).await?;

        self.transition(SubmissionState::Polling);
        let report = self.poll_until_terminal(poll, cancel).await?;
        if report.any_unsuccessful() {
            let summary = report
                .jobs
                .iter()
                .map(|(job, state)| format!("{job} {state}"))
                .collect::<Vec<_>>()
                .join(", ");
            return Err(ControllerError::JobsFailed(summary));
        }
        Ok(report)
    }
}

/// Race `fut` against `cancel`; the losing future is dropped.
async fn cancellable<F, R>(cancel: &CancellationToken, fut: F) -> Result<R, ControllerError>
where
    F: Future<Output = Result<R, ControllerError>>,
{
    tokio::select! {
        result = fut => result,
        () = cancel.cancelled() => Err(ControllerError::Cancelled),
    }
}
