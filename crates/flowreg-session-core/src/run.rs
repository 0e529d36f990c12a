//! State of an uploaded and submitted remote run.

use std::{fmt, path::PathBuf};

use serde::{Deserialize, Serialize};

/// Identifier returned by the scheduler for a submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobHandle(String);

impl JobHandle {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Scheduler-reported state of a job, collapsed over array tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Queued, or held waiting on a dependency.
    Pending,
    /// At least one task is executing.
    Running,
    /// Every task finished successfully.
    Completed,
    /// At least one task failed, or a dependency can never be satisfied.
    Failed,
    /// Cancelled by a user or administrator.
    Cancelled,
    /// Not visible to the scheduler (yet).
    Unknown,
}

impl JobState {
    /// Whether the job lifecycle has ended.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Everything known about one run bundle on the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRun {
    /// `run_YYYYmmdd_HHMMSS`.
    pub run_name: String,
    /// Absolute or `~`-relative run directory on the cluster.
    pub remote_run_dir: String,
    /// Local directory mirrored into `remote_run_dir`.
    pub local_bundle_dir: PathBuf,
    pub config_filename: String,
    /// Stage 1 array size.
    pub num_tasks: u32,
    #[serde(default)]
    pub stage1_job: Option<JobHandle>,
    #[serde(default)]
    pub stage23_job: Option<JobHandle>,
    #[serde(default)]
    pub upload_warnings: Vec<String>,
    /// Host the run was uploaded to.
    pub host_alias: String,
}

impl RemoteRun {
    /// Submitted job handles, stage 1 first.
    #[must_use]
    pub fn job_handles(&self) -> Vec<JobHandle> {
        self.stage1_job
            .iter()
            .chain(self.stage23_job.iter())
            .cloned()
            .collect()
    }

    /// Whether both stages have been submitted.
    #[must_use]
    pub const fn is_submitted(&self) -> bool {
        self.stage1_job.is_some() && self.stage23_job.is_some()
    }
}
