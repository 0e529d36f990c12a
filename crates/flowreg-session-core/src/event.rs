//! Typed progress events published by controllers and runners.

use serde::{Deserialize, Serialize};

use crate::run::{JobHandle, JobState};

/// Position of a submission in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionState {
    Idle,
    Validating,
    Uploading,
    Submitting,
    Polling,
    Succeeded,
    Failed,
}

impl SubmissionState {
    /// The state that must precede this one, if any.
    #[must_use]
    pub const fn predecessor(self) -> Option<Self> {
        match self {
            Self::Validating => Some(Self::Idle),
            Self::Uploading => Some(Self::Validating),
            Self::Submitting => Some(Self::Uploading),
            Self::Polling => Some(Self::Submitting),
            Self::Succeeded => Some(Self::Polling),
            Self::Idle | Self::Failed => None,
        }
    }
}

/// Event emitted while a session is prepared, submitted, or run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum SessionEvent {
    /// The controller moved to a new state.
    State(SubmissionState),
    /// Human-readable progress line.
    Progress(String),
    /// Non-fatal problem the user should see.
    Warning(String),
    /// Output line from a local run.
    Stdout(String),
    /// Error output line from a local run.
    Stderr(String),
    /// Both stages were accepted by the scheduler.
    Submitted {
        stage1: JobHandle,
        stage23: JobHandle,
    },
    /// A polled job changed state.
    JobState { job: JobHandle, state: JobState },
    /// The operation failed with a user-facing message.
    Error(String),
    /// No further events follow.
    Finished,
}

impl SessionEvent {
    /// Approximate heap size, used for history limits.
    #[must_use]
    pub fn approx_bytes(&self) -> usize {
        const OVERHEAD: usize = 16;
        let payload = match self {
            Self::Progress(s) | Self::Warning(s) | Self::Stdout(s) | Self::Stderr(s) | Self::Error(s) => {
                s.len()
            }
            Self::Submitted { stage1, stage23 } => stage1.as_str().len() + stage23.as_str().len(),
            Self::JobState { job, .. } => job.as_str().len(),
            Self::State(_) | Self::Finished => 0,
        };
        payload + OVERHEAD
    }
}
