//! Parsing of `sbatch`, `squeue`, and `sacct` output.

use std::{fmt::Write as _, sync::LazyLock};

use flowreg_session_core::{JobHandle, JobState};
use regex::Regex;

use crate::error::SlurmError;

static SUBMITTED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Submitted batch job (\d+)").unwrap_or_else(|e| unreachable!("{e}"))
});

/// Pending reason reported when an `afterok` dependency failed.
const NEVER_SATISFIED: &str = "DependencyNeverSatisfied";

/// Extract the job id from `sbatch` output.
///
/// # Errors
/// Returns `UnparsableSubmit` if the output has no job id.
pub fn parse_job_id(output: &str) -> Result<JobHandle, SlurmError> {
    SUBMITTED
        .captures(output)
        .and_then(|c| c.get(1))
        .map(|m| JobHandle::new(m.as_str()))
        .ok_or_else(|| SlurmError::UnparsableSubmit(output.trim().to_string()))
}

/// Map a Slurm state name (`RUNNING`, `CANCELLED by 42`, `CANCELLED+`) to a
/// `JobState`.
#[must_use]
pub fn slurm_state(raw: &str) -> JobState {
    let name = raw
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .trim_end_matches('+')
        .to_ascii_uppercase();
    match name.as_str() {
        "PENDING" | "REQUEUED" | "REQUEUE_HOLD" | "REQUEUE_FED" | "RESV_DEL_HOLD" => {
            JobState::Pending
        }
        "RUNNING" | "CONFIGURING" | "COMPLETING" | "SIGNALING" | "STAGE_OUT" | "RESIZING"
        | "SUSPENDED" | "STOPPED" => JobState::Running,
        "COMPLETED" => JobState::Completed,
        "FAILED" | "TIMEOUT" | "OUT_OF_MEMORY" | "NODE_FAIL" | "PREEMPTED" | "BOOT_FAIL"
        | "DEADLINE" | "SPECIAL_EXIT" | "REVOKED" => JobState::Failed,
        "CANCELLED" => JobState::Cancelled,
        _ => JobState::Unknown,
    }
}

/// Leading digits of a job id: `123_[1-4]`, `123_7.batch` and `123` all
/// belong to job `123`.
fn base_id(id: &str) -> &str {
    let end = id.find(|c: char| !c.is_ascii_digit()).unwrap_or(id.len());
    &id[..end]
}

/// One `squeue -o '%i %T %M %R'` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqueueRow {
    pub job_id: String,
    pub state: JobState,
    pub elapsed: String,
    /// Node list when running, `(Reason)` when pending.
    pub reason: String,
}

/// Parse `squeue` output, skipping the header and any diagnostics.
#[must_use]
pub fn parse_squeue(output: &str) -> Vec<SqueueRow> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let job_id = fields.next()?;
            if base_id(job_id).is_empty() {
                return None;
            }
            let state = slurm_state(fields.next()?);
            let elapsed = fields.next().unwrap_or_default().to_string();
            let reason = fields.collect::<Vec<_>>().join(" ");
            Some(SqueueRow {
                job_id: job_id.to_string(),
                state,
                elapsed,
                reason,
            })
        })
        .collect()
}

/// One allocation line of `sacct --noheader`. Step lines (`123.batch`,
/// `123.0`) are dropped by `parse_sacct`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SacctRow {
    pub job_id: String,
    pub state: JobState,
    pub elapsed: Option<String>,
}

/// Parse `sacct` output.
#[must_use]
pub fn parse_sacct(output: &str) -> Vec<SacctRow> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let job_id = fields.next()?;
            if base_id(job_id).is_empty() || job_id.contains('.') {
                return None;
            }
            let state = slurm_state(fields.next()?);
            // "CANCELLED by 1000" spans three fields
            let rest: Vec<&str> = fields.collect();
            let elapsed = rest
                .iter()
                .find(|f| f.contains(':'))
                .map(ToString::to_string);
            Some(SacctRow {
                job_id: job_id.to_string(),
                state,
                elapsed,
            })
        })
        .collect()
}

fn collapse(states: &[JobState]) -> Option<JobState> {
    if states.is_empty() {
        return None;
    }
    let any = |s: JobState| states.contains(&s);
    Some(if any(JobState::Failed) {
        JobState::Failed
    } else if any(JobState::Cancelled) {
        JobState::Cancelled
    } else if any(JobState::Running) {
        JobState::Running
    } else if any(JobState::Pending) {
        JobState::Pending
    } else if states.iter().all(|s| *s == JobState::Completed) {
        JobState::Completed
    } else {
        JobState::Unknown
    })
}

/// Collapse every array task of `job` into one state.
///
/// Live `squeue` rows win over accounting; a pending reason of
/// `DependencyNeverSatisfied` means the job can never start and counts as
/// failed.
#[must_use]
pub fn aggregate_state(job: &JobHandle, squeue: &[SqueueRow], sacct: &[SacctRow]) -> JobState {
    let base = base_id(job.as_str());
    let queued: Vec<&SqueueRow> = squeue
        .iter()
        .filter(|r| base_id(&r.job_id) == base)
        .collect();
    if queued.iter().any(|r| r.reason.contains(NEVER_SATISFIED)) {
        return JobState::Failed;
    }
    let live: Vec<JobState> = queued
        .iter()
        .map(|r| r.state)
        .filter(|s| matches!(s, JobState::Running | JobState::Pending))
        .collect();
    if let Some(state) = collapse(&live) {
        return state;
    }

    let accounted: Vec<JobState> = sacct
        .iter()
        .filter(|r| base_id(&r.job_id) == base)
        .map(|r| r.state)
        .collect();
    collapse(&accounted).unwrap_or(JobState::Unknown)
}

/// Result of one status refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    /// Raw `squeue` output.
    pub squeue: String,
    /// Raw `sacct` output; `None` when `sacct` could not be run.
    pub sacct: Option<String>,
    /// Collapsed state per queried job, in query order.
    pub jobs: Vec<(JobHandle, JobState)>,
}

impl StatusReport {
    /// Build a report from raw scheduler output.
    #[must_use]
    pub fn from_output(jobs: &[JobHandle], squeue: String, sacct: Option<String>) -> Self {
        let squeue_rows = parse_squeue(&squeue);
        let sacct_rows = sacct.as_deref().map(parse_sacct).unwrap_or_default();
        let jobs = jobs
            .iter()
            .map(|job| (job.clone(), aggregate_state(job, &squeue_rows, &sacct_rows)))
            .collect();
        tracing::debug!(?jobs, "Parsed scheduler status");
        Self {
            squeue,
            sacct,
            jobs,
        }
    }

    /// State of `job`, if it was part of the query.
    #[must_use]
    pub fn state_of(&self, job: &JobHandle) -> Option<JobState> {
        self.jobs.iter().find(|(j, _)| j == job).map(|(_, s)| *s)
    }

    /// Whether every queried job has ended.
    #[must_use]
    pub fn all_terminal(&self) -> bool {
        self.jobs.iter().all(|(_, s)| s.is_terminal())
    }

    /// Whether any queried job ended without completing.
    #[must_use]
    pub fn any_unsuccessful(&self) -> bool {
        self.jobs
            .iter()
            .any(|(_, s)| matches!(s, JobState::Failed | JobState::Cancelled))
    }

    /// Human-readable report: per-job summary followed by raw output.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (job, state) in &self.jobs {
            let _ = writeln!(out, "job {job}: {state}");
        }
        if !self.jobs.is_empty() {
            out.push('\n');
        }
        let squeue = if self.squeue.trim().is_empty() {
            "(no rows)"
        } else {
            self.squeue.trim_end()
        };
        let sacct = match self.sacct.as_deref().map(str::trim_end) {
            None => "(sacct unavailable)",
            Some("") => "(no rows)",
            Some(text) => text,
        };
        let _ = write!(out, "squeue:\n{squeue}\n\nsacct:\n{sacct}");
        out
    }
}
