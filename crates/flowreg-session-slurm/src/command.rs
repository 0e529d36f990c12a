//! Remote shell commands for the Slurm CLI.

use flowreg_session_core::JobHandle;
use flowreg_session_transport::quote_remote_path;

use crate::error::SlurmError;

/// `squeue` columns: job id, state, elapsed, node list or pending reason.
pub const SQUEUE_FORMAT: &str = "%i %T %M %R";
/// `sacct` columns.
pub const SACCT_FORMAT: &str = "JobID,State,Elapsed,MaxRSS";

/// Accept `<digits>` or `<digits>_<digits>` (one array task).
///
/// # Errors
/// Returns `InvalidJobId` for anything else; ids are interpolated into
/// shell commands.
pub fn validate_job_id(id: &str) -> Result<(), SlurmError> {
    let numeric = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    let valid = match id.split_once('_') {
        Some((job, task)) => numeric(job) && numeric(task),
        None => numeric(id),
    };
    if valid {
        Ok(())
    } else {
        Err(SlurmError::InvalidJobId(id.to_string()))
    }
}

fn joined(jobs: &[JobHandle], sep: &str) -> Result<String, SlurmError> {
    for job in jobs {
        validate_job_id(job.as_str())?;
    }
    Ok(jobs
        .iter()
        .map(JobHandle::as_str)
        .collect::<Vec<_>>()
        .join(sep))
}

/// `cd <run dir> && sbatch [--dependency=afterok:<id>] <script>`.
///
/// # Errors
/// Returns error if the directory cannot be quoted or the dependency id is
/// malformed.
pub fn submit_command(
    run_dir: &str,
    script: &str,
    after_ok: Option<&JobHandle>,
) -> Result<String, SlurmError> {
    let dir = quote_remote_path(run_dir)?;
    let script = flowreg_session_transport::quote(script)?;
    match after_ok {
        Some(job) => {
            validate_job_id(job.as_str())?;
            Ok(format!("cd {dir} && sbatch --dependency=afterok:{job} {script}"))
        }
        None => Ok(format!("cd {dir} && sbatch {script}")),
    }
}

/// `squeue` for the given jobs.
///
/// Slurm rejects ids it has already purged, so the exit status is ignored
/// and any diagnostic ends up in the report text.
///
/// # Errors
/// Returns `InvalidJobId` for malformed ids.
pub fn squeue_command(jobs: &[JobHandle]) -> Result<String, SlurmError> {
    Ok(format!(
        "squeue -j {} -o '{SQUEUE_FORMAT}' 2>&1 || true",
        joined(jobs, ",")?
    ))
}

/// `sacct` for the given jobs, without header.
///
/// # Errors
/// Returns `InvalidJobId` for malformed ids.
pub fn sacct_command(jobs: &[JobHandle]) -> Result<String, SlurmError> {
    Ok(format!(
        "sacct -j {} --format={SACCT_FORMAT} --noheader",
        joined(jobs, ",")?
    ))
}

/// `scancel` for the given jobs; `None` when there is nothing to cancel.
///
/// # Errors
/// Returns `InvalidJobId` for malformed ids.
pub fn cancel_command(jobs: &[JobHandle]) -> Result<Option<String>, SlurmError> {
    let jobs: Vec<JobHandle> = jobs
        .iter()
        .filter(|j| !j.as_str().trim().is_empty())
        .cloned()
        .collect();
    if jobs.is_empty() {
        return Ok(None);
    }
    Ok(Some(format!("scancel {}", joined(&jobs, " ")?)))
}

/// Tail the most recently modified `slurm*.out` in `run_dir`.
///
/// # Errors
/// Returns error if the directory cannot be quoted.
pub fn tail_log_command(run_dir: &str, lines: u32) -> Result<String, SlurmError> {
    Ok(format!(
        "cd {} && latest=$(ls -1t slurm*.out 2>/dev/null | head -n 1); \
         if [ -n \"$latest\" ]; then tail -n {lines} \"$latest\"; \
         else echo 'No slurm logs found.'; fi",
        quote_remote_path(run_dir)?
    ))
}
