//! Slurm integration for flowreg session runs.
//!
//! Provides:
//! - Batch script rendering for the stage 1 array job and the dependent
//!   stage 2+3 job
//! - Python entry snippets shared with the local runner
//! - Remote command builders for `sbatch`, `squeue`, `sacct`, `scancel`
//! - Parsing of scheduler output into `JobState`s

pub mod command;
pub mod error;
pub mod parse;
pub mod script;

pub use command::{
    cancel_command, sacct_command, squeue_command, submit_command, tail_log_command,
    validate_job_id,
};
pub use error::SlurmError;
pub use parse::{
    SacctRow, SqueueRow, StatusReport, aggregate_state, parse_job_id, parse_sacct, parse_squeue,
    slurm_state,
};
pub use script::{
    PipelineStage, STAGE1_SCRIPT, STAGE23_SCRIPT, pipeline_snippet, stage1_script, stage23_script,
};
