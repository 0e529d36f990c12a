//! Orchestration for flowreg session runs.
//!
//! Provides:
//! - `SubmissionController` - Validate, upload, submit, and poll a remote run
//! - `LocalRunner` - Run pipeline stages on this machine
//! - Run state storage implementations (memory, JSON file)

pub mod bundle;
pub mod controller;
pub mod discovery;
pub mod error;
pub mod local;
pub mod storage;

pub use controller::{PollSettings, SubmissionController};
pub use error::ControllerError;
pub use local::{LocalRunError, LocalRunner};
pub use storage::{FileStorage, MemoryStorage};
