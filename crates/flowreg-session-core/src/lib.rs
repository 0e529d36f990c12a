//! Core abstractions for flowreg session runs.
//!
//! This crate provides the fundamental building blocks:
//! - `SessionConfig` - Session settings and their YAML/TOML serializer
//! - `RemoteProfile` / `PathMapping` - Remote target description
//! - `RemoteRun` / `JobHandle` - State of an uploaded and submitted run
//! - `MsgStore` - Broadcast + history of controller events
//! - `Transport` and `RunStorage` traits

pub mod config;
pub mod event;
pub mod msg_store;
pub mod profile;
pub mod run;
pub mod traits;

pub use config::{ConfigError, FlowOptions, SessionConfig};
pub use event::{SessionEvent, SubmissionState};
pub use msg_store::MsgStore;
pub use profile::{PathMapping, RemoteProfile, SbatchDefaults, map_path};
pub use run::{JobHandle, JobState, RemoteRun};
pub use traits::{ErrorKind, ExecOutput, RunStorage, StorageError, Transport, TransportError};
