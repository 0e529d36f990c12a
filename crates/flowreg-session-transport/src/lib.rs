//! SSH and rsync transport for flowreg session runs.
//!
//! Provides:
//! - `SshTransport` - `Transport` over the system `ssh` and `rsync` binaries
//! - `CommandRunner` - Process seam, swappable in tests
//! - Remote directory browsing helpers
//! - Executable resolution utilities

pub mod browse;
pub mod classify;
pub mod command;
pub mod resolve;
pub mod runner;
pub mod ssh;

pub use browse::{RemoteDirectoryListing, list_remote_directories, list_remote_directory};
pub use command::{CommandParts, quote, quote_remote_path};
pub use resolve::resolve_executable_path;
pub use runner::{CommandOutput, CommandRunner, ProcessRunner};
pub use ssh::SshTransport;
