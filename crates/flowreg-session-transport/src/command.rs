//! Argument vectors for `ssh` and `rsync`.

use std::path::Path;

use flowreg_session_core::TransportError;

/// Options passed to every `ssh` invocation. Prompts would hang a
/// non-interactive caller, so they are disabled.
pub const SSH_COMMON_ARGS: [&str; 2] = ["-o", "BatchMode=yes"];

/// Parsed command parts (program + args).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandParts {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandParts {
    /// Create new command parts.
    #[must_use]
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Full argv, program first.
    #[must_use]
    pub fn argv(&self) -> Vec<&str> {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect()
    }

    /// Space-joined command line for logs and error messages.
    #[must_use]
    pub fn display(&self) -> String {
        self.argv().join(" ")
    }
}

/// Quote a string for a POSIX shell.
///
/// # Errors
/// Returns error if the string contains a nul byte.
pub fn quote(value: &str) -> Result<String, TransportError> {
    shlex::try_quote(value)
        .map(std::borrow::Cow::into_owned)
        .map_err(|e| TransportError::InvalidCommand(format!("{e}: {value:?}")))
}

/// Quote a remote path while keeping a leading `~` expandable.
///
/// `~/runs/x` becomes `"$HOME"/runs/x` (rest quoted as needed), so
/// `mkdir`, `cd`, and `rsync` all agree on the same directory.
///
/// # Errors
/// Returns error if the path contains a nul byte.
pub fn quote_remote_path(path: &str) -> Result<String, TransportError> {
    if path == "~" {
        return Ok("\"$HOME\"".to_string());
    }
    match path.strip_prefix("~/") {
        Some("") => Ok("\"$HOME\"/".to_string()),
        Some(rest) => Ok(format!("\"$HOME\"/{}", quote(rest)?)),
        None => quote(path),
    }
}

fn ssh_options(connect_timeout_secs: Option<u32>) -> Vec<String> {
    let mut opts: Vec<String> = SSH_COMMON_ARGS.iter().map(ToString::to_string).collect();
    if let Some(secs) = connect_timeout_secs {
        opts.push("-o".to_string());
        opts.push(format!("ConnectTimeout={secs}"));
    }
    opts
}

/// `ssh [opts] <host> "sh -lc '<command>'"`.
///
/// The remote command runs in a login shell so cluster modules and conda
/// initialization are available.
///
/// # Errors
/// Returns error if the command cannot be quoted.
pub fn ssh_command(
    host_alias: &str,
    remote_command: &str,
    connect_timeout_secs: Option<u32>,
) -> Result<CommandParts, TransportError> {
    let mut args = ssh_options(connect_timeout_secs);
    args.push(host_alias.to_string());
    args.push(format!("sh -lc {}", quote(remote_command)?));
    Ok(CommandParts::new("ssh", args))
}

/// `rsync -az -e "ssh [opts]" <local> <host>:<remote>`.
///
/// Directories are uploaded by content: both sides get a trailing `/`.
#[must_use]
pub fn rsync_upload_command(
    host_alias: &str,
    local_path: &Path,
    remote_path: &str,
    connect_timeout_secs: Option<u32>,
) -> CommandParts {
    let shell = std::iter::once("ssh".to_string())
        .chain(ssh_options(connect_timeout_secs))
        .collect::<Vec<_>>()
        .join(" ");

    let local = local_path.to_string_lossy();
    let (source, dest) = if local_path.is_dir() {
        (
            format!("{}/", local.trim_end_matches('/')),
            format!("{host_alias}:{}/", remote_path.trim_end_matches('/')),
        )
    } else {
        (local.into_owned(), format!("{host_alias}:{remote_path}"))
    };

    CommandParts::new(
        "rsync",
        vec!["-az".to_string(), "-e".to_string(), shell, source, dest],
    )
}
