//! Remote target description and local-to-remote path translation.

use serde::{Deserialize, Serialize};

/// Default SSH host alias.
pub const DEFAULT_HOST_ALIAS: &str = "deigo";

/// Default directory on the cluster under which run directories are created.
pub const DEFAULT_REMOTE_BASE_DIR: &str = "~/pyflowreg_runs";

/// Resource requests rendered into `#SBATCH` directives.
///
/// Empty strings and zero counts are omitted from the generated scripts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SbatchDefaults {
    pub partition: String,
    pub time: String,
    pub mem: String,
    pub cpus: u32,
    pub gpus: u32,
}

impl Default for SbatchDefaults {
    fn default() -> Self {
        Self {
            partition: String::new(),
            time: String::new(),
            mem: String::new(),
            cpus: 1,
            gpus: 0,
        }
    }
}

/// The cluster a session is submitted to.
///
/// Credentials are never stored here: the host alias is resolved by the
/// operating system's SSH client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteProfile {
    /// Host alias as understood by `ssh` (e.g. an entry in `~/.ssh/config`).
    pub host_alias: String,
    /// Directory under which `run_*` directories are created.
    pub remote_base_dir: String,
    /// Shell snippet run before Python, e.g. `conda activate pyflowreg`.
    pub env_activation_cmd: String,
    /// Default `#SBATCH` resource requests.
    pub sbatch: SbatchDefaults,
}

impl Default for RemoteProfile {
    fn default() -> Self {
        Self {
            host_alias: DEFAULT_HOST_ALIAS.to_string(),
            remote_base_dir: DEFAULT_REMOTE_BASE_DIR.to_string(),
            env_activation_cmd: String::new(),
            sbatch: SbatchDefaults::default(),
        }
    }
}

impl RemoteProfile {
    /// Create a profile for a host alias with default settings.
    #[must_use]
    pub fn new(host_alias: impl Into<String>) -> Self {
        Self {
            host_alias: host_alias.into(),
            ..Self::default()
        }
    }

    /// Set the remote base directory.
    #[must_use]
    pub fn with_remote_base_dir(mut self, dir: impl Into<String>) -> Self {
        self.remote_base_dir = dir.into();
        self
    }

    /// Check that the profile can be handed to `ssh` safely.
    ///
    /// # Errors
    /// Returns a description of the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        let host = self.host_alias.trim();
        if host.is_empty() {
            return Err("SSH host alias is empty".to_string());
        }
        if host.starts_with('-') || host.chars().any(char::is_whitespace) {
            return Err(format!("Invalid SSH host alias: {host:?}"));
        }
        if self.remote_base_dir.trim().is_empty() {
            return Err("Remote base directory is empty".to_string());
        }
        Ok(())
    }

    /// Remote directory for a named run.
    #[must_use]
    pub fn run_dir(&self, run_name: &str) -> String {
        format!("{}/{run_name}", self.remote_base_dir.trim_end_matches('/'))
    }
}

/// Translation of one local directory prefix to its cluster equivalent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathMapping {
    pub local_prefix: String,
    pub remote_prefix: String,
}

impl PathMapping {
    #[must_use]
    pub fn new(local_prefix: impl Into<String>, remote_prefix: impl Into<String>) -> Self {
        Self {
            local_prefix: local_prefix.into(),
            remote_prefix: remote_prefix.into(),
        }
    }
}

const SEPARATORS: [char; 2] = ['/', '\\'];

/// Translate a local path using the longest matching local prefix.
///
/// A prefix only matches at a path component boundary. Windows separators in
/// the remainder are normalized to `/`. Paths with no matching prefix are
/// returned unchanged.
#[must_use]
pub fn map_path(path: &str, mappings: &[PathMapping]) -> String {
    let mut best: Option<(&PathMapping, &str)> = None;
    for mapping in mappings {
        let local = mapping.local_prefix.trim_end_matches(SEPARATORS);
        if local.is_empty() {
            continue;
        }
        let matches = path == local
            || path
                .strip_prefix(local)
                .is_some_and(|rest| rest.starts_with(SEPARATORS));
        if matches && best.is_none_or(|(_, prefix)| local.len() > prefix.len()) {
            best = Some((mapping, local));
        }
    }

    let Some((mapping, local)) = best else {
        return path.to_string();
    };

    let suffix = path[local.len()..].trim_start_matches(SEPARATORS);
    let remote = mapping.remote_prefix.trim_end_matches('/');
    if suffix.is_empty() {
        remote.to_string()
    } else {
        format!("{remote}/{}", suffix.replace('\\', "/"))
    }
}
