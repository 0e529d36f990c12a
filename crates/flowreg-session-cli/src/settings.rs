//! User settings: remote profile, path mappings, and polling.
//!
//! Loaded from `<config dir>/flowreg-session/settings.toml`, then
//! overridden by `FLOWREG_SESSION_*` environment variables.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use flowreg_session_controller::PollSettings;
use flowreg_session_core::{PathMapping, RemoteProfile};
use serde::{Deserialize, Serialize};

const APP_DIR: &str = "flowreg-session";

pub const SETTINGS_ENV: &str = "FLOWREG_SESSION_SETTINGS";
pub const HOST_ENV: &str = "FLOWREG_SESSION_HOST";
pub const REMOTE_DIR_ENV: &str = "FLOWREG_SESSION_REMOTE_DIR";
pub const ENV_CMD_ENV: &str = "FLOWREG_SESSION_ENV_CMD";
pub const PYTHON_ENV: &str = flowreg_session_controller::local::PYTHON_ENV_VAR;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        let defaults = PollSettings::default();
        Self {
            interval_secs: defaults.interval.as_secs(),
            timeout_secs: defaults.timeout.as_secs(),
        }
    }
}

impl PollConfig {
    #[must_use]
    pub fn to_settings(&self) -> PollSettings {
        PollSettings {
            interval: Duration::from_secs(self.interval_secs.max(1)),
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// ssh `ConnectTimeout`; 0 leaves the client default.
    pub connect_timeout_secs: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub python: Option<String>,
    /// Parent of local run bundles.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bundle_dir: Option<PathBuf>,
    /// Where the last run is remembered between invocations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_file: Option<PathBuf>,
    pub remote: RemoteProfile,
    pub mappings: Vec<PathMapping>,
    pub poll: PollConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            remote: RemoteProfile::default(),
            mappings: Vec::new(),
            poll: PollConfig::default(),
            connect_timeout_secs: flowreg_session_transport::ssh::DEFAULT_CONNECT_TIMEOUT_SECS,
            python: None,
            bundle_dir: None,
            state_file: None,
        }
    }
}

/// Default settings file location.
#[must_use]
pub fn default_settings_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join(APP_DIR).join("settings.toml"))
}

impl Settings {
    /// Load settings.
    ///
    /// An explicit path (flag or `FLOWREG_SESSION_SETTINGS`) must exist; a
    /// missing default file yields defaults.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var_os(SETTINGS_ENV).map(PathBuf::from);
        let mut settings = match explicit.map(Path::to_path_buf).or(env_path) {
            Some(path) => Self::from_file(&path)?,
            None => match default_settings_path().filter(|p| p.is_file()) {
                Some(path) => Self::from_file(&path)?,
                None => Self::default(),
            },
        };
        settings.apply_env(|key| std::env::var(key).ok());
        Ok(settings)
    }

    /// Parse a TOML settings file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings {}", path.display()))?;
        let settings = toml::from_str(&text)
            .with_context(|| format!("Invalid settings file {}", path.display()))?;
        tracing::debug!(path = %path.display(), "Loaded settings");
        Ok(settings)
    }

    /// Override fields from environment variables (looked up via `lookup`).
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(host) = get(HOST_ENV) {
            self.remote.host_alias = host;
        }
        if let Some(dir) = get(REMOTE_DIR_ENV) {
            self.remote.remote_base_dir = dir;
        }
        if let Some(cmd) = get(ENV_CMD_ENV) {
            self.remote.env_activation_cmd = cmd;
        }
        if let Some(python) = get(PYTHON_ENV) {
            self.python = Some(python);
        }
    }

    /// Run state file: configured, else `<data dir>/flowreg-session/last_run.json`.
    ///
    /// # Errors
    /// Returns error if no data directory can be determined.
    pub fn state_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.state_file {
            return Ok(path.clone());
        }
        dirs::data_dir()
            .map(|d| d.join(APP_DIR).join("last_run.json"))
            .context("Cannot determine a data directory for run state; set state_file in settings")
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Option<u32> {
        (self.connect_timeout_secs > 0).then_some(self.connect_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let settings: Settings = toml::from_str(
            r#"
            [remote]
            host_alias = "hpc"

            [remote.sbatch]
            partition = "short"

            [[mappings]]
            local_prefix = "/Volumes/lab"
            remote_prefix = "/bucket/lab"
            "#,
        )
        .unwrap();
        assert_eq!(settings.remote.host_alias, "hpc");
        assert_eq!(settings.remote.remote_base_dir, "~/pyflowreg_runs");
        assert_eq!(settings.remote.sbatch.partition, "short");
        assert_eq!(settings.remote.sbatch.cpus, 1);
        assert_eq!(settings.mappings.len(), 1);
        assert_eq!(settings.poll, PollConfig::default());
        assert_eq!(settings.connect_timeout(), Some(15));
    }

    #[test]
    fn environment_overrides_file() {
        let env: HashMap<&str, &str> = [
            (HOST_ENV, "other"),
            (REMOTE_DIR_ENV, "/scratch/runs"),
            (ENV_CMD_ENV, ""),
            (PYTHON_ENV, "/opt/py/bin/python"),
        ]
        .into_iter()
        .collect();
        let mut settings = Settings::default();
        settings.remote.env_activation_cmd = "conda activate flow".to_string();
        settings.apply_env(|k| env.get(k).map(ToString::to_string));

        assert_eq!(settings.remote.host_alias, "other");
        assert_eq!(settings.remote.remote_base_dir, "/scratch/runs");
        assert_eq!(settings.remote.env_activation_cmd, "conda activate flow");
        assert_eq!(settings.python.as_deref(), Some("/opt/py/bin/python"));
    }

    #[test]
    fn serialized_settings_load_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        let mut settings = Settings::default();
        settings.mappings.push(PathMapping::new("/data", "/bucket/data"));
        settings.poll.interval_secs = 5;
        settings.state_file = Some(dir.path().join("state.json"));
        std::fs::write(&path, toml::to_string_pretty(&settings).unwrap()).unwrap();

        let loaded = Settings::from_file(&path).unwrap();
        assert_eq!(loaded, settings);
        assert_eq!(loaded.state_path().unwrap(), dir.path().join("state.json"));
        assert_eq!(loaded.poll.to_settings().interval, Duration::from_secs(5));
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        assert!(Settings::from_file(Path::new("/no/such/settings.toml")).is_err());
    }
}
