//! Session configuration and its on-disk serializer.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::profile::{PathMapping, map_path};

/// File name used for the configuration inside a run bundle.
pub const DEFAULT_CONFIG_FILENAME: &str = "session_config.yaml";

/// Input file pattern used when the configuration does not set one.
pub const DEFAULT_PATTERN: &str = "*.tif";

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Unsupported config format: {0} (expected .yaml, .yml or .toml)")]
    UnsupportedFormat(PathBuf),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Optical-flow options: a path to a JSON file or an inline mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FlowOptions {
    Path(PathBuf),
    Inline(serde_yaml::Mapping),
}

/// Settings for one registration session.
///
/// Path-valued keys are modelled explicitly so they can be made relative on
/// save and translated for the cluster on upload. Every other key is an
/// engine parameter kept verbatim in sorted order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Directory holding the input recordings.
    pub root: PathBuf,
    /// Glob selecting input files inside `root`.
    #[serde(default = "default_pattern")]
    pub pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_root: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_results: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub center: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_options: Option<FlowOptions>,
    /// Remaining engine parameters.
    #[serde(flatten)]
    pub parameters: BTreeMap<String, serde_yaml::Value>,
}

fn default_pattern() -> String {
    DEFAULT_PATTERN.to_string()
}

impl SessionConfig {
    /// Create a configuration rooted at `root` with default settings.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            pattern: default_pattern(),
            output_root: None,
            final_results: None,
            center: None,
            flow_options: None,
            parameters: BTreeMap::new(),
        }
    }

    /// Set an engine parameter.
    pub fn set_parameter(&mut self, key: impl Into<String>, value: impl Into<serde_yaml::Value>) {
        self.parameters.insert(key.into(), value.into());
    }

    /// Check required fields.
    ///
    /// # Errors
    /// Returns `ConfigError::Invalid` naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.root.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("root must be set".to_string()));
        }
        if self.pattern.trim().is_empty() {
            return Err(ConfigError::Invalid("pattern must not be empty".to_string()));
        }
        if matches!(&self.flow_options, Some(FlowOptions::Path(p)) if p.as_os_str().is_empty()) {
            return Err(ConfigError::Invalid(
                "flow_options path must not be empty".to_string(),
            ));
        }
        for key in self.parameters.keys() {
            if is_reserved_key(key) {
                return Err(ConfigError::Invalid(format!("duplicate key: {key}")));
            }
        }
        Ok(())
    }

    /// Resolve a possibly relative path against `root`.
    #[must_use]
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    /// Copy with every path field rewritten through `mappings`.
    #[must_use]
    pub fn map_paths(&self, mappings: &[PathMapping]) -> Self {
        let translate = |p: &Path| PathBuf::from(map_path(&p.to_string_lossy(), mappings));
        let mut mapped = self.clone();
        mapped.root = translate(&self.root);
        for field in mapped.path_fields_mut() {
            if let Some(path) = field.as_mut() {
                *path = translate(path);
            }
        }
        if let Some(FlowOptions::Path(path)) = mapped.flow_options.as_mut() {
            *path = translate(path);
        }
        mapped
    }

    /// Copy with a relative `root` joined onto `base`.
    #[must_use]
    pub fn anchored(&self, base: &Path) -> Self {
        let mut anchored = self.clone();
        if self.root.is_relative() && !self.root.as_os_str().is_empty() {
            anchored.root = base.join(&self.root);
        }
        anchored
    }

    /// Copy with every path absolute: a relative `root` is taken from the
    /// working directory, the other path fields from `root`.
    #[must_use]
    pub fn absolutized(&self) -> Self {
        let mut base = self.clone();
        if self.root.is_relative() && !self.root.as_os_str().is_empty() {
            match std::path::absolute(&self.root) {
                Ok(root) => base.root = root,
                Err(e) => tracing::warn!(root = %self.root.display(), "Cannot absolutize root: {e}"),
            }
        }
        let mut abs = base.clone();
        for field in abs.path_fields_mut() {
            if let Some(path) = field.as_mut() {
                *path = base.resolve(path);
            }
        }
        if let Some(FlowOptions::Path(path)) = abs.flow_options.as_mut() {
            *path = base.resolve(path);
        }
        abs
    }

    /// Copy with path fields under `root` rewritten relative to it.
    #[must_use]
    pub fn relativized(&self) -> Self {
        let root = self.root.clone();
        let relative = |p: &Path| p.strip_prefix(&root).map(Path::to_path_buf).ok();
        let mut rel = self.clone();
        for field in rel.path_fields_mut() {
            if let Some(path) = field.as_mut() {
                if let Some(stripped) = relative(path).filter(|p| !p.as_os_str().is_empty()) {
                    *path = stripped;
                }
            }
        }
        if let Some(FlowOptions::Path(path)) = rel.flow_options.as_mut() {
            if let Some(stripped) = relative(path).filter(|p| !p.as_os_str().is_empty()) {
                *path = stripped;
            }
        }
        rel
    }

    /// Serialize to YAML.
    ///
    /// # Errors
    /// Returns error if serialization fails.
    pub fn to_yaml(&self, prefer_relative: bool) -> Result<String, ConfigError> {
        let value = if prefer_relative {
            serde_yaml::to_string(&self.relativized())?
        } else {
            serde_yaml::to_string(self)?
        };
        Ok(value)
    }

    /// Parse YAML.
    ///
    /// # Errors
    /// Returns error if the text is not a valid configuration.
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Parse TOML.
    ///
    /// # Errors
    /// Returns error if the text is not a valid configuration.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Load from a `.yaml`, `.yml` or `.toml` file.
    ///
    /// A relative `root` is anchored at the directory holding the file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let format = Format::from_path(path)?;
        let io_err = |source: std::io::Error| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        let text = tokio::fs::read_to_string(path).await.map_err(io_err)?;
        let config = match format {
            Format::Yaml => Self::from_yaml_str(&text)?,
            Format::Toml => Self::from_toml_str(&text)?,
        };
        let file = std::path::absolute(path).map_err(io_err)?;
        let config = match file.parent() {
            Some(dir) => config.anchored(dir),
            None => config,
        };
        tracing::debug!(path = %path.display(), "Loaded session config");
        Ok(config)
    }

    /// Write as YAML, creating parent directories.
    ///
    /// # Errors
    /// Returns error if serialization or the write fails.
    pub async fn save(&self, path: &Path, prefer_relative: bool) -> Result<(), ConfigError> {
        let text = self.to_yaml(prefer_relative)?;
        let io_err = |source: std::io::Error| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        tokio::fs::write(path, text).await.map_err(io_err)?;
        tracing::debug!(path = %path.display(), prefer_relative, "Saved session config");
        Ok(())
    }

    fn path_fields_mut(&mut self) -> [&mut Option<PathBuf>; 3] {
        [
            &mut self.output_root,
            &mut self.final_results,
            &mut self.center,
        ]
    }
}

fn is_reserved_key(key: &str) -> bool {
    matches!(
        key,
        "root" | "pattern" | "output_root" | "final_results" | "center" | "flow_options"
    )
}

enum Format {
    Yaml,
    Toml,
}

impl Format {
    fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("yaml" | "yml") => Ok(Self::Yaml),
            Some("toml") => Ok(Self::Toml),
            _ => Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(root: &Path) -> SessionConfig {
        let mut cfg = SessionConfig::new(root);
        cfg.output_root = Some(root.join("output"));
        cfg.final_results = Some(root.join("final"));
        cfg.center = Some(root.join("center.npy"));
        cfg.flow_options = Some(FlowOptions::Path(root.join("flow_options.json")));
        cfg.set_parameter("resume", true);
        cfg
    }

    #[tokio::test]
    async fn yaml_roundtrip_with_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("dataset");
        let cfg = sample(&root);
        let path = dir.path().join("session_config.yaml");

        cfg.save(&path, true).await.unwrap();

        let raw: serde_yaml::Value =
            serde_yaml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["output_root"], "output");
        assert_eq!(raw["final_results"], "final");
        assert_eq!(raw["center"], "center.npy");
        assert_eq!(raw["flow_options"], "flow_options.json");
        assert_eq!(raw["resume"], true);

        let loaded = SessionConfig::load(&path).await.unwrap();
        assert_eq!(loaded.output_root, Some(PathBuf::from("output")));
        assert_eq!(loaded.root, root);
        assert_eq!(loaded.resolve(Path::new("output")), root.join("output"));
    }

    #[test]
    fn absolute_save_keeps_paths() {
        let cfg = sample(Path::new("/data/session"));
        let yaml = cfg.to_yaml(false).unwrap();
        assert!(yaml.contains("/data/session/output"));
        assert_eq!(SessionConfig::from_yaml_str(&yaml).unwrap(), cfg);
    }

    #[test]
    fn paths_outside_root_stay_absolute() {
        let mut cfg = SessionConfig::new("/data/session");
        cfg.center = Some(PathBuf::from("/elsewhere/center.npy"));
        let rel = cfg.relativized();
        assert_eq!(rel.center, Some(PathBuf::from("/elsewhere/center.npy")));
    }

    #[test]
    fn inline_flow_options_survive() {
        let yaml = "root: /data\nflow_options:\n  levels: 3\n  alpha: 1.5\nn_iters: 4\n";
        let cfg = SessionConfig::from_yaml_str(yaml).unwrap();
        let Some(FlowOptions::Inline(map)) = &cfg.flow_options else {
            panic!("expected inline flow options");
        };
        assert_eq!(map.get("levels"), Some(&serde_yaml::Value::from(3)));
        assert_eq!(cfg.parameters.get("n_iters"), Some(&serde_yaml::Value::from(4)));
        assert_eq!(cfg.pattern, DEFAULT_PATTERN);
    }

    #[tokio::test]
    async fn loads_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.toml");
        std::fs::write(&path, "root = \"/data\"\npattern = \"*_ch1.tif\"\nalpha = 2.0\n").unwrap();
        let cfg = SessionConfig::load(&path).await.unwrap();
        assert_eq!(cfg.root, PathBuf::from("/data"));
        assert_eq!(cfg.pattern, "*_ch1.tif");
        assert!(cfg.parameters.contains_key("alpha"));
    }

    #[tokio::test]
    async fn rejects_unknown_extension() {
        let err = SessionConfig::load(Path::new("config.json")).await.unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedFormat(_)));
    }

    #[test]
    fn map_paths_translates_every_path_field() {
        let cfg = sample(Path::new("/data/session"));
        let mapped = cfg.map_paths(&[PathMapping::new("/data", "/flash/lab")]);
        assert_eq!(mapped.root, PathBuf::from("/flash/lab/session"));
        assert_eq!(
            mapped.output_root,
            Some(PathBuf::from("/flash/lab/session/output"))
        );
        assert_eq!(
            mapped.flow_options,
            Some(FlowOptions::Path(PathBuf::from(
                "/flash/lab/session/flow_options.json"
            )))
        );
        assert_eq!(mapped.parameters, cfg.parameters);
    }

    #[test]
    fn absolutized_resolves_against_root() {
        let mut cfg = SessionConfig::new("/data/session");
        cfg.output_root = Some(PathBuf::from("out"));
        cfg.center = Some(PathBuf::from("/elsewhere/center.npy"));
        cfg.flow_options = Some(FlowOptions::Path(PathBuf::from("flow.json")));
        let abs = cfg.absolutized();
        assert_eq!(abs.output_root, Some(PathBuf::from("/data/session/out")));
        assert_eq!(abs.center, Some(PathBuf::from("/elsewhere/center.npy")));
        assert_eq!(
            abs.flow_options,
            Some(FlowOptions::Path(PathBuf::from("/data/session/flow.json")))
        );
    }

    #[tokio::test]
    async fn relative_root_is_anchored_at_the_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.yaml");
        std::fs::write(&path, "root: dataset\noutput_root: out\n").unwrap();
        let cfg = SessionConfig::load(&path).await.unwrap();
        assert_eq!(cfg.root, dir.path().join("dataset"));
        assert_eq!(
            cfg.absolutized().output_root,
            Some(dir.path().join("dataset").join("out"))
        );
    }

    #[test]
    fn absolutized_anchors_relative_root_at_working_dir() {
        let mut cfg = SessionConfig::new("dataset");
        cfg.output_root = Some(PathBuf::from("out"));
        let abs = cfg.absolutized();
        let cwd = std::env::current_dir().unwrap();
        assert_eq!(abs.root, cwd.join("dataset"));
        assert_eq!(abs.output_root, Some(cwd.join("dataset").join("out")));
    }

    #[test]
    fn validate_requires_root() {
        assert!(SessionConfig::new("").validate().is_err());
        assert!(SessionConfig::new("/data").validate().is_ok());
    }
}
