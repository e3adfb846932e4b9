//! Runtime configuration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use imgvol_common::{ImgvolError, ImgvolPaths, ImgvolResult};
use serde::Deserialize;

/// Snapshotter used when a runtime handler does not name one.
pub const DEFAULT_SNAPSHOTTER: &str = "overlayfs";

/// Runtime configuration options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Paths for runtime data.
    pub paths: ImgvolPaths,
    /// Snapshotter for handlers without their own.
    pub default_snapshotter: String,
    /// Runtime handlers by name.
    pub runtimes: BTreeMap<String, RuntimeHandler>,
}

/// Per runtime handler settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeHandler {
    /// Snapshotter override.
    #[serde(default)]
    pub snapshotter: Option<String>,
}

/// On-disk form of [`RuntimeConfig`].
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    root: Option<PathBuf>,
    state_dir: Option<PathBuf>,
    default_snapshotter: Option<String>,
    #[serde(default)]
    runtimes: BTreeMap<String, RuntimeHandler>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            paths: ImgvolPaths::new(),
            default_snapshotter: DEFAULT_SNAPSHOTTER.to_string(),
            runtimes: BTreeMap::new(),
        }
    }
}

impl RuntimeConfig {
    /// Load a TOML configuration file.
    ///
    /// ```toml
    /// root = "/var/lib/imgvol"
    /// state_dir = "/run/imgvol"
    /// default_snapshotter = "overlayfs"
    ///
    /// [runtimes.kata]
    /// snapshotter = "native"
    /// ```
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> ImgvolResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content).map_err(|e| ImgvolError::Config {
            message: format!("{}: {e}", path.display()),
        })
    }

    /// Parse a TOML configuration.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed TOML, unknown keys, or empty names.
    pub fn from_toml(content: &str) -> ImgvolResult<Self> {
        let file: ConfigFile = toml::from_str(content).map_err(|e| ImgvolError::Config {
            message: e.to_string(),
        })?;

        let mut config = Self::default();
        match (file.root, file.state_dir) {
            (Some(root), Some(state)) => config.paths = ImgvolPaths { root, state },
            (Some(root), None) => config = config.with_root(root),
            (None, Some(state)) => config = config.with_state_dir(state),
            (None, None) => {}
        }
        if let Some(snapshotter) = file.default_snapshotter {
            config = config.with_default_snapshotter(snapshotter);
        }
        config.runtimes = file.runtimes;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> ImgvolResult<()> {
        if self.default_snapshotter.is_empty() {
            return Err(ImgvolError::Config {
                message: "default_snapshotter must not be empty".to_string(),
            });
        }
        for (name, handler) in &self.runtimes {
            if name.is_empty() || handler.snapshotter.as_deref() == Some("") {
                return Err(ImgvolError::Config {
                    message: format!("runtime '{name}' has an empty name or snapshotter"),
                });
            }
        }
        Ok(())
    }

    /// Set the root directory. The state directory moves under it.
    #[must_use]
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.paths = ImgvolPaths::with_root(root);
        self
    }

    /// Set the state directory.
    #[must_use]
    pub fn with_state_dir(mut self, state: impl Into<PathBuf>) -> Self {
        self.paths.state = state.into();
        self
    }

    /// Set the default snapshotter.
    #[must_use]
    pub fn with_default_snapshotter(mut self, name: impl Into<String>) -> Self {
        self.default_snapshotter = name.into();
        self
    }

    /// Add a runtime handler.
    #[must_use]
    pub fn with_runtime(mut self, name: impl Into<String>, snapshotter: Option<String>) -> Self {
        self.runtimes
            .insert(name.into(), RuntimeHandler { snapshotter });
        self
    }

    /// Snapshotter used by sandboxes of `handler`.
    #[must_use]
    pub fn snapshotter_for(&self, handler: &str) -> &str {
        self.runtimes
            .get(handler)
            .and_then(|h| h.snapshotter.as_deref())
            .unwrap_or(self.default_snapshotter.as_str())
    }

    /// Every snapshotter name the configuration refers to, sorted.
    #[must_use]
    pub fn snapshotter_names(&self) -> Vec<String> {
        let mut names: Vec<String> = std::iter::once(self.default_snapshotter.clone())
            .chain(self.runtimes.values().filter_map(|h| h.snapshotter.clone()))
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = RuntimeConfig::default();
        assert_eq!(config.default_snapshotter, "overlayfs");
        assert!(config.runtimes.is_empty());
        assert_eq!(config.snapshotter_for("runc"), "overlayfs");
    }

    #[test]
    fn builder_pattern() {
        let config = RuntimeConfig::default()
            .with_root("/custom/root")
            .with_default_snapshotter("native")
            .with_runtime("kata", Some("devmapper".to_string()))
            .with_runtime("runc", None);

        assert_eq!(config.paths.root, PathBuf::from("/custom/root"));
        assert_eq!(config.paths.state, PathBuf::from("/custom/root/run"));
        assert_eq!(config.snapshotter_for("kata"), "devmapper");
        assert_eq!(config.snapshotter_for("runc"), "native");
        assert_eq!(config.snapshotter_names(), vec!["devmapper", "native"]);
    }

    #[test]
    fn from_toml() {
        let config = RuntimeConfig::from_toml(
            r#"
            root = "/srv/imgvol"
            state_dir = "/run/imgvol-test"

            [runtimes.kata]
            snapshotter = "native"
            "#,
        )
        .unwrap();

        assert_eq!(config.paths.root, PathBuf::from("/srv/imgvol"));
        assert_eq!(config.paths.state, PathBuf::from("/run/imgvol-test"));
        assert_eq!(config.default_snapshotter, "overlayfs");
        assert_eq!(config.snapshotter_for("kata"), "native");
    }

    #[test]
    fn from_toml_rejects_unknown_keys() {
        let err = RuntimeConfig::from_toml("snapshoter = \"native\"").unwrap_err();
        assert!(matches!(err, ImgvolError::Config { .. }));

        let err = RuntimeConfig::from_toml("default_snapshotter = \"\"").unwrap_err();
        assert!(matches!(err, ImgvolError::Config { .. }));
    }
}
