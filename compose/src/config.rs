//! Container configuration, loadable from YAML.

use crate::error::ConfigError;

use std::fs;
use std::path::Path;

use serde::Deserialize;

fn default_max_resolution_depth() -> usize {
  256
}

fn default_true() -> bool {
  true
}

/// Engine-wide settings, shared by a root container and all of its children.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ContainerConfig {
  /// Nested resolutions deeper than this fail instead of overflowing the stack.
  #[serde(default = "default_max_resolution_depth")]
  pub max_resolution_depth: usize,
  /// Fail fast on circular object graphs.
  #[serde(default = "default_true")]
  pub detect_cycles: bool,
  /// Release disposable instances held by lifetime managers when their scope is disposed.
  #[serde(default = "default_true")]
  pub track_disposables: bool,
}

impl Default for ContainerConfig {
  fn default() -> Self {
    Self {
      max_resolution_depth: default_max_resolution_depth(),
      detect_cycles: true,
      track_disposables: true,
    }
  }
}

impl ContainerConfig {
  pub fn from_yaml_str(source: &str) -> Result<Self, ConfigError> {
    serde_yaml::from_str(source).map_err(|e| ConfigError::Parse(e.to_string()))
  }

  pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let source = fs::read_to_string(path)?;
    Self::from_yaml_str(&source)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  #[test]
  fn missing_fields_take_defaults() {
    let config = ContainerConfig::from_yaml_str("detect_cycles: false\n").unwrap();
    assert_eq!(
      config,
      ContainerConfig {
        detect_cycles: false,
        ..ContainerConfig::default()
      }
    );
  }

  #[test]
  fn unknown_fields_are_rejected() {
    let err = ContainerConfig::from_yaml_str("max_depth: 3\n").unwrap_err();
    assert!(matches!(err, ConfigError::Parse(_)));
  }

  #[test]
  fn loads_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "max_resolution_depth: 8\ntrack_disposables: false").unwrap();

    let config = ContainerConfig::from_file(file.path()).unwrap();
    assert_eq!(config.max_resolution_depth, 8);
    assert!(!config.track_disposables);
    assert!(config.detect_cycles);
  }
}
