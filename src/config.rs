// Coordinator-wide tunables, loadable from TOML: `serde` + `toml`, with
// programmatic defaults when no file is present.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

fn default_quorum_timeout_ms() -> u64 {
    15_000
}

fn default_unsafe_quorum_timeout_ms() -> u64 {
    2_000
}

fn default_caller_timeout_slack_ms() -> u64 {
    5_000
}

fn default_compat_version_threshold() -> u32 {
    0
}

/// Coordinator-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Max time to wait for the admission predicate on a plain request.
    pub default_quorum_timeout_ms: u64,
    /// Same, but applied when the request sets `unsafe`.
    pub default_unsafe_quorum_timeout_ms: u64,
    /// Added to the quorum timeout to get the caller's total wait bound when
    /// the caller didn't specify one explicitly.
    pub default_caller_timeout_slack_ms: u64,
    /// Cluster compat versions below this select bypass mode.
    pub compat_version_threshold: u32,
    /// Explicit operator flag forcing bypass regardless of compat version.
    pub bypass_forced: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            default_quorum_timeout_ms: default_quorum_timeout_ms(),
            default_unsafe_quorum_timeout_ms: default_unsafe_quorum_timeout_ms(),
            default_caller_timeout_slack_ms: default_caller_timeout_slack_ms(),
            compat_version_threshold: default_compat_version_threshold(),
            bypass_forced: false,
        }
    }
}

impl CoordinatorConfig {
    pub fn default_quorum_timeout(&self, unsafe_mode: bool) -> Duration {
        let ms = if unsafe_mode {
            self.default_unsafe_quorum_timeout_ms
        } else {
            self.default_quorum_timeout_ms
        };
        Duration::from_millis(ms)
    }

    pub fn default_caller_timeout(&self, quorum_timeout: Duration) -> Duration {
        quorum_timeout + Duration::from_millis(self.default_caller_timeout_slack_ms)
    }

    /// Load from a TOML file. Returns defaults if the file doesn't exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&contents).map_err(ConfigError::Parse)
    }
}

/// Errors loading the coordinator configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_documented_values() {
        let cfg = CoordinatorConfig::default();
        assert_eq!(cfg.default_quorum_timeout(false), Duration::from_secs(15));
        assert_eq!(cfg.default_quorum_timeout(true), Duration::from_secs(2));
        assert_eq!(
            cfg.default_caller_timeout(Duration::from_secs(15)),
            Duration::from_secs(20)
        );
    }

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = CoordinatorConfig::load(Path::new("/nonexistent/coordinator.toml")).unwrap();
        assert_eq!(cfg, CoordinatorConfig::default());
    }
}
