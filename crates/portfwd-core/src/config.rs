//! Settings resolution for portfwd.
//!
//! Implements hierarchical settings resolution:
//! 1. Built-in defaults
//! 2. Global settings (~/.config/portfwd/settings.json)
//! 3. Environment variables
//! 4. CLI arguments (applied by the binary, highest priority)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Complete portfwd configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub log: LogSettings,
}

/// Tuning knobs for every forwarding engine started by the binary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineSettings {
    /// Upper bound for the outbound connect of a relay session.
    pub connect_timeout_ms: u64,
    /// How often a relay session checks both sockets for a pending error.
    pub liveness_interval_ms: u64,
    /// Largest chunk read from one side before it is forwarded.
    pub read_buffer_size: usize,
    /// Per-subscriber notification queue length.
    pub event_capacity: usize,
    /// Number of finished or running transmissions kept for inspection.
    pub history_capacity: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            liveness_interval_ms: 1_000,
            read_buffer_size: 64 * 1024,
            event_capacity: 1024,
            history_capacity: 256,
        }
    }
}

/// Logging output settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogSettings {
    pub level: String,
    pub json: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Load settings from `path` (or the global location) and apply env overrides.
///
/// A missing file is not an error; defaults are used instead.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = match path.map(Path::to_path_buf).or_else(global_config_path) {
        Some(path) if path.exists() => load_config_file(&path)?,
        _ => Config::default(),
    };
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// Directory holding portfwd's settings and forwards file.
pub fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("portfwd"))
}

/// Get the global settings path.
pub fn global_config_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("settings.json"))
}

/// Get the default forwards file path.
pub fn default_forwards_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("forwards.conf"))
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    Ok(serde_json::from_str(&content)?)
}

fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(n) = var("PORTFWD_CONNECT_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
        config.engine.connect_timeout_ms = n;
    }
    if let Some(n) = var("PORTFWD_LIVENESS_INTERVAL_MS").and_then(|v| v.parse().ok()) {
        config.engine.liveness_interval_ms = n;
    }
    if let Some(n) = var("PORTFWD_READ_BUFFER_SIZE").and_then(|v| v.parse().ok()) {
        config.engine.read_buffer_size = n;
    }
    if let Some(n) = var("PORTFWD_HISTORY_CAPACITY").and_then(|v| v.parse().ok()) {
        config.engine.history_capacity = n;
    }
    if let Some(val) = var("PORTFWD_LOG_LEVEL") {
        config.log.level = val;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_liveness_matches_twenty_polls() {
        let config = Config::default();
        assert_eq!(config.engine.liveness_interval_ms, 20 * 50);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"engine": {"connect_timeout_ms": 250}}"#).unwrap();

        let config = load_config_file(&path).unwrap();
        assert_eq!(config.engine.connect_timeout_ms, 250);
        assert_eq!(config.engine.read_buffer_size, 64 * 1024);
        assert_eq!(config.log, LogSettings::default());
    }

    #[test]
    fn malformed_file_is_json_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = load_config_file(&path).unwrap_err();
        assert!(matches!(err, Error::Json(_)));

        let err = load_config(Some(&path)).unwrap_err();
        assert!(err.to_string().starts_with("JSON error:"));
    }

    #[test]
    fn unreadable_file_is_config_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = load_config_file(dir.path()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn env_overrides_ignore_garbage() {
        let env: HashMap<&str, &str> = [
            ("PORTFWD_CONNECT_TIMEOUT_MS", "500"),
            ("PORTFWD_READ_BUFFER_SIZE", "lots"),
            ("PORTFWD_LOG_LEVEL", "trace"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        apply_env_overrides(&mut config, |key| env.get(key).map(ToString::to_string));

        assert_eq!(config.engine.connect_timeout_ms, 500);
        assert_eq!(config.engine.read_buffer_size, 64 * 1024);
        assert_eq!(config.log.level, "trace");
    }
}
