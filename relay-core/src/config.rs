//! Relay configuration
//!
//! # Example
//!
//! ```rust
//! use relay_core::config::RelayConfig;
//!
//! let config = RelayConfig::from_yaml_str("stream:\n  poll_interval_ms: 50\n").unwrap();
//! assert_eq!(config.stream.poll_interval_ms, 50);
//! assert_eq!(config.log.console_level, "info");
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::Level;

use crate::error::{Error, Result};
use crate::task::ScriptedTaskConfig;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Per-connection streaming behaviour
    pub stream: StreamConfig,
    /// Log destinations
    pub log: LogConfig,
    /// Demo task script
    pub agent: ScriptedTaskConfig,
}

impl RelayConfig {
    /// Parse and validate YAML
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml_ng::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&content)
    }

    /// Reject settings the relay cannot run with
    pub fn validate(&self) -> Result<()> {
        self.stream.validate()?;
        self.log.validate()
    }
}

/// What happens to a running task when its client disconnects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelPolicy {
    /// Abort the task, then clean it up
    #[default]
    Abort,
    /// Let the task run to completion unobserved; cleanup still runs
    Detach,
}

/// Streaming settings applied to every connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Bounded wait of one queue poll, in milliseconds
    pub poll_interval_ms: u64,
    /// Bridge queue capacity; `None` for unbounded
    pub queue_capacity: Option<usize>,
    /// Frames buffered between the driver and the HTTP body
    pub frame_buffer: usize,
    /// Disconnect handling
    pub cancel_policy: CancelPolicy,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            queue_capacity: None,
            frame_buffer: 32,
            cancel_policy: CancelPolicy::Abort,
        }
    }
}

impl StreamConfig {
    /// Poll wait as a duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(Error::config("stream.poll_interval_ms must be greater than 0"));
        }
        if self.queue_capacity == Some(0) {
            return Err(Error::config("stream.queue_capacity must be greater than 0"));
        }
        if self.frame_buffer == 0 {
            return Err(Error::config("stream.frame_buffer must be greater than 0"));
        }
        Ok(())
    }
}

/// Log file rotation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogRotation {
    /// New file every hour
    Hourly,
    /// New file every day
    #[default]
    Daily,
    /// One file for the process lifetime
    Never,
}

/// Log destination settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Directory for log files
    pub directory: PathBuf,
    /// Optional prefix for log file names
    pub name: Option<String>,
    /// Write to stderr
    pub console_enabled: bool,
    /// Minimum level written to stderr
    pub console_level: String,
    /// Write to a log file
    pub file_enabled: bool,
    /// Minimum level written to the log file
    pub file_level: String,
    /// File rotation
    pub rotation: LogRotation,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("logs"),
            name: None,
            console_enabled: true,
            console_level: "info".to_string(),
            file_enabled: true,
            file_level: "debug".to_string(),
            rotation: LogRotation::Daily,
        }
    }
}

impl LogConfig {
    /// Parsed console level
    pub fn console_level(&self) -> Result<Level> {
        parse_level("log.console_level", &self.console_level)
    }

    /// Parsed file level
    pub fn file_level(&self) -> Result<Level> {
        parse_level("log.file_level", &self.file_level)
    }

    fn validate(&self) -> Result<()> {
        self.console_level()?;
        self.file_level()?;
        Ok(())
    }
}

fn parse_level(key: &str, value: &str) -> Result<Level> {
    Level::from_str(value.trim())
        .map_err(|_| Error::config(format!("{} has unknown level '{}'", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.stream.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.stream.queue_capacity, None);
        assert_eq!(config.stream.cancel_policy, CancelPolicy::Abort);
        assert_eq!(config.log.console_level().unwrap(), Level::INFO);
        assert_eq!(config.log.file_level().unwrap(), Level::DEBUG);
        config.validate().unwrap();
    }

    #[test]
    fn test_yaml_overrides() {
        let yaml = r#"
stream:
  queue_capacity: 256
  cancel_policy: detach
log:
  directory: /tmp/relay
  name: relay
  rotation: never
agent:
  steps: ["a", "b"]
  step_delay_ms: 0
"#;
        let config = RelayConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.stream.queue_capacity, Some(256));
        assert_eq!(config.stream.cancel_policy, CancelPolicy::Detach);
        assert_eq!(config.stream.poll_interval_ms, 100);
        assert_eq!(config.log.rotation, LogRotation::Never);
        assert_eq!(config.log.name.as_deref(), Some("relay"));
        assert_eq!(config.agent.steps, vec!["a", "b"]);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            RelayConfig::from_yaml_str("stream:\n  poll_interval_ms: 0\n"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            RelayConfig::from_yaml_str("stream:\n  queue_capacity: 0\n"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            RelayConfig::from_yaml_str("log:\n  console_level: loud\n"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            RelayConfig::from_yaml_str("stream: [1, 2]"),
            Err(Error::ConfigParse(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.yaml");
        std::fs::write(&path, "stream:\n  frame_buffer: 4\n").unwrap();

        let config = RelayConfig::load(&path).unwrap();
        assert_eq!(config.stream.frame_buffer, 4);
    }
}
