//! Governor Configuration
//!
//! Strongly-typed bootstrap configuration with four named capacity fields
//! and explicit "0 means unlimited" semantics, validated at load time.
//!
//! Sources, in increasing precedence:
//! 1. built-in defaults (everything unthrottled)
//! 2. a JSON config file
//! 3. `IOGOV_*` environment variables

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::GovernorError;
use crate::quota::Category;

/// Default port the governor listens on
pub const DEFAULT_PORT: u16 = 4000;

/// Default grace period for in-flight grants during shutdown
pub const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 5;

/// Validated governor configuration.
///
/// Request-count categories (`read_reqs`, `write_reqs`) cap concurrent
/// operations; data categories (`read_data`, `write_data`) cap bytes in
/// flight. Capacity 0 leaves that category unthrottled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernorConfig {
    /// Max concurrent read operations (0 = unlimited)
    pub read_reqs: u64,

    /// Max read bytes in flight (0 = unlimited)
    pub read_data: u64,

    /// Max concurrent write operations (0 = unlimited)
    pub write_reqs: u64,

    /// Max write bytes in flight (0 = unlimited)
    pub write_data: u64,

    /// Host/interface to bind
    pub host: String,

    /// Port to bind
    pub port: u16,

    /// Seconds to let in-flight grants drain on shutdown
    pub drain_timeout_secs: u64,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            read_reqs: 0,
            read_data: 0,
            write_reqs: 0,
            write_data: 0,
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            drain_timeout_secs: DEFAULT_DRAIN_TIMEOUT_SECS,
        }
    }
}

/// Raw, unvalidated shape of the config file. Capacities are signed so a
/// negative value surfaces as a ConfigError instead of a serde type error.
#[derive(Debug, Clone, Default, Deserialize)]
struct RawConfig {
    read_reqs: Option<i64>,
    read_data: Option<i64>,
    write_reqs: Option<i64>,
    write_data: Option<i64>,
    host: Option<String>,
    port: Option<u16>,
    drain_timeout_secs: Option<u64>,
}

impl RawConfig {
    fn apply_env(&mut self) -> Result<(), GovernorError> {
        fn parse_var(name: &str) -> Result<Option<i64>, GovernorError> {
            match std::env::var(name) {
                Ok(val) => val
                    .parse::<i64>()
                    .map(Some)
                    .map_err(|_| GovernorError::Config(format!("{name} is not an integer: {val}"))),
                Err(_) => Ok(None),
            }
        }

        if let Some(v) = parse_var("IOGOV_READ_REQS")? {
            self.read_reqs = Some(v);
        }
        if let Some(v) = parse_var("IOGOV_READ_DATA")? {
            self.read_data = Some(v);
        }
        if let Some(v) = parse_var("IOGOV_WRITE_REQS")? {
            self.write_reqs = Some(v);
        }
        if let Some(v) = parse_var("IOGOV_WRITE_DATA")? {
            self.write_data = Some(v);
        }
        if let Ok(val) = std::env::var("IOGOV_HOST") {
            self.host = Some(val);
        }
        if let Ok(val) = std::env::var("IOGOV_PORT") {
            let port = val
                .parse::<u16>()
                .map_err(|_| GovernorError::Config(format!("IOGOV_PORT is not a port: {val}")))?;
            self.port = Some(port);
        }
        Ok(())
    }

    fn validate(self) -> Result<GovernorConfig, GovernorError> {
        fn capacity(name: &str, value: Option<i64>) -> Result<u64, GovernorError> {
            match value {
                Some(v) if v < 0 => Err(GovernorError::Config(format!(
                    "Capacity {name} must be nonnegative, got {v}"
                ))),
                Some(v) => Ok(v as u64),
                None => Ok(0),
            }
        }

        let defaults = GovernorConfig::default();
        Ok(GovernorConfig {
            read_reqs: capacity("read_reqs", self.read_reqs)?,
            read_data: capacity("read_data", self.read_data)?,
            write_reqs: capacity("write_reqs", self.write_reqs)?,
            write_data: capacity("write_data", self.write_data)?,
            host: self.host.unwrap_or(defaults.host),
            port: self.port.unwrap_or(defaults.port),
            drain_timeout_secs: self.drain_timeout_secs.unwrap_or(defaults.drain_timeout_secs),
        })
    }
}

impl GovernorConfig {
    /// Load from a JSON file, then apply `IOGOV_*` environment overrides.
    pub fn load(path: &Path) -> Result<Self, GovernorError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            GovernorError::Config(format!("Cannot read {}: {e}", path.display()))
        })?;
        let mut raw: RawConfig = serde_json::from_str(&contents).map_err(|e| {
            GovernorError::Config(format!("Cannot parse {}: {e}", path.display()))
        })?;
        raw.apply_env()?;
        raw.validate()
    }

    /// Defaults plus `IOGOV_*` environment overrides; no config file.
    pub fn from_env() -> Result<Self, GovernorError> {
        let mut raw = RawConfig::default();
        raw.apply_env()?;
        raw.validate()
    }

    /// Configured capacity for a category.
    pub fn capacity_for(&self, category: Category) -> u64 {
        match category {
            Category::ReadRequests => self.read_reqs,
            Category::ReadBytes => self.read_data,
            Category::WriteRequests => self.write_reqs,
            Category::WriteBytes => self.write_data,
        }
    }

    /// Address string suitable for binding or connecting.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Shutdown grace period as a [`Duration`].
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = GovernorConfig::default();
        for cat in Category::ALL {
            assert_eq!(config.capacity_for(cat), 0);
        }
        assert_eq!(config.port, DEFAULT_PORT);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"read_reqs": 32, "read_data": 1000000, "write_reqs": 8, "port": 4001}}"#
        )
        .unwrap();

        let config = GovernorConfig::load(file.path()).unwrap();
        assert_eq!(config.read_reqs, 32);
        assert_eq!(config.read_data, 1_000_000);
        assert_eq!(config.write_reqs, 8);
        // Unspecified capacity defaults to unthrottled
        assert_eq!(config.write_data, 0);
        assert_eq!(config.port, 4001);
    }

    #[test]
    fn test_negative_capacity_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"read_reqs": -1}}"#).unwrap();

        let err = GovernorConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, GovernorError::Config(_)));
        assert!(err.to_string().contains("read_reqs"));
    }

    #[test]
    fn test_missing_file_rejected() {
        let err = GovernorConfig::load(Path::new("/nonexistent/iogov.json")).unwrap_err();
        assert!(matches!(err, GovernorError::Config(_)));
    }

    #[test]
    fn test_malformed_json_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"read_reqs": "#).unwrap();

        let err = GovernorConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, GovernorError::Config(_)));
    }

    #[test]
    fn test_bind_addr() {
        let config = GovernorConfig {
            host: "127.0.0.1".to_string(),
            port: 4123,
            ..GovernorConfig::default()
        };
        assert_eq!(config.bind_addr(), "127.0.0.1:4123");
    }
}
