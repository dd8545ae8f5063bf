//! Daemon configuration.
//!
//! Configuration is read from `$HELM_STATE_DIR/helm.json` (or
//! `~/.helm/helm.json`) when present, with environment variables taking
//! priority. A missing file yields pure defaults; a malformed file is an
//! error so a typo does not silently run with defaults.

use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::protocol::DEFAULT_PORT;

/// Environment variable overriding the listen port.
pub const PORT_ENV_VAR: &str = "BROWSER_MCP_PORT";

const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_AGENT_CONNECT_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_KEEPALIVE_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_AGENT_PING_INTERVAL_MS: u64 = 25_000;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {message}")]
    ReadError { path: String, message: String },

    #[error("failed to parse config file {path}: {message}")]
    ParseError { path: String, message: String },

    #[error("invalid {} value: {value}", PORT_ENV_VAR)]
    InvalidPortEnv { value: String },

    #[error("invalid config value at {path}: {message}")]
    ValidationError { path: String, message: String },
}

/// Resolved daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Loopback port serving both HTTP health and the WS channel.
    pub port: u16,
    /// Deadline for one forwarded command (client -> agent -> reply).
    pub request_timeout: Duration,
    /// How long a Dispatch waits for an agent to attach before failing.
    pub agent_connect_timeout: Duration,
    /// Sessions without a keepalive for this long are swept.
    pub keepalive_timeout: Duration,
    /// Interval of the `ping` sent to keep the agent runtime alive.
    pub agent_ping_interval: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            agent_connect_timeout: Duration::from_millis(DEFAULT_AGENT_CONNECT_TIMEOUT_MS),
            keepalive_timeout: Duration::from_millis(DEFAULT_KEEPALIVE_TIMEOUT_MS),
            agent_ping_interval: Duration::from_millis(DEFAULT_AGENT_PING_INTERVAL_MS),
        }
    }
}

/// On-disk config shape. Every field is optional; omitted fields fall back
/// to the defaults above.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ConfigFile {
    port: Option<u16>,
    request_timeout_ms: Option<u64>,
    agent_connect_timeout_ms: Option<u64>,
    keepalive_timeout_ms: Option<u64>,
    agent_ping_interval_ms: Option<u64>,
}

/// Resolve the state directory: `HELM_STATE_DIR` or `~/.helm`.
pub fn state_dir() -> PathBuf {
    if let Ok(dir) = env::var("HELM_STATE_DIR") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".helm")
}

/// Path of the optional config file.
pub fn config_path() -> PathBuf {
    state_dir().join("helm.json")
}

impl DaemonConfig {
    /// Load configuration: file (if present) -> env overrides -> validation.
    pub fn load() -> Result<Self, ConfigError> {
        let file = read_config_file(&config_path())?;
        let mut config = Self::from_file(file);
        if let Ok(value) = env::var(PORT_ENV_VAR) {
            config.port = parse_port(&value)?;
        }
        config.validate()?;
        Ok(config)
    }

    fn from_file(file: ConfigFile) -> Self {
        let defaults = Self::default();
        Self {
            port: file.port.unwrap_or(defaults.port),
            request_timeout: file
                .request_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.request_timeout),
            agent_connect_timeout: file
                .agent_connect_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.agent_connect_timeout),
            keepalive_timeout: file
                .keepalive_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.keepalive_timeout),
            agent_ping_interval: file
                .agent_ping_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.agent_ping_interval),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("requestTimeoutMs", self.request_timeout),
            ("agentConnectTimeoutMs", self.agent_connect_timeout),
            ("keepaliveTimeoutMs", self.keepalive_timeout),
            ("agentPingIntervalMs", self.agent_ping_interval),
        ];
        for (path, value) in nonzero {
            if value.is_zero() {
                return Err(ConfigError::ValidationError {
                    path: path.to_string(),
                    message: "must be greater than zero".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Sweeper cadence: half the keepalive timeout.
    pub fn sweep_interval(&self) -> Duration {
        self.keepalive_timeout / 2
    }
}

fn read_config_file(path: &std::path::Path) -> Result<ConfigFile, ConfigError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ConfigFile::default()),
        Err(e) => {
            return Err(ConfigError::ReadError {
                path: path.display().to_string(),
                message: e.to_string(),
            })
        }
    };
    serde_json::from_str(&raw).map_err(|e| ConfigError::ParseError {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

fn parse_port(value: &str) -> Result<u16, ConfigError> {
    value
        .trim()
        .parse::<u16>()
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| ConfigError::InvalidPortEnv {
            value: value.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DaemonConfig::default();
        assert_eq!(config.port, 9876);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.agent_connect_timeout, Duration::from_secs(15));
        assert_eq!(config.keepalive_timeout, Duration::from_secs(60));
        assert_eq!(config.agent_ping_interval, Duration::from_secs(25));
        assert_eq!(config.sweep_interval(), Duration::from_secs(30));
    }

    #[test]
    fn test_parse_port() {
        assert_eq!(parse_port("9999").unwrap(), 9999);
        assert_eq!(parse_port(" 8080 ").unwrap(), 8080);
        assert!(parse_port("0").is_err());
        assert!(parse_port("browser").is_err());
        assert!(parse_port("70000").is_err());
    }

    #[test]
    fn test_file_overrides_and_validation() {
        let file: ConfigFile =
            serde_json::from_str(r#"{ "port": 4242, "requestTimeoutMs": 1000 }"#).unwrap();
        let config = DaemonConfig::from_file(file);
        assert_eq!(config.port, 4242);
        assert_eq!(config.request_timeout, Duration::from_secs(1));
        assert_eq!(config.keepalive_timeout, Duration::from_secs(60));

        let zero: ConfigFile = serde_json::from_str(r#"{ "keepaliveTimeoutMs": 0 }"#).unwrap();
        assert!(DaemonConfig::from_file(zero).validate().is_err());
    }

    #[test]
    fn test_unknown_file_keys_rejected() {
        let result = serde_json::from_str::<ConfigFile>(r#"{ "prot": 4242 }"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let file = read_config_file(&dir.path().join("helm.json")).unwrap();
        assert!(file.port.is_none());
    }
}
