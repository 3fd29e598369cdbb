//! Configuration loading and resolution
//!
//! Each setting resolves in priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. TOML config file
//! 4. Compiled default (fallback)

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

pub const ENV_SERVER_URL: &str = "SMC_SERVER_URL";
pub const ENV_SESSION: &str = "SMC_SESSION";
pub const ENV_POLL_INTERVAL_MS: &str = "SMC_POLL_INTERVAL_MS";
pub const ENV_REQUEST_TIMEOUT_SECS: &str = "SMC_REQUEST_TIMEOUT_SECS";

pub const DEFAULT_SERVER_URL: &str = "http://localhost:8000";
pub const DEFAULT_SESSION: &str = "default";
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
/// Matching and inference jobs are heavy; each call gets minutes, not seconds
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 600;

/// On-disk configuration (every field optional)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub server_url: Option<String>,
    #[serde(default)]
    pub session_name: Option<String>,
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Values supplied on the command line
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub server_url: Option<String>,
    pub session_name: Option<String>,
    pub poll_interval_ms: Option<u64>,
    pub request_timeout_secs: Option<u64>,
    /// Explicit TOML path; the platform default is tried otherwise
    pub config_path: Option<PathBuf>,
}

/// Fully resolved client configuration
///
/// Passed explicitly to the API client, job coordinator and evaluation engine.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub server_url: String,
    pub session_name: String,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    pub log_level: String,
}

impl ClientConfig {
    /// Defaults with a specific server and session, mostly for tests and embedding
    pub fn new(server_url: impl Into<String>, session_name: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            session_name: session_name.into(),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            log_level: default_log_level(),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.session_name.trim().is_empty() {
            return Err(Error::Config("session name must not be empty".to_string()));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::Config("poll interval must be greater than zero".to_string()));
        }
        if !(self.server_url.starts_with("http://") || self.server_url.starts_with("https://")) {
            return Err(Error::Config(format!(
                "server url must start with http:// or https://: {}",
                self.server_url
            )));
        }
        Ok(())
    }
}

/// Platform config file location (`<config_dir>/smc/config.toml`)
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("smc").join("config.toml"))
}

/// Read and parse a TOML config file
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    let content = std::fs::read_to_string(path)?;
    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse TOML failed ({}): {}", path.display(), e)))
}

/// Resolve configuration from CLI → ENV → TOML → defaults
pub fn resolve_config(overrides: &ConfigOverrides) -> Result<ClientConfig> {
    let toml_config = match &overrides.config_path {
        // An explicitly named file must exist
        Some(path) => load_toml_config(path)?,
        None => match default_config_path() {
            Some(path) if path.exists() => {
                debug!("Loading config from {}", path.display());
                load_toml_config(&path)?
            }
            _ => TomlConfig::default(),
        },
    };

    let server_url = overrides
        .server_url
        .clone()
        .or_else(|| env_string(ENV_SERVER_URL))
        .or(toml_config.server_url)
        .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string());

    let session_name = overrides
        .session_name
        .clone()
        .or_else(|| env_string(ENV_SESSION))
        .or(toml_config.session_name)
        .unwrap_or_else(|| DEFAULT_SESSION.to_string());

    let poll_interval_ms = match overrides.poll_interval_ms {
        Some(ms) => ms,
        None => match env_u64(ENV_POLL_INTERVAL_MS)? {
            Some(ms) => ms,
            None => toml_config
                .poll_interval_ms
                .unwrap_or(DEFAULT_POLL_INTERVAL_MS),
        },
    };

    let request_timeout_secs = match overrides.request_timeout_secs {
        Some(secs) => secs,
        None => match env_u64(ENV_REQUEST_TIMEOUT_SECS)? {
            Some(secs) => secs,
            None => toml_config
                .request_timeout_secs
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
        },
    };

    let config = ClientConfig {
        server_url: server_url.trim_end_matches('/').to_string(),
        session_name,
        poll_interval: Duration::from_millis(poll_interval_ms),
        request_timeout: Duration::from_secs(request_timeout_secs),
        log_level: toml_config.logging.level,
    };
    config.validate()?;

    info!(
        server_url = %config.server_url,
        session = %config.session_name,
        poll_interval_ms = poll_interval_ms,
        "Client configuration resolved"
    );

    Ok(config)
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_u64(name: &str) -> Result<Option<u64>> {
    match env_string(name) {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| Error::Config(format!("{} is not a number ({}): {}", name, raw, e))),
        None => Ok(None),
    }
}
