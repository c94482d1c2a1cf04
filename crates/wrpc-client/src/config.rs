// ABOUTME: Configuration loading and validation for backend clients.
// ABOUTME: TOML config file with environment variable expansion and a redacted credential.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::client::Client;
use crate::connect::{
    ConnectConfig, ConnectRetry, TlsMode, WsDialer, DEFAULT_INITIAL_BACKOFF, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_RPC_PATH,
};
use crate::error::ConfigError;
use crate::retry::{RetryPolicy, AVAILABILITY_TIMEOUT, DEFAULT_POLL_INTERVAL, DELETION_TIMEOUT};

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub backend: BackendConfig,
    #[serde(default)]
    pub connect: ConnectSection,
    #[serde(default)]
    pub convergence: ConvergenceSection,
}

/// Where the backend lives and how to authenticate.
#[derive(Clone, Deserialize)]
pub struct BackendConfig {
    /// Host or URL, e.g. "orchestrator.example.com" or "https://orchestrator:8443".
    pub address: String,
    /// RPC path appended when the address has none.
    #[serde(default = "default_path")]
    pub path: String,
    /// Bearer credential.
    pub token: String,
    /// Skip certificate verification.
    #[serde(default)]
    pub insecure: bool,
}

impl std::fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConfig")
            .field("address", &self.address)
            .field("path", &self.path)
            .field("token", &"[REDACTED]")
            .field("insecure", &self.insecure)
            .finish()
    }
}

fn default_path() -> String {
    DEFAULT_RPC_PATH.to_string()
}

/// Connection establishment tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectSection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_secs")]
    pub initial_backoff_secs: u64,
    /// Per-attempt handshake timeout; 0 disables it.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for ConnectSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_secs: default_initial_backoff_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_initial_backoff_secs() -> u64 {
    DEFAULT_INITIAL_BACKOFF.as_secs()
}

fn default_connect_timeout_secs() -> u64 {
    30
}

/// Polling cadence and deadlines for convergence loops.
#[derive(Debug, Clone, Deserialize)]
pub struct ConvergenceSection {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_availability_timeout_secs")]
    pub availability_timeout_secs: u64,
    #[serde(default = "default_deletion_timeout_secs")]
    pub deletion_timeout_secs: u64,
}

impl Default for ConvergenceSection {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            availability_timeout_secs: default_availability_timeout_secs(),
            deletion_timeout_secs: default_deletion_timeout_secs(),
        }
    }
}

fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL.as_secs()
}

fn default_availability_timeout_secs() -> u64 {
    AVAILABILITY_TIMEOUT.as_secs()
}

fn default_deletion_timeout_secs() -> u64 {
    DELETION_TIMEOUT.as_secs()
}

/// Default config location: `~/.config/wrpc/config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("wrpc").join("config.toml"))
}

fn expand_env(contents: &str) -> String {
    shellexpand::env_with_context_no_errors(contents, |var: &str| match std::env::var(var) {
        Ok(val) => Some(val),
        Err(_) => {
            warn!(
                variable = %var,
                "Environment variable not defined, using empty string"
            );
            Some(String::new())
        }
    })
    .into_owned()
}

impl Config {
    /// Load configuration from the specified path or the default location.
    pub fn load(path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let path = path
            .or_else(default_config_path)
            .ok_or(ConfigError::NoPath)?;
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&contents)
    }

    /// Parse TOML text, expanding `${VAR}` references first.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(&expand_env(contents))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.backend.address.trim().is_empty() {
            return Err(ConfigError::Invalid("backend.address is required".into()));
        }
        if self.backend.token.is_empty() {
            return Err(ConfigError::Invalid("backend.token is required".into()));
        }
        if !self.backend.path.is_empty() && !self.backend.path.starts_with('/') {
            return Err(ConfigError::Invalid(
                "backend.path must start with '/'".into(),
            ));
        }
        if self.connect.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "connect.max_attempts must be at least 1".into(),
            ));
        }
        if self.convergence.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "convergence.poll_interval_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Connection settings for the WebSocket dialer.
    pub fn connect_config(&self) -> Result<ConnectConfig, ConfigError> {
        let mut config = ConnectConfig::new(&self.backend.address, self.backend.token.clone())
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if !has_path(&self.backend.address) {
            config = config
                .with_path(&self.backend.path)
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        }
        if self.backend.insecure {
            config = config.with_tls(TlsMode::Insecure);
        }
        Ok(match self.connect.connect_timeout_secs {
            0 => config.without_connect_timeout(),
            secs => config.with_connect_timeout(Duration::from_secs(secs)),
        })
    }

    pub fn connect_retry(&self) -> ConnectRetry {
        ConnectRetry::new(
            self.connect.max_attempts,
            Duration::from_secs(self.connect.initial_backoff_secs),
        )
    }

    pub fn availability_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_secs(self.convergence.poll_interval_secs),
            Duration::from_secs(self.convergence.availability_timeout_secs),
        )
    }

    pub fn deletion_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_secs(self.convergence.poll_interval_secs),
            Duration::from_secs(self.convergence.deletion_timeout_secs),
        )
    }

    /// WebSocket client built from this configuration.
    pub fn client(&self) -> Result<Client<WsDialer>, ConfigError> {
        Ok(Client::websocket(self.connect_config()?).with_retry(self.connect_retry()))
    }
}

/// True if the address names its own path beyond `/`.
fn has_path(address: &str) -> bool {
    let rest = address.split_once("://").map_or(address, |(_, rest)| rest);
    rest.split_once('/')
        .map(|(_, path)| !path.is_empty())
        .unwrap_or(false)
}
