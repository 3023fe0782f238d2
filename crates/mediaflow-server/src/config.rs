//! Configuration from the process environment.
//!
//! A `.env` file is loaded first when present; every setting is then read
//! from `MEDIAFLOW_*` variables, e.g. `MEDIAFLOW_BIND_ADDR`.

use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub const ENV_PREFIX: &str = "MEDIAFLOW_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Deployment profile, read from `MEDIAFLOW_ENV`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Custom(String),
}

impl Environment {
    pub fn current() -> Self {
        Self::from_name(std::env::var(format!("{ENV_PREFIX}ENV")).ok().as_deref())
    }

    /// `None` means development.
    pub fn from_name(name: Option<&str>) -> Self {
        match name {
            Some("production") | Some("prod") => Self::Production,
            Some("development") | Some("dev") | None => Self::Development,
            Some(other) => Self::Custom(other.to_string()),
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Custom(name) => name,
        }
    }

    /// Filter used when `RUST_LOG` is not set.
    pub fn default_log_filter(&self) -> &'static str {
        match self {
            Self::Development => "info,mediaflow=debug,mediaflow_jobs=debug,mediaflow_db=debug,mediaflow_server=debug",
            Self::Production | Self::Custom(_) => "info",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which broker keeps the jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    #[default]
    Memory,
    Postgres,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default)]
    pub broker: BrokerKind,
    #[serde(default)]
    pub broker_url: Option<String>,
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,
    #[serde(default = "default_storage")]
    pub default_storage: String,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// Prefix of the `statusUrl` handed to clients; empty for relative URLs.
    #[serde(default)]
    pub public_base_url: String,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_database_url() -> String {
    "sqlite://mediaflow.db".to_string()
}

fn default_db_max_connections() -> u32 {
    5
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("./data/objects")
}

fn default_storage() -> String {
    "local".to_string()
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

fn default_max_body_bytes() -> usize {
    16 * 1024 * 1024
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            database_url: default_database_url(),
            db_max_connections: default_db_max_connections(),
            broker: BrokerKind::default(),
            broker_url: None,
            storage_root: default_storage_root(),
            default_storage: default_storage(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            public_base_url: String::new(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

/// Load `.env` if present. Missing files are ignored.
pub fn load_dotenv() {
    let _ = dotenvy::dotenv();
}

impl AppConfig {
    /// Read `.env` and the `MEDIAFLOW_*` variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        load_dotenv();
        let config: Self = envy::prefixed(ENV_PREFIX).from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Same as [`from_env`](Self::from_env) over explicit `(name, value)`
    /// pairs, names including the prefix.
    pub fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let config: Self = envy::prefixed(ENV_PREFIX).from_iter(vars)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.db_max_connections == 0 {
            return Err(ConfigError::Invalid(
                "db_max_connections must be at least 1".to_string(),
            ));
        }
        if self.broker == BrokerKind::Postgres && self.broker_url.is_none() {
            return Err(ConfigError::Invalid(
                "broker_url is required for the postgres broker".to_string(),
            ));
        }
        if !matches!(self.default_storage.as_str(), "local" | "memory") {
            return Err(ConfigError::Invalid(format!(
                "unknown default_storage '{}'",
                self.default_storage
            )));
        }
        Ok(())
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}
