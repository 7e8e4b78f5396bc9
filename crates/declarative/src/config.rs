//! Manager configuration.
//!
//! Configuration is read from a serde source or from `DATABASE_*`
//! environment variables:
//!
//! | Variable | Field |
//! |---|---|
//! | `DATABASE_URI` | `database_uri` |
//! | `DATABASE_BINDS` | `binds` (JSON object of bind key to URI) |
//! | `DATABASE_ECHO` | `echo` |
//! | `DATABASE_POOL_SIZE` | `pool_size` |
//! | `DATABASE_POOL_TIMEOUT` | `pool_timeout` (seconds) |
//! | `DATABASE_POOL_RECYCLE` | `pool_recycle` (seconds) |
//! | `DATABASE_MAX_OVERFLOW` | `max_overflow` |
//! | `DATABASE_AUTOFLUSH` | `session.autoflush` |

use std::collections::BTreeMap;
use std::env;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::schema::SqlDialect;

/// URI used when none is configured: a private in-memory SQLite database.
pub const DEFAULT_DATABASE_URI: &str = "sqlite::memory:";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for field '{field}': '{value}'. Expected: {expected}")]
    InvalidValue {
        field: String,
        value: String,
        expected: String,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ConfigError {
    fn invalid(field: &str, value: &str, expected: &str) -> Self {
        Self::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
            expected: expected.to_string(),
        }
    }
}

impl From<ConfigError> for ModelError {
    fn from(err: ConfigError) -> Self {
        ModelError::Configuration(err.to_string())
    }
}

/// Options applied to every session the manager creates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Flush pending changes before queries run
    pub autoflush: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { autoflush: true }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Default engine URI; `None` leaves the default bind unconfigured
    pub database_uri: Option<String>,
    /// Extra engines by bind key
    pub binds: BTreeMap<String, String>,
    /// Log every statement at info level
    pub echo: bool,
    pub pool_size: Option<u32>,
    /// Seconds to wait for a connection
    pub pool_timeout: Option<u64>,
    /// Seconds after which connections are replaced
    pub pool_recycle: Option<u64>,
    pub max_overflow: Option<u32>,
    pub session: SessionConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            database_uri: Some(DEFAULT_DATABASE_URI.to_string()),
            binds: BTreeMap::new(),
            echo: false,
            pool_size: None,
            pool_timeout: None,
            pool_recycle: None,
            max_overflow: None,
            session: SessionConfig::default(),
        }
    }
}

fn parse<T: FromStr>(field: &str, raw: &str, expected: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::invalid(field, raw, expected))
}

fn parse_bool(field: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::invalid(field, raw, "a boolean")),
    }
}

impl ManagerConfig {
    /// Configuration with only a default URI.
    pub fn with_uri(uri: &str) -> Self {
        Self {
            database_uri: Some(uri.to_string()),
            ..Self::default()
        }
    }

    pub fn bind(mut self, key: &str, uri: &str) -> Self {
        self.binds.insert(key.to_string(), uri.to_string());
        self
    }

    pub fn echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to
    /// its value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(uri) = lookup("DATABASE_URI") {
            config.database_uri = Some(uri).filter(|u| !u.trim().is_empty());
        }

        if let Some(binds) = lookup("DATABASE_BINDS") {
            config.binds = serde_json::from_str(&binds)?;
        }

        if let Some(echo) = lookup("DATABASE_ECHO") {
            config.echo = parse_bool("echo", &echo)?;
        }

        if let Some(size) = lookup("DATABASE_POOL_SIZE") {
            config.pool_size = Some(parse("pool_size", &size, "a positive integer")?);
        }

        if let Some(timeout) = lookup("DATABASE_POOL_TIMEOUT") {
            config.pool_timeout = Some(parse("pool_timeout", &timeout, "seconds")?);
        }

        if let Some(recycle) = lookup("DATABASE_POOL_RECYCLE") {
            config.pool_recycle = Some(parse("pool_recycle", &recycle, "seconds")?);
        }

        if let Some(overflow) = lookup("DATABASE_MAX_OVERFLOW") {
            config.max_overflow = Some(parse("max_overflow", &overflow, "a non-negative integer")?);
        }

        if let Some(autoflush) = lookup("DATABASE_AUTOFLUSH") {
            config.session.autoflush = parse_bool("autoflush", &autoflush)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(uri) = &self.database_uri {
            validate_uri("database_uri", uri)?;
        }
        for (key, uri) in &self.binds {
            if key.trim().is_empty() {
                return Err(ConfigError::invalid("binds", key, "a non-empty bind key"));
            }
            validate_uri(&format!("binds.{}", key), uri)?;
        }
        if self.pool_size == Some(0) {
            return Err(ConfigError::invalid("pool_size", "0", "a positive integer"));
        }
        if self.pool_timeout == Some(0) {
            return Err(ConfigError::invalid("pool_timeout", "0", "a positive number of seconds"));
        }
        Ok(())
    }

    /// Every configured URI keyed by bind (`None` is the default bind).
    pub fn uris(&self) -> Vec<(Option<&str>, &str)> {
        self.database_uri
            .as_deref()
            .map(|uri| (None, uri))
            .into_iter()
            .chain(self.binds.iter().map(|(key, uri)| (Some(key.as_str()), uri.as_str())))
            .collect()
    }
}

fn validate_uri(field: &str, uri: &str) -> Result<(), ConfigError> {
    url::Url::parse(uri).map_err(|_| ConfigError::invalid(field, uri, "a database URL"))?;
    SqlDialect::from_url(uri).map_err(|_| ConfigError::invalid(field, uri, "a sqlite or postgres URL"))?;
    Ok(())
}
