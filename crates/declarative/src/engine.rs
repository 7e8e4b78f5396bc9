//! Engines - connection pools keyed by bind
//!
//! Every configured URI gets one lazily connected [`AnyPool`]. Nothing
//! touches the network until a session first needs a connection.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::OnceCell;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{Any, AnyPool, Transaction};

use crate::config::ManagerConfig;
use crate::error::{ModelError, ModelResult};
use crate::schema::SqlDialect;
use crate::value::DatabaseValue;

static DRIVERS: OnceCell<()> = OnceCell::new();

/// Register the sqlx drivers behind the `Any` pool. Safe to call repeatedly.
pub fn install_drivers() {
    DRIVERS.get_or_init(sqlx::any::install_default_drivers);
}

/// Database connection pool error types
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Connection acquisition failed: {0}")]
    AcquisitionFailed(#[from] sqlx::Error),

    #[error("Pool is closed")]
    PoolClosed,

    #[error("Connection timeout after {timeout}s")]
    ConnectionTimeout { timeout: u64 },

    #[error("Health check failed: {reason}")]
    HealthCheckFailed { reason: String },

    #[error("Configuration error: {message}")]
    ConfigurationError { message: String },
}

impl From<PoolError> for ModelError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::AcquisitionFailed(sqlx_err) => {
                ModelError::Connection(format!("Database connection failed: {}", sqlx_err))
            }
            PoolError::PoolClosed => ModelError::Connection("Database pool is closed".to_string()),
            PoolError::ConnectionTimeout { timeout } => {
                ModelError::Connection(format!("Database connection timeout after {}s", timeout))
            }
            PoolError::HealthCheckFailed { reason } => {
                ModelError::Connection(format!("Database health check failed: {}", reason))
            }
            PoolError::ConfigurationError { message } => ModelError::Configuration(message),
        }
    }
}

/// Connection pool configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: u64,
    pub idle_timeout: Option<u64>,
    pub max_lifetime: Option<u64>,
    pub test_before_acquire: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 15,
            min_connections: 0,
            acquire_timeout: 30,
            idle_timeout: Some(600),
            max_lifetime: Some(1800),
            test_before_acquire: true,
        }
    }
}

impl PoolConfig {
    /// Pool settings for `url` under the manager's pool options.
    ///
    /// An in-memory SQLite database lives exactly as long as its connection,
    /// so it always gets a single connection that is never recycled.
    pub fn for_url(url: &str, config: &ManagerConfig) -> Self {
        if is_memory_url(url) {
            return Self {
                max_connections: 1,
                min_connections: 0,
                acquire_timeout: config.pool_timeout.unwrap_or(30),
                idle_timeout: None,
                max_lifetime: None,
                test_before_acquire: false,
            };
        }

        let defaults = Self::default();
        let max_connections = match (config.pool_size, config.max_overflow) {
            (None, None) => defaults.max_connections,
            (size, overflow) => size.unwrap_or(5) + overflow.unwrap_or(10),
        };
        Self {
            max_connections: max_connections.max(1),
            acquire_timeout: config.pool_timeout.unwrap_or(defaults.acquire_timeout),
            max_lifetime: config.pool_recycle.or(defaults.max_lifetime),
            ..defaults
        }
    }

    fn options(&self) -> AnyPoolOptions {
        AnyPoolOptions::new()
            .max_connections(self.max_connections)
            .min_connections(self.min_connections)
            .acquire_timeout(Duration::from_secs(self.acquire_timeout))
            .idle_timeout(self.idle_timeout.map(Duration::from_secs))
            .max_lifetime(self.max_lifetime.map(Duration::from_secs))
            .test_before_acquire(self.test_before_acquire)
    }
}

fn is_memory_url(url: &str) -> bool {
    url.starts_with("sqlite:") && (url.contains(":memory:") || url.contains("mode=memory"))
}

#[derive(Debug, Default)]
struct EngineStats {
    acquire_count: AtomicU64,
    acquire_errors: AtomicU64,
}

/// A connection pool for one database URL.
#[derive(Debug, Clone)]
pub struct Engine {
    url: String,
    dialect: SqlDialect,
    pool: AnyPool,
    config: PoolConfig,
    echo: bool,
    stats: Arc<EngineStats>,
    created_at: Instant,
}

impl Engine {
    /// Build a lazily connected engine.
    pub fn connect_lazy(url: &str, config: PoolConfig, echo: bool) -> ModelResult<Self> {
        install_drivers();
        let dialect = SqlDialect::from_url(url)?;
        let pool = config.options().connect_lazy(url).map_err(|e| PoolError::ConfigurationError {
            message: format!("invalid database url '{}': {}", redact(url), e),
        })?;

        tracing::debug!("Engine created for {} (max connections: {})", redact(url), config.max_connections);

        Ok(Self {
            url: url.to_string(),
            dialect,
            pool,
            config,
            echo,
            stats: Arc::new(EngineStats::default()),
            created_at: Instant::now(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// The URL with any password masked, for logs and debugging.
    pub fn display_url(&self) -> String {
        redact(&self.url)
    }

    pub fn dialect(&self) -> SqlDialect {
        self.dialect
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn echo(&self) -> bool {
        self.echo
    }

    /// Number of transactions begun and how many of those failed.
    pub fn acquire_stats(&self) -> (u64, u64) {
        (
            self.stats.acquire_count.load(Ordering::Relaxed),
            self.stats.acquire_errors.load(Ordering::Relaxed),
        )
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Begin a transaction on a fresh pooled connection.
    pub async fn begin(&self) -> Result<Transaction<'static, Any>, PoolError> {
        if self.pool.is_closed() {
            return Err(PoolError::PoolClosed);
        }

        self.stats.acquire_count.fetch_add(1, Ordering::Relaxed);

        match self.pool.begin().await {
            Ok(tx) => {
                tracing::debug!("Transaction started on {}", self.display_url());
                Ok(tx)
            }
            Err(e) => {
                self.stats.acquire_errors.fetch_add(1, Ordering::Relaxed);
                let pool_error = self.classify_error(e);
                tracing::error!("Failed to begin transaction: {}", pool_error);
                Err(pool_error)
            }
        }
    }

    fn classify_error(&self, error: sqlx::Error) -> PoolError {
        match &error {
            sqlx::Error::PoolTimedOut => PoolError::ConnectionTimeout {
                timeout: self.config.acquire_timeout,
            },
            sqlx::Error::PoolClosed => PoolError::PoolClosed,
            _ => PoolError::AcquisitionFailed(error),
        }
    }

    /// Run `SELECT 1` on a pooled connection and report how long it took.
    pub async fn health_check(&self) -> Result<Duration, PoolError> {
        if self.pool.is_closed() {
            return Err(PoolError::PoolClosed);
        }

        let start = Instant::now();
        let _: Option<AnyRow> = sqlx::query("SELECT 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| PoolError::HealthCheckFailed {
                reason: format!("Health check query failed: {}", e),
            })?;

        let duration = start.elapsed();
        tracing::debug!("Database health check passed in {:?}", duration);
        Ok(duration)
    }

    /// Log a statement about to run. Echoing engines log at info level.
    pub(crate) fn log_statement(&self, sql: &str, params: &[DatabaseValue]) {
        if self.echo {
            tracing::info!(target: "elif_declarative::engine", "{} {:?}", sql, params);
        } else {
            tracing::debug!(target: "elif_declarative::engine", "{} {:?}", sql, params);
        }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn redact(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(mut parsed) if parsed.password().is_some() => {
            let _ = parsed.set_password(Some("***"));
            parsed.to_string()
        }
        _ => url.to_string(),
    }
}

/// The default engine plus one engine per bind key.
#[derive(Debug, Clone, Default)]
pub struct Engines {
    default: Option<Engine>,
    binds: BTreeMap<String, Engine>,
}

impl Engines {
    pub fn from_config(config: &ManagerConfig) -> ModelResult<Self> {
        config.validate()?;

        let default = config
            .database_uri
            .as_deref()
            .map(|uri| Engine::connect_lazy(uri, PoolConfig::for_url(uri, config), config.echo))
            .transpose()?;

        let mut binds = BTreeMap::new();
        for (key, uri) in &config.binds {
            let engine = Engine::connect_lazy(uri, PoolConfig::for_url(uri, config), config.echo)?;
            binds.insert(key.clone(), engine);
        }

        Ok(Self { default, binds })
    }

    /// Engine for a bind key, `None` being the default engine.
    pub fn get(&self, bind: Option<&str>) -> ModelResult<&Engine> {
        match bind {
            Some(key) => self
                .binds
                .get(key)
                .ok_or_else(|| ModelError::UnboundBindKey(key.to_string())),
            None => self.default.as_ref().ok_or(ModelError::UnboundExecution),
        }
    }

    pub fn default_engine(&self) -> Option<&Engine> {
        self.default.as_ref()
    }

    pub fn binds(&self) -> &BTreeMap<String, Engine> {
        &self.binds
    }

    /// Every configured bind, the default first.
    pub fn keys(&self) -> Vec<Option<String>> {
        self.default
            .iter()
            .map(|_| None)
            .chain(self.binds.keys().map(|key| Some(key.clone())))
            .collect()
    }

    pub async fn close(&self) {
        if let Some(engine) = &self.default {
            engine.close().await;
        }
        for engine in self.binds.values() {
            engine.close().await;
        }
    }
}
