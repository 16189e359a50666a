//! Explicit session configuration.
//!
//! Nothing is read from the process environment implicitly: callers build a
//! [`SessionConfig`] (directly, through [`Default`], or with
//! [`SessionConfig::load`]) and hand it to [`crate::session::Session::start`].

use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

use crate::Result;
use crate::predicate::Dialect;

pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Inactivity after which an open transaction is rolled back.
    pub timeout_ms: u64,
    /// Record per-call timing samples.
    pub timing: bool,
    pub dialect: Dialect,
    /// Location of the SQLite database used by the bundled persistor.
    pub database: String,
    pub log_filter: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            timing: false,
            dialect: Dialect::Postgres,
            database: ":memory:".to_string(),
            log_filter: "info".to_string(),
        }
    }
}

impl SessionConfig {
    /// Layers built-in defaults, an optional config file and `DOCSTORE_*`
    /// environment variables, in that order.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let defaults = Self::default();
        let mut builder = Config::builder()
            .set_default("timeout_ms", defaults.timeout_ms)?
            .set_default("timing", defaults.timing)?
            .set_default("dialect", "postgres")?
            .set_default("database", defaults.database)?
            .set_default("log_filter", defaults.log_filter)?;
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).required(false));
        }
        let settings = builder
            .add_source(Environment::with_prefix("DOCSTORE"))
            .build()?;
        Ok(settings.try_deserialize::<SessionConfig>()?)
    }
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }
    pub fn with_timing(mut self, timing: bool) -> Self {
        self.timing = timing;
        self
    }
    pub fn with_dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }
    /// Installs a fmt subscriber filtered by `log_filter`. Returns false when a
    /// global subscriber was already set.
    pub fn init_tracing(&self) -> bool {
        let filter = EnvFilter::try_new(&self.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .try_init()
            .is_ok()
    }
}
