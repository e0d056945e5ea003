use crate::config::{env_lookup, env_u64_from, env_usize_from};
use crate::error::{ImportError, ImportResult};
use std::time::Duration;

const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// Connection settings for [`PgStore`](super::PgStore).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgConfig {
    pub database_url: String,
    pub max_connections: u32,
    /// Applied with `SET LOCAL lock_timeout` at the start of every transaction.
    pub lock_timeout: Option<Duration>,
}

impl PgConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            lock_timeout: None,
        }
    }

    pub fn max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    /// Read `DATABASE_URL`, `BATCH_IMPORT_PG_MAX_CONNECTIONS` and
    /// `BATCH_IMPORT_PG_LOCK_TIMEOUT_MS`.
    pub fn from_env() -> ImportResult<Self> {
        Self::from_vars(&env_lookup)
    }

    pub fn from_vars(lookup: &dyn Fn(&str) -> Option<String>) -> ImportResult<Self> {
        let database_url = lookup("DATABASE_URL")
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| ImportError::config("DATABASE_URL must be set"))?;

        let max_connections = env_usize_from(lookup, "BATCH_IMPORT_PG_MAX_CONNECTIONS")
            .and_then(|n| u32::try_from(n).ok())
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_MAX_CONNECTIONS);

        let lock_timeout = env_u64_from(lookup, "BATCH_IMPORT_PG_LOCK_TIMEOUT_MS")
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis);

        Ok(Self {
            database_url,
            max_connections,
            lock_timeout,
        })
    }
}
