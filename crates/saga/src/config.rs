//! Engine configuration loaded from environment variables.

use std::time::Duration;

/// Saga engine configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `SAGA_LOCK_TIMEOUT_MS`: how long a persist waits for the per-saga lock (default: `5000`)
/// - `DATABASE_URL`: PostgreSQL URL for the durable store (default: unset)
/// - `SAGA_DB_MAX_CONNECTIONS`: PostgreSQL pool size (default: `5`)
#[derive(Debug, Clone)]
pub struct SagaEngineConfig {
    pub lock_timeout: Duration,
    pub database_url: Option<String>,
    pub db_max_connections: u32,
}

impl SagaEngineConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            lock_timeout: lookup("SAGA_LOCK_TIMEOUT_MS")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.lock_timeout),
            database_url: lookup("DATABASE_URL").filter(|url| !url.is_empty()),
            db_max_connections: lookup("SAGA_DB_MAX_CONNECTIONS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.db_max_connections),
        }
    }

    /// Overrides the persistence lock timeout.
    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }
}

impl Default for SagaEngineConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_millis(5000),
            database_url: None,
            db_max_connections: 5,
        }
    }
}
