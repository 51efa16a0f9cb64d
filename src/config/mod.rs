/// Configuration management for the stepwright scheduler
///
/// Handles the database connection, the worker pool and the step lease
/// parameters. Every value has a default and can be overridden with a
/// `STEPWRIGHT_*` environment variable.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Database configuration
    pub database: DatabaseConfig,
    /// Worker pool configuration
    pub worker: WorkerConfig,
    /// Heartbeat and stale-claim reclamation
    pub lease: LeaseConfig,
}

/// SQLite database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Connection URL (default: "sqlite://data/stepwright.db")
    pub url: String,
    /// Pool size shared by all workers
    pub max_connections: u32,
}

/// Claim-based worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of concurrent workers
    pub workers: usize,
    /// First sleep after an empty poll
    pub poll_interval_ms: u64,
    /// Upper bound of the doubling backoff
    pub max_poll_backoff_ms: u64,
}

/// Step lease configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    pub heartbeat_interval_ms: u64,
    /// RUNNING steps without a heartbeat for this long go back to READY
    pub lease_timeout_ms: u64,
    pub sweep_interval_ms: u64,
}

/// Shortest period handed to a timer; tokio intervals reject zero
pub const MIN_PERIOD: Duration = Duration::from_millis(1);

fn period(ms: u64) -> Duration {
    Duration::from_millis(ms).max(MIN_PERIOD)
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        period(self.poll_interval_ms)
    }

    pub fn max_poll_backoff(&self) -> Duration {
        period(self.max_poll_backoff_ms)
    }
}

impl LeaseConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        period(self.heartbeat_interval_ms)
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_millis(self.lease_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        period(self.sweep_interval_ms)
    }
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for k8s/container deployment
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: std::env::var("STEPWRIGHT_DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite://data/stepwright.db".to_string()),
                max_connections: env_or("STEPWRIGHT_DB_MAX_CONNECTIONS", 5),
            },
            worker: WorkerConfig {
                workers: env_or("STEPWRIGHT_WORKERS", 4),
                poll_interval_ms: env_or("STEPWRIGHT_POLL_INTERVAL_MS", 200),
                max_poll_backoff_ms: env_or("STEPWRIGHT_MAX_POLL_BACKOFF_MS", 5000),
            },
            lease: LeaseConfig {
                heartbeat_interval_ms: env_or("STEPWRIGHT_HEARTBEAT_INTERVAL_MS", 5000),
                lease_timeout_ms: env_or("STEPWRIGHT_LEASE_TIMEOUT_MS", 30000),
                sweep_interval_ms: env_or("STEPWRIGHT_SWEEP_INTERVAL_MS", 10000),
            },
        }
    }
}

/// Parse an env var, falling back to `default` when unset or malformed
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}
