//! Configuration management for the Marketsync service

use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::sync::SyncSettings;
use crate::transport::RetryPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    /// Attempts for a batch that hits a transient store error
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Path to the provider/entity/client catalog
    pub catalog: PathBuf,
    pub max_concurrent_units: usize,
    pub unit_retries: u32,
    pub unit_retry_delay_ms: u64,
    pub batch_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3000,
            },
            database: DatabaseConfig {
                url: "sqlite:./marketsync.db".to_string(),
                max_attempts: 3,
                backoff_ms: 500,
            },
            sync: SyncConfig {
                catalog: PathBuf::from("./catalog.json"),
                max_concurrent_units: 4,
                unit_retries: 2,
                unit_retry_delay_ms: 5000,
                batch_size: 500,
            },
        }
    }
}

fn var_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self, env::VarError> {
        let defaults = Config::default();
        Ok(Config {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or(defaults.server.host),
                port: var_or("SERVER_PORT", defaults.server.port),
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").unwrap_or(defaults.database.url),
                max_attempts: var_or("STORE_MAX_ATTEMPTS", defaults.database.max_attempts).max(1),
                backoff_ms: var_or("STORE_BACKOFF_MS", defaults.database.backoff_ms),
            },
            sync: SyncConfig {
                catalog: env::var("SYNC_CATALOG")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.sync.catalog),
                max_concurrent_units: var_or(
                    "SYNC_MAX_CONCURRENT_UNITS",
                    defaults.sync.max_concurrent_units,
                )
                .max(1),
                unit_retries: var_or("SYNC_UNIT_RETRIES", defaults.sync.unit_retries),
                unit_retry_delay_ms: var_or(
                    "SYNC_UNIT_RETRY_DELAY_MS",
                    defaults.sync.unit_retry_delay_ms,
                ),
                batch_size: var_or("SYNC_BATCH_SIZE", defaults.sync.batch_size).max(1),
            },
        })
    }

    /// Retry policy of the persistence gateway
    pub fn store_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.database.max_attempts,
            Duration::from_millis(self.database.backoff_ms),
        )
    }

    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            max_concurrent_units: self.sync.max_concurrent_units,
            unit_retries: self.sync.unit_retries,
            unit_retry_delay: Duration::from_millis(self.sync.unit_retry_delay_ms),
            batch_size: self.sync.batch_size,
        }
    }
}
