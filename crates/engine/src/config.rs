use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::store::{DatabaseConfig, DatabaseType};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    /// Tenants with a dedicated database, keyed by tenant id.
    #[serde(default)]
    pub tenant_databases: HashMap<String, String>,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub notifications: NotificationServiceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Tick of the pending and delayed sweeps.
    pub poll_interval: Duration,
    /// Tick of the cron schedule sweep.
    pub schedule_interval: Duration,
    pub sweep_batch_size: i64,
    /// How long a pending/running execution may sit untouched before the
    /// pending sweep resubmits it.
    pub stale_after: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub step_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            schedule_interval: Duration::from_secs(60),
            sweep_batch_size: 50,
            stale_after: Duration::from_secs(300),
            max_retries: 3,
            retry_base_delay: Duration::from_secs(30),
            retry_max_delay: Duration::from_secs(15 * 60),
            step_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub workers: usize,
    pub queue_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            queue_capacity: 1000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationServiceConfig {
    /// Base URL of the notification service. Unset means notifications are
    /// only logged.
    pub service_url: Option<String>,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    Duration::from_secs(env_or(key, default.as_secs()))
}

/// Parses `tenant=url,tenant=url`.
fn parse_tenant_urls(raw: &str) -> crate::Result<HashMap<String, String>> {
    let mut tenants = HashMap::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (tenant, url) = entry.split_once('=').ok_or_else(|| {
            crate::Error::Config(format!(
                "TENANT_DATABASE_URLS entry '{}' must look like tenant=url",
                entry
            ))
        })?;
        tenants.insert(tenant.trim().to_string(), url.trim().to_string());
    }
    Ok(tenants)
}

impl Config {
    pub fn load() -> crate::Result<Self> {
        // Load environment variables from .env file if it exists
        let _ = dotenvy::dotenv();

        let defaults = EngineConfig::default();
        let pool_defaults = PoolConfig::default();

        let db_type = std::env::var("DATABASE_TYPE")
            .unwrap_or_else(|_| "sqlite".to_string())
            .parse::<DatabaseType>()?;

        let config = Config {
            server: ServerConfig {
                addr: std::env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            },
            database: DatabaseConfig {
                db_type,
                sqlite_path: std::env::var("SQLITE_PATH")
                    .map(PathBuf::from)
                    .ok()
                    .or_else(|| Some(PathBuf::from("data/notiflow.db"))),
                connection_string: std::env::var("DATABASE_URL").ok(),
                max_connections: env_or("DATABASE_MAX_CONNECTIONS", 5),
            },
            tenant_databases: match std::env::var("TENANT_DATABASE_URLS") {
                Ok(raw) => parse_tenant_urls(&raw)?,
                Err(_) => HashMap::new(),
            },
            engine: EngineConfig {
                poll_interval: env_secs("ENGINE_POLL_INTERVAL_SECS", defaults.poll_interval),
                schedule_interval: env_secs("ENGINE_SCHEDULE_INTERVAL_SECS", defaults.schedule_interval),
                sweep_batch_size: env_or("ENGINE_SWEEP_BATCH_SIZE", defaults.sweep_batch_size),
                stale_after: env_secs("ENGINE_STALE_AFTER_SECS", defaults.stale_after),
                max_retries: env_or("ENGINE_MAX_RETRIES", defaults.max_retries),
                retry_base_delay: env_secs("ENGINE_RETRY_BASE_DELAY_SECS", defaults.retry_base_delay),
                retry_max_delay: env_secs("ENGINE_RETRY_MAX_DELAY_SECS", defaults.retry_max_delay),
                step_timeout: env_secs("ENGINE_STEP_TIMEOUT_SECS", defaults.step_timeout),
            },
            pool: PoolConfig {
                workers: env_or("WORKER_POOL_WORKERS", pool_defaults.workers),
                queue_capacity: env_or("WORKER_POOL_QUEUE_CAPACITY", pool_defaults.queue_capacity),
            },
            notifications: NotificationServiceConfig {
                service_url: std::env::var("NOTIFICATION_SERVICE_URL").ok(),
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::Result<()> {
        match self.database.db_type {
            DatabaseType::Postgres if self.database.connection_string.is_none() => {
                return Err(crate::Error::Config(
                    "DATABASE_URL must be set when using PostgreSQL".to_string(),
                ));
            }
            DatabaseType::Sqlite if self.database.sqlite_path.is_none() => {
                return Err(crate::Error::Config(
                    "SQLITE_PATH must be set when using SQLite".to_string(),
                ));
            }
            _ => {}
        }
        self.database.validate().map_err(crate::Error::Config)?;

        if self.engine.poll_interval.is_zero() {
            return Err(crate::Error::Config("ENGINE_POLL_INTERVAL_SECS must be positive".into()));
        }
        if self.engine.retry_base_delay > self.engine.retry_max_delay {
            return Err(crate::Error::Config(
                "ENGINE_RETRY_BASE_DELAY_SECS must not exceed ENGINE_RETRY_MAX_DELAY_SECS".into(),
            ));
        }
        if let Some(url) = &self.notifications.service_url {
            url::Url::parse(url).map_err(|e| {
                crate::Error::Config(format!("NOTIFICATION_SERVICE_URL is invalid: {}", e))
            })?;
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                addr: "0.0.0.0:8080".to_string(),
            },
            database: DatabaseConfig::default(),
            tenant_databases: HashMap::new(),
            engine: EngineConfig::default(),
            pool: PoolConfig::default(),
            notifications: NotificationServiceConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tenant_urls() {
        let tenants = parse_tenant_urls("acme=postgres://db/acme, globex=sqlite:data/globex.db").unwrap();
        assert_eq!(tenants.len(), 2);
        assert_eq!(tenants["acme"], "postgres://db/acme");
        assert_eq!(tenants["globex"], "sqlite:data/globex.db");

        assert!(parse_tenant_urls("broken").is_err());
        assert!(parse_tenant_urls("").unwrap().is_empty());
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.engine.max_retries, 3);
        assert_eq!(config.engine.sweep_batch_size, 50);
    }

    #[test]
    fn test_validate_rejects_inverted_backoff() {
        let mut config = Config::default();
        config.engine.retry_base_delay = Duration::from_secs(600);
        config.engine.retry_max_delay = Duration::from_secs(60);
        assert!(config.validate().is_err());
    }
}
