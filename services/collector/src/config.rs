//! Collector configuration.
//!
//! Everything is read from the environment. Durations are given in whole
//! seconds or milliseconds as the variable name says.

use std::{net::SocketAddr, str::FromStr, time::Duration};

use anyhow::{bail, Context, Result};

use crate::{db::DbConfig, sync::SyncConfig, workqueue::WorkQueueConfig};

/// Which persistence backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Postgres,
    Memory,
}

impl FromStr for StoreKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "memory" => Ok(Self::Memory),
            other => bail!("unknown store '{other}', expected 'postgres' or 'memory'"),
        }
    }
}

/// Collector configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Scheduler REST base URL (example: http://localhost:9080).
    pub scheduler_url: String,

    /// Address for the health and statistics listener.
    pub listen_addr: SocketAddr,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub store: StoreKind,

    /// Run database migrations on startup.
    pub dev_mode: bool,

    pub sync: SyncConfig,
    pub workqueue: WorkQueueConfig,
    pub database: DbConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let scheduler_url = std::env::var("YHS_SCHEDULER_URL")
            .unwrap_or_else(|_| "http://localhost:9080".to_string());

        let listen_addr = std::env::var("YHS_LISTEN_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8989".to_string())
            .parse()
            .context("YHS_LISTEN_ADDR must be a socket address.")?;

        let log_level = std::env::var("YHS_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let store = std::env::var("YHS_STORE")
            .ok()
            .map(|v| v.parse())
            .transpose()?
            .unwrap_or(StoreKind::Postgres);

        let dev_mode = std::env::var("YHS_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let defaults = SyncConfig::default();
        let sync = SyncConfig {
            sync_interval: env_duration("YHS_SYNC_INTERVAL_SECS", Duration::from_secs)?
                .unwrap_or(defaults.sync_interval)
                .max(Duration::from_secs(1)),
            reconnect_delay: env_duration("YHS_RECONNECT_DELAY_MS", Duration::from_millis)?
                .unwrap_or(defaults.reconnect_delay),
            accumulator_idle: env_duration("YHS_ACCUMULATOR_IDLE_MS", Duration::from_millis)?
                .unwrap_or(defaults.accumulator_idle),
        };

        let defaults = WorkQueueConfig::default();
        let workqueue = WorkQueueConfig {
            initial_delay: env_duration("YHS_WORKQUEUE_INITIAL_DELAY_MS", Duration::from_millis)?
                .unwrap_or(defaults.initial_delay),
            grace_period: env_duration("YHS_WORKQUEUE_GRACE_PERIOD_MS", Duration::from_millis)?
                .unwrap_or(defaults.grace_period),
            max_concurrency: env_number("YHS_WORKQUEUE_MAX_CONCURRENCY")?
                .unwrap_or(defaults.max_concurrency)
                .max(1),
            max_pending: env_number("YHS_WORKQUEUE_MAX_PENDING")?
                .unwrap_or(defaults.max_pending)
                .max(1),
            ..defaults
        };

        let database = DbConfig::from_env();

        Ok(Self {
            scheduler_url,
            listen_addr,
            log_level,
            store,
            dev_mode,
            sync,
            workqueue,
            database,
        })
    }
}

fn env_number<T: FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    std::env::var(name)
        .ok()
        .map(|v| v.parse::<T>())
        .transpose()
        .with_context(|| format!("{name} must be a non-negative integer."))
}

fn env_duration(name: &str, unit: fn(u64) -> Duration) -> Result<Option<Duration>> {
    Ok(env_number::<u64>(name)?.map(unit))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("postgres", StoreKind::Postgres)]
    #[case("PostgreSQL", StoreKind::Postgres)]
    #[case("memory", StoreKind::Memory)]
    fn test_store_kind_parses(#[case] input: &str, #[case] expected: StoreKind) {
        assert_eq!(input.parse::<StoreKind>().unwrap(), expected);
    }

    #[test]
    fn test_store_kind_rejects_unknown() {
        assert!("sqlite".parse::<StoreKind>().is_err());
    }
}
