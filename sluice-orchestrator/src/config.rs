//! Orchestrator configuration
//!
//! Defines all configurable parameters for the orchestrator including
//! the bind address, store backend selection, shard layout and retry
//! behavior.

use std::time::Duration;

/// Orchestrator configuration
///
/// Every field has a default so a bare process comes up in local mode;
/// production deployments override through environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP API listens on
    pub bind_addr: String,

    /// Postgres connection string; unset selects the in-memory store
    pub database_url: Option<String>,

    /// Number of shards pipeline and job keys hash into
    pub shard_count: u64,

    /// Prefix for worker replica-group names, isolating multiple
    /// orchestrators sharing one cluster
    pub group_prefix: String,

    /// First delay of the controller retry backoff
    pub retry_initial: Duration,

    /// Upper bound the retry backoff doubles towards
    pub retry_max: Duration,

    /// Capacity of the datum queues between controllers and workers
    pub queue_capacity: usize,
}

impl Config {
    /// Creates configuration from environment variables
    ///
    /// Expected environment variables (all optional):
    /// - ORCHESTRATOR_BIND_ADDR (default: 0.0.0.0:8080)
    /// - DATABASE_URL (default: unset, in-memory store)
    /// - SHARD_COUNT (default: 16)
    /// - GROUP_PREFIX (default: sluice)
    /// - RETRY_INITIAL_MS (default: 500)
    /// - RETRY_MAX_MS (default: 30000)
    /// - QUEUE_CAPACITY (default: 64)
    pub fn from_env() -> anyhow::Result<Self> {
        let bind_addr =
            std::env::var("ORCHESTRATOR_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        let database_url = std::env::var("DATABASE_URL").ok();

        let shard_count = std::env::var("SHARD_COUNT")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(16);

        let group_prefix =
            std::env::var("GROUP_PREFIX").unwrap_or_else(|_| "sluice".to_string());

        let retry_initial = std::env::var("RETRY_INITIAL_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_millis(500));

        let retry_max = std::env::var("RETRY_MAX_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_millis(30_000));

        let queue_capacity = std::env::var("QUEUE_CAPACITY")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(64);

        let config = Self {
            bind_addr,
            database_url,
            shard_count,
            group_prefix,
            retry_initial,
            retry_max,
            queue_capacity,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bind_addr.is_empty() {
            anyhow::bail!("bind_addr cannot be empty");
        }

        if self.shard_count == 0 {
            anyhow::bail!("shard_count must be greater than 0");
        }

        if self.group_prefix.is_empty() {
            anyhow::bail!("group_prefix cannot be empty");
        }

        if self.retry_initial.is_zero() {
            anyhow::bail!("retry_initial must be greater than 0");
        }

        if self.retry_initial > self.retry_max {
            anyhow::bail!("retry_initial cannot exceed retry_max");
        }

        if self.queue_capacity == 0 {
            anyhow::bail!("queue_capacity must be greater than 0");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            database_url: None,
            shard_count: 16,
            group_prefix: "sluice".to_string(),
            retry_initial: Duration::from_millis(500),
            retry_max: Duration::from_millis(30_000),
            queue_capacity: 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.shard_count, 16);
        assert_eq!(config.retry_initial, Duration::from_millis(500));
        assert!(config.database_url.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.shard_count = 0;
        assert!(config.validate().is_err());
        config.shard_count = 4;

        config.retry_initial = Duration::from_secs(60);
        assert!(config.validate().is_err());
        config.retry_initial = Duration::from_millis(500);

        config.queue_capacity = 0;
        assert!(config.validate().is_err());
    }
}
