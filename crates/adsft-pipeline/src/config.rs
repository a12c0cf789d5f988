//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::classifier::PathNormalizer;
use crate::store::MetadataStore;
use crate::topology::EXCHANGE;
use crate::worker::{RetryConfig, WorkerConfig};

// ============================================================================
// Pipeline Configuration Constants
// ============================================================================

/// Default root that source paths are relative to.
pub const DEFAULT_FULLTEXT_ROOT: &str = ".";

/// Default root of the extraction metadata store.
pub const DEFAULT_EXTRACT_PATH: &str = "./live";

/// Default connection attempts before a worker gives up.
pub const DEFAULT_CONNECT_MAX_ATTEMPTS: u32 = 5;

/// Default wait after the first failed connection attempt.
pub const DEFAULT_CONNECT_BACKOFF_MS: u64 = 200;

/// Default cap on the wait between connection attempts.
pub const DEFAULT_CONNECT_MAX_BACKOFF_MS: u64 = 5000;

/// Default wait between polls of an empty queue.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

/// Default number of workers per stage.
pub const DEFAULT_WORKERS_PER_STAGE: usize = 1;

/// Default number of records per ingress message.
pub const DEFAULT_PUBLISH_BATCH_SIZE: usize = 100;

/// Pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub fulltext_root: PathBuf,
    pub extract_path: PathBuf,
    pub exchange: String,
    pub connect_max_attempts: u32,
    pub connect_backoff_ms: u64,
    pub connect_max_backoff_ms: u64,
    pub poll_interval_ms: u64,
    pub workers_per_stage: usize,
    pub publish_batch_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fulltext_root: PathBuf::from(DEFAULT_FULLTEXT_ROOT),
            extract_path: PathBuf::from(DEFAULT_EXTRACT_PATH),
            exchange: EXCHANGE.to_string(),
            connect_max_attempts: DEFAULT_CONNECT_MAX_ATTEMPTS,
            connect_backoff_ms: DEFAULT_CONNECT_BACKOFF_MS,
            connect_max_backoff_ms: DEFAULT_CONNECT_MAX_BACKOFF_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            workers_per_stage: DEFAULT_WORKERS_PER_STAGE,
            publish_batch_size: DEFAULT_PUBLISH_BATCH_SIZE,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from `.env`, environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self::from_env();
        config.validate()?;

        Ok(config)
    }

    /// Read configuration from environment variables only, without validation
    pub fn from_env() -> Self {
        Self {
            fulltext_root: std::env::var("ADSFT_FULLTEXT_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_FULLTEXT_ROOT)),
            extract_path: std::env::var("ADSFT_EXTRACT_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_EXTRACT_PATH)),
            exchange: std::env::var("ADSFT_EXCHANGE").unwrap_or_else(|_| EXCHANGE.to_string()),
            connect_max_attempts: env_or("ADSFT_CONNECT_MAX_ATTEMPTS", DEFAULT_CONNECT_MAX_ATTEMPTS),
            connect_backoff_ms: env_or("ADSFT_CONNECT_BACKOFF_MS", DEFAULT_CONNECT_BACKOFF_MS),
            connect_max_backoff_ms: env_or(
                "ADSFT_CONNECT_MAX_BACKOFF_MS",
                DEFAULT_CONNECT_MAX_BACKOFF_MS,
            ),
            poll_interval_ms: env_or("ADSFT_POLL_INTERVAL_MS", DEFAULT_POLL_INTERVAL_MS),
            workers_per_stage: env_or("ADSFT_WORKERS_PER_STAGE", DEFAULT_WORKERS_PER_STAGE),
            publish_batch_size: env_or("ADSFT_PUBLISH_BATCH_SIZE", DEFAULT_PUBLISH_BATCH_SIZE),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.exchange.trim().is_empty() {
            anyhow::bail!("Exchange name cannot be empty");
        }

        if self.connect_max_attempts == 0 {
            anyhow::bail!("Connection max attempts must be greater than 0");
        }

        if self.connect_max_backoff_ms < self.connect_backoff_ms {
            anyhow::bail!(
                "Connection max backoff ({}ms) cannot be less than the initial backoff ({}ms)",
                self.connect_max_backoff_ms,
                self.connect_backoff_ms
            );
        }

        if self.workers_per_stage == 0 {
            anyhow::bail!("Workers per stage must be greater than 0");
        }

        if self.publish_batch_size == 0 {
            anyhow::bail!("Publish batch size must be greater than 0");
        }

        Ok(())
    }

    pub fn retry(&self) -> RetryConfig {
        RetryConfig::new()
            .with_max_attempts(self.connect_max_attempts)
            .with_initial_backoff_ms(self.connect_backoff_ms)
            .with_max_backoff_ms(self.connect_max_backoff_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Worker settings for a stage consuming `queue`
    pub fn worker_config(&self, stage: &str, queue: &str) -> WorkerConfig {
        WorkerConfig::new(stage, queue)
            .with_exchange(&self.exchange)
            .with_retry(self.retry())
            .with_poll_interval(self.poll_interval())
    }

    pub fn store(&self) -> MetadataStore {
        MetadataStore::new(&self.extract_path)
    }

    pub fn normalizer(&self) -> PathNormalizer {
        PathNormalizer::new(&self.fulltext_root)
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "ADSFT_FULLTEXT_ROOT",
        "ADSFT_EXTRACT_PATH",
        "ADSFT_EXCHANGE",
        "ADSFT_CONNECT_MAX_ATTEMPTS",
        "ADSFT_WORKERS_PER_STAGE",
    ];

    fn clear_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear_env();
        let config = PipelineConfig::from_env();

        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.exchange, "FulltextExtractionExchange");
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear_env();
        std::env::set_var("ADSFT_FULLTEXT_ROOT", "/proj/ads/fulltext");
        std::env::set_var("ADSFT_CONNECT_MAX_ATTEMPTS", "9");
        std::env::set_var("ADSFT_WORKERS_PER_STAGE", "not-a-number");

        let config = PipelineConfig::from_env();
        clear_env();

        assert_eq!(config.fulltext_root, PathBuf::from("/proj/ads/fulltext"));
        assert_eq!(config.connect_max_attempts, 9);
        assert_eq!(config.workers_per_stage, DEFAULT_WORKERS_PER_STAGE);
        assert_eq!(config.retry().max_attempts, 9);
    }

    #[test]
    fn test_validation() {
        let mut config = PipelineConfig::default();
        config.connect_max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.connect_max_backoff_ms = 10;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.exchange = " ".to_string();
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.workers_per_stage = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_worker_config() {
        let config = PipelineConfig {
            poll_interval_ms: 5,
            ..Default::default()
        };
        let worker = config.worker_config("check", "CheckIfExtractQueue");

        assert_eq!(worker.queue, "CheckIfExtractQueue");
        assert_eq!(worker.exchange, "FulltextExtractionExchange");
        assert_eq!(worker.poll_interval, Duration::from_millis(5));
        assert!(!worker.exit_when_idle);
    }
}
