//! Configuration types for the aggregation pipeline
//!
//! Component configs used by the coordinator. Broker and store adapters keep
//! their own configs next to their code ([`crate::broker::KafkaBrokerConfig`],
//! [`crate::store::PostgresStoreConfig`], [`crate::store::RedisCounterConfig`]).

use crate::error::{ProcessorError, Result};
use crate::retry::RetryPolicy;
use crate::window::TumblingWindowAssigner;
use retail_analytics_types::PartitionKey;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Windowing policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowingConfig {
    /// Tumbling window length
    pub window_length: Duration,

    /// How far the watermark trails the newest event time
    pub allowed_lateness: Duration,

    /// Wall-clock time without events after which a key's windows are flushed
    pub flush_interval: Duration,

    /// Grouping dimension
    pub partition_key: PartitionKey,
}

impl Default for WindowingConfig {
    fn default() -> Self {
        Self {
            window_length: Duration::from_secs(300),
            allowed_lateness: Duration::from_secs(30),
            flush_interval: Duration::from_secs(60),
            partition_key: PartitionKey::Country,
        }
    }
}

impl WindowingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.window_length < Duration::from_millis(1) {
            return Err(ProcessorError::Configuration {
                source: "window_length must be at least 1ms".into(),
            });
        }
        if self.flush_interval.is_zero() {
            return Err(ProcessorError::Configuration {
                source: "flush_interval must be greater than 0".into(),
            });
        }
        chrono::Duration::from_std(self.window_length)
            .and(chrono::Duration::from_std(self.allowed_lateness))
            .map_err(|e| ProcessorError::config(format!("window durations out of range: {e}")))?;
        Ok(())
    }

    pub fn assigner(&self) -> Result<TumblingWindowAssigner> {
        let length = chrono::Duration::from_std(self.window_length)
            .map_err(|e| ProcessorError::config(format!("window_length out of range: {e}")))?;
        Ok(TumblingWindowAssigner::new(length))
    }

    pub fn lateness(&self) -> Result<chrono::Duration> {
        chrono::Duration::from_std(self.allowed_lateness)
            .map_err(|e| ProcessorError::config(format!("allowed_lateness out of range: {e}")))
    }
}

/// Coordinator loop tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Topics to consume
    pub topics: Vec<String>,

    /// Consumer group joined on start
    pub group_id: String,

    /// Upper bound on records per poll
    pub max_batch_size: usize,

    /// Longest a single poll may block
    pub poll_timeout: Duration,

    /// Sleep after an empty poll
    pub idle_sleep: Duration,

    /// Budget for the final flush on shutdown
    pub shutdown_timeout: Duration,

    /// Failed flush cycles in a row tolerated before stopping
    pub max_consecutive_batch_failures: u32,

    /// Timeout for a single store call
    pub write_timeout: Duration,

    /// Retries around store calls
    pub store_retry: RetryPolicy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            topics: vec!["ecommerce_transactions".to_string()],
            group_id: "transaction-aggregator".to_string(),
            max_batch_size: 500,
            poll_timeout: Duration::from_secs(2),
            idle_sleep: Duration::from_millis(200),
            shutdown_timeout: Duration::from_secs(30),
            max_consecutive_batch_failures: 10,
            write_timeout: Duration::from_secs(5),
            store_retry: RetryPolicy::default(),
        }
    }
}

impl CoordinatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.topics.is_empty() || self.topics.iter().any(|t| t.trim().is_empty()) {
            return Err(ProcessorError::config("at least one non-empty topic is required"));
        }
        if self.group_id.trim().is_empty() {
            return Err(ProcessorError::config("group_id must not be empty"));
        }
        if self.max_batch_size == 0 {
            return Err(ProcessorError::config("max_batch_size must be greater than 0"));
        }
        if self.max_consecutive_batch_failures == 0 {
            return Err(ProcessorError::config(
                "max_consecutive_batch_failures must be at least 1",
            ));
        }
        if self.write_timeout.is_zero() {
            return Err(ProcessorError::config("write_timeout must be greater than 0"));
        }
        self.store_retry.validate()
    }
}
