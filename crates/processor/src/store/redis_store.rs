//! Redis counter mirror
//!
//! Each sealed aggregate increments an hourly bucket hash
//! `{prefix}revenue:{partition_key}:{YYYY-MM-DD}:{HH}` and the global totals
//! hash `{prefix}global`. Buckets expire after the configured TTL; the global
//! hash does not.
//!
//! The increments are not idempotent. With `dedup_applies` an apply marker
//! keyed by the aggregate fingerprint is claimed first, so re-applying the
//! exact same sealed aggregate is a no-op. A replay that produces a different
//! aggregate for the same window still double counts.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, RedisError, Script};
use retail_analytics_types::SealedAggregate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use super::{converted, ApplyOutcome, CounterStore};
use crate::error::{ProcessorError, Result};
use crate::retry::RetryPolicy;

const BACKEND: &str = "redis";

/// Claims the marker (when enabled) and applies every increment atomically.
///
/// KEYS: marker, bucket, global
/// ARGV: dedup flag, ttl secs, orders, revenue, converted revenue, customers
const APPLY_SCRIPT: &str = r"
if ARGV[1] == '1' then
    if not redis.call('SET', KEYS[1], '1', 'NX', 'EX', ARGV[2]) then
        return 0
    end
end
redis.call('HINCRBY', KEYS[2], 'order_count', ARGV[3])
redis.call('HINCRBYFLOAT', KEYS[2], 'revenue', ARGV[4])
redis.call('HINCRBYFLOAT', KEYS[2], 'revenue_converted', ARGV[5])
redis.call('HINCRBY', KEYS[2], 'customers', ARGV[6])
redis.call('EXPIRE', KEYS[2], ARGV[2])
redis.call('HINCRBY', KEYS[3], 'total_orders', ARGV[3])
redis.call('HINCRBYFLOAT', KEYS[3], 'total_revenue', ARGV[4])
return 1
";

/// Redis connection and key layout settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisCounterConfig {
    pub url: String,
    pub key_prefix: String,
    /// Expiry of bucket hashes and apply markers
    pub ttl: Duration,
    /// Skip re-application of an identical sealed aggregate
    pub dedup_applies: bool,
    pub conversion_rate: Decimal,
}

impl Default for RedisCounterConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            key_prefix: "retail:".to_string(),
            ttl: Duration::from_secs(7 * 24 * 3600),
            dedup_applies: true,
            conversion_rate: Decimal::new(127, 2),
        }
    }
}

impl RedisCounterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.ttl.as_secs() == 0 {
            return Err(ProcessorError::config("counter ttl must be at least one second"));
        }
        if self.conversion_rate <= Decimal::ZERO {
            return Err(ProcessorError::config("conversion_rate must be positive"));
        }
        Ok(())
    }

    /// Hourly bucket of a window start
    pub fn bucket_key(&self, aggregate: &SealedAggregate) -> String {
        format!(
            "{}revenue:{}:{}",
            self.key_prefix,
            aggregate.partition_key,
            aggregate.window_start.format("%Y-%m-%d:%H")
        )
    }

    pub fn global_key(&self) -> String {
        format!("{}global", self.key_prefix)
    }

    pub fn marker_key(&self, aggregate: &SealedAggregate) -> String {
        format!("{}applied:{}", self.key_prefix, aggregate.fingerprint())
    }
}

/// Counter mirror on Redis
pub struct RedisCounterStore {
    connection: ConnectionManager,
    config: RedisCounterConfig,
    script: Script,
}

impl RedisCounterStore {
    /// Connect, retrying while the server is unreachable
    pub async fn connect(config: RedisCounterConfig, retry: &RetryPolicy) -> Result<Self> {
        config.validate()?;
        let client = Client::open(config.url.as_str())
            .map_err(|e| ProcessorError::config(format!("invalid redis URL: {e}")))?;

        let connection = retry
            .run("redis.connect", || {
                let client = client.clone();
                async move { ConnectionManager::new(client).await.map_err(classify) }
            })
            .await
            .map_err(|err| err.into_connectivity(BACKEND, retry.max_attempts))?;

        info!(prefix = %config.key_prefix, "connected to counter store");
        Ok(Self {
            connection,
            config,
            script: Script::new(APPLY_SCRIPT),
        })
    }

    pub fn config(&self) -> &RedisCounterConfig {
        &self.config
    }

    pub async fn health_check(&self) -> Result<bool> {
        let mut conn = self.connection.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(classify)?;
        Ok(pong == "PONG")
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn apply(&self, aggregate: &SealedAggregate) -> Result<ApplyOutcome> {
        let mut conn = self.connection.clone();
        let revenue_converted = converted(aggregate.revenue_total, self.config.conversion_rate);

        let applied: i32 = self
            .script
            .key(self.config.marker_key(aggregate))
            .key(self.config.bucket_key(aggregate))
            .key(self.config.global_key())
            .arg(if self.config.dedup_applies { "1" } else { "0" })
            .arg(self.config.ttl.as_secs())
            .arg(aggregate.order_count)
            .arg(aggregate.revenue_total.to_string())
            .arg(revenue_converted.to_string())
            .arg(aggregate.distinct_customers)
            .invoke_async(&mut conn)
            .await
            .map_err(classify)?;

        let outcome = if applied == 1 {
            ApplyOutcome::Applied
        } else {
            ApplyOutcome::Duplicate
        };
        debug!(
            partition_key = %aggregate.partition_key,
            window_start = %aggregate.window_start,
            ?outcome,
            "counters applied"
        );
        Ok(outcome)
    }

    fn name(&self) -> &'static str {
        BACKEND
    }
}

fn classify(err: RedisError) -> ProcessorError {
    if err.is_io_error() || err.is_timeout() || err.is_connection_dropped() || err.is_connection_refusal() {
        ProcessorError::transient(BACKEND, err)
    } else {
        ProcessorError::Storage {
            backend: BACKEND,
            details: err.to_string(),
        }
    }
}
