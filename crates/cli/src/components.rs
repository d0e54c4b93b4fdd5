//! Maps the layered service configuration onto component configs

use processor::broker::KafkaBrokerConfig;
use processor::config::{CoordinatorConfig, WindowingConfig};
use processor::retry::RetryPolicy;
use processor::store::{PostgresStoreConfig, RedisCounterConfig};
use retail_analytics_config::{RetrySettings, ServiceConfig};
use std::collections::HashMap;
use std::time::Duration;

pub fn retry_policy(settings: &RetrySettings) -> RetryPolicy {
    RetryPolicy::new(
        settings.max_attempts,
        Duration::from_millis(settings.base_delay_ms),
        Duration::from_millis(settings.max_delay_ms),
    )
    .with_jitter(settings.jitter)
}

pub fn kafka_config(config: &ServiceConfig) -> KafkaBrokerConfig {
    let broker = &config.broker;
    KafkaBrokerConfig {
        brokers: broker.brokers.clone(),
        topic: broker.topic.clone(),
        group_id: broker.group_id.clone(),
        client_id: broker.client_id.clone(),
        auto_offset_reset: broker.auto_offset_reset.clone(),
        session_timeout_ms: broker.session_timeout_ms,
        delivery_timeout_ms: broker.delivery_timeout_ms,
        extra_config: HashMap::new(),
    }
}

pub fn windowing_config(config: &ServiceConfig) -> WindowingConfig {
    let window = &config.window;
    WindowingConfig {
        window_length: Duration::from_secs(window.length_secs),
        allowed_lateness: Duration::from_secs(window.allowed_lateness_secs),
        flush_interval: Duration::from_secs(window.flush_interval_secs),
        partition_key: window.partition_key,
    }
}

pub fn coordinator_config(config: &ServiceConfig) -> CoordinatorConfig {
    let coordinator = &config.coordinator;
    CoordinatorConfig {
        topics: vec![config.broker.topic.clone()],
        group_id: config.broker.group_id.clone(),
        max_batch_size: coordinator.max_batch_size,
        poll_timeout: Duration::from_millis(config.broker.poll_timeout_ms),
        idle_sleep: Duration::from_millis(coordinator.idle_sleep_ms),
        shutdown_timeout: Duration::from_secs(coordinator.shutdown_timeout_secs),
        max_consecutive_batch_failures: coordinator.max_consecutive_batch_failures,
        write_timeout: Duration::from_millis(coordinator.write_timeout_ms),
        store_retry: retry_policy(&config.retry),
    }
}

pub fn postgres_config(config: &ServiceConfig) -> PostgresStoreConfig {
    let store = &config.durable_store;
    PostgresStoreConfig {
        url: store.url.clone(),
        min_connections: 1,
        max_connections: store.max_connections,
        connect_timeout: Duration::from_secs(store.connect_timeout_secs),
        auto_migrate: store.auto_migrate,
        conversion_rate: config.reporting.conversion_rate,
    }
}

pub fn redis_config(config: &ServiceConfig) -> RedisCounterConfig {
    let counters = &config.counter_store;
    RedisCounterConfig {
        url: counters.url.clone(),
        key_prefix: counters.key_prefix.clone(),
        ttl: Duration::from_secs(counters.ttl_secs),
        dedup_applies: counters.dedup_applies,
        conversion_rate: config.reporting.conversion_rate,
    }
}
