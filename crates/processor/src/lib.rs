//! Windowed transaction aggregation
//!
//! Consumes e-commerce transactions from a partitioned broker, folds them
//! into per-key tumbling windows, and writes every sealed window to a
//! durable store with an idempotent upsert and to a best-effort counter
//! cache. Offsets are committed only after the durable write of everything
//! they cover, giving at-least-once processing with idempotent results.

pub mod aggregation;
pub mod broker;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod metrics;
pub mod retry;
pub mod store;
pub mod watermark;
pub mod window;

pub use aggregation::{RejectReason, WindowAggregate, WindowAggregator};
pub use broker::{BrokerClient, BrokerRecord, KafkaBroker, KafkaBrokerConfig, MemoryBroker, TopicPartition};
pub use config::{CoordinatorConfig, WindowingConfig};
pub use coordinator::{CoordinatorState, CoordinatorStats, PipelineCoordinator};
pub use error::{ProcessorError, Result as ProcessorResult};
pub use metrics::{MetricsRegistry, MetricsServer, MetricsServerConfig, PipelineMetrics};
pub use retry::RetryPolicy;
pub use store::{
    AggregateStore, CounterStore, MemoryAggregateStore, MemoryCounterStore, PostgresAggregateStore,
    PostgresStoreConfig, RedisCounterConfig, RedisCounterStore, StoredAggregate,
};
pub use watermark::{Watermark, WatermarkTracker};
pub use window::{OpenWindows, TumblingWindowAssigner, WindowBounds};
