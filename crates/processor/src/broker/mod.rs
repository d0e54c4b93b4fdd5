//! Broker client adapter
//!
//! The coordinator talks to the message broker only through [`BrokerClient`].
//! [`KafkaBroker`] is the production adapter; [`MemoryBroker`] is a
//! partitioned in-process log used by tests and smoke runs.
//!
//! Offsets follow the Kafka convention: committing `n` for a partition means
//! every record below `n` is done and consumption resumes at `n`.

mod kafka;
mod memory;

pub use kafka::{KafkaBroker, KafkaBrokerConfig};
pub use memory::MemoryBroker;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use retail_analytics_types::{decode_transaction_at, CodecError, Transaction};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::Result;

/// Topic and partition pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition)
    }
}

/// One consumed message, payload still encoded
#[derive(Debug, Clone)]
pub struct BrokerRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
    /// Broker timestamp, if the message carried one
    pub timestamp: Option<DateTime<Utc>>,
}

impl BrokerRecord {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }

    /// Decode the payload, using `ingested_at` when it carries no usable event time
    pub fn decode(&self, ingested_at: DateTime<Utc>) -> std::result::Result<Transaction, CodecError> {
        decode_transaction_at(&self.payload, ingested_at)
    }
}

/// Publish/subscribe access to the transaction topic
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Join `group_id` and subscribe to `topics`
    async fn subscribe(&self, topics: &[String], group_id: &str) -> Result<()>;

    /// Fetch up to `max_records`, waiting at most `max_wait` for the first.
    ///
    /// Records of one partition come back in offset order. An empty batch is
    /// not an error. Exhausting the retry budget returns a fatal
    /// [`ProcessorError::Connectivity`](crate::error::ProcessorError::Connectivity).
    async fn poll(&self, max_records: usize, max_wait: Duration) -> Result<Vec<BrokerRecord>>;

    /// Advance the group cursor of `tp` to `offset`
    async fn commit(&self, tp: &TopicPartition, offset: i64) -> Result<()>;

    /// Produce one transaction keyed by `key`
    async fn publish(&self, event: &Transaction, key: &str) -> Result<()>;

    /// Partitions revoked from this member since the last call.
    ///
    /// Offsets tracked for them must not be committed any more; another
    /// member may already own them.
    fn take_revoked(&self) -> Vec<TopicPartition> {
        Vec::new()
    }

    /// Short name used in logs and metrics
    fn name(&self) -> &'static str;
}
