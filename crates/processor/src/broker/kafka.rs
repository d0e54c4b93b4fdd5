//! Kafka adapter built on rdkafka
//!
//! Offsets are never auto-committed: the coordinator decides when a position
//! is safe and calls [`BrokerClient::commit`] explicitly.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::{KafkaError, KafkaResult};
use rdkafka::message::BorrowedMessage;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::util::Timeout;
use rdkafka::{ClientContext, Message, Offset, TopicPartitionList};
use retail_analytics_types::{encode_transaction, Transaction};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::{BrokerClient, BrokerRecord, TopicPartition};
use crate::error::{ProcessorError, Result};
use crate::retry::RetryPolicy;

const COMPONENT: &str = "kafka";

/// Connection settings for [`KafkaBroker`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaBrokerConfig {
    /// Kafka brokers (comma-separated list)
    pub brokers: String,
    /// Topic transactions are produced to and consumed from
    pub topic: String,
    pub group_id: String,
    pub client_id: String,
    /// Where a fresh consumer group starts: `earliest` or `latest`
    pub auto_offset_reset: String,
    pub session_timeout_ms: u64,
    /// Upper bound for one produce call, including librdkafka's own retries
    pub delivery_timeout_ms: u64,
    /// Additional librdkafka properties
    #[serde(default)]
    pub extra_config: HashMap<String, String>,
}

impl Default for KafkaBrokerConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            topic: "ecommerce_transactions".to_string(),
            group_id: "transaction-aggregator".to_string(),
            client_id: "retail-analytics".to_string(),
            auto_offset_reset: "earliest".to_string(),
            session_timeout_ms: 30_000,
            delivery_timeout_ms: 30_000,
            extra_config: HashMap::new(),
        }
    }
}

impl KafkaBrokerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.brokers.trim().is_empty() {
            return Err(ProcessorError::config("kafka brokers must not be empty"));
        }
        if self.topic.trim().is_empty() {
            return Err(ProcessorError::config("kafka topic must not be empty"));
        }
        if self.group_id.trim().is_empty() {
            return Err(ProcessorError::config("kafka group_id must not be empty"));
        }
        if !matches!(self.auto_offset_reset.as_str(), "earliest" | "latest") {
            return Err(ProcessorError::config(format!(
                "auto_offset_reset must be earliest or latest, got {}",
                self.auto_offset_reset
            )));
        }
        Ok(())
    }
}

/// Logs partition movement inside the consumer group and remembers revoked
/// partitions until the coordinator collects them
#[derive(Default)]
struct RebalanceContext {
    revoked: Arc<Mutex<Vec<TopicPartition>>>,
}

impl ClientContext for RebalanceContext {}

impl ConsumerContext for RebalanceContext {
    fn pre_rebalance(&self, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(tpl) => {
                info!(partitions = ?partitions_of(tpl), "partitions revoked");
                self.revoked.lock().extend(
                    tpl.elements()
                        .iter()
                        .map(|elem| TopicPartition::new(elem.topic(), elem.partition())),
                );
            }
            Rebalance::Assign(tpl) => {
                info!(partitions = ?partitions_of(tpl), "partitions assigned");
            }
            Rebalance::Error(err) => {
                error!(error = %err, "rebalance error");
            }
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, _offsets: &TopicPartitionList) {
        if let Err(err) = result {
            error!(error = %err, "offset commit callback failed");
        }
    }
}

fn partitions_of(tpl: &TopicPartitionList) -> Vec<i32> {
    tpl.elements().iter().map(|elem| elem.partition()).collect()
}

/// Errors librdkafka recovers from once the cluster is reachable again
fn should_retry(error: &KafkaError) -> bool {
    let code = match error {
        KafkaError::MessageConsumption(code)
        | KafkaError::MessageProduction(code)
        | KafkaError::ConsumerCommit(code)
        | KafkaError::Global(code) => *code,
        _ => return false,
    };
    matches!(
        code,
        RDKafkaErrorCode::BrokerTransportFailure
            | RDKafkaErrorCode::AllBrokersDown
            | RDKafkaErrorCode::QueueFull
            | RDKafkaErrorCode::NetworkException
            | RDKafkaErrorCode::RequestTimedOut
            | RDKafkaErrorCode::OperationTimedOut
            | RDKafkaErrorCode::NotLeaderForPartition
            | RDKafkaErrorCode::LeaderNotAvailable
            | RDKafkaErrorCode::NotCoordinator
            | RDKafkaErrorCode::CoordinatorNotAvailable
            | RDKafkaErrorCode::CoordinatorLoadInProgress
            | RDKafkaErrorCode::RebalanceInProgress
    )
}

fn classify(error: KafkaError) -> ProcessorError {
    if should_retry(&error) {
        ProcessorError::transient(COMPONENT, error)
    } else {
        ProcessorError::Storage {
            backend: COMPONENT,
            details: error.to_string(),
        }
    }
}

fn to_record(msg: &BorrowedMessage<'_>) -> BrokerRecord {
    BrokerRecord {
        topic: msg.topic().to_string(),
        partition: msg.partition(),
        offset: msg.offset(),
        key: msg.key().map(|k| k.to_vec()),
        payload: msg.payload().map(|p| p.to_vec()).unwrap_or_default(),
        timestamp: msg
            .timestamp()
            .to_millis()
            .and_then(DateTime::<Utc>::from_timestamp_millis),
    }
}

/// Kafka consumer group member and producer for the transaction topic
pub struct KafkaBroker {
    consumer: Arc<StreamConsumer<RebalanceContext>>,
    revoked: Arc<Mutex<Vec<TopicPartition>>>,
    producer: FutureProducer,
    config: KafkaBrokerConfig,
    retry: RetryPolicy,
    /// Consecutive failed receives; reset by any successful one
    poll_failures: AtomicU32,
}

impl KafkaBroker {
    /// Create the consumer and producer clients.
    ///
    /// No network traffic happens until [`BrokerClient::subscribe`] or the
    /// first publish.
    pub fn new(config: KafkaBrokerConfig, retry: RetryPolicy) -> Result<Self> {
        config.validate()?;
        retry.validate()?;

        let mut consumer_config = ClientConfig::new();
        consumer_config
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.group_id)
            .set("client.id", &config.client_id)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("session.timeout.ms", config.session_timeout_ms.to_string());
        for (key, value) in &config.extra_config {
            consumer_config.set(key, value);
        }

        let context = RebalanceContext::default();
        let revoked = Arc::clone(&context.revoked);
        let consumer: StreamConsumer<RebalanceContext> = consumer_config
            .create_with_context(context)
            .map_err(|e| ProcessorError::Configuration {
                source: Box::new(e),
            })?;

        let mut producer_config = ClientConfig::new();
        producer_config
            .set("bootstrap.servers", &config.brokers)
            .set("client.id", &config.client_id)
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("message.timeout.ms", config.delivery_timeout_ms.to_string());
        for (key, value) in &config.extra_config {
            producer_config.set(key, value);
        }

        let producer: FutureProducer =
            producer_config
                .create()
                .map_err(|e| ProcessorError::Configuration {
                    source: Box::new(e),
                })?;

        Ok(Self {
            consumer: Arc::new(consumer),
            revoked,
            producer,
            config,
            retry,
            poll_failures: AtomicU32::new(0),
        })
    }

    pub fn config(&self) -> &KafkaBrokerConfig {
        &self.config
    }

    /// Count a failed receive; escalates once the retry budget is spent
    async fn receive_failed(&self, err: KafkaError) -> Result<()> {
        if !should_retry(&err) {
            error!(error = %err, "non-retryable consume error");
            return Err(ProcessorError::Connectivity {
                component: COMPONENT,
                attempts: 1,
                message: err.to_string(),
            });
        }

        let attempt = self.poll_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if attempt >= self.retry.max_attempts {
            error!(attempts = attempt, error = %err, "broker unreachable, retry budget exhausted");
            return Err(ProcessorError::Connectivity {
                component: COMPONENT,
                attempts: attempt,
                message: err.to_string(),
            });
        }

        let delay = self.retry.backoff(attempt);
        warn!(
            attempt,
            max_attempts = self.retry.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "consume failed, backing off"
        );
        tokio::time::sleep(delay).await;
        Ok(())
    }
}

#[async_trait]
impl BrokerClient for KafkaBroker {
    async fn subscribe(&self, topics: &[String], group_id: &str) -> Result<()> {
        if group_id != self.config.group_id {
            return Err(ProcessorError::config(format!(
                "consumer was created for group {} but asked to join {}",
                self.config.group_id, group_id
            )));
        }
        let topic_refs: Vec<&str> = topics.iter().map(|s| s.as_str()).collect();
        self.consumer
            .subscribe(&topic_refs)
            .map_err(|e| ProcessorError::Configuration {
                source: Box::new(e),
            })?;

        info!(topics = ?topics, group_id, "subscribed");
        Ok(())
    }

    async fn poll(&self, max_records: usize, max_wait: Duration) -> Result<Vec<BrokerRecord>> {
        let deadline = tokio::time::Instant::now() + max_wait;
        let mut batch = Vec::new();

        while batch.len() < max_records {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }

            match tokio::time::timeout(remaining, self.consumer.recv()).await {
                Err(_elapsed) => break,
                Ok(Ok(msg)) => {
                    self.poll_failures.store(0, Ordering::Relaxed);
                    batch.push(to_record(&msg));
                }
                Ok(Err(KafkaError::PartitionEOF(partition))) => {
                    debug!(partition, "reached end of partition");
                }
                Ok(Err(err)) => {
                    self.receive_failed(err).await?;
                    if !batch.is_empty() {
                        break;
                    }
                }
            }
        }

        Ok(batch)
    }

    async fn commit(&self, tp: &TopicPartition, offset: i64) -> Result<()> {
        let result = self
            .retry
            .run("kafka.commit", || {
                let consumer = Arc::clone(&self.consumer);
                let tp = tp.clone();
                async move {
                    tokio::task::spawn_blocking(move || {
                        let mut tpl = TopicPartitionList::new();
                        tpl.add_partition_offset(&tp.topic, tp.partition, Offset::Offset(offset))
                            .map_err(classify)?;
                        consumer.commit(&tpl, CommitMode::Sync).map_err(classify)
                    })
                    .await
                    .map_err(|e| ProcessorError::Invariant(format!("commit task failed: {e}")))?
                }
            })
            .await;

        match result {
            Ok(()) => {
                debug!(topic = %tp.topic, partition = tp.partition, offset, "offset committed");
                Ok(())
            }
            Err(err) => Err(err.into_connectivity(COMPONENT, self.retry.max_attempts)),
        }
    }

    async fn publish(&self, event: &Transaction, key: &str) -> Result<()> {
        let payload = encode_transaction(event)?;
        let timeout = Timeout::After(Duration::from_millis(self.config.delivery_timeout_ms));

        self.retry
            .run("kafka.publish", || {
                let record = FutureRecord::to(&self.config.topic)
                    .key(key)
                    .payload(&payload)
                    .timestamp(event.event_time.timestamp_millis());
                async move {
                    self.producer
                        .send(record, timeout)
                        .await
                        .map(|_| ())
                        .map_err(|(err, _)| classify(err))
                }
            })
            .await
            .map_err(|err| err.into_connectivity(COMPONENT, self.retry.max_attempts))
    }

    fn take_revoked(&self) -> Vec<TopicPartition> {
        std::mem::take(&mut *self.revoked.lock())
    }

    fn name(&self) -> &'static str {
        COMPONENT
    }
}
