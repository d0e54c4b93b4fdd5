//! In-process broker with Kafka-like partition and offset semantics

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use retail_analytics_types::{encode_transaction, Transaction};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, info};

use super::{BrokerClient, BrokerRecord, TopicPartition};
use crate::error::{ProcessorError, Result};
use crate::retry::RetryPolicy;

const COMPONENT: &str = "memory-broker";

#[derive(Debug, Clone)]
struct StoredMessage {
    key: Option<Vec<u8>>,
    payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct Inner {
    /// topic -> partition log
    logs: HashMap<String, Vec<Vec<StoredMessage>>>,
    group_id: Option<String>,
    subscribed: Vec<String>,
    /// Next offset this consumer reads per partition
    positions: BTreeMap<TopicPartition, i64>,
    /// group -> committed offsets
    committed: HashMap<String, BTreeMap<TopicPartition, i64>>,
    commit_log: Vec<(TopicPartition, i64)>,
    /// Revoked since the consumer last asked
    revoked: Vec<TopicPartition>,
    failing_polls: u32,
    failing_commits: u32,
}

/// Partitioned log with consumer-group cursors.
///
/// Subscribing rewinds the consumer to the group's committed offsets, so a
/// second subscribe after a simulated crash replays every uncommitted record.
pub struct MemoryBroker {
    partitions: usize,
    retry: RetryPolicy,
    inner: Mutex<Inner>,
}

impl MemoryBroker {
    pub fn new(partitions: usize) -> Self {
        Self::with_retry(partitions, RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5)))
    }

    pub fn with_retry(partitions: usize, retry: RetryPolicy) -> Self {
        Self {
            partitions: partitions.max(1),
            retry,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn partition_for(&self, key: &[u8]) -> i32 {
        let hash = key
            .iter()
            .fold(0u32, |h, b| h.wrapping_mul(31).wrapping_add(u32::from(*b)));
        (hash % self.partitions as u32) as i32
    }

    /// Append a raw payload, bypassing the codec. Returns its offset.
    pub fn append_raw(&self, topic: &str, partition: i32, key: Option<&[u8]>, payload: &[u8]) -> i64 {
        let mut inner = self.inner.lock();
        let logs = inner
            .logs
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); self.partitions]);
        let log = &mut logs[partition.rem_euclid(self.partitions as i32) as usize];
        log.push(StoredMessage {
            key: key.map(|k| k.to_vec()),
            payload: payload.to_vec(),
        });
        (log.len() - 1) as i64
    }

    /// Make the next `count` poll attempts fail as transient errors
    pub fn fail_next_polls(&self, count: u32) {
        self.inner.lock().failing_polls = count;
    }

    /// Make the next `count` commit attempts fail as transient errors
    pub fn fail_next_commits(&self, count: u32) {
        self.inner.lock().failing_commits = count;
    }

    pub fn committed(&self, group_id: &str, tp: &TopicPartition) -> Option<i64> {
        self.inner
            .lock()
            .committed
            .get(group_id)
            .and_then(|offsets| offsets.get(tp).copied())
    }

    /// Revoke and reassign every subscribed partition.
    ///
    /// Positions fall back to the group's committed offsets, as they do when
    /// a partition moves to another member and back.
    pub fn rebalance(&self) {
        let mut inner = self.inner.lock();
        let committed = inner
            .group_id
            .as_ref()
            .and_then(|group| inner.committed.get(group))
            .cloned()
            .unwrap_or_default();
        let revoked: Vec<TopicPartition> = inner.positions.keys().cloned().collect();
        info!(partitions = revoked.len(), "rebalance");
        inner.revoked.extend(revoked);
        inner.positions = committed;
    }

    /// Every successful commit, in order
    pub fn commit_log(&self) -> Vec<(TopicPartition, i64)> {
        self.inner.lock().commit_log.clone()
    }

    /// Records not yet read by the current consumer
    pub fn pending(&self) -> usize {
        let inner = self.inner.lock();
        inner
            .subscribed
            .iter()
            .filter_map(|topic| inner.logs.get(topic).map(|logs| (topic, logs)))
            .flat_map(|(topic, logs)| {
                logs.iter().enumerate().map(move |(partition, log)| {
                    let tp = TopicPartition::new(topic.clone(), partition as i32);
                    (tp, log.len() as i64)
                })
            })
            .map(|(tp, end)| {
                let position = inner.positions.get(&tp).copied().unwrap_or(0);
                (end - position).max(0) as usize
            })
            .sum()
    }

    fn try_poll(&self, max_records: usize) -> Result<Vec<BrokerRecord>> {
        let mut inner = self.inner.lock();
        if inner.failing_polls > 0 {
            inner.failing_polls -= 1;
            return Err(ProcessorError::transient(COMPONENT, "broker unreachable"));
        }

        let mut batch = Vec::new();
        let topics = inner.subscribed.clone();
        for topic in topics {
            for partition in 0..self.partitions {
                let tp = TopicPartition::new(topic.clone(), partition as i32);
                let mut position = inner.positions.get(&tp).copied().unwrap_or(0);
                let Some(log) = inner.logs.get(&topic).map(|logs| &logs[partition]) else {
                    continue;
                };
                while batch.len() < max_records {
                    let Some(message) = log.get(position as usize) else {
                        break;
                    };
                    batch.push(BrokerRecord {
                        topic: topic.clone(),
                        partition: partition as i32,
                        offset: position,
                        key: message.key.clone(),
                        payload: message.payload.clone(),
                        timestamp: Some(Utc::now()),
                    });
                    position += 1;
                }
                inner.positions.insert(tp, position);
            }
        }
        Ok(batch)
    }
}

#[async_trait]
impl BrokerClient for MemoryBroker {
    async fn subscribe(&self, topics: &[String], group_id: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let committed = inner.committed.get(group_id).cloned().unwrap_or_default();
        inner.positions = committed;
        inner.subscribed = topics.to_vec();
        inner.group_id = Some(group_id.to_string());
        info!(topics = ?topics, group_id, "subscribed");
        Ok(())
    }

    async fn poll(&self, max_records: usize, max_wait: Duration) -> Result<Vec<BrokerRecord>> {
        let batch = self
            .retry
            .run("memory.poll", || async { self.try_poll(max_records) })
            .await
            .map_err(|err| err.into_connectivity(COMPONENT, self.retry.max_attempts))?;

        if batch.is_empty() {
            tokio::time::sleep(max_wait.min(Duration::from_millis(5))).await;
        }
        Ok(batch)
    }

    async fn commit(&self, tp: &TopicPartition, offset: i64) -> Result<()> {
        self.retry
            .run("memory.commit", || async {
                let mut inner = self.inner.lock();
                if inner.failing_commits > 0 {
                    inner.failing_commits -= 1;
                    return Err(ProcessorError::transient(COMPONENT, "commit timed out"));
                }
                let group = inner
                    .group_id
                    .clone()
                    .ok_or_else(|| ProcessorError::config("commit before subscribe"))?;
                inner
                    .committed
                    .entry(group)
                    .or_default()
                    .insert(tp.clone(), offset);
                inner.commit_log.push((tp.clone(), offset));
                debug!(%tp, offset, "offset committed");
                Ok(())
            })
            .await
            .map_err(|err| err.into_connectivity(COMPONENT, self.retry.max_attempts))
    }

    async fn publish(&self, event: &Transaction, key: &str) -> Result<()> {
        let payload = encode_transaction(event)?;
        let partition = self.partition_for(key.as_bytes());
        let topic = {
            let inner = self.inner.lock();
            inner
                .subscribed
                .first()
                .cloned()
                .unwrap_or_else(|| "ecommerce_transactions".to_string())
        };
        self.append_raw(&topic, partition, Some(key.as_bytes()), &payload);
        Ok(())
    }

    fn take_revoked(&self) -> Vec<TopicPartition> {
        std::mem::take(&mut self.inner.lock().revoked)
    }

    fn name(&self) -> &'static str {
        COMPONENT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    const TOPIC: &str = "orders";

    fn topics() -> Vec<String> {
        vec![TOPIC.to_string()]
    }

    #[tokio::test]
    async fn test_partition_order_and_commit() {
        let broker = MemoryBroker::new(2);
        for i in 0..3 {
            broker.append_raw(TOPIC, 0, None, format!("p0-{i}").as_bytes());
        }
        broker.append_raw(TOPIC, 1, None, b"p1-0");
        broker.subscribe(&topics(), "g").await.unwrap();

        let batch = broker.poll(10, Duration::from_millis(1)).await.unwrap();
        assert_eq!(batch.len(), 4);
        let p0: Vec<i64> = batch.iter().filter(|r| r.partition == 0).map(|r| r.offset).collect();
        assert_eq!(p0, vec![0, 1, 2]);

        let tp = TopicPartition::new(TOPIC, 0);
        broker.commit(&tp, 2).await.unwrap();
        assert_eq!(broker.committed("g", &tp), Some(2));
        assert_eq!(broker.pending(), 0);
    }

    #[tokio::test]
    async fn test_resubscribe_replays_uncommitted() {
        let broker = MemoryBroker::new(1);
        for i in 0..3 {
            broker.append_raw(TOPIC, 0, None, format!("{i}").as_bytes());
        }
        broker.subscribe(&topics(), "g").await.unwrap();
        broker.poll(10, Duration::from_millis(1)).await.unwrap();
        broker.commit(&TopicPartition::new(TOPIC, 0), 1).await.unwrap();

        broker.subscribe(&topics(), "g").await.unwrap();
        let batch = broker.poll(10, Duration::from_millis(1)).await.unwrap();
        assert_eq!(batch.iter().map(|r| r.offset).collect::<Vec<_>>(), vec![1, 2]);

        // A fresh group starts from the beginning
        broker.subscribe(&topics(), "other").await.unwrap();
        assert_eq!(broker.pending(), 3);
    }

    #[tokio::test]
    async fn test_poll_recovers_then_escalates() {
        let broker = MemoryBroker::new(1);
        broker.subscribe(&topics(), "g").await.unwrap();

        broker.fail_next_polls(2);
        assert!(broker.poll(10, Duration::ZERO).await.unwrap().is_empty());

        broker.fail_next_polls(u32::MAX);
        let err = broker.poll(10, Duration::ZERO).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, ProcessorError::Connectivity { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn test_publish_keys_to_stable_partition() {
        let broker = MemoryBroker::new(4);
        broker.subscribe(&topics(), "g").await.unwrap();
        let event = Transaction::new("1", "A", "c", "France", 1, Decimal::ONE, Utc::now());

        broker.publish(&event, "France").await.unwrap();
        broker.publish(&event, "France").await.unwrap();

        let batch = broker.poll(10, Duration::ZERO).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].partition, batch[1].partition);
        assert_eq!(batch[1].decode(Utc::now()).unwrap().country, "France");
    }

    #[tokio::test]
    async fn test_rebalance_rewinds_to_committed() {
        let broker = MemoryBroker::new(1);
        for i in 0..3 {
            broker.append_raw(TOPIC, 0, None, format!("{i}").as_bytes());
        }
        broker.subscribe(&topics(), "g").await.unwrap();
        broker.poll(10, Duration::ZERO).await.unwrap();
        broker.commit(&TopicPartition::new(TOPIC, 0), 1).await.unwrap();
        assert!(broker.take_revoked().is_empty());

        broker.rebalance();
        assert_eq!(broker.take_revoked(), vec![TopicPartition::new(TOPIC, 0)]);
        assert!(broker.take_revoked().is_empty());

        let batch = broker.poll(10, Duration::ZERO).await.unwrap();
        assert_eq!(batch.iter().map(|r| r.offset).collect::<Vec<_>>(), vec![1, 2]);
    }
}
