//! In-memory stores with failure injection
//!
//! Same write semantics as the PostgreSQL and Redis adapters, without the
//! servers. Used by tests and `run --in-memory`.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use retail_analytics_types::{LateOrigin, SealedAggregate, WindowKey};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use super::{
    converted, plan_upsert, AggregateStore, ApplyOutcome, CounterStore, StoredAggregate, UpsertOutcome,
    UpsertPlan,
};
use crate::error::{ProcessorError, Result};

/// Counts down injected failures; `u32::MAX` fails forever
#[derive(Debug, Default)]
struct FailureInjector {
    remaining: AtomicU32,
}

impl FailureInjector {
    fn arm(&self, count: u32) {
        self.remaining.store(count, Ordering::SeqCst);
    }

    fn check(&self, component: &'static str) -> Result<()> {
        let tripped = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                0 => None,
                u32::MAX => Some(u32::MAX),
                n => Some(n - 1),
            })
            .is_ok();
        if tripped {
            Err(ProcessorError::transient(component, "injected failure"))
        } else {
            Ok(())
        }
    }
}

/// Durable store held in memory
#[derive(Debug)]
pub struct MemoryAggregateStore {
    conversion_rate: Decimal,
    rows: RwLock<BTreeMap<WindowKey, StoredAggregate>>,
    late_rows: RwLock<BTreeMap<(WindowKey, LateOrigin), StoredAggregate>>,
    failures: FailureInjector,
    attempts: AtomicU64,
}

impl Default for MemoryAggregateStore {
    fn default() -> Self {
        Self::new(Decimal::new(127, 2))
    }
}

impl MemoryAggregateStore {
    pub fn new(conversion_rate: Decimal) -> Self {
        Self {
            conversion_rate,
            rows: RwLock::new(BTreeMap::new()),
            late_rows: RwLock::new(BTreeMap::new()),
            failures: FailureInjector::default(),
            attempts: AtomicU64::new(0),
        }
    }

    /// Fail the next `count` upserts with a transient error
    pub fn fail_next(&self, count: u32) {
        self.failures.arm(count);
    }

    /// Fail every upsert until [`recover`](Self::recover)
    pub fn fail_always(&self) {
        self.failures.arm(u32::MAX);
    }

    pub fn recover(&self) {
        self.failures.arm(0);
    }

    /// Upsert calls so far, failed ones included
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn rows(&self) -> Vec<StoredAggregate> {
        self.rows.read().values().cloned().collect()
    }

    pub fn late_row_count(&self) -> usize {
        self.late_rows.read().len()
    }
}

#[async_trait]
impl AggregateStore for MemoryAggregateStore {
    async fn upsert(&self, aggregate: &SealedAggregate) -> Result<UpsertOutcome> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.failures.check("memory-store")?;

        let key = aggregate.key();
        let mut rows = self.rows.write();
        let mut late_rows = self.late_rows.write();

        let on_time: Option<BTreeSet<String>> = rows
            .get(&key)
            .map(|row| row.event_keys.iter().cloned().collect());
        let late: BTreeSet<String> = late_rows
            .iter()
            .filter(|((window, _), _)| *window == key)
            .flat_map(|(_, row)| row.event_keys.iter().cloned())
            .collect();

        let outcome = match plan_upsert(aggregate, on_time.as_ref(), &late) {
            UpsertPlan::Skip => UpsertOutcome::Skipped,
            UpsertPlan::Write(row) => {
                let stored = StoredAggregate::from_sealed(&row, self.conversion_rate, Utc::now());
                match row.late_origin {
                    Some(origin) => late_rows.insert((key, origin), stored),
                    None => rows.insert(key, stored),
                };
                UpsertOutcome::Written
            }
            UpsertPlan::Divert(row) => {
                let origin = row
                    .late_origin
                    .ok_or_else(|| ProcessorError::Invariant(format!("late aggregate for {key} has no origin")))?;
                let stored = StoredAggregate::from_sealed(&row, self.conversion_rate, Utc::now());
                late_rows.insert((key, origin), stored);
                UpsertOutcome::Diverted(Box::new(row))
            }
        };
        Ok(outcome)
    }

    async fn get(&self, key: &WindowKey) -> Result<Option<StoredAggregate>> {
        Ok(self.rows.read().get(key).cloned())
    }

    async fn get_late(&self, key: &WindowKey) -> Result<Vec<StoredAggregate>> {
        Ok(self
            .late_rows
            .read()
            .iter()
            .filter(|((window, _), _)| window == key)
            .map(|(_, row)| row.clone())
            .collect())
    }

    fn name(&self) -> &'static str {
        "memory-store"
    }
}

/// One hourly counter bucket
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CounterBucket {
    pub order_count: u64,
    pub revenue: Decimal,
    pub revenue_converted: Decimal,
    pub customers: u64,
}

/// Counter mirror held in memory
#[derive(Debug)]
pub struct MemoryCounterStore {
    conversion_rate: Decimal,
    dedup_applies: bool,
    buckets: RwLock<HashMap<String, CounterBucket>>,
    global: RwLock<(u64, Decimal)>,
    markers: RwLock<HashSet<String>>,
    failures: FailureInjector,
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::new(Decimal::new(127, 2), true)
    }
}

impl MemoryCounterStore {
    pub fn new(conversion_rate: Decimal, dedup_applies: bool) -> Self {
        Self {
            conversion_rate,
            dedup_applies,
            buckets: RwLock::new(HashMap::new()),
            global: RwLock::new((0, Decimal::ZERO)),
            markers: RwLock::new(HashSet::new()),
            failures: FailureInjector::default(),
        }
    }

    pub fn fail_next(&self, count: u32) {
        self.failures.arm(count);
    }

    pub fn fail_always(&self) {
        self.failures.arm(u32::MAX);
    }

    /// Bucket for a partition key and `YYYY-MM-DD:HH` hour
    pub fn bucket(&self, partition_key: &str, hour: &str) -> Option<CounterBucket> {
        self.buckets.read().get(&format!("{partition_key}:{hour}")).cloned()
    }

    /// Global order count and revenue
    pub fn global(&self) -> (u64, Decimal) {
        *self.global.read()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn apply(&self, aggregate: &SealedAggregate) -> Result<ApplyOutcome> {
        self.failures.check("memory-counters")?;

        if self.dedup_applies && !self.markers.write().insert(aggregate.fingerprint()) {
            return Ok(ApplyOutcome::Duplicate);
        }

        let key = format!(
            "{}:{}",
            aggregate.partition_key,
            aggregate.window_start.format("%Y-%m-%d:%H")
        );
        {
            let mut buckets = self.buckets.write();
            let bucket = buckets.entry(key).or_default();
            bucket.order_count += aggregate.order_count;
            bucket.revenue += aggregate.revenue_total;
            bucket.revenue_converted += converted(aggregate.revenue_total, self.conversion_rate);
            bucket.customers += aggregate.distinct_customers;
        }
        let mut global = self.global.write();
        global.0 += aggregate.order_count;
        global.1 += aggregate.revenue_total;
        Ok(ApplyOutcome::Applied)
    }

    fn name(&self) -> &'static str {
        "memory-counters"
    }
}
