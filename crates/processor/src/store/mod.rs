//! Aggregate sinks
//!
//! Sealed aggregates go to two places:
//!
//! - an [`AggregateStore`], the durable source of truth, written with a
//!   full-value overwrite keyed by window so replays converge on one row.
//!   Every row records the idempotency keys of its events; see
//!   [`plan_upsert`] for how an incoming aggregate is reconciled with them;
//! - a [`CounterStore`], a read-acceleration cache of running counters.
//!   Increments there are not idempotent, so the cache may drift under
//!   redelivery and is never read back by the pipeline.
//!
//! Adapters make a single attempt per call and classify failures as
//! transient or permanent; the coordinator owns retries and timeouts.

mod memory;
mod postgres_store;
mod redis_store;

pub use memory::{CounterBucket, MemoryAggregateStore, MemoryCounterStore};
pub use postgres_store::{PostgresAggregateStore, PostgresStoreConfig, MIGRATIONS};
pub use redis_store::{RedisCounterConfig, RedisCounterStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use retail_analytics_types::{LateOrigin, SealedAggregate, WindowKey};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::Result;

/// Result of a durable upsert
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// The row now holds the incoming aggregate
    Written,
    /// Every event of the aggregate is already stored for its window
    Skipped,
    /// The on-time row already holds events the aggregate lacks, so it was
    /// left alone. The events it did not have were recorded as this late
    /// aggregate.
    Diverted(Box<SealedAggregate>),
}

/// What an upsert must do, given the keys already stored for a window
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertPlan {
    Skip,
    /// Create or replace the row with this aggregate
    Write(SealedAggregate),
    /// Keep the on-time row and insert this late aggregate
    Divert(SealedAggregate),
}

/// Reconcile an incoming aggregate with a window's stored event keys.
///
/// `on_time` is the key set of the window's on-time row, if it has one, and
/// `late` the union of its late rows' keys. An event is never stored twice:
///
/// - events already in a late row are dropped from an on-time aggregate;
/// - an on-time aggregate replaces the row only when it covers every stored
///   event, as a replay after a crash does;
/// - otherwise the row stays and the events it lacks become a late
///   aggregate, as for a straggler consumed after a restart;
/// - a late aggregate keeps only events stored nowhere yet.
pub fn plan_upsert(
    aggregate: &SealedAggregate,
    on_time: Option<&BTreeSet<String>>,
    late: &BTreeSet<String>,
) -> UpsertPlan {
    if aggregate.late {
        let mut known = late.clone();
        known.extend(on_time.into_iter().flatten().cloned());
        return match aggregate.without_events(&known) {
            Some(rest) => UpsertPlan::Write(rest),
            None => UpsertPlan::Skip,
        };
    }

    let Some(incoming) = aggregate.without_events(late) else {
        return UpsertPlan::Skip;
    };
    let Some(stored) = on_time else {
        return UpsertPlan::Write(incoming);
    };

    let incoming_keys: BTreeSet<String> = incoming.events.keys().cloned().collect();
    if incoming_keys.is_subset(stored) {
        UpsertPlan::Skip
    } else if stored.is_subset(&incoming_keys) {
        UpsertPlan::Write(incoming)
    } else {
        match incoming.without_events(stored) {
            Some(rest) => UpsertPlan::Divert(rest.into_late()),
            None => UpsertPlan::Skip,
        }
    }
}

/// Result of a counter-store apply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The same sealed aggregate was applied before
    Duplicate,
}

/// A row of the durable store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredAggregate {
    pub partition_key: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub order_count: u64,
    pub revenue_total: Decimal,
    pub revenue_converted: Decimal,
    pub distinct_customers: u64,
    pub avg_order_value: Decimal,
    pub event_digest: String,
    /// Idempotency keys of the stored events, sorted
    pub event_keys: Vec<String>,
    pub late_origin: Option<LateOrigin>,
    pub updated_at: DateTime<Utc>,
}

impl StoredAggregate {
    /// Row image of a sealed aggregate at `updated_at`
    pub fn from_sealed(aggregate: &SealedAggregate, conversion_rate: Decimal, updated_at: DateTime<Utc>) -> Self {
        Self {
            partition_key: aggregate.partition_key.clone(),
            window_start: aggregate.window_start,
            window_end: aggregate.window_end,
            order_count: aggregate.order_count,
            revenue_total: aggregate.revenue_total,
            revenue_converted: converted(aggregate.revenue_total, conversion_rate),
            distinct_customers: aggregate.distinct_customers,
            avg_order_value: aggregate.avg_order_value,
            event_digest: aggregate.event_digest.clone(),
            event_keys: aggregate.event_keys(),
            late_origin: aggregate.late_origin,
            updated_at,
        }
    }
}

/// Revenue in the secondary reporting currency
pub fn converted(revenue: Decimal, rate: Decimal) -> Decimal {
    (revenue * rate).round_dp(4)
}

/// Durable, idempotent sink for sealed aggregates
#[async_trait]
pub trait AggregateStore: Send + Sync {
    /// Full-value overwrite keyed by window, reconciled per [`plan_upsert`].
    ///
    /// Late aggregates (`late_origin` set) are written to a separate table
    /// keyed additionally by their origin. Applying the same aggregate twice
    /// leaves the row as after the first application.
    async fn upsert(&self, aggregate: &SealedAggregate) -> Result<UpsertOutcome>;

    /// On-time row for a window
    async fn get(&self, key: &WindowKey) -> Result<Option<StoredAggregate>>;

    /// Late rows recorded for a window
    async fn get_late(&self, key: &WindowKey) -> Result<Vec<StoredAggregate>>;

    fn name(&self) -> &'static str;
}

/// Best-effort mirror of running counters
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn apply(&self, aggregate: &SealedAggregate) -> Result<ApplyOutcome>;

    fn name(&self) -> &'static str;
}
