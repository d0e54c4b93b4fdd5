use parking_lot::Mutex;
use retail_analytics_types::{EventShare, PartitionKey, Transaction, WindowKey};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

use super::accumulator::WindowAggregate;
use crate::window::TumblingWindowAssigner;

/// Why an event was kept out of every aggregate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RejectReason {
    /// total_amount <= 0, including returns
    NonPositiveTotal,
    /// A field the aggregate needs is empty
    MissingField(&'static str),
    /// The payload never decoded; carries the codec's reason label
    Codec(&'static str),
}

impl RejectReason {
    /// Label value for metrics and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::NonPositiveTotal => "non_positive_total",
            RejectReason::MissingField(_) => "missing_field",
            RejectReason::Codec(reason) => *reason,
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::MissingField(field) => write!(f, "missing_field({field})"),
            other => write!(f, "{}", other.as_str()),
        }
    }
}

/// What folding one event did to an accumulator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoldOutcome {
    Added,
    /// An event with the same idempotency key is already in the accumulator
    Duplicate,
    Rejected(RejectReason),
}

/// Rejection side channel of the aggregator
#[derive(Debug, Default)]
pub struct RejectionCounter {
    total: AtomicU64,
    by_reason: Mutex<BTreeMap<&'static str, u64>>,
}

impl RejectionCounter {
    pub fn record(&self, reason: RejectReason) {
        self.total.fetch_add(1, Ordering::Relaxed);
        *self.by_reason.lock().entry(reason.as_str()).or_insert(0) += 1;
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn by_reason(&self) -> BTreeMap<&'static str, u64> {
        self.by_reason.lock().clone()
    }
}

/// Folds transactions into per-window aggregates.
///
/// Holds no window state of its own; callers own the accumulators and pass
/// them through [`WindowAggregator::fold`].
#[derive(Debug)]
pub struct WindowAggregator {
    partition_key: PartitionKey,
    assigner: TumblingWindowAssigner,
    rejections: RejectionCounter,
}

impl WindowAggregator {
    pub fn new(partition_key: PartitionKey, assigner: TumblingWindowAssigner) -> Self {
        Self {
            partition_key,
            assigner,
            rejections: RejectionCounter::default(),
        }
    }

    pub fn partition_key(&self) -> PartitionKey {
        self.partition_key
    }

    pub fn assigner(&self) -> &TumblingWindowAssigner {
        &self.assigner
    }

    /// Check the fields aggregation depends on
    pub fn validate(&self, event: &Transaction) -> Result<(), RejectReason> {
        if event.invoice_no.trim().is_empty() {
            return Err(RejectReason::MissingField("invoice_no"));
        }
        if self.partition_key.extract(event).trim().is_empty() {
            return Err(RejectReason::MissingField(match self.partition_key {
                PartitionKey::Country => "country",
                PartitionKey::StockCode => "stock_code",
                PartitionKey::CustomerId => "customer_id",
            }));
        }
        if event.customer_id.trim().is_empty() {
            return Err(RejectReason::MissingField("customer_id"));
        }
        if event.total_amount <= Decimal::ZERO {
            return Err(RejectReason::NonPositiveTotal);
        }
        Ok(())
    }

    /// Window the event maps to, regardless of validity
    pub fn window_key(&self, event: &Transaction) -> WindowKey {
        self.assigner
            .assign(event.event_time)
            .key(self.partition_key.extract(event))
    }

    /// Fold one event, read from `partition` at `offset`, into `aggregate`.
    ///
    /// An invalid event leaves the accumulator unchanged and is counted on the
    /// rejection side channel. A redelivered event is recognised by its
    /// idempotency key and folded only once. The caller is responsible for
    /// handing in the accumulator of the event's own window.
    pub fn fold(
        &self,
        aggregate: &mut WindowAggregate,
        event: &Transaction,
        partition: i32,
        offset: i64,
    ) -> FoldOutcome {
        if let Err(reason) = self.validate(event) {
            self.reject(event, reason);
            return FoldOutcome::Rejected(reason);
        }
        let share = EventShare {
            total_amount: event.total_amount,
            customer_id: event.customer_id.clone(),
            partition,
            offset,
        };
        if aggregate.add(event.idempotency_key(), share) {
            FoldOutcome::Added
        } else {
            FoldOutcome::Duplicate
        }
    }

    /// Count an event that will not reach any aggregate
    pub fn reject(&self, event: &Transaction, reason: RejectReason) {
        warn!(
            invoice_no = %event.invoice_no,
            stock_code = %event.stock_code,
            reason = %reason,
            "rejected transaction"
        );
        self.rejections.record(reason);
    }

    /// Count a payload that never became a transaction
    pub fn reject_undecodable(&self, reason: RejectReason) {
        self.rejections.record(reason);
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejections.total()
    }

    pub fn rejections(&self) -> &RejectionCounter {
        &self.rejections
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use rand::seq::SliceRandom;

    fn window_start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap()
    }

    fn aggregator() -> WindowAggregator {
        WindowAggregator::new(
            PartitionKey::Country,
            TumblingWindowAssigner::new(Duration::minutes(5)),
        )
    }

    fn tx(invoice: &str, country: &str, customer: &str, amount: &str, secs: i64) -> Transaction {
        let amount: Decimal = amount.parse().unwrap();
        Transaction::new(
            invoice,
            "85123A",
            customer,
            country,
            1,
            amount,
            window_start() + Duration::seconds(secs),
        )
    }

    fn fold_all(agg: &WindowAggregator, events: &[Transaction]) -> WindowAggregate {
        let mut acc = WindowAggregate::new();
        for (offset, event) in events.iter().enumerate() {
            agg.fold(&mut acc, event, 0, offset as i64);
        }
        acc
    }

    #[test]
    fn test_scenario_one_window_two_keys() {
        let agg = aggregator();
        let events = vec![
            tx("1", "UK", "a", "10.0", 5),
            tx("2", "UK", "b", "5.0", 60),
            tx("3", "FR", "c", "20.0", 120),
        ];

        let mut by_key: BTreeMap<WindowKey, WindowAggregate> = BTreeMap::new();
        for (offset, event) in events.iter().enumerate() {
            let acc = by_key.entry(agg.window_key(event)).or_default();
            assert_eq!(agg.fold(acc, event, 0, offset as i64), FoldOutcome::Added);
        }

        let uk = &by_key[&WindowKey::new("UK", window_start())];
        assert_eq!(uk.order_count(), 2);
        assert_eq!(uk.revenue_total(), Decimal::new(15, 0));
        assert_eq!(uk.avg_order_value(), Decimal::new(75, 1));

        let fr = &by_key[&WindowKey::new("FR", window_start())];
        assert_eq!(fr.order_count(), 1);
        assert_eq!(fr.revenue_total(), Decimal::new(20, 0));
        assert_eq!(fr.avg_order_value(), Decimal::new(20, 0));
    }

    #[test]
    fn test_invalid_total_is_rejected_without_touching_aggregate() {
        let agg = aggregator();
        let invalid = tx("1", "UK", "a", "1", 0).with_total_amount(Decimal::new(-3, 0));
        let valid = tx("2", "UK", "b", "12.0", 1);

        let result = fold_all(&agg, &[invalid, valid]);
        assert_eq!(result.order_count(), 1);
        assert_eq!(result.revenue_total(), Decimal::new(12, 0));
        assert_eq!(agg.rejected_count(), 1);
        assert_eq!(agg.rejections().by_reason()["non_positive_total"], 1);
    }

    #[test]
    fn test_one_malformed_among_many() {
        let agg = aggregator();
        let mut events: Vec<Transaction> = (0..10)
            .map(|i| tx(&format!("inv-{i}"), "UK", &format!("c{i}"), "2.50", i))
            .collect();
        events.insert(4, tx("", "UK", "x", "99", 3));

        let result = fold_all(&agg, &events);
        assert_eq!(result.order_count(), 10);
        assert_eq!(result.revenue_total(), Decimal::new(25, 0));
        assert_eq!(agg.rejected_count(), 1);
    }

    #[test]
    fn test_missing_partition_value_rejected() {
        let agg = WindowAggregator::new(
            PartitionKey::StockCode,
            TumblingWindowAssigner::new(Duration::minutes(5)),
        );
        let mut event = tx("1", "UK", "a", "1", 0);
        event.stock_code = String::new();
        assert_eq!(
            agg.validate(&event),
            Err(RejectReason::MissingField("stock_code"))
        );
    }

    #[test]
    fn test_zero_total_rejected() {
        let agg = aggregator();
        let event = tx("1", "UK", "a", "0", 0);
        assert_eq!(agg.validate(&event), Err(RejectReason::NonPositiveTotal));
    }

    #[test]
    fn test_fold_is_order_independent() {
        let agg = aggregator();
        let events: Vec<Transaction> = (0..40)
            .map(|i| {
                tx(
                    &format!("inv-{i}"),
                    "UK",
                    &format!("c{}", i % 7),
                    &format!("{}.{:02}", i % 13 + 1, (i * 37) % 100),
                    i,
                )
            })
            .collect();

        let expected = fold_all(&agg, &events);
        let mut rng = rand::thread_rng();
        for _ in 0..25 {
            let mut shuffled = events.clone();
            shuffled.shuffle(&mut rng);
            let result = fold_all(&agg, &shuffled);
            assert_eq!(result.order_count(), expected.order_count());
            assert_eq!(result.revenue_total(), expected.revenue_total());
            assert_eq!(result.avg_order_value(), expected.avg_order_value());
            assert_eq!(result.distinct_customers(), 7);
        }
    }

    #[test]
    fn test_window_key_uses_floor() {
        let agg = aggregator();
        let event = tx("1", "UK", "a", "1", 299);
        assert_eq!(agg.window_key(&event), WindowKey::new("UK", window_start()));
        let event = tx("1", "UK", "a", "1", 300);
        assert_eq!(
            agg.window_key(&event),
            WindowKey::new("UK", window_start() + Duration::minutes(5))
        );
    }

    #[test]
    fn test_redelivery_is_not_double_counted() {
        let agg = aggregator();
        let event = tx("1", "UK", "a", "10.0", 5);
        let mut acc = WindowAggregate::new();

        assert_eq!(agg.fold(&mut acc, &event, 0, 0), FoldOutcome::Added);
        assert_eq!(agg.fold(&mut acc, &event, 0, 0), FoldOutcome::Duplicate);
        assert_eq!(agg.fold(&mut acc, &event, 0, 3), FoldOutcome::Duplicate);

        assert_eq!(acc.order_count(), 1);
        assert_eq!(acc.revenue_total(), Decimal::new(10, 0));
        assert_eq!(agg.rejected_count(), 0);
    }
}
