use chrono::{DateTime, Utc};
use retail_analytics_types::{
    average_order_value, event_digest, EventShare, LateOrigin, SealedAggregate, WindowKey,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Running totals for one open window
///
/// Every update is commutative: revenue is a sum and both the event map and
/// the customer set are sets, so the fold order inside a window never
/// matters. An event is folded at most once per idempotency key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowAggregate {
    events: BTreeMap<String, EventShare>,
    revenue_total: Decimal,
    customers: BTreeSet<String>,
}

impl WindowAggregate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one event; `false` if its key was folded before
    pub(crate) fn add(&mut self, idempotency_key: String, share: EventShare) -> bool {
        if self.events.contains_key(&idempotency_key) {
            return false;
        }
        self.revenue_total = self.revenue_total.saturating_add(share.total_amount);
        if !self.customers.contains(&share.customer_id) {
            self.customers.insert(share.customer_id.clone());
        }
        self.events.insert(idempotency_key, share);
        true
    }

    pub fn contains(&self, idempotency_key: &str) -> bool {
        self.events.contains_key(idempotency_key)
    }

    pub fn order_count(&self) -> u64 {
        self.events.len() as u64
    }

    pub fn revenue_total(&self) -> Decimal {
        self.revenue_total
    }

    pub fn distinct_customers(&self) -> u64 {
        self.customers.len() as u64
    }

    /// revenue_total / order_count, zero for an empty aggregate
    pub fn avg_order_value(&self) -> Decimal {
        average_order_value(self.revenue_total, self.order_count())
    }

    pub fn event_digest(&self) -> String {
        event_digest(self.events.keys().map(String::as_str))
    }

    /// Earliest broker position folded in
    pub fn first_position(&self) -> Option<LateOrigin> {
        self.events.values().map(EventShare::position).min()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Freeze into the immutable form handed to the writers
    pub fn seal(
        &self,
        key: &WindowKey,
        window_end: DateTime<Utc>,
        late: bool,
        sealed_at: DateTime<Utc>,
    ) -> SealedAggregate {
        SealedAggregate::from_events(key, window_end, late, self.events.clone(), sealed_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    const KEY_A: &str = "0000000000000000000000000000000a5f1e9b";
    const KEY_B: &str = "00000000000000000000000000000010ffffff";
    const KEY_C: &str = "00000000000000000000000000000001";

    fn share(amount: i64, customer: &str, offset: i64) -> EventShare {
        EventShare {
            total_amount: Decimal::new(amount, 0),
            customer_id: customer.to_string(),
            partition: 0,
            offset,
        }
    }

    #[test]
    fn test_empty_aggregate() {
        let agg = WindowAggregate::new();
        assert!(agg.is_empty());
        assert_eq!(agg.avg_order_value(), Decimal::ZERO);
        assert_eq!(agg.distinct_customers(), 0);
        assert_eq!(agg.first_position(), None);
    }

    #[test]
    fn test_distinct_customers_is_a_set() {
        let mut agg = WindowAggregate::new();
        agg.add(KEY_A.into(), share(10, "a", 0));
        agg.add(KEY_B.into(), share(5, "a", 1));
        agg.add(KEY_C.into(), share(1, "b", 2));
        assert_eq!(agg.order_count(), 3);
        assert_eq!(agg.distinct_customers(), 2);
        assert_eq!(agg.revenue_total(), Decimal::new(16, 0));
    }

    #[test]
    fn test_redelivered_event_is_folded_once() {
        let mut agg = WindowAggregate::new();
        assert!(agg.add(KEY_A.into(), share(10, "a", 4)));
        // Same event again, e.g. a producer retry landing at a later offset
        assert!(!agg.add(KEY_A.into(), share(10, "a", 9)));

        assert_eq!(agg.order_count(), 1);
        assert_eq!(agg.revenue_total(), Decimal::new(10, 0));
        assert!(agg.contains(KEY_A));
        assert_eq!(agg.first_position(), Some(LateOrigin { partition: 0, offset: 4 }));
    }

    #[test]
    fn test_avg_rounds_repeating_decimals() {
        let mut agg = WindowAggregate::new();
        agg.add(KEY_A.into(), share(10, "a", 0));
        agg.add(KEY_B.into(), share(0, "a", 1));
        agg.add(KEY_C.into(), share(0, "a", 2));
        assert_eq!(agg.avg_order_value(), Decimal::new(33333, 4));
    }

    #[test]
    fn test_event_digest_is_order_independent() {
        let mut forward = WindowAggregate::new();
        forward.add(KEY_A.into(), share(1, "a", 0));
        forward.add(KEY_B.into(), share(1, "b", 1));

        let mut backward = WindowAggregate::new();
        backward.add(KEY_B.into(), share(1, "b", 1));
        backward.add(KEY_A.into(), share(1, "a", 0));

        assert_eq!(forward.event_digest(), backward.event_digest());
        assert_eq!(forward.event_digest(), "0000000000000000000000000000001a");
    }

    #[test]
    fn test_seal_carries_key_and_late_flag() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let key = WindowKey::new("FR", start);
        let mut agg = WindowAggregate::new();
        agg.add(KEY_B.into(), share(20, "c1", 40));

        let sealed = agg.seal(&key, start + Duration::minutes(5), false, start);
        assert_eq!(sealed.partition_key, "FR");
        assert_eq!(sealed.order_count, 1);
        assert_eq!(sealed.avg_order_value, Decimal::new(20, 0));
        assert_eq!(sealed.event_keys(), vec![KEY_B.to_string()]);
        assert!(!sealed.late);

        let late = agg.seal(&key, start + Duration::minutes(5), true, start);
        assert!(late.late);
        assert_eq!(late.late_origin, Some(LateOrigin { partition: 0, offset: 40 }));
    }
}
