//! Window keys and the sealed aggregate wire form

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::errors::Result;
use crate::events::Transaction;

/// Dimension aggregates are grouped by inside a window
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PartitionKey {
    #[default]
    Country,
    StockCode,
    CustomerId,
}

impl PartitionKey {
    /// Value of this dimension for a transaction
    pub fn extract<'a>(&self, tx: &'a Transaction) -> &'a str {
        match self {
            PartitionKey::Country => &tx.country,
            PartitionKey::StockCode => &tx.stock_code,
            PartitionKey::CustomerId => &tx.customer_id,
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionKey::Country => write!(f, "country"),
            PartitionKey::StockCode => write!(f, "stock_code"),
            PartitionKey::CustomerId => write!(f, "customer_id"),
        }
    }
}

/// Identity of one aggregation bucket
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WindowKey {
    /// Grouping value, e.g. a country name
    pub partition_key: String,
    /// Inclusive start of the window
    pub window_start: DateTime<Utc>,
}

impl WindowKey {
    pub fn new(partition_key: impl Into<String>, window_start: DateTime<Utc>) -> Self {
        Self {
            partition_key: partition_key.into(),
            window_start,
        }
    }

    /// Exclusive end of the window for a given window length
    pub fn window_end(&self, window_length: Duration) -> DateTime<Utc> {
        self.window_start
            .checked_add_signed(window_length)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

impl fmt::Display for WindowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.partition_key, self.window_start.to_rfc3339())
    }
}

/// Broker position of the first event folded into a late aggregate.
///
/// Late rows are stored separately from on-time rows and keyed by this
/// origin so repeated flushes of different late batches never overwrite
/// each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LateOrigin {
    pub partition: i32,
    pub offset: i64,
}

/// What one folded event contributed to an aggregate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventShare {
    pub total_amount: Decimal,
    pub customer_id: String,
    /// Broker partition the event was read from
    pub partition: i32,
    pub offset: i64,
}

impl EventShare {
    pub fn position(&self) -> LateOrigin {
        LateOrigin {
            partition: self.partition,
            offset: self.offset,
        }
    }
}

/// Order-independent digest of a set of idempotency keys.
///
/// Wrapping sum of the leading 128 bits of each hex key.
pub fn event_digest<'a>(keys: impl IntoIterator<Item = &'a str>) -> String {
    let sum = keys.into_iter().fold(0u128, |sum, key| {
        let prefix = key.get(..32).unwrap_or(key);
        sum.wrapping_add(u128::from_str_radix(prefix, 16).unwrap_or(0))
    });
    format!("{sum:032x}")
}

/// revenue / orders rounded to 4 places, zero for no orders
pub fn average_order_value(revenue: Decimal, orders: u64) -> Decimal {
    if orders == 0 {
        return Decimal::ZERO;
    }
    (revenue / Decimal::from(orders)).round_dp(4)
}

/// Immutable aggregate emitted when a window closes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedAggregate {
    pub partition_key: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub order_count: u64,
    pub revenue_total: Decimal,
    pub distinct_customers: u64,
    pub avg_order_value: Decimal,
    /// Built from events that arrived after their window closed
    #[serde(default)]
    pub late: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub late_origin: Option<LateOrigin>,
    /// Order-independent digest of the folded events' idempotency keys
    #[serde(default)]
    pub event_digest: String,
    pub sealed_at: DateTime<Utc>,
    /// Every folded event by idempotency key
    #[serde(default)]
    pub events: BTreeMap<String, EventShare>,
}

impl SealedAggregate {
    /// Seal a set of events.
    ///
    /// A late aggregate takes the earliest broker position among its events
    /// as its origin.
    pub fn from_events(
        key: &WindowKey,
        window_end: DateTime<Utc>,
        late: bool,
        events: BTreeMap<String, EventShare>,
        sealed_at: DateTime<Utc>,
    ) -> Self {
        let order_count = events.len() as u64;
        let revenue_total = events
            .values()
            .fold(Decimal::ZERO, |sum, share| sum.saturating_add(share.total_amount));
        let customers: BTreeSet<&str> = events.values().map(|s| s.customer_id.as_str()).collect();
        let late_origin = if late {
            events.values().map(EventShare::position).min()
        } else {
            None
        };

        Self {
            partition_key: key.partition_key.clone(),
            window_start: key.window_start,
            window_end,
            order_count,
            revenue_total,
            distinct_customers: customers.len() as u64,
            avg_order_value: average_order_value(revenue_total, order_count),
            late,
            late_origin,
            event_digest: event_digest(events.keys().map(String::as_str)),
            sealed_at,
            events,
        }
    }

    /// Idempotency keys of the folded events, sorted
    pub fn event_keys(&self) -> Vec<String> {
        self.events.keys().cloned().collect()
    }

    /// The events of this aggregate not in `known`, sealed the same way.
    ///
    /// `None` when every event is already known.
    pub fn without_events(&self, known: &BTreeSet<String>) -> Option<SealedAggregate> {
        let rest: BTreeMap<String, EventShare> = self
            .events
            .iter()
            .filter(|(key, _)| !known.contains(*key))
            .map(|(key, share)| (key.clone(), share.clone()))
            .collect();
        if rest.is_empty() {
            return None;
        }
        Some(Self::from_events(&self.key(), self.window_end, self.late, rest, self.sealed_at))
    }

    /// The same events as a late aggregate
    pub fn into_late(self) -> SealedAggregate {
        let key = self.key();
        Self::from_events(&key, self.window_end, true, self.events, self.sealed_at)
    }

    pub fn key(&self) -> WindowKey {
        WindowKey::new(self.partition_key.clone(), self.window_start)
    }

    /// Content hash; equal for two seals of the same events
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.partition_key.as_bytes());
        hasher.update(self.window_start.timestamp_millis().to_be_bytes());
        hasher.update(self.window_end.timestamp_millis().to_be_bytes());
        hasher.update(self.order_count.to_be_bytes());
        hasher.update(self.revenue_total.normalize().to_string().as_bytes());
        hasher.update(self.distinct_customers.to_be_bytes());
        hasher.update([u8::from(self.late)]);
        hasher.update(self.event_digest.as_bytes());
        if let Some(origin) = self.late_origin {
            hasher.update(origin.partition.to_be_bytes());
            hasher.update(origin.offset.to_be_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

/// Encode a sealed aggregate as JSON
pub fn encode_aggregate(aggregate: &SealedAggregate) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(aggregate)?)
}

/// Decode a sealed aggregate from JSON
pub fn decode_aggregate(payload: &[u8]) -> Result<SealedAggregate> {
    Ok(serde_json::from_slice(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn share(amount: i64, customer: &str, offset: i64) -> EventShare {
        EventShare {
            total_amount: Decimal::new(amount, 0),
            customer_id: customer.to_string(),
            partition: 0,
            offset,
        }
    }

    fn sample() -> SealedAggregate {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        SealedAggregate {
            partition_key: "United Kingdom".into(),
            window_start: start,
            window_end: start + Duration::minutes(5),
            order_count: 2,
            revenue_total: Decimal::new(1500, 2),
            distinct_customers: 2,
            avg_order_value: Decimal::new(750, 2),
            late: false,
            late_origin: None,
            event_digest: "00000000000000000000000000000abc".into(),
            sealed_at: start + Duration::minutes(6),
            events: BTreeMap::new(),
        }
    }

    #[test]
    fn test_partition_key_extract() {
        let tx = Transaction::new("1", "85123A", "17850", "France", 1, Decimal::ONE, Utc::now());
        assert_eq!(PartitionKey::Country.extract(&tx), "France");
        assert_eq!(PartitionKey::StockCode.extract(&tx), "85123A");
        assert_eq!(PartitionKey::CustomerId.extract(&tx), "17850");
        assert_eq!(PartitionKey::default(), PartitionKey::Country);
    }

    #[test]
    fn test_window_key_ordering_and_end() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let a = WindowKey::new("FR", start);
        let b = WindowKey::new("FR", start + Duration::minutes(5));
        let c = WindowKey::new("UK", start);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(a.window_end(Duration::minutes(5)), b.window_start);
        assert_eq!(a.to_string(), "FR@2024-03-01T10:00:00+00:00");
    }

    #[test]
    fn test_aggregate_json_keeps_exact_decimals() {
        let aggregate = sample();
        let bytes = encode_aggregate(&aggregate).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["revenue_total"], "15.00");
        assert!(json.get("late_origin").is_none());
        assert_eq!(decode_aggregate(&bytes).unwrap(), aggregate);
    }

    #[test]
    fn test_decode_aggregate_rejects_garbage() {
        assert_eq!(decode_aggregate(b"{}").unwrap_err().reason(), "malformed");
    }

    #[test]
    fn test_fingerprint_tracks_content_not_seal_time() {
        let a = sample();
        let mut b = sample();
        b.sealed_at = b.sealed_at + Duration::hours(1);
        b.revenue_total = Decimal::new(15, 0);
        assert_eq!(a.fingerprint(), b.fingerprint());

        let mut c = sample();
        c.order_count = 3;
        assert_ne!(a.fingerprint(), c.fingerprint());

        let mut d = sample();
        d.late = true;
        d.late_origin = Some(LateOrigin { partition: 0, offset: 7 });
        assert_ne!(a.fingerprint(), d.fingerprint());

        let mut e = sample();
        e.event_digest = "00000000000000000000000000000abd".into();
        assert_ne!(a.fingerprint(), e.fingerprint());
    }

    #[test]
    fn test_from_events_totals_and_origin() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let key = WindowKey::new("UK", start);
        let events = BTreeMap::from([
            ("0a".to_string(), share(10, "a", 7)),
            ("0b".to_string(), share(5, "a", 3)),
            ("10".to_string(), share(15, "b", 9)),
        ]);

        let on_time = SealedAggregate::from_events(&key, start + Duration::minutes(5), false, events.clone(), start);
        assert_eq!(on_time.order_count, 3);
        assert_eq!(on_time.revenue_total, Decimal::new(30, 0));
        assert_eq!(on_time.distinct_customers, 2);
        assert_eq!(on_time.avg_order_value, Decimal::new(10, 0));
        assert_eq!(on_time.event_digest, "00000000000000000000000000000025");
        assert_eq!(on_time.late_origin, None);

        let late = on_time.into_late();
        assert!(late.late);
        assert_eq!(late.late_origin, Some(LateOrigin { partition: 0, offset: 3 }));
    }

    #[test]
    fn test_without_events_keeps_only_unknown() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let key = WindowKey::new("UK", start);
        let events = BTreeMap::from([
            ("0a".to_string(), share(10, "a", 1)),
            ("0b".to_string(), share(5, "b", 2)),
        ]);
        let aggregate = SealedAggregate::from_events(&key, start + Duration::minutes(5), true, events, start);

        let known = BTreeSet::from(["0a".to_string()]);
        let rest = aggregate.without_events(&known).unwrap();
        assert_eq!(rest.order_count, 1);
        assert_eq!(rest.revenue_total, Decimal::new(5, 0));
        assert_eq!(rest.event_keys(), vec!["0b".to_string()]);
        assert_eq!(rest.late_origin, Some(LateOrigin { partition: 0, offset: 2 }));

        let all: BTreeSet<String> = aggregate.event_keys().into_iter().collect();
        assert!(aggregate.without_events(&all).is_none());
    }

    #[test]
    fn test_average_order_value_rounds() {
        assert_eq!(average_order_value(Decimal::new(10, 0), 3), Decimal::new(33333, 4));
        assert_eq!(average_order_value(Decimal::new(10, 0), 0), Decimal::ZERO);
    }
}
