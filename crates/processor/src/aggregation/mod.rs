//! Window aggregation
//!
//! [`WindowAggregator::fold`] adds one transaction to an accumulator the
//! caller owns. It performs no I/O and keeps no per-window state, so the
//! coordinator stays the only owner of open windows. Accumulators remember
//! each event's idempotency key, so a redelivered event is folded once.
//!
//! ```rust
//! use chrono::{Duration, TimeZone, Utc};
//! use processor::aggregation::{FoldOutcome, WindowAggregate, WindowAggregator};
//! use processor::window::TumblingWindowAssigner;
//! use retail_analytics_types::{PartitionKey, Transaction};
//! use rust_decimal::Decimal;
//!
//! let aggregator = WindowAggregator::new(
//!     PartitionKey::Country,
//!     TumblingWindowAssigner::new(Duration::minutes(5)),
//! );
//! let ts = Utc.with_ymd_and_hms(2024, 1, 1, 12, 1, 0).unwrap();
//! let a = Transaction::new("1", "A1", "c1", "UK", 2, Decimal::new(5, 0), ts);
//! let b = Transaction::new("2", "A1", "c2", "UK", 1, Decimal::new(5, 0), ts);
//!
//! let mut acc = WindowAggregate::new();
//! aggregator.fold(&mut acc, &a, 0, 0);
//! aggregator.fold(&mut acc, &b, 0, 1);
//! assert_eq!(aggregator.fold(&mut acc, &b, 0, 1), FoldOutcome::Duplicate);
//! assert_eq!(acc.order_count(), 2);
//! assert_eq!(acc.revenue_total(), Decimal::new(15, 0));
//! ```

mod accumulator;
mod aggregator;

pub use accumulator::WindowAggregate;
pub use aggregator::{FoldOutcome, RejectReason, RejectionCounter, WindowAggregator};
