//! Open-window buffer owned by the coordinator loop
//!
//! Holds the accumulator of every open window, the late accumulators waiting
//! to be emitted, and the lowest broker offset each of them still depends on.

use chrono::{DateTime, Utc};
use retail_analytics_types::WindowKey;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::aggregation::WindowAggregate;
use crate::broker::TopicPartition;
use crate::watermark::Watermark;

/// Why a window left the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The watermark passed the window end
    Watermark,
    /// No event arrived for the partition key within the flush interval
    Idle,
    /// Shutdown drain
    Drain,
    /// Late accumulator emitted on a flush cycle
    Late,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Watermark => "watermark",
            CloseReason::Idle => "idle",
            CloseReason::Drain => "drain",
            CloseReason::Late => "late",
        }
    }
}

/// Where an event was folded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    OnTime,
    Late,
    /// Already folded into the window it maps to; only its offset is held
    Duplicate,
}

/// A window taken out of the buffer, ready to be sealed
#[derive(Debug, Clone)]
pub struct ClosedWindow {
    pub key: WindowKey,
    pub window_end: DateTime<Utc>,
    pub aggregate: WindowAggregate,
    /// Lowest offset per broker partition read for this window
    pub held_offsets: BTreeMap<TopicPartition, i64>,
    pub reason: CloseReason,
}

impl ClosedWindow {
    /// Built from events that arrived after the window was sealed
    pub fn is_late(&self) -> bool {
        self.reason == CloseReason::Late
    }
}

#[derive(Debug)]
struct BufferedWindow {
    aggregate: WindowAggregate,
    window_end: DateTime<Utc>,
    held_offsets: BTreeMap<TopicPartition, i64>,
}

impl BufferedWindow {
    fn new(window_end: DateTime<Utc>) -> Self {
        Self {
            aggregate: WindowAggregate::default(),
            window_end,
            held_offsets: BTreeMap::new(),
        }
    }

    fn hold(&mut self, tp: &TopicPartition, offset: i64) {
        self.held_offsets
            .entry(tp.clone())
            .and_modify(|held| *held = (*held).min(offset))
            .or_insert(offset);
    }

    fn close(self, key: WindowKey, reason: CloseReason) -> ClosedWindow {
        ClosedWindow {
            key,
            window_end: self.window_end,
            aggregate: self.aggregate,
            held_offsets: self.held_offsets,
            reason,
        }
    }
}

/// In-memory map of open and late windows
#[derive(Debug, Default)]
pub struct OpenWindows {
    open: BTreeMap<WindowKey, BufferedWindow>,
    late: BTreeMap<WindowKey, BufferedWindow>,
    last_activity: HashMap<String, Instant>,
    /// Windows closed by the idle timer before the watermark reached them
    sealed_early: HashMap<WindowKey, DateTime<Utc>>,
}

impl OpenWindows {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an event for `key` must go to a late accumulator
    pub fn is_late(&self, key: &WindowKey, window_end: DateTime<Utc>, watermark: Watermark) -> bool {
        watermark.has_passed(window_end) || self.sealed_early.contains_key(key)
    }

    /// Fold one event into the window it belongs to.
    ///
    /// `fold` adds the event to the window's accumulator and returns `false`
    /// when the accumulator already had it. The event's broker position is
    /// held until the window is written, duplicate or not.
    pub fn fold<F>(
        &mut self,
        key: WindowKey,
        window_end: DateTime<Utc>,
        watermark: Watermark,
        position: (&TopicPartition, i64),
        now: Instant,
        fold: F,
    ) -> Routed
    where
        F: FnOnce(&mut WindowAggregate) -> bool,
    {
        let (tp, offset) = position;
        let routed = if self.is_late(&key, window_end, watermark) {
            Routed::Late
        } else {
            Routed::OnTime
        };

        let map = match routed {
            Routed::OnTime => {
                self.last_activity.insert(key.partition_key.clone(), now);
                &mut self.open
            }
            Routed::Late => &mut self.late,
            Routed::Duplicate => unreachable!("routing is decided before folding"),
        };

        let window = map
            .entry(key)
            .or_insert_with(|| BufferedWindow::new(window_end));
        let added = fold(&mut window.aggregate);
        window.hold(tp, offset);

        if added {
            routed
        } else {
            Routed::Duplicate
        }
    }

    /// Remove every open window closed by the watermark or the idle timer
    pub fn drain_closed(
        &mut self,
        watermark: Watermark,
        now: Instant,
        flush_interval: Duration,
    ) -> Vec<ClosedWindow> {
        let idle_keys: Vec<String> = self
            .last_activity
            .iter()
            .filter(|(_, last)| now.saturating_duration_since(**last) >= flush_interval)
            .map(|(pk, _)| pk.clone())
            .collect();

        let closing: Vec<(WindowKey, CloseReason)> = self
            .open
            .iter()
            .filter_map(|(key, window)| {
                if watermark.has_passed(window.window_end) {
                    Some((key.clone(), CloseReason::Watermark))
                } else if idle_keys.contains(&key.partition_key) {
                    Some((key.clone(), CloseReason::Idle))
                } else {
                    None
                }
            })
            .collect();

        let mut closed = Vec::with_capacity(closing.len());
        for (key, reason) in closing {
            if let Some(window) = self.open.remove(&key) {
                if reason == CloseReason::Idle {
                    self.sealed_early.insert(key.clone(), window.window_end);
                }
                trace!(window = %key, reason = reason.as_str(), "window closed");
                closed.push(window.close(key, reason));
            }
        }

        for pk in idle_keys {
            if !self.open.keys().any(|key| key.partition_key == pk) {
                self.last_activity.remove(&pk);
            }
        }

        closed
    }

    /// Remove every late accumulator
    pub fn drain_late(&mut self) -> Vec<ClosedWindow> {
        std::mem::take(&mut self.late)
            .into_iter()
            .map(|(key, window)| window.close(key, CloseReason::Late))
            .collect()
    }

    /// Remove everything, regardless of closing policy
    pub fn drain_all(&mut self) -> Vec<ClosedWindow> {
        let mut closed: Vec<ClosedWindow> = std::mem::take(&mut self.open)
            .into_iter()
            .map(|(key, window)| window.close(key, CloseReason::Drain))
            .collect();
        closed.extend(self.drain_late());
        self.last_activity.clear();
        closed
    }

    /// Forget early-sealed windows the watermark has caught up with
    pub fn prune_sealed(&mut self, watermark: Watermark) -> usize {
        let before = self.sealed_early.len();
        self.sealed_early
            .retain(|_, window_end| !watermark.has_passed(*window_end));
        let pruned = before - self.sealed_early.len();
        if pruned > 0 {
            debug!(pruned, "released early-sealed windows");
        }
        pruned
    }

    /// Lowest held offset per broker partition across open and late windows
    pub fn held_offsets(&self) -> BTreeMap<TopicPartition, i64> {
        let mut held: BTreeMap<TopicPartition, i64> = BTreeMap::new();
        for window in self.open.values().chain(self.late.values()) {
            for (tp, offset) in &window.held_offsets {
                held.entry(tp.clone())
                    .and_modify(|min| *min = (*min).min(*offset))
                    .or_insert(*offset);
            }
        }
        held
    }

    pub fn open_len(&self) -> usize {
        self.open.len()
    }

    pub fn late_len(&self) -> usize {
        self.late.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty() && self.late.is_empty()
    }

    pub fn get(&self, key: &WindowKey) -> Option<&WindowAggregate> {
        self.open.get(key).map(|window| &window.aggregate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use retail_analytics_types::{EventShare, LateOrigin};
    use rust_decimal::Decimal;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()
    }

    fn end() -> DateTime<Utc> {
        start() + ChronoDuration::minutes(5)
    }

    fn tp(partition: i32) -> TopicPartition {
        TopicPartition::new("orders", partition)
    }

    /// Fold an event keyed by its customer id
    fn add(amount: i64, customer: &str) -> impl FnOnce(&mut WindowAggregate) -> bool + '_ {
        add_at(amount, customer, 0, 0)
    }

    fn add_at(amount: i64, customer: &str, partition: i32, offset: i64) -> impl FnOnce(&mut WindowAggregate) -> bool + '_ {
        move |agg| {
            agg.add(
                customer.to_string(),
                EventShare {
                    total_amount: Decimal::new(amount, 0),
                    customer_id: customer.to_string(),
                    partition,
                    offset,
                },
            )
        }
    }

    #[test]
    fn test_fold_and_watermark_close() {
        let mut buffer = OpenWindows::new();
        let now = Instant::now();
        let key = WindowKey::new("UK", start());

        let routed = buffer.fold(key.clone(), end(), Watermark::min(), (&tp(0), 7), now, add(10, "a"));
        assert_eq!(routed, Routed::OnTime);
        buffer.fold(key.clone(), end(), Watermark::min(), (&tp(0), 3), now, add(5, "b"));
        assert_eq!(buffer.get(&key).map(|a| a.order_count()), Some(2));
        assert_eq!(buffer.held_offsets()[&tp(0)], 3);

        let before_end = Watermark::from_datetime(end() - ChronoDuration::seconds(1));
        assert!(buffer
            .drain_closed(before_end, now, Duration::from_secs(60))
            .is_empty());

        let closed = buffer.drain_closed(Watermark::from_datetime(end()), now, Duration::from_secs(60));
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].reason, CloseReason::Watermark);
        assert_eq!(closed[0].aggregate.revenue_total(), Decimal::new(15, 0));
        assert!(!closed[0].is_late());
        assert!(buffer.is_empty());
        assert!(buffer.held_offsets().is_empty());
    }

    #[test]
    fn test_late_event_goes_to_late_accumulator() {
        let mut buffer = OpenWindows::new();
        let now = Instant::now();
        let key = WindowKey::new("UK", start());
        let watermark = Watermark::from_datetime(end() + ChronoDuration::minutes(1));

        let routed = buffer.fold(key.clone(), end(), watermark, (&tp(1), 42), now, add_at(8, "a", 1, 42));
        assert_eq!(routed, Routed::Late);
        buffer.fold(key.clone(), end(), watermark, (&tp(0), 50), now, add_at(2, "b", 0, 50));
        assert_eq!(buffer.open_len(), 0);
        assert_eq!(buffer.late_len(), 1);

        let late = buffer.drain_late();
        assert_eq!(late.len(), 1);
        assert_eq!(late[0].reason, CloseReason::Late);
        assert!(late[0].is_late());
        assert_eq!(late[0].aggregate.first_position(), Some(LateOrigin { partition: 0, offset: 50 }));
        assert_eq!(late[0].aggregate.order_count(), 2);
    }

    #[test]
    fn test_idle_flush_seals_key_early() {
        let mut buffer = OpenWindows::new();
        let t0 = Instant::now();
        let key = WindowKey::new("FR", start());
        buffer.fold(key.clone(), end(), Watermark::min(), (&tp(0), 1), t0, add(20, "c"));

        let flush = Duration::from_secs(60);
        assert!(buffer.drain_closed(Watermark::min(), t0 + Duration::from_secs(59), flush).is_empty());

        let closed = buffer.drain_closed(Watermark::min(), t0 + flush, flush);
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].reason, CloseReason::Idle);

        // A straggler for the same window no longer reopens it
        assert!(buffer.is_late(&key, end(), Watermark::min()));
        let routed = buffer.fold(key.clone(), end(), Watermark::min(), (&tp(0), 2), t0 + flush, add(1, "d"));
        assert_eq!(routed, Routed::Late);

        assert_eq!(buffer.prune_sealed(Watermark::from_datetime(end())), 1);
        assert!(!buffer.is_late(&key, end(), Watermark::min()));
    }

    #[test]
    fn test_idle_timer_is_per_partition_key() {
        let mut buffer = OpenWindows::new();
        let t0 = Instant::now();
        let flush = Duration::from_secs(60);
        buffer.fold(WindowKey::new("UK", start()), end(), Watermark::min(), (&tp(0), 1), t0, add(1, "a"));
        buffer.fold(
            WindowKey::new("FR", start()),
            end(),
            Watermark::min(),
            (&tp(0), 2),
            t0 + Duration::from_secs(30),
            add(1, "b"),
        );

        let closed = buffer.drain_closed(Watermark::min(), t0 + flush, flush);
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].key.partition_key, "UK");
        assert_eq!(buffer.open_len(), 1);
        assert_eq!(buffer.held_offsets()[&tp(0)], 2);
    }

    #[test]
    fn test_drain_all_empties_buffer() {
        let mut buffer = OpenWindows::new();
        let now = Instant::now();
        buffer.fold(WindowKey::new("UK", start()), end(), Watermark::min(), (&tp(0), 1), now, add(1, "a"));
        let late_wm = Watermark::from_datetime(end());
        buffer.fold(WindowKey::new("DE", start()), end(), late_wm, (&tp(1), 9), now, add(1, "b"));

        let closed = buffer.drain_all();
        assert_eq!(closed.len(), 2);
        assert!(closed.iter().any(|w| w.reason == CloseReason::Drain));
        assert!(closed.iter().any(|w| w.reason == CloseReason::Late));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_redelivered_event_is_held_but_not_refolded() {
        let mut buffer = OpenWindows::new();
        let now = Instant::now();
        let key = WindowKey::new("UK", start());

        let first = buffer.fold(key.clone(), end(), Watermark::min(), (&tp(0), 5), now, add(10, "a"));
        let again = buffer.fold(key.clone(), end(), Watermark::min(), (&tp(0), 2), now, add(10, "a"));
        assert_eq!(first, Routed::OnTime);
        assert_eq!(again, Routed::Duplicate);

        let aggregate = buffer.get(&key).unwrap();
        assert_eq!(aggregate.order_count(), 1);
        assert_eq!(aggregate.revenue_total(), Decimal::new(10, 0));
        assert_eq!(buffer.held_offsets()[&tp(0)], 2);
    }
}
