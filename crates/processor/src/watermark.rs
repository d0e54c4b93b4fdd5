//! Event-time watermark tracking
//!
//! The watermark is the largest event time seen so far minus the allowed
//! lateness. A window whose end is at or before the watermark is closed, and
//! any event that still maps to it is late.
//!
//! ```text
//! max event time        12:07:40
//! allowed lateness         00:30
//! watermark             12:07:10   -> windows ending <= 12:07:10 close
//! ```

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// A point in event time, in milliseconds since the epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Watermark {
    pub timestamp: i64,
}

impl Watermark {
    pub fn new(timestamp: i64) -> Self {
        Self { timestamp }
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self {
            timestamp: dt.timestamp_millis(),
        }
    }

    /// The watermark before any event has been seen
    pub fn min() -> Self {
        Self { timestamp: i64::MIN }
    }

    pub fn is_min(&self) -> bool {
        self.timestamp == i64::MIN
    }

    /// `None` for the minimum watermark or an out-of-range timestamp
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        if self.is_min() {
            return None;
        }
        Utc.timestamp_millis_opt(self.timestamp).single()
    }

    /// Whether everything up to `end` (exclusive) is behind this watermark
    pub fn has_passed(&self, end: DateTime<Utc>) -> bool {
        end.timestamp_millis() <= self.timestamp
    }
}

impl Default for Watermark {
    fn default() -> Self {
        Self::min()
    }
}

impl std::fmt::Display for Watermark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.to_datetime() {
            Some(dt) => write!(f, "Watermark({})", dt.to_rfc3339()),
            None => write!(f, "Watermark(-inf)"),
        }
    }
}

/// Tracks the largest event time seen and the watermark trailing it.
///
/// Event times come from every broker partition the consumer reads; the
/// watermark is global to the coordinator.
#[derive(Debug, Clone)]
pub struct WatermarkTracker {
    allowed_lateness: Duration,
    max_event_time: Option<i64>,
    current: Watermark,
}

impl WatermarkTracker {
    pub fn new(allowed_lateness: Duration) -> Self {
        Self {
            allowed_lateness,
            max_event_time: None,
            current: Watermark::min(),
        }
    }

    /// Record an event time; returns the new watermark if it advanced.
    ///
    /// The watermark never moves backwards.
    pub fn observe(&mut self, event_time: DateTime<Utc>) -> Option<Watermark> {
        let ts = event_time.timestamp_millis();
        if self.max_event_time.is_some_and(|max| ts <= max) {
            return None;
        }

        self.max_event_time = Some(ts);
        let candidate = Watermark::new(ts.saturating_sub(self.allowed_lateness.num_milliseconds()));
        if candidate > self.current {
            trace!(watermark = candidate.timestamp, "watermark advanced");
            self.current = candidate;
            return Some(candidate);
        }
        None
    }

    pub fn current(&self) -> Watermark {
        self.current
    }
}
