//! Window bounds

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use retail_analytics_types::WindowKey;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Half-open time range `[start, end)` of one tumbling window.
///
/// Field order makes the derived ordering sort by start first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WindowBounds {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl WindowBounds {
    /// Window of `length` starting at `start`; the end saturates at the
    /// largest representable time.
    pub fn new(start: DateTime<Utc>, length: Duration) -> Self {
        Self {
            start,
            end: start
                .checked_add_signed(length)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    pub fn length(&self) -> Duration {
        self.end - self.start
    }

    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        self.start <= timestamp && timestamp < self.end
    }

    /// Identity of this window for one partition key
    pub fn key(&self, partition_key: impl Into<String>) -> WindowKey {
        WindowKey::new(partition_key, self.start)
    }
}

impl fmt::Display for WindowBounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {})",
            self.start.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.end.to_rfc3339_opts(SecondsFormat::Secs, true)
        )
    }
}
