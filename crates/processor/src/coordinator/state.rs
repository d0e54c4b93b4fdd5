//! Coordinator lifecycle states and counters

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where the coordinator loop is.
///
/// ```text
/// Idle -> Polling -> Aggregating -> Flushing -> Committing -> Polling ...
///                                   shutdown -> Draining -> Stopped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinatorState {
    Idle,
    Polling,
    Aggregating,
    Flushing,
    Committing,
    Draining,
    Stopped,
}

impl CoordinatorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoordinatorState::Idle => "IDLE",
            CoordinatorState::Polling => "POLLING",
            CoordinatorState::Aggregating => "AGGREGATING",
            CoordinatorState::Flushing => "FLUSHING",
            CoordinatorState::Committing => "COMMITTING",
            CoordinatorState::Draining => "DRAINING",
            CoordinatorState::Stopped => "STOPPED",
        }
    }

    /// Lifecycle states are logged at info, loop states at trace
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            CoordinatorState::Idle | CoordinatorState::Draining | CoordinatorState::Stopped
        )
    }
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of coordinator counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorStats {
    pub state: CoordinatorState,
    /// Records taken from the broker, decodable or not
    pub events_consumed: u64,
    /// Events folded into an on-time or late aggregate
    pub events_folded: u64,
    pub events_rejected: u64,
    pub events_late: u64,
    /// Re-read events already folded into their window
    pub events_duplicate: u64,
    pub windows_sealed: u64,
    pub durable_written: u64,
    pub durable_skipped: u64,
    /// Aggregates partly written as late rows because the stored row lacked their events
    pub durable_diverted: u64,
    pub durable_failures: u64,
    pub counter_applied: u64,
    pub counter_duplicates: u64,
    pub counter_failures: u64,
    pub commits: u64,
    pub idle_polls: u64,
    pub batch_failures: u64,
    pub open_windows: usize,
    pub pending_writes: usize,
    pub watermark: Option<DateTime<Utc>>,
}

impl Default for CoordinatorStats {
    fn default() -> Self {
        Self {
            state: CoordinatorState::Idle,
            events_consumed: 0,
            events_folded: 0,
            events_rejected: 0,
            events_late: 0,
            events_duplicate: 0,
            windows_sealed: 0,
            durable_written: 0,
            durable_skipped: 0,
            durable_diverted: 0,
            durable_failures: 0,
            counter_applied: 0,
            counter_duplicates: 0,
            counter_failures: 0,
            commits: 0,
            idle_polls: 0,
            batch_failures: 0,
            open_windows: 0,
            pending_writes: 0,
            watermark: None,
        }
    }
}
