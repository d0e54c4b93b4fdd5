//! Tumbling window assignment

use super::types::WindowBounds;
use chrono::{DateTime, Duration, TimeZone, Utc};

/// Tumbling window assigner
///
/// Creates fixed-size, non-overlapping windows aligned to the epoch. Each
/// event is assigned to exactly one window.
///
/// ```text
/// Window size: 5 minutes
/// Event at 12:03:10 -> Window [12:00, 12:05)
/// Event at 12:05:00 -> Window [12:05, 12:10)
/// ```
#[derive(Debug, Clone)]
pub struct TumblingWindowAssigner {
    size: Duration,
}

impl TumblingWindowAssigner {
    /// Create a new tumbling window assigner.
    ///
    /// Sizes below one millisecond are raised to one millisecond.
    pub fn new(size: Duration) -> Self {
        Self {
            size: size.max(Duration::milliseconds(1)),
        }
    }

    pub fn size(&self) -> Duration {
        self.size
    }

    /// floor(timestamp, size)
    pub fn window_start(&self, timestamp: DateTime<Utc>) -> DateTime<Utc> {
        let ts_millis = timestamp.timestamp_millis();
        let size_millis = self.size.num_milliseconds();
        let aligned = ts_millis - ts_millis.rem_euclid(size_millis);

        Utc.timestamp_millis_opt(aligned).single().unwrap_or(timestamp)
    }

    /// The one window containing `timestamp`
    pub fn assign(&self, timestamp: DateTime<Utc>) -> WindowBounds {
        WindowBounds::new(self.window_start(timestamp), self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(millis).unwrap()
    }

    #[test]
    fn test_tumbling_alignment() {
        let assigner = TumblingWindowAssigner::new(Duration::milliseconds(1000));

        let bounds = assigner.assign(ts(500));
        assert_eq!(bounds.start, ts(0));
        assert_eq!(bounds.end, ts(1000));

        let bounds = assigner.assign(ts(1000));
        assert_eq!(bounds.start, ts(1000));

        let bounds = assigner.assign(ts(1999));
        assert_eq!(bounds.start, ts(1000));
        assert!(bounds.contains(ts(1999)));
    }

    #[test]
    fn test_negative_timestamps_floor_downwards() {
        let assigner = TumblingWindowAssigner::new(Duration::milliseconds(1000));
        assert_eq!(assigner.window_start(ts(-1)), ts(-1000));
        assert_eq!(assigner.window_start(ts(-1000)), ts(-1000));
    }

    #[test]
    fn test_five_minute_windows() {
        let assigner = TumblingWindowAssigner::new(Duration::minutes(5));
        let event = Utc.with_ymd_and_hms(2010, 12, 1, 8, 26, 0).unwrap();
        let bounds = assigner.assign(event);
        assert_eq!(bounds.start, Utc.with_ymd_and_hms(2010, 12, 1, 8, 25, 0).unwrap());
        assert_eq!(bounds.end, Utc.with_ymd_and_hms(2010, 12, 1, 8, 30, 0).unwrap());
    }

    #[test]
    fn test_zero_size_is_clamped() {
        let assigner = TumblingWindowAssigner::new(Duration::zero());
        assert_eq!(assigner.size(), Duration::milliseconds(1));
    }
}
