//! Windowing for the aggregation pipeline
//!
//! Transactions are grouped into fixed-size, non-overlapping (tumbling)
//! windows aligned to the epoch:
//!
//! ```text
//! Time:     0----5----10---15---20---25---30
//! Windows:  [----][----][----][----][----]
//! ```
//!
//! A window is open until either the watermark passes its end or its
//! partition key has been idle for the flush interval. Events that arrive for
//! a window after it closed are folded into a separate late accumulator.
//!
//! # Example
//!
//! ```rust
//! use chrono::{Duration, TimeZone, Utc};
//! use processor::window::TumblingWindowAssigner;
//!
//! let assigner = TumblingWindowAssigner::new(Duration::minutes(5));
//! let bounds = assigner.assign(Utc.with_ymd_and_hms(2024, 1, 1, 12, 3, 10).unwrap());
//! assert_eq!(bounds.start, Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap());
//! ```

mod assigner;
mod buffer;
mod types;

pub use assigner::TumblingWindowAssigner;
pub use buffer::{ClosedWindow, CloseReason, OpenWindows, Routed};
pub use types::WindowBounds;
