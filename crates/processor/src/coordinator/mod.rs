//! Pipeline coordinator
//!
//! A single sequential loop per process:
//!
//! ```text
//!  IDLE ──start──▶ POLLING ──batch──▶ AGGREGATING ──▶ FLUSHING ──▶ COMMITTING ─┐
//!                    ▲   │ empty: idle sleep                │ durable failure   │
//!                    │   └──────────────────────────────────┤ (commit withheld) │
//!                    └──────────────────────────────────────┴───────────────────┘
//!  shutdown ──▶ DRAINING ──▶ STOPPED
//! ```
//!
//! Every sealed aggregate is written to the durable store before any offset
//! it depends on is committed. Counter-store failures are logged and never
//! hold back a commit.

mod offsets;
mod runner;
mod state;

pub use runner::PipelineCoordinator;
pub use state::{CoordinatorState, CoordinatorStats};
