//! Label sets for pipeline metrics

use prometheus_client::encoding::EncodeLabelSet;
use std::fmt;

/// Outcome of a store call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultLabel {
    /// Durable row written
    Written,
    /// Durable row already reflected the aggregate
    Skipped,
    /// Events missing from the durable row were written as a late row
    Diverted,
    /// Counter increments applied
    Applied,
    /// Counter apply marker already claimed
    Duplicate,
    /// Retries exhausted or a non-transient error
    Failure,
}

impl ResultLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultLabel::Written => "written",
            ResultLabel::Skipped => "skipped",
            ResultLabel::Diverted => "diverted",
            ResultLabel::Applied => "applied",
            ResultLabel::Duplicate => "duplicate",
            ResultLabel::Failure => "failure",
        }
    }
}

impl fmt::Display for ResultLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `result="..."`
#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
pub struct ResultLabels {
    pub result: String,
}

impl From<ResultLabel> for ResultLabels {
    fn from(label: ResultLabel) -> Self {
        Self {
            result: label.as_str().to_string(),
        }
    }
}

/// `reason="..."`
#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
pub struct ReasonLabels {
    pub reason: String,
}

impl ReasonLabels {
    pub fn new(reason: &str) -> Self {
        Self {
            reason: reason.to_string(),
        }
    }
}
