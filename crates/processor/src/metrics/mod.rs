//! Prometheus metrics for the aggregation pipeline
//!
//! [`PipelineMetrics`] holds every counter and gauge the coordinator updates.
//! Register it once into a [`MetricsRegistry`] and, optionally, expose the
//! registry over HTTP with [`MetricsServer`].

mod labels;
mod pipeline;
mod registry;
mod server;

pub use labels::{ReasonLabels, ResultLabel, ResultLabels};
pub use pipeline::PipelineMetrics;
pub use registry::MetricsRegistry;
pub use server::{HealthStatus, MetricsServer, MetricsServerConfig};

use thiserror::Error;

/// Failures of the metrics endpoint
#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("metrics endpoint failed: {0}")]
    Serve(String),

    #[error("cannot bind metrics endpoint to {address}: {source}")]
    BindError {
        address: String,
        source: std::io::Error,
    },

    #[error("invalid metrics address {0:?}, expected host:port")]
    InvalidAddress(String),

    #[error("cannot encode metrics: {0}")]
    EncodingError(String),
}
