//! Error types for the aggregation pipeline
//!
//! Errors are classified by what the coordinator should do about them:
//! transient failures are retried with backoff, malformed input is dropped
//! and counted, and everything fatal stops the loop for an operator.

use retail_analytics_types::CodecError;
use thiserror::Error;

/// Main processor error type
#[derive(Error, Debug)]
pub enum ProcessorError {
    /// A required dependency stayed unreachable for the whole retry budget
    #[error("{component} unreachable after {attempts} attempts: {message}")]
    Connectivity {
        component: &'static str,
        attempts: u32,
        message: String,
    },

    /// A failure worth retrying (timeouts, dropped connections, broker hiccups)
    #[error("transient {component} failure: {source}")]
    Transient {
        component: &'static str,
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A payload that does not decode into a valid event
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// A store rejected an operation for a non-transient reason
    #[error("{backend} storage error: {details}")]
    Storage {
        backend: &'static str,
        details: String,
    },

    /// Configuration errors
    #[error("configuration error: {source}")]
    Configuration {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Serialization/deserialization errors
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal state no longer satisfies an invariant
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProcessorError {
    /// Wrap an error as retryable
    pub fn transient<E>(component: &'static str, err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        ProcessorError::Transient {
            component,
            source: err.into(),
        }
    }

    /// Build a configuration error from a message
    pub fn config(message: impl Into<String>) -> Self {
        ProcessorError::Configuration {
            source: message.into().into(),
        }
    }

    /// Whether retrying the same call may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, ProcessorError::Transient { .. })
    }

    /// Whether the coordinator must stop
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProcessorError::Connectivity { .. }
                | ProcessorError::Configuration { .. }
                | ProcessorError::Invariant(_)
        )
    }

    /// Escalate an exhausted retry into a connectivity failure
    pub fn into_connectivity(self, component: &'static str, attempts: u32) -> Self {
        match self {
            ProcessorError::Transient { source, .. } => ProcessorError::Connectivity {
                component,
                attempts,
                message: source.to_string(),
            },
            other => other,
        }
    }
}

impl From<serde_json::Error> for ProcessorError {
    fn from(err: serde_json::Error) -> Self {
        ProcessorError::Serialization(err.to_string())
    }
}

/// Result type for processor operations
pub type Result<T> = std::result::Result<T, ProcessorError>;
