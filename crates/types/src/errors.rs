//! Error types for the wire codec

use thiserror::Error;

/// Result type alias for codec operations
pub type Result<T> = std::result::Result<T, CodecError>;

/// Reasons a payload cannot become a [`crate::Transaction`] or aggregate
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid value for {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("negative quantity {quantity} on non-return invoice {invoice_no}")]
    NegativeQuantity { invoice_no: String, quantity: i64 },

    #[error("negative unit price {0}")]
    NegativeUnitPrice(String),

    #[error("total_amount {declared} does not match quantity x unit_price = {computed}")]
    TotalMismatch { declared: String, computed: String },
}

impl CodecError {
    /// Short label used for rejection counters
    pub fn reason(&self) -> &'static str {
        match self {
            CodecError::Malformed(_) => "malformed",
            CodecError::MissingField(_) => "missing_field",
            CodecError::InvalidField { .. } => "invalid_field",
            CodecError::NegativeQuantity { .. } => "negative_quantity",
            CodecError::NegativeUnitPrice(_) => "negative_unit_price",
            CodecError::TotalMismatch { .. } => "total_mismatch",
        }
    }
}

impl From<serde_json::Error> for CodecError {
    fn from(err: serde_json::Error) -> Self {
        CodecError::Malformed(err.to_string())
    }
}
