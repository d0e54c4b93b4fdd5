//! Core types for the retail analytics pipeline
//!
//! This crate defines the transaction event published to the broker, the
//! window key and sealed aggregate emitted by the processor, and the JSON
//! codec shared by every component that touches the wire.

pub mod aggregates;
pub mod errors;
pub mod events;

pub use aggregates::{
    average_order_value, decode_aggregate, encode_aggregate, event_digest, EventShare, LateOrigin,
    PartitionKey, SealedAggregate, WindowKey,
};
pub use errors::{CodecError, Result};
pub use events::{
    decode_transaction, decode_transaction_at, encode_transaction, max_total_amount, Transaction,
};
