//! Shared types for the transaction coordinator workspace.

pub mod types;

pub use types::{CompensationId, MessageId, Payload, TransactionId};
