//! Cross-service transaction coordinator.
//!
//! This crate coordinates distributed transactions across participant
//! services using Saga and Two-Phase Commit semantics:
//!
//! 1. A caller initiates a transaction, idempotently per tenant and key
//! 2. Participants prepare, then commit, reporting back as they finish
//! 3. On failure the transaction rolls back, and compensating actions are
//!    recorded for every participant that had already done work
//!
//! Committed transactions enqueue an outbox message for at-least-once
//! delivery, and a lock table provides per-resource exclusive leases. The
//! coordinator performs no I/O of its own and runs no background tasks.

pub mod clock;
pub mod compensation;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod lock;
pub mod outbox;
pub mod publisher;
pub mod state;
mod store;
pub mod summary;
pub mod transaction;

pub use clock::{Clock, ManualClock, SystemClock};
pub use compensation::{CompensatingAction, CompensationRegistry};
pub use config::CoordinatorConfig;
pub use coordinator::TransactionCoordinator;
pub use error::{CoordinatorError, ErrorKind};
pub use events::TransactionEvent;
pub use lock::{LockTable, TransactionLock};
pub use outbox::{Outbox, OutboxMessage, OutboxPolicy, OutboxStatus};
pub use publisher::{EventPublisher, InMemoryEventPublisher};
pub use state::{ParticipantStatus, TransactionStatus};
pub use summary::{CoordinatorSummary, TransactionFilter};
pub use transaction::{
    DistributedTransaction, NewTransaction, ParticipantSpec, TransactionParticipant,
    TransactionType,
};
