//! Coordinator error types.

use common::TransactionId;
use thiserror::Error;

use crate::state::{ParticipantStatus, TransactionStatus};

/// Errors returned by coordinator operations.
///
/// None of these are panics: unknown ids, illegal transitions and lock
/// contention are normal outcomes that callers are expected to inspect.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// No transaction with this id exists.
    #[error("Transaction not found: {0}")]
    TransactionNotFound(TransactionId),

    /// The transaction has no participant with this service id.
    #[error("Participant '{service_id}' not found in transaction {transaction_id}")]
    ParticipantNotFound {
        transaction_id: TransactionId,
        service_id: String,
    },

    /// The requested operation is not legal from the transaction's current status.
    #[error("Cannot {operation} transaction {transaction_id} in state {actual}")]
    InvalidState {
        transaction_id: TransactionId,
        operation: &'static str,
        actual: TransactionStatus,
    },

    /// The participant would move backwards or out of a final status.
    #[error("Participant '{service_id}' cannot move from {from} to {to}")]
    InvalidParticipantTransition {
        service_id: String,
        from: ParticipantStatus,
        to: ParticipantStatus,
    },

    /// Another transaction holds a live lock on the resource.
    #[error("Resource '{resource_id}' of tenant '{tenant_id}' is locked by transaction {holder}")]
    LockContended {
        resource_id: String,
        tenant_id: String,
        holder: TransactionId,
    },

    /// The caller does not hold the lock it tried to release.
    #[error("Transaction {transaction_id} does not hold a lock on resource '{resource_id}'")]
    LockNotHeld {
        resource_id: String,
        transaction_id: TransactionId,
    },

    /// An outbox publisher failed to deliver a message.
    #[error("Publish failed: {0}")]
    Publish(String),
}

/// Coarse classification of a [`CoordinatorError`].
///
/// Lets an outer layer map not-found and invalid-state to client errors
/// without matching every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    InvalidState,
    Contention,
    Delivery,
}

impl CoordinatorError {
    /// Returns the coarse kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoordinatorError::TransactionNotFound(_)
            | CoordinatorError::ParticipantNotFound { .. }
            | CoordinatorError::LockNotHeld { .. } => ErrorKind::NotFound,
            CoordinatorError::InvalidState { .. }
            | CoordinatorError::InvalidParticipantTransition { .. } => ErrorKind::InvalidState,
            CoordinatorError::LockContended { .. } => ErrorKind::Contention,
            CoordinatorError::Publish(_) => ErrorKind::Delivery,
        }
    }

    /// Returns true for unknown transactions, participants or lock holders.
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Returns true for transitions that are illegal from the current status.
    pub fn is_invalid_state(&self) -> bool {
        self.kind() == ErrorKind::InvalidState
    }
}

/// Convenience type alias for coordinator results.
pub type Result<T> = std::result::Result<T, CoordinatorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        let id = TransactionId::new();

        assert_eq!(
            CoordinatorError::TransactionNotFound(id).kind(),
            ErrorKind::NotFound
        );
        assert!(
            CoordinatorError::ParticipantNotFound {
                transaction_id: id,
                service_id: "billing".into(),
            }
            .is_not_found()
        );
        assert!(
            CoordinatorError::InvalidState {
                transaction_id: id,
                operation: "prepare",
                actual: TransactionStatus::Committed,
            }
            .is_invalid_state()
        );
        assert_eq!(
            CoordinatorError::LockContended {
                resource_id: "r1".into(),
                tenant_id: "t1".into(),
                holder: id,
            }
            .kind(),
            ErrorKind::Contention
        );
        assert_eq!(
            CoordinatorError::Publish("broker down".into()).kind(),
            ErrorKind::Delivery
        );
    }

    #[test]
    fn test_invalid_state_message() {
        let id = TransactionId::new();
        let err = CoordinatorError::InvalidState {
            transaction_id: id,
            operation: "prepare",
            actual: TransactionStatus::Committed,
        };
        assert_eq!(
            err.to_string(),
            format!("Cannot prepare transaction {id} in state committed")
        );
    }
}
