//! Transaction audit events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A state transition recorded in a transaction's history.
///
/// Transactions are retained for audit, and this log is what an auditor
/// reads: every operation that changes a transaction appends exactly one
/// event, plus one more when the change completes an aggregate transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum TransactionEvent {
    /// Transaction created.
    Initiated { at: DateTime<Utc> },

    /// Prepare round started.
    PrepareStarted { at: DateTime<Utc> },

    /// A participant acknowledged prepare.
    ParticipantPrepared {
        service_id: String,
        at: DateTime<Utc>,
    },

    /// Every participant prepared.
    Prepared { at: DateTime<Utc> },

    /// Commit round started.
    CommitStarted { at: DateTime<Utc> },

    /// A participant acknowledged commit.
    ParticipantCommitted {
        service_id: String,
        at: DateTime<Utc>,
    },

    /// Every participant committed.
    Committed { at: DateTime<Utc> },

    /// Rollback requested; `compensations` actions were generated.
    RollbackStarted {
        reason: String,
        compensations: usize,
        at: DateTime<Utc>,
    },

    /// A participant acknowledged its compensation.
    ParticipantRolledBack {
        service_id: String,
        at: DateTime<Utc>,
    },

    /// Every required compensation was acknowledged.
    RolledBack { at: DateTime<Utc> },

    /// A participant reported an error.
    ParticipantFailed {
        service_id: String,
        error: String,
        retry_count: u32,
        at: DateTime<Utc>,
    },

    /// Transaction could not be completed or compensated.
    Failed { reason: String, at: DateTime<Utc> },

    /// Marked by the timeout scanner.
    TimedOut { at: DateTime<Utc> },
}

impl TransactionEvent {
    /// Returns the event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            TransactionEvent::Initiated { .. } => "Initiated",
            TransactionEvent::PrepareStarted { .. } => "PrepareStarted",
            TransactionEvent::ParticipantPrepared { .. } => "ParticipantPrepared",
            TransactionEvent::Prepared { .. } => "Prepared",
            TransactionEvent::CommitStarted { .. } => "CommitStarted",
            TransactionEvent::ParticipantCommitted { .. } => "ParticipantCommitted",
            TransactionEvent::Committed { .. } => "Committed",
            TransactionEvent::RollbackStarted { .. } => "RollbackStarted",
            TransactionEvent::ParticipantRolledBack { .. } => "ParticipantRolledBack",
            TransactionEvent::RolledBack { .. } => "RolledBack",
            TransactionEvent::ParticipantFailed { .. } => "ParticipantFailed",
            TransactionEvent::Failed { .. } => "Failed",
            TransactionEvent::TimedOut { .. } => "TimedOut",
        }
    }

    /// Returns when the event happened.
    pub fn at(&self) -> DateTime<Utc> {
        match self {
            TransactionEvent::Initiated { at }
            | TransactionEvent::PrepareStarted { at }
            | TransactionEvent::ParticipantPrepared { at, .. }
            | TransactionEvent::Prepared { at }
            | TransactionEvent::CommitStarted { at }
            | TransactionEvent::ParticipantCommitted { at, .. }
            | TransactionEvent::Committed { at }
            | TransactionEvent::RollbackStarted { at, .. }
            | TransactionEvent::ParticipantRolledBack { at, .. }
            | TransactionEvent::RolledBack { at }
            | TransactionEvent::ParticipantFailed { at, .. }
            | TransactionEvent::Failed { at, .. }
            | TransactionEvent::TimedOut { at } => *at,
        }
    }
}
