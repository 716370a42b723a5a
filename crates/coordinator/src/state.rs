//! Transaction and participant state machines.

use serde::{Deserialize, Serialize};

/// The status of a distributed transaction in its lifecycle.
///
/// State transitions:
/// ```text
/// Initiated ──► Preparing ──► Prepared ──► Committing ──► Committed
///     │                                        ▲
///     └────────────────────────────────────────┘   (relaxed commit)
///
/// any non-terminal ──► RollingBack ──► RolledBack
///                           └────────► Failed      (compensation exhausted)
///
/// {Initiated, Preparing, Committing, RollingBack} ──► TimedOut ──► RollingBack
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    /// Created, no participant has been asked to do anything yet.
    #[default]
    Initiated,

    /// Participants have been asked to prepare.
    Preparing,

    /// Every participant acknowledged prepare.
    Prepared,

    /// Participants have been told to commit.
    Committing,

    /// Every participant committed (terminal state).
    Committed,

    /// Compensations are outstanding.
    RollingBack,

    /// Every compensation was acknowledged (terminal state).
    RolledBack,

    /// Exceeded its timeout; awaiting an external rollback (terminal state).
    TimedOut,

    /// Could not be completed or compensated (terminal state).
    Failed,
}

impl TransactionStatus {
    /// Returns true if the prepare round can start.
    pub fn can_prepare(&self) -> bool {
        matches!(self, TransactionStatus::Initiated)
    }

    /// Returns true if participants may still report prepared.
    pub fn accepts_prepared(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Initiated | TransactionStatus::Preparing | TransactionStatus::Prepared
        )
    }

    /// Returns true if the commit round can start.
    ///
    /// `Initiated` is accepted for transaction types that skip the prepare round.
    pub fn can_commit(&self) -> bool {
        matches!(self, TransactionStatus::Prepared | TransactionStatus::Initiated)
    }

    /// Returns true if a rollback request is accepted.
    ///
    /// `TimedOut` stays eligible so that timeout remediation can roll back.
    pub fn can_roll_back(&self) -> bool {
        !self.is_terminal() || matches!(self, TransactionStatus::TimedOut)
    }

    /// Returns true if the timeout scanner may mark this transaction.
    pub fn can_time_out(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Initiated
                | TransactionStatus::Preparing
                | TransactionStatus::Committing
                | TransactionStatus::RollingBack
        )
    }

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Committed
                | TransactionStatus::RolledBack
                | TransactionStatus::TimedOut
                | TransactionStatus::Failed
        )
    }

    /// Returns the status name as it appears on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Initiated => "initiated",
            TransactionStatus::Preparing => "preparing",
            TransactionStatus::Prepared => "prepared",
            TransactionStatus::Committing => "committing",
            TransactionStatus::Committed => "committed",
            TransactionStatus::RollingBack => "rolling_back",
            TransactionStatus::RolledBack => "rolled_back",
            TransactionStatus::TimedOut => "timed_out",
            TransactionStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The status of a single participant within a transaction.
///
/// Participants only move forward along `Pending → Prepared → Committed`
/// or sideways into `RolledBack` / `Failed`, which are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantStatus {
    #[default]
    Pending,
    Prepared,
    Committed,
    RolledBack,
    Failed,
}

impl ParticipantStatus {
    /// Returns true if moving from `self` to `next` never regresses the participant.
    ///
    /// Re-applying the current status is allowed so that duplicate callbacks
    /// are idempotent.
    pub fn can_transition_to(&self, next: ParticipantStatus) -> bool {
        use ParticipantStatus::*;

        if *self == next {
            return true;
        }
        match (*self, next) {
            (RolledBack | Failed, _) => false,
            (_, RolledBack | Failed) => true,
            (Pending, Prepared | Committed) => true,
            (Prepared, Committed) => true,
            _ => false,
        }
    }

    /// Returns true if the participant applied work that would need undoing.
    pub fn requires_compensation(&self) -> bool {
        matches!(self, ParticipantStatus::Prepared | ParticipantStatus::Committed)
    }

    /// Returns true if the participant can no longer change.
    pub fn is_final(&self) -> bool {
        matches!(self, ParticipantStatus::RolledBack | ParticipantStatus::Failed)
    }

    /// Returns the status name as it appears on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            ParticipantStatus::Pending => "pending",
            ParticipantStatus::Prepared => "prepared",
            ParticipantStatus::Committed => "committed",
            ParticipantStatus::RolledBack => "rolled_back",
            ParticipantStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ParticipantStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
