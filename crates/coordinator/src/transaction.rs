//! Distributed transaction aggregate and participant tracking.

use std::time::Duration;

use chrono::{DateTime, Utc};
use common::{Payload, TransactionId};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::compensation::CompensatingAction;
use crate::error::{CoordinatorError, Result};
use crate::events::TransactionEvent;
use crate::state::{ParticipantStatus, TransactionStatus};

/// The coordination style a transaction was created for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    SagaOrchestration,
    SagaChoreography,
    TwoPhaseCommit,
    Outbox,
}

impl TransactionType {
    /// Returns the type name as it appears on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::SagaOrchestration => "saga_orchestration",
            TransactionType::SagaChoreography => "saga_choreography",
            TransactionType::TwoPhaseCommit => "two_phase_commit",
            TransactionType::Outbox => "outbox",
        }
    }

    /// Event type of the outbox message published when a transaction of this
    /// type commits, e.g. `two_phase_commit.committed`.
    pub fn committed_event_type(&self) -> String {
        format!("{}.committed", self.as_str())
    }
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A participant as declared by the caller at initiation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantSpec {
    pub service_id: String,
    pub service_name: String,
    #[serde(default)]
    pub prepare_payload: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation_payload: Option<Payload>,
}

impl ParticipantSpec {
    /// Creates a participant with an empty prepare payload and no compensation.
    pub fn new(service_id: impl Into<String>, service_name: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
            service_name: service_name.into(),
            prepare_payload: Payload::Null,
            compensation_payload: None,
        }
    }

    /// Sets the input the participant needs to prepare.
    pub fn with_prepare_payload(mut self, payload: Payload) -> Self {
        self.prepare_payload = payload;
        self
    }

    /// Sets the payload forwarded to the participant's inverse operation on rollback.
    pub fn with_compensation_payload(mut self, payload: Payload) -> Self {
        self.compensation_payload = Some(payload);
        self
    }
}

/// Request to initiate a distributed transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTransaction {
    pub tenant_id: String,
    #[serde(rename = "type")]
    pub transaction_type: TransactionType,
    pub idempotency_key: String,
    pub participants: Vec<ParticipantSpec>,
    /// Falls back to the coordinator's configured default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub metadata: Payload,
}

impl NewTransaction {
    /// Creates a request with no participants, the default timeout and empty metadata.
    pub fn new(
        tenant_id: impl Into<String>,
        transaction_type: TransactionType,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            transaction_type,
            idempotency_key: idempotency_key.into(),
            participants: Vec::new(),
            timeout_ms: None,
            metadata: Payload::Null,
        }
    }

    /// Adds a participant.
    pub fn participant(mut self, participant: ParticipantSpec) -> Self {
        self.participants.push(participant);
        self
    }

    /// Sets the transaction timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Sets free-form metadata.
    pub fn metadata(mut self, metadata: Payload) -> Self {
        self.metadata = metadata;
        self
    }
}

/// One external service's stake in a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionParticipant {
    pub service_id: String,
    pub service_name: String,
    pub status: ParticipantStatus,
    pub prepare_payload: Payload,
    /// Returned by the participant when it prepared; consumed at commit time.
    pub commit_payload: Option<Payload>,
    pub compensation_payload: Option<Payload>,
    /// Set when rollback started while this participant was prepared or committed.
    pub compensation_required: bool,
    pub prepare_requested_at: Option<DateTime<Utc>>,
    pub prepared_at: Option<DateTime<Utc>>,
    pub committed_at: Option<DateTime<Utc>>,
    pub rolled_back_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

impl TransactionParticipant {
    fn from_spec(spec: ParticipantSpec) -> Self {
        Self {
            service_id: spec.service_id,
            service_name: spec.service_name,
            status: ParticipantStatus::Pending,
            prepare_payload: spec.prepare_payload,
            commit_payload: None,
            compensation_payload: spec.compensation_payload,
            compensation_required: false,
            prepare_requested_at: None,
            prepared_at: None,
            committed_at: None,
            rolled_back_at: None,
            failed_at: None,
            retry_count: 0,
            last_error: None,
        }
    }

    /// Moves the participant to `next`, stamping the matching timestamp.
    ///
    /// Returns `Ok(false)` when the participant already had that status.
    fn advance(&mut self, next: ParticipantStatus, now: DateTime<Utc>) -> Result<bool> {
        if !self.status.can_transition_to(next) {
            return Err(CoordinatorError::InvalidParticipantTransition {
                service_id: self.service_id.clone(),
                from: self.status,
                to: next,
            });
        }
        if self.status == next {
            return Ok(false);
        }

        self.status = next;
        let stamp = match next {
            ParticipantStatus::Pending => return Ok(true),
            ParticipantStatus::Prepared => &mut self.prepared_at,
            ParticipantStatus::Committed => &mut self.committed_at,
            ParticipantStatus::RolledBack => &mut self.rolled_back_at,
            ParticipantStatus::Failed => &mut self.failed_at,
        };
        *stamp = Some(now);
        Ok(true)
    }
}

/// The unit of coordination.
///
/// Participants are fixed at initiation. All mutation goes through the
/// coordinator, which holds this value behind a per-transaction lock;
/// callers only ever see clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributedTransaction {
    id: TransactionId,
    tenant_id: String,
    #[serde(rename = "type")]
    transaction_type: TransactionType,
    status: TransactionStatus,
    timeout_ms: u64,
    idempotency_key: String,
    initiated_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    committed_at: Option<DateTime<Utc>>,
    rolled_back_at: Option<DateTime<Utc>>,
    rollback_started_at: Option<DateTime<Utc>>,
    failure_reason: Option<String>,
    metadata: Payload,
    participants: Vec<TransactionParticipant>,
    history: Vec<TransactionEvent>,
}

impl DistributedTransaction {
    pub(crate) fn new(request: NewTransaction, default_timeout: Duration, now: DateTime<Utc>) -> Self {
        let timeout_ms = request
            .timeout_ms
            .unwrap_or_else(|| u64::try_from(default_timeout.as_millis()).unwrap_or(u64::MAX));

        Self {
            id: TransactionId::new(),
            tenant_id: request.tenant_id,
            transaction_type: request.transaction_type,
            status: TransactionStatus::Initiated,
            timeout_ms,
            idempotency_key: request.idempotency_key,
            initiated_at: now,
            updated_at: now,
            committed_at: None,
            rolled_back_at: None,
            rollback_started_at: None,
            failure_reason: None,
            metadata: request.metadata,
            participants: request
                .participants
                .into_iter()
                .map(TransactionParticipant::from_spec)
                .collect(),
            history: vec![TransactionEvent::Initiated { at: now }],
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn transaction_type(&self) -> TransactionType {
        self.transaction_type
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn idempotency_key(&self) -> &str {
        &self.idempotency_key
    }

    pub fn initiated_at(&self) -> DateTime<Utc> {
        self.initiated_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn committed_at(&self) -> Option<DateTime<Utc>> {
        self.committed_at
    }

    pub fn rolled_back_at(&self) -> Option<DateTime<Utc>> {
        self.rolled_back_at
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    pub fn metadata(&self) -> &Payload {
        &self.metadata
    }

    pub fn participants(&self) -> &[TransactionParticipant] {
        &self.participants
    }

    /// Looks up a participant by service id.
    pub fn participant(&self, service_id: &str) -> Option<&TransactionParticipant> {
        self.participants.iter().find(|p| p.service_id == service_id)
    }

    /// Audit trail of every transition applied to this transaction.
    pub fn history(&self) -> &[TransactionEvent] {
        &self.history
    }

    /// Returns true if more than the configured timeout has elapsed since initiation.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let timeout = i64::try_from(self.timeout_ms)
            .ok()
            .and_then(chrono::Duration::try_milliseconds)
            .unwrap_or(chrono::Duration::MAX);
        now - self.initiated_at > timeout
    }

    /// Time from initiation to commit or rollback completion.
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.committed_at
            .or(self.rolled_back_at)
            .map(|end| end - self.initiated_at)
    }

    /// Starts the prepare round.
    pub(crate) fn prepare(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.ensure(self.status.can_prepare(), "prepare")?;

        self.status = TransactionStatus::Preparing;
        for participant in &mut self.participants {
            participant.prepare_requested_at = Some(now);
        }
        self.record(TransactionEvent::PrepareStarted { at: now });
        self.complete_prepare_if_ready(now);
        Ok(())
    }

    /// Records a participant's prepare acknowledgement.
    ///
    /// Returns true if this acknowledgement moved the transaction to `Prepared`.
    pub(crate) fn record_prepared(
        &mut self,
        service_id: &str,
        commit_payload: Option<Payload>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.ensure(self.status.accepts_prepared(), "acknowledge prepare for")?;

        let participant = self.participant_mut(service_id)?;
        let changed = participant.advance(ParticipantStatus::Prepared, now)?;
        if commit_payload.is_some() {
            participant.commit_payload = commit_payload;
        }
        if changed {
            self.record(TransactionEvent::ParticipantPrepared {
                service_id: service_id.to_string(),
                at: now,
            });
        }
        Ok(self.complete_prepare_if_ready(now))
    }

    /// Starts the commit round.
    ///
    /// Returns true if the transaction committed immediately, which only
    /// happens when it has no participants.
    pub(crate) fn commit(&mut self, now: DateTime<Utc>) -> Result<bool> {
        self.ensure(self.status.can_commit(), "commit")?;

        self.status = TransactionStatus::Committing;
        self.record(TransactionEvent::CommitStarted { at: now });
        Ok(self.complete_commit_if_ready(now))
    }

    /// Records a participant's commit acknowledgement.
    ///
    /// Returns true if this acknowledgement moved the transaction to `Committed`.
    pub(crate) fn record_committed(&mut self, service_id: &str, now: DateTime<Utc>) -> Result<bool> {
        self.ensure(
            self.status == TransactionStatus::Committing,
            "acknowledge commit for",
        )?;

        let changed = self
            .participant_mut(service_id)?
            .advance(ParticipantStatus::Committed, now)?;
        if changed {
            self.record(TransactionEvent::ParticipantCommitted {
                service_id: service_id.to_string(),
                at: now,
            });
        }
        Ok(self.complete_commit_if_ready(now))
    }

    /// Enters rollback and returns the compensations it generated.
    ///
    /// A participant needs compensation when it is prepared or committed; an
    /// action is only emitted for those that supplied a compensation payload.
    /// Resuming a rollback (after a timeout, or a repeated request) never
    /// generates compensations twice.
    pub(crate) fn begin_rollback(
        &mut self,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<CompensatingAction>> {
        self.ensure(self.status.can_roll_back(), "roll back")?;
        if self.status == TransactionStatus::RollingBack {
            return Ok(Vec::new());
        }

        let mut actions = Vec::new();
        if self.rollback_started_at.is_none() {
            self.rollback_started_at = Some(now);
            self.failure_reason = Some(reason.to_string());

            for participant in &mut self.participants {
                if !participant.status.requires_compensation() {
                    continue;
                }
                participant.compensation_required = true;
                if let Some(payload) = &participant.compensation_payload {
                    actions.push(CompensatingAction::new(
                        self.id,
                        &self.tenant_id,
                        participant,
                        payload.clone(),
                        reason,
                        now,
                    ));
                }
            }
        }

        self.status = TransactionStatus::RollingBack;
        self.record(TransactionEvent::RollbackStarted {
            reason: reason.to_string(),
            compensations: actions.len(),
            at: now,
        });
        self.complete_rollback_if_ready(now);
        Ok(actions)
    }

    /// Records that a participant finished compensating.
    ///
    /// Returns true if this acknowledgement moved the transaction to `RolledBack`.
    pub(crate) fn record_rolled_back(&mut self, service_id: &str, now: DateTime<Utc>) -> Result<bool> {
        self.ensure(
            self.status == TransactionStatus::RollingBack,
            "acknowledge rollback for",
        )?;

        let changed = self
            .participant_mut(service_id)?
            .advance(ParticipantStatus::RolledBack, now)?;
        if changed {
            self.record(TransactionEvent::ParticipantRolledBack {
                service_id: service_id.to_string(),
                at: now,
            });
        }
        Ok(self.complete_rollback_if_ready(now))
    }

    /// Records a participant error, failing the participant once its retry
    /// budget is spent.
    ///
    /// A participant that exhausts its budget while its compensation is
    /// outstanding fails the whole transaction: the rollback cannot finish
    /// without manual intervention.
    pub(crate) fn record_failure(
        &mut self,
        service_id: &str,
        error: &str,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Result<ParticipantStatus> {
        self.ensure(!self.status.is_terminal(), "report failure for")?;

        let participant = self.participant_mut(service_id)?;
        if participant.status.is_final() {
            return Err(CoordinatorError::InvalidParticipantTransition {
                service_id: service_id.to_string(),
                from: participant.status,
                to: ParticipantStatus::Failed,
            });
        }

        participant.retry_count += 1;
        participant.last_error = Some(error.to_string());
        let retry_count = participant.retry_count;
        if retry_count >= max_retries {
            participant.advance(ParticipantStatus::Failed, now)?;
        }
        let status = participant.status;
        let blocks_rollback = participant.compensation_required;

        self.record(TransactionEvent::ParticipantFailed {
            service_id: service_id.to_string(),
            error: error.to_string(),
            retry_count,
            at: now,
        });

        if status == ParticipantStatus::Failed
            && blocks_rollback
            && self.status == TransactionStatus::RollingBack
        {
            let reason = format!("compensation failed for '{service_id}': {error}");
            self.status = TransactionStatus::Failed;
            self.failure_reason = Some(reason.clone());
            self.record(TransactionEvent::Failed { reason, at: now });
        }
        Ok(status)
    }

    /// Marks the transaction timed out if it is eligible and past its deadline.
    pub(crate) fn mark_timed_out(&mut self, now: DateTime<Utc>) -> bool {
        if !self.status.can_time_out() || !self.is_expired(now) {
            return false;
        }
        self.status = TransactionStatus::TimedOut;
        self.record(TransactionEvent::TimedOut { at: now });
        true
    }

    /// Payload of the outbox message published on commit.
    pub(crate) fn committed_payload(&self) -> Payload {
        let participants: Vec<Payload> = self
            .participants
            .iter()
            .map(|p| {
                json!({
                    "serviceId": p.service_id,
                    "serviceName": p.service_name,
                    "commitPayload": p.commit_payload,
                })
            })
            .collect();

        json!({
            "transactionId": self.id,
            "tenantId": self.tenant_id,
            "type": self.transaction_type,
            "idempotencyKey": self.idempotency_key,
            "committedAt": self.committed_at,
            "metadata": self.metadata,
            "participants": participants,
        })
    }

    fn complete_prepare_if_ready(&mut self, now: DateTime<Utc>) -> bool {
        let ready = matches!(
            self.status,
            TransactionStatus::Initiated | TransactionStatus::Preparing
        ) && self.all_participants(ParticipantStatus::Prepared);
        if ready {
            self.status = TransactionStatus::Prepared;
            self.record(TransactionEvent::Prepared { at: now });
        }
        ready
    }

    fn complete_commit_if_ready(&mut self, now: DateTime<Utc>) -> bool {
        let ready = self.status == TransactionStatus::Committing
            && self.all_participants(ParticipantStatus::Committed);
        if ready {
            self.status = TransactionStatus::Committed;
            self.committed_at = Some(now);
            self.record(TransactionEvent::Committed { at: now });
        }
        ready
    }

    fn complete_rollback_if_ready(&mut self, now: DateTime<Utc>) -> bool {
        let ready = self.status == TransactionStatus::RollingBack
            && self
                .participants
                .iter()
                .filter(|p| p.compensation_required)
                .all(|p| p.status == ParticipantStatus::RolledBack);
        if ready {
            self.status = TransactionStatus::RolledBack;
            self.rolled_back_at = Some(now);
            self.record(TransactionEvent::RolledBack { at: now });
        }
        ready
    }

    fn all_participants(&self, status: ParticipantStatus) -> bool {
        self.participants.iter().all(|p| p.status == status)
    }

    fn participant_mut(&mut self, service_id: &str) -> Result<&mut TransactionParticipant> {
        let transaction_id = self.id;
        self.participants
            .iter_mut()
            .find(|p| p.service_id == service_id)
            .ok_or_else(|| CoordinatorError::ParticipantNotFound {
                transaction_id,
                service_id: service_id.to_string(),
            })
    }

    fn ensure(&self, allowed: bool, operation: &'static str) -> Result<()> {
        if allowed {
            Ok(())
        } else {
            Err(CoordinatorError::InvalidState {
                transaction_id: self.id,
                operation,
                actual: self.status,
            })
        }
    }

    fn record(&mut self, event: TransactionEvent) {
        self.updated_at = event.at();
        self.history.push(event);
    }
}
