//! Transaction coordinator tying the state machine, compensation registry,
//! outbox and lock table together.

use std::time::Duration;

use chrono::{DateTime, Utc};
use common::{Payload, TransactionId};

use crate::clock::{Clock, SystemClock};
use crate::compensation::{CompensatingAction, CompensationRegistry};
use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, Result};
use crate::lock::{LockTable, TransactionLock};
use crate::outbox::{Outbox, OutboxMessage, OutboxPolicy, OutboxStatus};
use crate::publisher::EventPublisher;
use crate::state::TransactionStatus;
use crate::store::TransactionStore;
use crate::summary::{CoordinatorSummary, TransactionFilter};
use crate::transaction::{DistributedTransaction, NewTransaction};

/// Coordinates distributed transactions across participant services.
///
/// The coordinator is passive: it performs no background work and never
/// talks to participants itself. Callers drive transactions through
/// prepare/commit or rollback, participants report back through the
/// `participant_*` callbacks, and an external loop periodically calls
/// [`detect_timed_out_transactions`](Self::detect_timed_out_transactions)
/// and drains the outbox.
///
/// Every operation is safe to call concurrently; each transaction is
/// serialized behind its own lock.
pub struct TransactionCoordinator<C: Clock = SystemClock> {
    config: CoordinatorConfig,
    clock: C,
    store: TransactionStore,
    compensations: CompensationRegistry,
    outbox: Outbox,
    locks: LockTable,
}

impl TransactionCoordinator<SystemClock> {
    /// Creates a coordinator using the system clock.
    pub fn new(config: CoordinatorConfig) -> Self {
        Self::with_clock(config, SystemClock)
    }
}

impl Default for TransactionCoordinator<SystemClock> {
    fn default() -> Self {
        Self::new(CoordinatorConfig::default())
    }
}

impl<C: Clock> TransactionCoordinator<C> {
    /// Creates a coordinator with an explicit time source.
    pub fn with_clock(config: CoordinatorConfig, clock: C) -> Self {
        let outbox = Outbox::new(OutboxPolicy::from(&config));
        Self {
            config,
            clock,
            store: TransactionStore::default(),
            compensations: CompensationRegistry::new(),
            outbox,
            locks: LockTable::new(),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Creates a transaction, or returns the existing one for the same
    /// `(tenant_id, idempotency_key)` unchanged.
    #[tracing::instrument(
        skip(self, request),
        fields(tenant_id = %request.tenant_id, idempotency_key = %request.idempotency_key)
    )]
    pub fn initiate(&self, request: NewTransaction) -> DistributedTransaction {
        let now = self.clock.now();
        let tenant_id = request.tenant_id.clone();
        let idempotency_key = request.idempotency_key.clone();

        let (transaction, created) = self.store.get_or_insert_with(&tenant_id, &idempotency_key, || {
            DistributedTransaction::new(request, self.config.default_timeout, now)
        });

        if created {
            metrics::counter!("transactions_initiated_total").increment(1);
            tracing::info!(
                transaction_id = %transaction.id(),
                transaction_type = %transaction.transaction_type(),
                participants = transaction.participants().len(),
                "transaction initiated"
            );
        } else {
            metrics::counter!("transactions_idempotent_replays_total").increment(1);
            tracing::debug!(transaction_id = %transaction.id(), "idempotent initiate replay");
        }
        transaction
    }

    /// Starts the prepare round. Only valid from `initiated`.
    #[tracing::instrument(skip(self))]
    pub fn prepare(&self, id: TransactionId) -> Result<DistributedTransaction> {
        self.with_transaction(id, |tx, now| {
            tx.prepare(now)?;
            Ok(tx.clone())
        })
    }

    /// Records that a participant prepared, moving the transaction to
    /// `prepared` once every participant has.
    #[tracing::instrument(skip(self, commit_payload))]
    pub fn participant_prepared(
        &self,
        id: TransactionId,
        service_id: &str,
        commit_payload: Option<Payload>,
    ) -> Result<DistributedTransaction> {
        self.with_transaction(id, |tx, now| {
            if tx.record_prepared(service_id, commit_payload, now)? {
                tracing::debug!("all participants prepared");
            }
            Ok(tx.clone())
        })
    }

    /// Starts the commit round, from `prepared` or directly from `initiated`.
    #[tracing::instrument(skip(self))]
    pub fn commit(&self, id: TransactionId) -> Result<DistributedTransaction> {
        self.with_transaction(id, |tx, now| {
            if tx.commit(now)? {
                self.on_committed(tx, now);
            }
            Ok(tx.clone())
        })
    }

    /// Records that a participant committed. When the last participant
    /// commits, the transaction commits and its outbox message is enqueued.
    #[tracing::instrument(skip(self))]
    pub fn participant_committed(
        &self,
        id: TransactionId,
        service_id: &str,
    ) -> Result<DistributedTransaction> {
        self.with_transaction(id, |tx, now| {
            if tx.record_committed(service_id, now)? {
                self.on_committed(tx, now);
            }
            Ok(tx.clone())
        })
    }

    /// Rolls a transaction back and returns the compensations it generated.
    ///
    /// Accepted from any non-terminal state and from `timed_out`.
    #[tracing::instrument(skip(self))]
    pub fn rollback(&self, id: TransactionId, reason: &str) -> Result<Vec<CompensatingAction>> {
        self.with_transaction(id, |tx, now| {
            let previous = tx.status();
            let actions = tx.begin_rollback(reason, now)?;
            self.compensations.record(&actions);

            if previous != TransactionStatus::RollingBack {
                metrics::counter!("compensations_generated_total").increment(actions.len() as u64);
                tracing::info!(
                    from = %previous,
                    compensations = actions.len(),
                    "transaction rolling back"
                );
            }
            if tx.status() == TransactionStatus::RolledBack {
                self.on_rolled_back(tx);
            }
            Ok(actions)
        })
    }

    /// Records that a participant finished compensating. When every
    /// participant that needed compensation has, the transaction is rolled back.
    #[tracing::instrument(skip(self))]
    pub fn participant_rolled_back(
        &self,
        id: TransactionId,
        service_id: &str,
    ) -> Result<DistributedTransaction> {
        self.with_transaction(id, |tx, now| {
            if tx.record_rolled_back(service_id, now)? {
                self.on_rolled_back(tx);
            }
            Ok(tx.clone())
        })
    }

    /// Records a participant error. The participant fails once it has used up
    /// `participant_max_retries`; a failed compensation fails the transaction.
    #[tracing::instrument(skip(self))]
    pub fn participant_failed(
        &self,
        id: TransactionId,
        service_id: &str,
        error: &str,
    ) -> Result<DistributedTransaction> {
        self.with_transaction(id, |tx, now| {
            tx.record_failure(service_id, error, self.config.participant_max_retries, now)?;
            if tx.status() == TransactionStatus::Failed {
                metrics::counter!("transactions_failed_total").increment(1);
                tracing::warn!(
                    reason = tx.failure_reason().unwrap_or_default(),
                    "transaction failed, manual intervention required"
                );
            } else {
                tracing::debug!("participant failure recorded");
            }
            Ok(tx.clone())
        })
    }

    /// Marks every overdue `initiated`, `preparing`, `committing` or
    /// `rolling_back` transaction as `timed_out` and returns them.
    ///
    /// Only marks: remediation (usually `rollback(id, "timeout")`) is left
    /// to the caller.
    #[tracing::instrument(skip(self))]
    pub fn detect_timed_out_transactions(&self) -> Vec<DistributedTransaction> {
        let now = self.clock.now();
        let mut entries = self.store.entries();
        entries.sort_by_key(|entry| entry.seq);

        let timed_out: Vec<_> = entries
            .iter()
            .filter_map(|entry| {
                let mut tx = entry.transaction.lock();
                tx.mark_timed_out(now).then(|| tx.clone())
            })
            .collect();

        if !timed_out.is_empty() {
            metrics::counter!("transactions_timed_out_total").increment(timed_out.len() as u64);
            tracing::info!(count = timed_out.len(), "transactions timed out");
        }
        timed_out
    }

    /// Delivers up to one batch of due outbox messages through `deliver`,
    /// which returns whether delivery succeeded. Returns the number published.
    ///
    /// `deliver` runs with no coordinator lock held and may call back into
    /// the coordinator.
    #[tracing::instrument(skip(self, deliver))]
    pub fn publish<F>(&self, deliver: F) -> usize
    where
        F: FnMut(&OutboxMessage) -> bool,
    {
        let published = self.outbox.publish(self.clock.now(), deliver);
        tracing::debug!(published, "outbox drained");
        published
    }

    /// Delivers up to one batch of due outbox messages through an async
    /// publisher. Returns the number published.
    ///
    /// The batch is leased before delivery so concurrent relays do not
    /// deliver the same message twice; no lock is held while awaiting.
    #[tracing::instrument(skip(self, publisher))]
    pub async fn relay_outbox<P>(&self, publisher: &P) -> usize
    where
        P: EventPublisher + ?Sized,
    {
        let claimed = self.outbox.claim_due(self.clock.now());
        let mut published = 0;

        for message in claimed {
            let outcome = publisher
                .publish(&message)
                .await
                .map_err(|e| e.to_string());
            if self.outbox.complete(message.id, outcome, self.clock.now())
                == Some(OutboxStatus::Published)
            {
                published += 1;
            }
        }

        tracing::debug!(published, "outbox relayed");
        published
    }

    /// Acquires a lease on a tenant's resource for a transaction.
    ///
    /// Fails with [`CoordinatorError::LockContended`] while another
    /// transaction holds a live lease; never blocks.
    #[tracing::instrument(skip(self))]
    pub fn acquire_lock(
        &self,
        resource_id: &str,
        tenant_id: &str,
        transaction_id: TransactionId,
        ttl: Option<Duration>,
    ) -> Result<TransactionLock> {
        let ttl = ttl.unwrap_or(self.config.default_lock_ttl);
        let result = self
            .locks
            .acquire(resource_id, tenant_id, transaction_id, ttl, self.clock.now());

        if let Err(CoordinatorError::LockContended { holder, .. }) = &result {
            metrics::counter!("lock_contention_total").increment(1);
            tracing::debug!(%holder, "lock contended");
        }
        result
    }

    /// Releases a lease. Only the holding transaction may release it.
    #[tracing::instrument(skip(self))]
    pub fn release_lock(
        &self,
        resource_id: &str,
        tenant_id: &str,
        transaction_id: TransactionId,
    ) -> Result<()> {
        self.locks.release(resource_id, tenant_id, transaction_id)
    }

    /// Releases every lease held by a transaction.
    pub fn release_all_locks(&self, transaction_id: TransactionId) -> usize {
        self.locks.release_all(transaction_id)
    }

    /// Drops expired leases from the lock table.
    pub fn purge_expired_locks(&self) -> usize {
        self.locks.purge_expired(self.clock.now())
    }

    /// Returns the live lease on a resource, if any.
    pub fn lock_holder(&self, resource_id: &str, tenant_id: &str) -> Option<TransactionLock> {
        self.locks.holder(resource_id, tenant_id, self.clock.now())
    }

    /// Returns a snapshot of a transaction.
    pub fn get_transaction(&self, id: TransactionId) -> Option<DistributedTransaction> {
        self.store.get(id).map(|entry| entry.transaction.lock().clone())
    }

    /// Lists transactions newest first.
    pub fn list_transactions(&self, filter: &TransactionFilter) -> Vec<DistributedTransaction> {
        let mut entries = self.store.entries();
        entries.sort_by_key(|entry| std::cmp::Reverse(entry.seq));

        entries
            .iter()
            .map(|entry| entry.transaction.lock().clone())
            .filter(|tx| filter.matches(tx))
            .collect()
    }

    /// Lists compensations in generation order, optionally for one transaction.
    pub fn list_compensations(&self, transaction_id: Option<TransactionId>) -> Vec<CompensatingAction> {
        self.compensations.list(transaction_id)
    }

    /// Lists outbox messages in enqueue order, optionally filtered by status.
    pub fn list_outbox(&self, status: Option<OutboxStatus>) -> Vec<OutboxMessage> {
        self.outbox.list(status)
    }

    /// Aggregated counts for observability.
    pub fn get_summary(&self) -> CoordinatorSummary {
        let snapshots: Vec<_> = self
            .store
            .entries()
            .iter()
            .map(|entry| entry.transaction.lock().clone())
            .collect();

        CoordinatorSummary {
            pending_outbox_messages: self.outbox.pending_count(),
            active_distributed_locks: self.locks.active_count(self.clock.now()),
            ..CoordinatorSummary::from_transactions(&snapshots)
        }
    }

    fn with_transaction<T, F>(&self, id: TransactionId, f: F) -> Result<T>
    where
        F: FnOnce(&mut DistributedTransaction, DateTime<Utc>) -> Result<T>,
    {
        let entry = self
            .store
            .get(id)
            .ok_or(CoordinatorError::TransactionNotFound(id))?;
        let mut tx = entry.transaction.lock();
        let now = self.clock.now();
        f(&mut *tx, now)
    }

    fn on_committed(&self, tx: &DistributedTransaction, now: DateTime<Utc>) {
        self.outbox.enqueue(OutboxMessage::new(
            tx.id(),
            tx.tenant_id(),
            tx.transaction_type().committed_event_type(),
            tx.committed_payload(),
            now,
        ));

        metrics::counter!("transactions_committed_total").increment(1);
        if let Some(duration) = tx.duration() {
            metrics::histogram!("transaction_duration_seconds")
                .record(duration.num_milliseconds() as f64 / 1000.0);
        }
        tracing::info!(transaction_id = %tx.id(), "transaction committed");
    }

    fn on_rolled_back(&self, tx: &DistributedTransaction) {
        metrics::counter!("transactions_rolled_back_total").increment(1);
        if let Some(duration) = tx.duration() {
            metrics::histogram!("transaction_duration_seconds")
                .record(duration.num_milliseconds() as f64 / 1000.0);
        }
        tracing::info!(
            transaction_id = %tx.id(),
            reason = tx.failure_reason().unwrap_or_default(),
            "transaction rolled back"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::state::ParticipantStatus;
    use crate::transaction::{ParticipantSpec, TransactionType};
    use serde_json::json;

    fn setup() -> (TransactionCoordinator<ManualClock>, ManualClock) {
        let clock = ManualClock::default();
        let coordinator = TransactionCoordinator::with_clock(CoordinatorConfig::default(), clock.clone());
        (coordinator, clock)
    }

    fn order_request() -> NewTransaction {
        NewTransaction::new("acme", TransactionType::TwoPhaseCommit, "order-42")
            .participant(
                ParticipantSpec::new("inventory", "Inventory Service")
                    .with_prepare_payload(json!({"sku": "SKU-1", "qty": 2}))
                    .with_compensation_payload(json!({"release": "SKU-1"})),
            )
            .participant(
                ParticipantSpec::new("billing", "Billing Service")
                    .with_compensation_payload(json!({"refund": 4500})),
            )
            .timeout(Duration::from_millis(5000))
    }

    #[test]
    fn test_happy_path() {
        let (coordinator, _) = setup();
        let tx = coordinator.initiate(order_request());
        assert_eq!(tx.status(), TransactionStatus::Initiated);

        let id = tx.id();
        assert_eq!(coordinator.prepare(id).unwrap().status(), TransactionStatus::Preparing);
        coordinator.participant_prepared(id, "inventory", None).unwrap();
        let tx = coordinator.participant_prepared(id, "billing", None).unwrap();
        assert_eq!(tx.status(), TransactionStatus::Prepared);

        assert_eq!(coordinator.commit(id).unwrap().status(), TransactionStatus::Committing);
        coordinator.participant_committed(id, "inventory").unwrap();
        let tx = coordinator.participant_committed(id, "billing").unwrap();
        assert_eq!(tx.status(), TransactionStatus::Committed);

        let outbox = coordinator.list_outbox(None);
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].event_type, "two_phase_commit.committed");
        assert_eq!(outbox[0].transaction_id, id);
    }

    #[test]
    fn test_unknown_transaction() {
        let (coordinator, _) = setup();
        let id = TransactionId::new();

        assert!(matches!(
            coordinator.prepare(id),
            Err(CoordinatorError::TransactionNotFound(missing)) if missing == id
        ));
        assert!(coordinator.rollback(id, "nope").unwrap_err().is_not_found());
        assert!(coordinator.get_transaction(id).is_none());
    }

    #[test]
    fn test_rollback_records_compensations() {
        let (coordinator, _) = setup();
        let id = coordinator.initiate(order_request()).id();
        coordinator.prepare(id).unwrap();
        coordinator.participant_prepared(id, "inventory", None).unwrap();

        let actions = coordinator.rollback(id, "billing declined").unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].service_id, "inventory");
        assert_eq!(coordinator.list_compensations(Some(id)), actions);

        let tx = coordinator.participant_rolled_back(id, "inventory").unwrap();
        assert_eq!(tx.status(), TransactionStatus::RolledBack);
        assert_eq!(
            tx.participant("billing").unwrap().status,
            ParticipantStatus::Pending
        );
        assert!(coordinator.list_outbox(None).is_empty());
    }

    #[test]
    fn test_timeout_then_rollback() {
        let (coordinator, clock) = setup();
        let id = coordinator.initiate(order_request()).id();
        coordinator.commit(id).unwrap();
        coordinator.participant_committed(id, "inventory").unwrap();

        clock.advance_millis(5001);
        let timed_out = coordinator.detect_timed_out_transactions();
        assert_eq!(timed_out.len(), 1);
        assert_eq!(timed_out[0].status(), TransactionStatus::TimedOut);
        assert!(coordinator.detect_timed_out_transactions().is_empty());

        let actions = coordinator.rollback(id, "timeout").unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].service_id, "inventory");
    }

    #[test]
    fn test_participant_failure_during_compensation() {
        let (coordinator, _) = setup();
        let id = coordinator.initiate(order_request()).id();
        coordinator.participant_prepared(id, "billing", None).unwrap();
        coordinator.rollback(id, "abort").unwrap();

        for _ in 0..3 {
            coordinator.participant_failed(id, "billing", "refund rejected").unwrap();
        }
        let tx = coordinator.get_transaction(id).unwrap();
        assert_eq!(tx.status(), TransactionStatus::Failed);
        assert_eq!(coordinator.get_summary().failed_transactions, 1);
    }

    #[test]
    fn test_summary_counts_locks_and_outbox() {
        let (coordinator, clock) = setup();
        let id = coordinator.initiate(order_request()).id();
        coordinator.commit(id).unwrap();
        coordinator.participant_committed(id, "inventory").unwrap();
        clock.advance_millis(250);
        coordinator.participant_committed(id, "billing").unwrap();

        coordinator.acquire_lock("r1", "acme", id, None).unwrap();

        let summary = coordinator.get_summary();
        assert_eq!(summary.total_transactions, 1);
        assert_eq!(summary.committed_transactions, 1);
        assert_eq!(summary.pending_outbox_messages, 1);
        assert_eq!(summary.active_distributed_locks, 1);
        assert_eq!(summary.avg_transaction_duration_ms, 250.0);

        clock.advance_millis(30_000);
        assert_eq!(coordinator.get_summary().active_distributed_locks, 0);
    }
}
