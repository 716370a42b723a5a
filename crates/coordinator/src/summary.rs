//! Read-only aggregates for observability consumers.

use serde::{Deserialize, Serialize};

use crate::state::TransactionStatus;
use crate::transaction::DistributedTransaction;

/// Point-in-time counts across the coordinator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorSummary {
    pub total_transactions: usize,
    /// Transactions not yet in a terminal state.
    pub active_transactions: usize,
    pub committed_transactions: usize,
    pub rolled_back_transactions: usize,
    /// Transactions that failed or timed out.
    pub failed_transactions: usize,
    pub pending_outbox_messages: usize,
    /// Unexpired locks.
    pub active_distributed_locks: usize,
    /// Mean initiation-to-completion time of committed and rolled back
    /// transactions; zero when there are none.
    pub avg_transaction_duration_ms: f64,
}

impl CoordinatorSummary {
    /// Folds transaction snapshots into the transaction counts.
    pub(crate) fn from_transactions<'a>(
        transactions: impl IntoIterator<Item = &'a DistributedTransaction>,
    ) -> Self {
        let mut summary = Self::default();
        let mut total_duration_ms = 0i64;
        let mut completed = 0usize;

        for tx in transactions {
            summary.total_transactions += 1;
            match tx.status() {
                TransactionStatus::Committed => summary.committed_transactions += 1,
                TransactionStatus::RolledBack => summary.rolled_back_transactions += 1,
                TransactionStatus::Failed | TransactionStatus::TimedOut => {
                    summary.failed_transactions += 1
                }
                _ => summary.active_transactions += 1,
            }
            if let Some(duration) = tx.duration() {
                total_duration_ms += duration.num_milliseconds();
                completed += 1;
            }
        }

        if completed > 0 {
            summary.avg_transaction_duration_ms = total_duration_ms as f64 / completed as f64;
        }
        summary
    }
}

/// Filter for listing transactions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionFilter {
    pub tenant_id: Option<String>,
    pub status: Option<TransactionStatus>,
}

impl TransactionFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn status(mut self, status: TransactionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub(crate) fn matches(&self, tx: &DistributedTransaction) -> bool {
        self.tenant_id.as_deref().is_none_or(|t| tx.tenant_id() == t)
            && self.status.is_none_or(|s| tx.status() == s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::{NewTransaction, ParticipantSpec, TransactionType};
    use chrono::{Duration as TimeDelta, Utc};
    use std::time::Duration;

    fn transaction(tenant: &str) -> DistributedTransaction {
        DistributedTransaction::new(
            NewTransaction::new(tenant, TransactionType::SagaChoreography, "k")
                .participant(ParticipantSpec::new("a", "A")),
            Duration::from_secs(30),
            Utc::now(),
        )
    }

    #[test]
    fn test_counts_and_average_duration() {
        let mut committed = transaction("acme");
        let start = committed.initiated_at();
        committed.commit(start).unwrap();
        committed
            .record_committed("a", start + TimeDelta::milliseconds(200))
            .unwrap();

        let mut rolled_back = transaction("acme");
        let start = rolled_back.initiated_at();
        rolled_back
            .begin_rollback("cancel", start + TimeDelta::milliseconds(400))
            .unwrap();

        let mut timed_out = transaction("acme");
        let start = timed_out.initiated_at();
        assert!(timed_out.mark_timed_out(start + TimeDelta::seconds(31)));

        let active = transaction("globex");

        let summary =
            CoordinatorSummary::from_transactions([&committed, &rolled_back, &timed_out, &active]);
        assert_eq!(summary.total_transactions, 4);
        assert_eq!(summary.committed_transactions, 1);
        assert_eq!(summary.rolled_back_transactions, 1);
        assert_eq!(summary.failed_transactions, 1);
        assert_eq!(summary.active_transactions, 1);
        assert_eq!(summary.avg_transaction_duration_ms, 300.0);
    }

    #[test]
    fn test_empty_summary_has_zero_average() {
        let summary = CoordinatorSummary::from_transactions(Vec::<&DistributedTransaction>::new());
        assert_eq!(summary, CoordinatorSummary::default());
    }

    #[test]
    fn test_filter_matches() {
        let tx = transaction("acme");
        assert!(TransactionFilter::new().matches(&tx));
        assert!(TransactionFilter::new().tenant("acme").matches(&tx));
        assert!(!TransactionFilter::new().tenant("globex").matches(&tx));
        assert!(TransactionFilter::new()
            .status(TransactionStatus::Initiated)
            .matches(&tx));
        assert!(!TransactionFilter::new()
            .tenant("acme")
            .status(TransactionStatus::Committed)
            .matches(&tx));
    }
}
