//! Compensating actions and the registry that records them.

use chrono::{DateTime, Utc};
use common::{CompensationId, Payload, TransactionId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::transaction::TransactionParticipant;

/// Intent to invoke a participant's inverse operation.
///
/// The coordinator only records the intent; executing it is up to the
/// participant service, which reports back through
/// `participant_rolled_back`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompensatingAction {
    pub id: CompensationId,
    pub transaction_id: TransactionId,
    pub tenant_id: String,
    pub service_id: String,
    pub service_name: String,
    pub payload: Payload,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

impl CompensatingAction {
    pub(crate) fn new(
        transaction_id: TransactionId,
        tenant_id: &str,
        participant: &TransactionParticipant,
        payload: Payload,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: CompensationId::new(),
            transaction_id,
            tenant_id: tenant_id.to_string(),
            service_id: participant.service_id.clone(),
            service_name: participant.service_name.clone(),
            payload,
            reason: reason.to_string(),
            created_at: now,
        }
    }
}

/// Append-only log of generated compensations.
///
/// Entries outlive any later change to their transaction.
#[derive(Debug, Default)]
pub struct CompensationRegistry {
    actions: RwLock<Vec<CompensatingAction>>,
}

impl CompensationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&self, actions: &[CompensatingAction]) {
        if actions.is_empty() {
            return;
        }
        self.actions.write().extend_from_slice(actions);
    }

    /// Lists compensations in generation order, optionally for one transaction.
    pub fn list(&self, transaction_id: Option<TransactionId>) -> Vec<CompensatingAction> {
        self.actions
            .read()
            .iter()
            .filter(|a| transaction_id.is_none_or(|id| a.transaction_id == id))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.actions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::{DistributedTransaction, NewTransaction, ParticipantSpec, TransactionType};
    use serde_json::json;
    use std::time::Duration;

    fn rolled_back_actions(tenant: &str) -> (TransactionId, Vec<CompensatingAction>) {
        let now = Utc::now();
        let request = NewTransaction::new(tenant, TransactionType::SagaOrchestration, "k")
            .participant(ParticipantSpec::new("a", "A").with_compensation_payload(json!(1)));
        let mut tx = DistributedTransaction::new(request, Duration::from_secs(30), now);
        tx.record_prepared("a", None, now).unwrap();
        let actions = tx.begin_rollback("abort", now).unwrap();
        (tx.id(), actions)
    }

    #[test]
    fn test_list_filters_by_transaction() {
        let registry = CompensationRegistry::new();
        let (first, actions) = rolled_back_actions("acme");
        registry.record(&actions);
        let (second, actions) = rolled_back_actions("globex");
        registry.record(&actions);

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.list(None).len(), 2);

        let only_first = registry.list(Some(first));
        assert_eq!(only_first.len(), 1);
        assert_eq!(only_first[0].tenant_id, "acme");
        assert_eq!(only_first[0].payload, json!(1));
        assert_eq!(only_first[0].reason, "abort");

        assert_eq!(registry.list(Some(second))[0].tenant_id, "globex");
        assert!(registry.list(Some(TransactionId::new())).is_empty());
    }

    #[test]
    fn test_empty_registry() {
        let registry = CompensationRegistry::new();
        registry.record(&[]);
        assert!(registry.is_empty());
        assert!(registry.list(None).is_empty());
    }
}
