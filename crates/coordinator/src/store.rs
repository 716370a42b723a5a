//! Transaction store and idempotency index.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use common::TransactionId;
use parking_lot::{Mutex, RwLock};

use crate::transaction::DistributedTransaction;

/// A stored transaction behind its own lock.
///
/// `seq` is the insertion order, used for newest-first listings.
#[derive(Debug)]
pub(crate) struct TransactionEntry {
    pub(crate) seq: u64,
    pub(crate) transaction: Mutex<DistributedTransaction>,
}

/// Owns every transaction and the `(tenant, idempotency key)` index.
///
/// Lock order: the idempotency index is taken before the transaction map,
/// and an entry's own mutex is only taken after the map lock is released.
#[derive(Debug, Default)]
pub(crate) struct TransactionStore {
    transactions: RwLock<HashMap<TransactionId, Arc<TransactionEntry>>>,
    idempotency: Mutex<HashMap<(String, String), TransactionId>>,
    next_seq: AtomicU64,
}

impl TransactionStore {
    /// Returns the transaction indexed under `(tenant_id, key)`, or inserts the
    /// one built by `create`.
    ///
    /// The boolean is true when a new transaction was inserted. Lookup and
    /// insert happen under the index lock, so concurrent callers with the same
    /// key always agree on one transaction.
    pub(crate) fn get_or_insert_with<F>(
        &self,
        tenant_id: &str,
        idempotency_key: &str,
        create: F,
    ) -> (DistributedTransaction, bool)
    where
        F: FnOnce() -> DistributedTransaction,
    {
        let index_key = (tenant_id.to_string(), idempotency_key.to_string());
        let mut index = self.idempotency.lock();

        if let Some(id) = index.get(&index_key)
            && let Some(entry) = self.get(*id)
        {
            return (entry.transaction.lock().clone(), false);
        }

        let transaction = create();
        let id = transaction.id();
        let entry = Arc::new(TransactionEntry {
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            transaction: Mutex::new(transaction.clone()),
        });
        self.transactions.write().insert(id, entry);
        index.insert(index_key, id);
        (transaction, true)
    }

    pub(crate) fn get(&self, id: TransactionId) -> Option<Arc<TransactionEntry>> {
        self.transactions.read().get(&id).cloned()
    }

    /// Snapshot of every entry; the map lock is released before returning.
    pub(crate) fn entries(&self) -> Vec<Arc<TransactionEntry>> {
        self.transactions.read().values().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.transactions.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::{NewTransaction, TransactionType};
    use chrono::Utc;
    use std::time::Duration;

    fn build(tenant: &str, key: &str) -> DistributedTransaction {
        DistributedTransaction::new(
            NewTransaction::new(tenant, TransactionType::Outbox, key),
            Duration::from_secs(30),
            Utc::now(),
        )
    }

    #[test]
    fn test_same_key_returns_existing() {
        let store = TransactionStore::default();

        let (first, created) = store.get_or_insert_with("acme", "k1", || build("acme", "k1"));
        assert!(created);

        let (second, created) = store.get_or_insert_with("acme", "k1", || build("acme", "k1"));
        assert!(!created);
        assert_eq!(first.id(), second.id());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_key_is_scoped_by_tenant() {
        let store = TransactionStore::default();

        let (a, _) = store.get_or_insert_with("acme", "k1", || build("acme", "k1"));
        let (b, created) = store.get_or_insert_with("globex", "k1", || build("globex", "k1"));
        assert!(created);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_entries_are_sequenced() {
        let store = TransactionStore::default();
        let (a, _) = store.get_or_insert_with("acme", "k1", || build("acme", "k1"));
        let (b, _) = store.get_or_insert_with("acme", "k2", || build("acme", "k2"));

        let seq_a = store.get(a.id()).unwrap().seq;
        let seq_b = store.get(b.id()).unwrap().seq;
        assert!(seq_b > seq_a);
        assert_eq!(store.entries().len(), 2);
    }
}
