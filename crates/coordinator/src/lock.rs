//! Per-resource exclusive leases scoped to a transaction.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::TransactionId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::clock::after;
use crate::error::{CoordinatorError, Result};

/// A live or expired lease on a tenant's resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionLock {
    pub resource_id: String,
    pub tenant_id: String,
    pub transaction_id: TransactionId,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl TransactionLock {
    /// Returns true once the lease has run out.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LockKey {
    tenant_id: String,
    resource_id: String,
}

impl LockKey {
    fn new(tenant_id: &str, resource_id: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            resource_id: resource_id.to_string(),
        }
    }
}

/// Lock table keyed by `(tenant, resource)`.
///
/// At most one live lock exists per key. Acquisition never blocks or queues,
/// expired locks are simply overwritten by the next acquirer, and there is no
/// renewal other than re-acquiring.
#[derive(Debug, Default)]
pub struct LockTable {
    locks: Mutex<HashMap<LockKey, TransactionLock>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires or re-acquires a lease.
    ///
    /// Succeeds when the key is free, its lock has expired, or the same
    /// transaction already holds it (which restarts the lease).
    pub fn acquire(
        &self,
        resource_id: &str,
        tenant_id: &str,
        transaction_id: TransactionId,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<TransactionLock> {
        let key = LockKey::new(tenant_id, resource_id);
        let mut locks = self.locks.lock();

        if let Some(existing) = locks.get(&key)
            && !existing.is_expired(now)
            && existing.transaction_id != transaction_id
        {
            return Err(CoordinatorError::LockContended {
                resource_id: resource_id.to_string(),
                tenant_id: tenant_id.to_string(),
                holder: existing.transaction_id,
            });
        }

        let lock = TransactionLock {
            resource_id: resource_id.to_string(),
            tenant_id: tenant_id.to_string(),
            transaction_id,
            acquired_at: now,
            expires_at: after(now, ttl),
        };
        locks.insert(key, lock.clone());
        Ok(lock)
    }

    /// Releases a lease held by `transaction_id`.
    ///
    /// An expired lease still held by the caller can be released.
    pub fn release(&self, resource_id: &str, tenant_id: &str, transaction_id: TransactionId) -> Result<()> {
        let key = LockKey::new(tenant_id, resource_id);
        let mut locks = self.locks.lock();

        match locks.get(&key) {
            Some(existing) if existing.transaction_id == transaction_id => {
                locks.remove(&key);
                Ok(())
            }
            _ => Err(CoordinatorError::LockNotHeld {
                resource_id: resource_id.to_string(),
                transaction_id,
            }),
        }
    }

    /// Releases every lease held by a transaction. Returns how many were removed.
    pub fn release_all(&self, transaction_id: TransactionId) -> usize {
        let mut locks = self.locks.lock();
        let before = locks.len();
        locks.retain(|_, lock| lock.transaction_id != transaction_id);
        before - locks.len()
    }

    /// Drops expired leases. Returns how many were removed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut locks = self.locks.lock();
        let before = locks.len();
        locks.retain(|_, lock| !lock.is_expired(now));
        before - locks.len()
    }

    /// Returns the live lock on a resource, if any.
    pub fn holder(&self, resource_id: &str, tenant_id: &str, now: DateTime<Utc>) -> Option<TransactionLock> {
        self.locks
            .lock()
            .get(&LockKey::new(tenant_id, resource_id))
            .filter(|lock| !lock.is_expired(now))
            .cloned()
    }

    /// Number of unexpired leases.
    pub fn active_count(&self, now: DateTime<Utc>) -> usize {
        self.locks
            .lock()
            .values()
            .filter(|lock| !lock.is_expired(now))
            .count()
    }
}
