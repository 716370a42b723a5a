//! Reliable publish queue for committed transactions.
//!
//! Messages are only ever enqueued by the commit aggregation step, and are
//! drained by the caller: synchronously through [`Outbox::publish`], or
//! through an async relay that claims a batch, delivers it without holding
//! the outbox lock, and records the outcomes afterwards.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::{MessageId, Payload, TransactionId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::clock::after;
use crate::config::CoordinatorConfig;

/// Delivery status of an outbox message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    /// Waiting for (re)delivery.
    Pending,
    /// Delivered.
    Published,
    /// Retry budget exhausted; parked for manual inspection.
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Published => "published",
            OutboxStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// At-least-once delivery unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxMessage {
    pub id: MessageId,
    pub transaction_id: TransactionId,
    pub tenant_id: String,
    pub event_type: String,
    pub payload: Payload,
    pub status: OutboxStatus,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub next_attempt_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl OutboxMessage {
    pub(crate) fn new(
        transaction_id: TransactionId,
        tenant_id: &str,
        event_type: String,
        payload: Payload,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: MessageId::new(),
            transaction_id,
            tenant_id: tenant_id.to_string(),
            event_type,
            payload,
            status: OutboxStatus::Pending,
            attempts: 0,
            created_at: now,
            next_attempt_at: now,
            published_at: None,
            last_error: None,
        }
    }

    /// Returns true if the message is waiting and its retry time has come.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == OutboxStatus::Pending && self.next_attempt_at <= now
    }

    fn mark_published(&mut self, now: DateTime<Utc>) {
        self.status = OutboxStatus::Published;
        self.published_at = Some(now);
        self.last_error = None;
    }

    fn mark_attempt_failed(&mut self, error: Option<String>, policy: &OutboxPolicy, now: DateTime<Utc>) {
        self.attempts += 1;
        self.last_error = error;
        if self.attempts >= policy.max_attempts {
            self.status = OutboxStatus::Failed;
        } else {
            self.next_attempt_at = after(now, policy.backoff(self.attempts));
        }
    }
}

/// Batching, retry and retention limits for the outbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxPolicy {
    pub batch_size: usize,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub retention_limit: usize,
    pub retention_trim: usize,
    pub claim_lease: Duration,
}

impl OutboxPolicy {
    /// Delay before the next attempt after `attempts` failures: the base
    /// delay doubled for each failure after the first.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        self.backoff_base.saturating_mul(1u32 << exponent)
    }
}

impl From<&CoordinatorConfig> for OutboxPolicy {
    fn from(config: &CoordinatorConfig) -> Self {
        Self {
            batch_size: config.outbox_batch_size,
            max_attempts: config.outbox_max_attempts,
            backoff_base: config.outbox_backoff_base,
            retention_limit: config.outbox_retention_limit,
            retention_trim: config.outbox_retention_trim,
            claim_lease: config.outbox_claim_lease,
        }
    }
}

impl Default for OutboxPolicy {
    fn default() -> Self {
        Self::from(&CoordinatorConfig::default())
    }
}

/// Ordered, retryable message queue.
#[derive(Debug)]
pub struct Outbox {
    policy: OutboxPolicy,
    messages: Mutex<VecDeque<OutboxMessage>>,
}

impl Outbox {
    pub fn new(policy: OutboxPolicy) -> Self {
        Self {
            policy,
            messages: Mutex::new(VecDeque::new()),
        }
    }

    pub fn policy(&self) -> &OutboxPolicy {
        &self.policy
    }

    /// Appends a message, dropping the oldest `retention_trim` entries once the
    /// queue grows past `retention_limit`, whatever their status.
    pub(crate) fn enqueue(&self, message: OutboxMessage) {
        let mut messages = self.messages.lock();
        messages.push_back(message);

        if messages.len() > self.policy.retention_limit {
            let dropped = self.policy.retention_trim.min(messages.len());
            messages.drain(..dropped);
            metrics::counter!("outbox_trimmed_total").increment(dropped as u64);
            tracing::debug!(dropped, remaining = messages.len(), "outbox trimmed");
        }
    }

    /// Delivers up to one batch of due messages through `deliver`.
    ///
    /// The batch is claimed first and `deliver` runs with the outbox
    /// unlocked, so it may read coordinator state freely. Returns the number
    /// of messages published.
    pub fn publish<F>(&self, now: DateTime<Utc>, mut deliver: F) -> usize
    where
        F: FnMut(&OutboxMessage) -> bool,
    {
        let mut published = 0;

        for message in self.claim_due(now) {
            let outcome = if deliver(&message) {
                Ok(())
            } else {
                Err("delivery rejected".to_string())
            };
            if self.complete(message.id, outcome, now) == Some(OutboxStatus::Published) {
                published += 1;
            }
        }
        published
    }

    /// Leases up to one batch of due messages to an async relay.
    ///
    /// Claimed messages stay `Pending` but are not due again until the claim
    /// lease runs out, so a concurrent relay skips them and a relay that never
    /// reports back does not lose them.
    pub(crate) fn claim_due(&self, now: DateTime<Utc>) -> Vec<OutboxMessage> {
        let lease_until = after(now, self.policy.claim_lease);
        let mut messages = self.messages.lock();

        messages
            .iter_mut()
            .filter(|m| m.is_due(now))
            .take(self.policy.batch_size)
            .map(|message| {
                message.next_attempt_at = lease_until;
                message.clone()
            })
            .collect()
    }

    /// Records the outcome of delivering a claimed message.
    ///
    /// Returns the message's new status, or `None` if it is gone (trimmed) or
    /// was already settled.
    pub(crate) fn complete(
        &self,
        id: MessageId,
        outcome: std::result::Result<(), String>,
        now: DateTime<Utc>,
    ) -> Option<OutboxStatus> {
        let mut messages = self.messages.lock();
        let message = messages
            .iter_mut()
            .find(|m| m.id == id && m.status == OutboxStatus::Pending)?;

        match outcome {
            Ok(()) => {
                message.mark_published(now);
                metrics::counter!("outbox_published_total").increment(1);
            }
            Err(error) => {
                message.mark_attempt_failed(Some(error), &self.policy, now);
                Self::observe_failure(message);
            }
        }
        Some(message.status)
    }

    /// Lists messages in enqueue order, optionally filtered by status.
    pub fn list(&self, status: Option<OutboxStatus>) -> Vec<OutboxMessage> {
        self.messages
            .lock()
            .iter()
            .filter(|m| status.is_none_or(|s| m.status == s))
            .cloned()
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.messages
            .lock()
            .iter()
            .filter(|m| m.status == OutboxStatus::Pending)
            .count()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn observe_failure(message: &OutboxMessage) {
        metrics::counter!("outbox_delivery_failures_total").increment(1);
        if message.status == OutboxStatus::Failed {
            metrics::counter!("outbox_dead_lettered_total").increment(1);
            tracing::warn!(
                message_id = %message.id,
                transaction_id = %message.transaction_id,
                event_type = %message.event_type,
                attempts = message.attempts,
                "outbox message dead-lettered"
            );
        } else {
            tracing::debug!(
                message_id = %message.id,
                attempts = message.attempts,
                next_attempt_at = %message.next_attempt_at,
                "outbox delivery failed, retry scheduled"
            );
        }
    }
}

impl Default for Outbox {
    fn default() -> Self {
        Self::new(OutboxPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as TimeDelta;
    use serde_json::json;

    fn message(now: DateTime<Utc>) -> OutboxMessage {
        OutboxMessage::new(
            TransactionId::new(),
            "acme",
            "two_phase_commit.committed".to_string(),
            json!({"ok": true}),
            now,
        )
    }

    #[test]
    fn test_backoff_doubles_from_base() {
        let policy = OutboxPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
        assert_eq!(policy.backoff(4), Duration::from_secs(8));
    }

    #[test]
    fn test_publish_marks_published() {
        let outbox = Outbox::default();
        let now = Utc::now();
        outbox.enqueue(message(now));

        let published = outbox.publish(now, |m| {
            assert_eq!(m.event_type, "two_phase_commit.committed");
            true
        });
        assert!(outbox.list(None)[0].last_error.is_none());

        assert_eq!(published, 1);
        let all = outbox.list(None);
        assert_eq!(all[0].status, OutboxStatus::Published);
        assert_eq!(all[0].published_at, Some(now));
        assert_eq!(outbox.pending_count(), 0);
    }

    #[test]
    fn test_failed_delivery_backs_off_then_dead_letters() {
        let outbox = Outbox::default();
        let start = Utc::now();
        outbox.enqueue(message(start));

        let mut now = start;
        let mut gaps = Vec::new();
        for _ in 0..4 {
            assert_eq!(outbox.publish(now, |_| false), 0);
            let all = outbox.list(None);
            let m = &all[0];
            assert_eq!(m.status, OutboxStatus::Pending);
            gaps.push((m.next_attempt_at - now).num_seconds());

            // Not due before the backoff elapses.
            let calls = outbox.publish(m.next_attempt_at - TimeDelta::milliseconds(1), |_| true);
            assert_eq!(calls, 0);
            now = m.next_attempt_at;
        }
        assert_eq!(gaps, vec![1, 2, 4, 8]);

        assert_eq!(outbox.publish(now, |_| false), 0);
        let all = outbox.list(None);
        let m = &all[0];
        assert_eq!(m.status, OutboxStatus::Failed);
        assert_eq!(m.attempts, 5);

        let mut called = false;
        outbox.publish(now + TimeDelta::days(1), |_| {
            called = true;
            true
        });
        assert!(!called);
    }

    #[test]
    fn test_deliver_can_read_the_outbox() {
        let outbox = Outbox::default();
        let now = Utc::now();
        outbox.enqueue(message(now));

        let published = outbox.publish(now, |m| {
            outbox.enqueue(message(now));
            outbox.list(None).iter().any(|listed| listed.id == m.id)
        });
        assert_eq!(published, 1);
        assert_eq!(outbox.len(), 2);
        assert_eq!(outbox.pending_count(), 1);
    }

    #[test]
    fn test_rejected_delivery_records_error() {
        let outbox = Outbox::default();
        let now = Utc::now();
        outbox.enqueue(message(now));

        assert_eq!(outbox.publish(now, |_| false), 0);
        let all = outbox.list(None);
        assert_eq!(all[0].attempts, 1);
        assert_eq!(all[0].last_error.as_deref(), Some("delivery rejected"));
    }

    #[test]
    fn test_publish_respects_batch_size() {
        let outbox = Outbox::new(OutboxPolicy {
            batch_size: 2,
            ..OutboxPolicy::default()
        });
        let now = Utc::now();
        for _ in 0..5 {
            outbox.enqueue(message(now));
        }

        assert_eq!(outbox.publish(now, |_| true), 2);
        assert_eq!(outbox.pending_count(), 3);
        assert_eq!(outbox.publish(now, |_| true), 2);
        assert_eq!(outbox.publish(now, |_| true), 1);
        assert_eq!(outbox.list(Some(OutboxStatus::Published)).len(), 5);
    }

    #[test]
    fn test_retention_drops_oldest_entries() {
        let outbox = Outbox::new(OutboxPolicy {
            retention_limit: 10,
            retention_trim: 3,
            ..OutboxPolicy::default()
        });
        let now = Utc::now();
        let mut ids = Vec::new();
        for _ in 0..11 {
            let m = message(now);
            ids.push(m.id);
            outbox.enqueue(m);
        }

        let remaining: Vec<_> = outbox.list(None).into_iter().map(|m| m.id).collect();
        assert_eq!(remaining.len(), 8);
        assert_eq!(remaining, ids[3..].to_vec());
    }

    #[test]
    fn test_claimed_messages_are_leased() {
        let outbox = Outbox::default();
        let now = Utc::now();
        outbox.enqueue(message(now));

        let claimed = outbox.claim_due(now);
        assert_eq!(claimed.len(), 1);
        assert!(outbox.claim_due(now).is_empty());

        // Lease expiry makes an unreported claim due again.
        assert_eq!(outbox.claim_due(now + TimeDelta::seconds(30)).len(), 1);
    }

    #[test]
    fn test_complete_records_outcomes() {
        let outbox = Outbox::default();
        let now = Utc::now();
        outbox.enqueue(message(now));
        outbox.enqueue(message(now));

        let claimed = outbox.claim_due(now);
        assert_eq!(
            outbox.complete(claimed[0].id, Ok(()), now),
            Some(OutboxStatus::Published)
        );
        assert_eq!(
            outbox.complete(claimed[1].id, Err("broker down".into()), now),
            Some(OutboxStatus::Pending)
        );
        assert_eq!(outbox.complete(claimed[0].id, Ok(()), now), None);

        let pending = outbox.list(Some(OutboxStatus::Pending));
        let retried = &pending[0];
        assert_eq!(retried.attempts, 1);
        assert_eq!(retried.last_error.as_deref(), Some("broker down"));
        assert_eq!(retried.next_attempt_at, now + TimeDelta::seconds(1));
    }
}
