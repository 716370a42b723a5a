//! Event publisher trait and in-memory implementation.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::CoordinatorError;
use crate::outbox::OutboxMessage;

/// Forwards outbox messages to an external event bus or broker.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Delivers one message. An error leaves the message pending for retry.
    async fn publish(&self, message: &OutboxMessage) -> Result<(), CoordinatorError>;
}

#[derive(Debug, Default)]
struct InMemoryPublisherState {
    published: Vec<OutboxMessage>,
    fail_on_publish: bool,
}

/// In-memory publisher for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryEventPublisher {
    state: Arc<RwLock<InMemoryPublisherState>>,
}

impl InMemoryEventPublisher {
    /// Creates a new in-memory publisher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures the publisher to reject every message until reset.
    pub fn set_fail_on_publish(&self, fail: bool) {
        self.state.write().fail_on_publish = fail;
    }

    /// Returns the number of messages delivered so far.
    pub fn published_count(&self) -> usize {
        self.state.read().published.len()
    }

    /// Returns the delivered messages in delivery order.
    pub fn published(&self) -> Vec<OutboxMessage> {
        self.state.read().published.clone()
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventPublisher {
    async fn publish(&self, message: &OutboxMessage) -> Result<(), CoordinatorError> {
        let mut state = self.state.write();

        if state.fail_on_publish {
            return Err(CoordinatorError::Publish("Broker unavailable".to_string()));
        }

        state.published.push(message.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use common::TransactionId;
    use serde_json::json;

    fn message() -> OutboxMessage {
        OutboxMessage::new(
            TransactionId::new(),
            "acme",
            "outbox.committed".to_string(),
            json!({}),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_publish_records_message() {
        let publisher = InMemoryEventPublisher::new();
        let m = message();

        publisher.publish(&m).await.unwrap();
        assert_eq!(publisher.published_count(), 1);
        assert_eq!(publisher.published()[0].id, m.id);
    }

    #[tokio::test]
    async fn test_fail_on_publish() {
        let publisher = InMemoryEventPublisher::new();
        publisher.set_fail_on_publish(true);

        let result = publisher.publish(&message()).await;
        assert!(matches!(result, Err(CoordinatorError::Publish(_))));
        assert_eq!(publisher.published_count(), 0);

        publisher.set_fail_on_publish(false);
        publisher.publish(&message()).await.unwrap();
        assert_eq!(publisher.published_count(), 1);
    }
}
