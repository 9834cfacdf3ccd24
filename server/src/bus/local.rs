use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::trace;

use super::{validate_filter, validate_topic, BusMessage, MessageBus, Subscription};
use crate::error::BusError;
use crate::protocol::Event;

const DEFAULT_CAPACITY: usize = 1024;

/// In-process bus backed by a broadcast channel. Publishing with nobody
/// subscribed silently drops the message.
#[derive(Clone)]
pub struct LocalBus {
    sender: broadcast::Sender<BusMessage>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn publish(&self, topic: &str, event: &Event) -> Result<(), BusError> {
        validate_topic(topic)?;
        let message = BusMessage {
            topic: topic.to_string(),
            event: event.clone(),
        };
        let receivers = self.sender.send(message).unwrap_or(0);
        trace!(%topic, method = %event.method, receivers, "published");
        Ok(())
    }

    async fn subscribe(&self, filters: Vec<String>) -> Result<Subscription, BusError> {
        for filter in &filters {
            validate_filter(filter)?;
        }
        Ok(Subscription::new(filters, self.sender.subscribe()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Payload;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = LocalBus::new();
        bus.publish("user/login/events", &Event::new("login_ok", Payload::new()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_subscriber_only_sees_matching_topics() {
        let bus = LocalBus::new();
        let mut sub = bus
            .subscribe(vec!["chat/room/+".to_string(), "chat/room/lobby".to_string()])
            .await
            .unwrap();

        bus.publish("user/login", &Event::new("login", Payload::new())).await.unwrap();
        bus.publish("chat/room/lobby", &Event::new("chat", Payload::new())).await.unwrap();
        bus.publish("chat/room/other", &Event::new("chat", Payload::new())).await.unwrap();

        let first = timeout(Duration::from_secs(1), sub.recv()).await.unwrap().unwrap();
        assert_eq!(first.topic, "chat/room/lobby");
        // Matched by two filters but delivered once.
        let second = timeout(Duration::from_secs(1), sub.recv()).await.unwrap().unwrap();
        assert_eq!(second.topic, "chat/room/other");
    }

    #[tokio::test]
    async fn test_rejects_wildcard_publish() {
        let bus = LocalBus::new();
        let err = bus.publish("chat/+", &Event::new("chat", Payload::new())).await;
        assert!(matches!(err, Err(BusError::InvalidTopic(_))));
    }
}
