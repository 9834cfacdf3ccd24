//! Publish/subscribe bus clients talk to.

pub mod gateway;
pub mod local;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;

use crate::error::BusError;
use crate::protocol::Event;

pub use local::LocalBus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    pub topic: String,
    pub event: Event,
}

/// At-most-once publish/subscribe transport.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, topic: &str, event: &Event) -> Result<(), BusError>;

    /// Subscribe to every message matching any of `filters`. Each message is
    /// delivered once per subscription even if several filters match.
    async fn subscribe(&self, filters: Vec<String>) -> Result<Subscription, BusError>;
}

/// Stream of messages for one subscriber.
pub struct Subscription {
    filters: Vec<String>,
    receiver: broadcast::Receiver<BusMessage>,
}

impl Subscription {
    pub(crate) fn new(filters: Vec<String>, receiver: broadcast::Receiver<BusMessage>) -> Self {
        Self { filters, receiver }
    }

    pub fn filters(&self) -> &[String] {
        &self.filters
    }

    /// Next matching message, or `None` once the bus is gone. Messages missed
    /// by a slow subscriber are dropped.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        loop {
            match self.receiver.recv().await {
                Ok(message) => {
                    if self.filters.iter().any(|f| topic_matches(f, &message.topic)) {
                        return Some(message);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, filters = ?self.filters, "subscriber lagging, messages dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

/// MQTT style topic matching: `+` matches one level, a trailing `#` matches
/// any remaining levels.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

pub fn validate_filter(filter: &str) -> Result<(), BusError> {
    if filter.is_empty() {
        return Err(BusError::InvalidFilter(filter.to_string()));
    }
    let levels: Vec<&str> = filter.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        let wildcard_misuse = (level.contains('#') && (*level != "#" || i + 1 != levels.len()))
            || (level.contains('+') && *level != "+");
        if wildcard_misuse {
            return Err(BusError::InvalidFilter(filter.to_string()));
        }
    }
    Ok(())
}

pub fn validate_topic(topic: &str) -> Result<(), BusError> {
    if topic.is_empty() || topic.contains('+') || topic.contains('#') {
        return Err(BusError::InvalidTopic(topic.to_string()));
    }
    Ok(())
}
