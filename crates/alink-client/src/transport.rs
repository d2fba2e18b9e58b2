//! Transport collaborator contract.
//!
//! The embedder supplies a [`Transport`] for publishing and managing
//! subscriptions, and feeds every delivered message to
//! [`Session::dispatch`](crate::Session::dispatch) from its delivery loop.

use alink_proto::TopicLayout;
use async_trait::async_trait;

/// Delivery guarantee for a publish or subscription.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Qos {
    /// Fire and forget
    #[default]
    AtMostOnce,
    /// Acknowledged delivery
    AtLeastOnce,
}

/// Publish/subscribe channel to the upstream endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish a payload on a topic.
    async fn publish(&self, topic: &str, qos: Qos, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Subscribe to a topic filter.
    async fn subscribe(&self, topic: &str, qos: Qos) -> Result<(), TransportError>;

    /// Remove subscriptions.
    async fn unsubscribe(&self, topics: &[String]) -> Result<(), TransportError>;

    /// Topic layout this transport requires.
    fn layout(&self) -> TopicLayout {
        TopicLayout::mqtt()
    }
}

/// Errors for transport operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Publish failed
    #[error("publish error: {0}")]
    Publish(String),
    /// Subscription failed
    #[error("subscription error: {0}")]
    Subscribe(String),
    /// Unsubscription failed
    #[error("unsubscribe error: {0}")]
    Unsubscribe(String),
    /// Invalid broker URL
    #[error("invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
}
