use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::Stream;
use tracing::debug;

use crate::error::TwainError;
use crate::protocol::EventBrokerInfo;

/// Items produced by a topic subscription.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum PubSubEvent {
    /// Raw payload of one message published on the topic.
    Message(Vec<u8>),
    /// The broker connection dropped; no further messages will arrive.
    ConnectionLost { reason: String },
}

/// Stream of events for one subscribed topic.
#[derive(Debug)]
pub struct PubSubSubscription {
    events: mpsc::UnboundedReceiver<PubSubEvent>,
}

impl PubSubSubscription {
    /// Wraps a receiver fed by a broker client implementation.
    #[must_use]
    pub fn new(events: mpsc::UnboundedReceiver<PubSubEvent>) -> Self {
        Self { events }
    }
}

impl Stream for PubSubSubscription {
    type Item = PubSubEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}

/// Connects to a pub/sub broker and subscribes to a response topic.
///
/// Broker connection mechanics (MQTT sessions, websockets, credentials
/// refresh) live behind this trait.
#[async_trait]
pub trait PubSubClient: Send + Sync + fmt::Debug {
    async fn subscribe(
        &self,
        broker: &EventBrokerInfo,
        auth_token: &str,
    ) -> Result<PubSubSubscription, TwainError>;
}

#[derive(Debug, Default)]
struct ChannelTopics {
    subscribers: Vec<(String, mpsc::UnboundedSender<PubSubEvent>)>,
}

/// In-process pub/sub hub.
///
/// Bridges an external broker client into the session, and backs the fake
/// cloud relay in tests.
#[derive(Debug, Clone, Default)]
pub struct ChannelPubSub {
    topics: Arc<Mutex<ChannelTopics>>,
}

impl ChannelPubSub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a handle that publishes into this hub.
    #[must_use]
    pub fn publisher(&self) -> PubSubPublisher {
        PubSubPublisher {
            topics: Arc::clone(&self.topics),
        }
    }
}

#[async_trait]
impl PubSubClient for ChannelPubSub {
    async fn subscribe(
        &self,
        broker: &EventBrokerInfo,
        _auth_token: &str,
    ) -> Result<PubSubSubscription, TwainError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribers
            .push((broker.topic.clone(), sender));
        debug!(topic = %broker.topic, "subscribed to in-process topic");
        Ok(PubSubSubscription::new(receiver))
    }
}

/// Publishing side of a [`ChannelPubSub`].
#[derive(Debug, Clone)]
pub struct PubSubPublisher {
    topics: Arc<Mutex<ChannelTopics>>,
}

impl PubSubPublisher {
    /// Publishes a payload and returns how many subscribers received it.
    pub fn publish(&self, topic: &str, payload: impl Into<Vec<u8>>) -> usize {
        let payload = payload.into();
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        topics.subscribers.retain(|(_topic, sender)| !sender.is_closed());
        let mut delivered = 0usize;
        for (subscribed, sender) in &topics.subscribers {
            if subscribed == topic && sender.send(PubSubEvent::Message(payload.clone())).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Signals connection loss to every subscriber and forgets them.
    pub fn disconnect(&self, reason: &str) {
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        for (_topic, sender) in topics.subscribers.drain(..) {
            let _closed = sender.send(PubSubEvent::ConnectionLost {
                reason: reason.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tokio_stream::StreamExt;

    use super::*;

    fn broker(topic: &str) -> EventBrokerInfo {
        EventBrokerInfo {
            broker_type: "mqtt".to_string(),
            url: "wss://broker.example".to_string(),
            topic: topic.to_string(),
        }
    }

    #[tokio::test]
    async fn publish_reaches_only_matching_topic() -> Result<(), TwainError> {
        let hub = ChannelPubSub::new();
        let mut responses = hub.subscribe(&broker("responses"), "token").await?;
        let mut other = hub.subscribe(&broker("other"), "token").await?;

        let delivered = hub.publisher().publish("responses", b"hello".to_vec());

        assert_eq!(1, delivered);
        assert_eq!(
            Some(PubSubEvent::Message(b"hello".to_vec())),
            responses.next().await
        );
        hub.publisher().disconnect("test over");
        assert_eq!(
            Some(PubSubEvent::ConnectionLost {
                reason: "test over".to_string()
            }),
            other.next().await
        );
        Ok(())
    }
}
