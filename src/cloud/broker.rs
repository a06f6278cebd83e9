use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::pubsub::{PubSubClient, PubSubEvent, PubSubSubscription};
use crate::error::{ConnectionError, TwainError};
use crate::protocol::{CloudEnvelope, CommandId, EventBrokerInfo, body_command_id};

/// Result of routing one incoming message.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum DispatchOutcome {
    /// Delivered; `kept` is true for keep-alive listeners.
    Delivered { kept: bool },
    /// No listener matched; the message was dropped.
    Unmatched,
    /// The envelope could not be decoded; the message was dropped.
    Malformed,
}

#[derive(Debug)]
struct ListenerEntry {
    key: u64,
    correlation: Option<CommandId>,
    keep_alive: bool,
    sender: mpsc::UnboundedSender<String>,
}

/// Routes messages from one response topic to the requests awaiting them.
///
/// Messages carrying a `commandId` go only to the listener registered for
/// that id. Messages without one go to the oldest uncorrelated listener.
#[derive(Debug)]
pub struct EventBroker {
    info: EventBrokerInfo,
    listeners: Mutex<Vec<ListenerEntry>>,
    next_key: AtomicU64,
    connection_lost: CancellationToken,
    lost_reason: Mutex<Option<String>>,
}

impl EventBroker {
    /// Subscribes to the broker's response topic and starts dispatching.
    #[instrument(skip(client, auth_token), level = "info", fields(topic = %info.topic, broker_type = %info.broker_type))]
    pub async fn connect(
        info: EventBrokerInfo,
        auth_token: &str,
        client: &dyn PubSubClient,
    ) -> Result<Arc<Self>, TwainError> {
        let subscription = client.subscribe(&info, auth_token).await?;
        let broker = Arc::new(Self::new(info));
        tokio::spawn(run_dispatch(Arc::downgrade(&broker), subscription));
        info!("event broker subscribed");
        Ok(broker)
    }

    pub(crate) fn new(info: EventBrokerInfo) -> Self {
        Self {
            info,
            listeners: Mutex::new(Vec::new()),
            next_key: AtomicU64::new(1),
            connection_lost: CancellationToken::new(),
            lost_reason: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn info(&self) -> &EventBrokerInfo {
        &self.info
    }

    /// Registers a listener; it is removed when the returned handle drops.
    pub fn add_listener(
        self: &Arc<Self>,
        correlation: Option<CommandId>,
        keep_alive: bool,
    ) -> PendingDelivery {
        let (sender, receiver) = mpsc::unbounded_channel();
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        self.lock_listeners().push(ListenerEntry {
            key,
            correlation: correlation.clone(),
            keep_alive,
            sender,
        });
        debug!(key, ?correlation, keep_alive, "registered broker listener");

        PendingDelivery {
            key,
            broker: Arc::downgrade(self),
            receiver,
            connection_lost: self.connection_lost.clone(),
        }
    }

    /// Removes a listener by key. Unknown keys are ignored.
    pub(crate) fn remove_listener(&self, key: u64) {
        self.lock_listeners().retain(|entry| entry.key != key);
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.lock_listeners().len()
    }

    /// Token cancelled once the broker connection is lost.
    #[must_use]
    pub fn connection_lost(&self) -> CancellationToken {
        self.connection_lost.clone()
    }

    /// Reason reported with the connection loss, if it happened.
    #[must_use]
    pub fn lost_reason(&self) -> Option<String> {
        self.lock_reason().clone()
    }

    /// Routes one raw topic payload to its listener.
    #[instrument(skip(self, payload), level = "debug", fields(payload_len = payload.len()))]
    pub(crate) fn dispatch(&self, payload: &[u8]) -> DispatchOutcome {
        let envelope = match CloudEnvelope::decode(payload) {
            Ok(envelope) => envelope,
            Err(error) => {
                warn!(%error, "dropping undecodable broker message");
                return DispatchOutcome::Malformed;
            }
        };
        let body = match envelope.body_text() {
            Ok(body) => body.to_string(),
            Err(error) => {
                warn!(%error, "dropping broker message without a body");
                return DispatchOutcome::Malformed;
            }
        };
        if let Some(status) = envelope.status_code
            && !(200..300).contains(&status)
        {
            warn!(status, headers = ?envelope.headers, "relayed response carries an error status");
        }

        let command_id = body_command_id(&body);
        let mut listeners = self.lock_listeners();
        let position = match &command_id {
            Some(id) => listeners
                .iter()
                .position(|entry| entry.correlation.as_ref() == Some(id)),
            None => listeners.iter().position(|entry| entry.correlation.is_none()),
        };
        let Some(position) = position else {
            warn!(?command_id, "no listener for broker message, dropping");
            return DispatchOutcome::Unmatched;
        };

        let kept = listeners[position].keep_alive;
        let sender = if kept {
            listeners[position].sender.clone()
        } else {
            listeners.remove(position).sender
        };
        drop(listeners);

        if sender.send(body).is_err() {
            debug!(?command_id, "listener went away before delivery");
            return DispatchOutcome::Unmatched;
        }
        debug!(?command_id, kept, "delivered broker message");
        DispatchOutcome::Delivered { kept }
    }

    /// Marks the connection lost and fails every pending listener.
    pub(crate) fn fail_all(&self, reason: &str) {
        if self.connection_lost.is_cancelled() {
            return;
        }
        warn!(reason, "event broker connection lost");
        *self.lock_reason() = Some(reason.to_string());
        self.lock_listeners().clear();
        self.connection_lost.cancel();
    }

    fn lock_listeners(&self) -> std::sync::MutexGuard<'_, Vec<ListenerEntry>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_reason(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.lost_reason.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn run_dispatch(broker: Weak<EventBroker>, mut subscription: PubSubSubscription) {
    while let Some(event) = subscription.next().await {
        let Some(broker) = broker.upgrade() else {
            return;
        };
        match event {
            PubSubEvent::Message(payload) => {
                broker.dispatch(&payload);
            }
            PubSubEvent::ConnectionLost { reason } => {
                broker.fail_all(&reason);
                return;
            }
        }
    }

    if let Some(broker) = broker.upgrade() {
        broker.fail_all("subscription stream ended");
    }
}

/// A registered broker listener awaiting delivery.
#[derive(Debug)]
pub struct PendingDelivery {
    key: u64,
    broker: Weak<EventBroker>,
    receiver: mpsc::UnboundedReceiver<String>,
    connection_lost: CancellationToken,
}

impl PendingDelivery {
    /// Waits for the next body delivered to this listener.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` when nothing arrives within `timeout`, and a
    /// connection error when the broker connection drops first.
    pub async fn next(&mut self, timeout: Duration, operation: &str) -> Result<String, TwainError> {
        tokio::select! {
            biased;
            body = self.receiver.recv() => match body {
                Some(body) => Ok(body),
                None => Err(self.disconnected()),
            },
            () = self.connection_lost.cancelled() => Err(self.disconnected()),
            () = sleep(timeout) => Err(TwainError::timeout(operation, timeout)),
        }
    }

    fn disconnected(&self) -> TwainError {
        let reason = self
            .broker
            .upgrade()
            .and_then(|broker| broker.lost_reason())
            .unwrap_or_else(|| "event broker dropped".to_string());
        ConnectionError::BrokerDisconnected { reason }.into()
    }
}

impl Drop for PendingDelivery {
    fn drop(&mut self) {
        if let Some(broker) = self.broker.upgrade() {
            broker.remove_listener(self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn broker() -> Arc<EventBroker> {
        Arc::new(EventBroker::new(EventBrokerInfo {
            broker_type: "mqtt".to_string(),
            url: "wss://broker.example".to_string(),
            topic: "responses".to_string(),
        }))
    }

    fn envelope(body: &serde_json::Value) -> Vec<u8> {
        json!({
            "headers": {"content-Type": "application/json; charset=UTF-8"},
            "statusCode": 200,
            "body": body.to_string(),
        })
        .to_string()
        .into_bytes()
    }

    fn id(value: &str) -> CommandId {
        CommandId::from(value.to_string())
    }

    #[tokio::test]
    async fn delivery_matches_command_id_not_arrival_order() -> Result<(), TwainError> {
        let broker = broker();
        let mut first = broker.add_listener(Some(id("first")), false);
        let mut second = broker.add_listener(Some(id("second")), false);

        let outcome = broker.dispatch(&envelope(&json!({"commandId": "second", "n": 2})));

        assert_eq!(DispatchOutcome::Delivered { kept: false }, outcome);
        let body = second.next(Duration::from_millis(10), "second").await?;
        assert!(body.contains("\"n\":2"));
        assert_eq!(1, broker.listener_count());
        assert_matches!(
            first.next(Duration::from_millis(10), "first").await,
            Err(TwainError::Timeout { .. })
        );
        Ok(())
    }

    #[tokio::test]
    async fn keep_alive_listener_stays_registered() -> Result<(), TwainError> {
        let broker = broker();
        let mut events = broker.add_listener(Some(id("events")), true);

        for n in 0..2 {
            let outcome = broker.dispatch(&envelope(&json!({"commandId": "events", "n": n})));
            assert_eq!(DispatchOutcome::Delivered { kept: true }, outcome);
        }

        assert!(events.next(Duration::from_millis(10), "events").await?.contains("\"n\":0"));
        assert!(events.next(Duration::from_millis(10), "events").await?.contains("\"n\":1"));
        assert_eq!(1, broker.listener_count());
        Ok(())
    }

    #[test]
    fn uncorrelated_body_goes_to_uncorrelated_listener() {
        let broker = broker();
        let _command = broker.add_listener(Some(id("cmd")), false);
        let _info = broker.add_listener(None, false);

        let outcome = broker.dispatch(&envelope(&json!({"x-privet-token": "t"})));

        assert_eq!(DispatchOutcome::Delivered { kept: false }, outcome);
        assert_eq!(1, broker.listener_count());
    }

    #[test]
    fn unmatched_and_malformed_messages_are_dropped() {
        let broker = broker();
        let _listener = broker.add_listener(Some(id("mine")), false);

        assert_eq!(
            DispatchOutcome::Unmatched,
            broker.dispatch(&envelope(&json!({"commandId": "someone-else"})))
        );
        assert_eq!(DispatchOutcome::Malformed, broker.dispatch(b"not json"));
        assert_eq!(
            DispatchOutcome::Malformed,
            broker.dispatch(br#"{"statusCode":200,"body":{"nested":true}}"#)
        );
        assert_eq!(1, broker.listener_count());
    }

    #[test]
    fn dropping_pending_delivery_unregisters_listener() {
        let broker = broker();
        let pending = broker.add_listener(Some(id("gone")), false);
        assert_eq!(1, broker.listener_count());

        drop(pending);

        assert_eq!(0, broker.listener_count());
    }

    #[tokio::test]
    async fn connection_loss_fails_outstanding_waits() {
        let broker = broker();
        let mut pending = broker.add_listener(Some(id("waiting")), false);

        broker.fail_all("socket closed");

        let result = pending.next(Duration::from_secs(30), "waiting").await;
        assert_matches!(
            result,
            Err(TwainError::Connection(ConnectionError::BrokerDisconnected { reason }))
                if reason == "socket closed"
        );
        assert!(broker.connection_lost().is_cancelled());
    }
}
