//! Client handle over the in-process broker.
//!
//! Services hold a cheap clonable [`BusClient`] for publishing, stream
//! subscriptions, and blocking request/response exchanges correlated by
//! `context.correlation_id`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};

use crate::bus::broker::{Broker, SubscriptionId};
use crate::bus::message::Message;
use crate::error::{Result, SkaldError};

/// A stream subscription that unsubscribes itself when dropped.
pub struct BusSubscription {
    broker: Arc<Broker>,
    id: SubscriptionId,
    rx: mpsc::UnboundedReceiver<Message>,
}

impl BusSubscription {
    /// Wait for the next matching message. `None` once the broker is gone.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Non-blocking poll used by tests and drain loops.
    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }
}

impl Drop for BusSubscription {
    fn drop(&mut self) {
        self.broker.unsubscribe(self.id);
    }
}

/// Cheap clonable handle onto the shared broker.
#[derive(Clone)]
pub struct BusClient {
    broker: Arc<Broker>,
}

impl BusClient {
    /// Wrap a shared broker.
    pub fn new(broker: Arc<Broker>) -> Self {
        Self { broker }
    }

    /// Access the underlying broker (used by the WebSocket server).
    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    /// Publish a message to all matching subscribers.
    pub fn publish(&self, message: &Message) {
        self.broker.publish(message);
    }

    /// Subscribe to a type pattern (`"speak"`, `"gui.*"`, `"*"`).
    pub fn subscribe(&self, pattern: &str) -> BusSubscription {
        let (id, rx) = self.broker.subscribe(pattern);
        BusSubscription {
            broker: Arc::clone(&self.broker),
            id,
            rx,
        }
    }

    /// Publish `message` and wait for a response whose
    /// `context.correlation_id` matches, up to `timeout`.
    ///
    /// A correlation id is attached if the message does not carry one. The
    /// response subscription is registered before publishing so a fast
    /// responder cannot race the caller.
    pub async fn request(&self, mut message: Message, timeout: Duration) -> Result<Message> {
        let correlation_id = match message.context.correlation_id.clone() {
            Some(id) => id,
            None => {
                let (tagged, id) = message.with_correlation();
                message = tagged;
                id
            }
        };

        let request_type = message.msg_type.clone();
        let mut sub = self.subscribe("*");
        self.publish(&message);

        let deadline = Instant::now() + timeout;
        loop {
            let received = timeout_at(deadline, sub.recv())
                .await
                .map_err(|_| SkaldError::Timeout(format!("response to {request_type}")))?;
            let Some(candidate) = received else {
                return Err(SkaldError::Channel("bus closed during request".to_owned()));
            };
            // Skip the echo of our own request; any other type with the same
            // correlation id is the response.
            if candidate.msg_type != request_type
                && candidate.context.correlation_id.as_deref() == Some(correlation_id.as_str())
            {
                return Ok(candidate);
            }
        }
    }
}
