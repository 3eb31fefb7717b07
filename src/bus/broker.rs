//! In-process publish/subscribe broker.
//!
//! Delivery is synchronous from the publisher's point of view: `publish`
//! fans a message out to every matching subscriber, in subscription order,
//! before returning. Subscriber failures are isolated — the broker logs and
//! keeps delivering, never surfacing the failure to the publisher. The
//! broker holds no business state.
//!
//! Channel subscriptions are unbounded; a slow subscriber risks unbounded
//! memory growth. That is an accepted operational risk, mitigated by
//! heartbeat-driven liveness checks and process restarts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::bus::message::Message;
use crate::error::Result;

/// Subscription pattern: an exact type, a `prefix.*` wildcard, or `*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypePattern {
    /// Matches one exact type string.
    Exact(String),
    /// Matches any type starting with the stored prefix (from `"gui.*"`).
    Prefix(String),
    /// Matches every message.
    All,
}

impl TypePattern {
    /// Parse a pattern string (`"speak"`, `"gui.*"`, `"*"`).
    pub fn parse(pattern: &str) -> Self {
        if pattern == "*" {
            Self::All
        } else if let Some(prefix) = pattern.strip_suffix(".*") {
            Self::Prefix(format!("{prefix}."))
        } else {
            Self::Exact(pattern.to_owned())
        }
    }

    /// Whether a message type matches this pattern.
    pub fn matches(&self, msg_type: &str) -> bool {
        match self {
            Self::Exact(t) => t == msg_type,
            Self::Prefix(p) => msg_type.starts_with(p.as_str()),
            Self::All => true,
        }
    }
}

/// Synchronous handler invoked inline during `publish`.
pub type Handler = Arc<dyn Fn(&Message) -> Result<()> + Send + Sync>;

enum SubscriberSink {
    Handler(Handler),
    Channel(mpsc::UnboundedSender<Message>),
}

struct Subscription {
    id: u64,
    pattern: TypePattern,
    sink: SubscriberSink,
}

/// Handle used to remove a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

/// The in-process broker shared by all services in this host.
#[derive(Default)]
pub struct Broker {
    subscriptions: Mutex<Vec<Arc<Subscription>>>,
    next_id: AtomicU64,
}

impl Broker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an inline handler for a type pattern.
    pub fn subscribe_handler(&self, pattern: &str, handler: Handler) -> SubscriptionId {
        self.push(TypePattern::parse(pattern), SubscriberSink::Handler(handler))
    }

    /// Register a channel subscription; matching messages are cloned into
    /// the returned receiver.
    pub fn subscribe(&self, pattern: &str) -> (SubscriptionId, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.push(TypePattern::parse(pattern), SubscriberSink::Channel(tx));
        (id, rx)
    }

    /// Remove a subscription. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut subs = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
        subs.retain(|s| s.id != id.0);
    }

    /// Fan a message out to every matching subscriber, in subscription order.
    ///
    /// Handler errors and closed channels are logged and skipped; they never
    /// propagate to the publisher.
    pub fn publish(&self, message: &Message) {
        // Snapshot matching subscriptions so handlers can re-enter the broker
        // (publish, subscribe) without deadlocking.
        let matching: Vec<Arc<Subscription>> = {
            let subs = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
            subs.iter()
                .filter(|s| s.pattern.matches(&message.msg_type))
                .cloned()
                .collect()
        };

        debug!(
            msg_type = %message.msg_type,
            subscribers = matching.len(),
            "bus publish"
        );

        let mut dead = Vec::new();
        for sub in &matching {
            match &sub.sink {
                SubscriberSink::Handler(handler) => {
                    if let Err(e) = handler(message) {
                        warn!(
                            msg_type = %message.msg_type,
                            error = %e,
                            "bus handler failed; continuing delivery"
                        );
                    }
                }
                SubscriberSink::Channel(tx) => {
                    if tx.send(message.clone()).is_err() {
                        dead.push(sub.id);
                    }
                }
            }
        }

        if !dead.is_empty() {
            let mut subs = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
            subs.retain(|s| !dead.contains(&s.id));
        }
    }

    /// Number of live subscriptions (for diagnostics).
    pub fn subscription_count(&self) -> usize {
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    fn push(&self, pattern: TypePattern, sink: SubscriberSink) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut subs = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
        subs.push(Arc::new(Subscription { id, pattern, sink }));
        SubscriptionId(id)
    }
}
