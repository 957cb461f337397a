//! In-process publish/subscribe fan-out of scan status updates.
//!
//! Topics are keyed by scan id. The bus is an injected instance with an
//! explicit lifecycle (constructed at process start, or per-test), never
//! an ambient singleton. Publishing to a topic with no subscribers is a
//! no-op, since observers may subscribe after polling has already begun.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use uuid::Uuid;

use crate::scan::{ScanReport, ScanState};

/// A status/result event delivered to observers of one scan.
///
/// Carries the full current payload, not a diff: an observer that misses
/// intermediate events can trust the last event as the complete state.
#[derive(Debug, Clone, Serialize)]
pub struct ScanEvent {
    pub scan_id: Uuid,
    pub state: ScanState,
    /// Monotonically increasing within one scan's event stream.
    pub timestamp: DateTime<Utc>,
    pub results: Option<ScanReport>,
    /// Human-readable reason, present only on `failed` events.
    pub error: Option<String>,
}

/// One observer's interest in one scan. Ephemeral, never persisted.
///
/// Dropping the subscription (or calling [`NotificationBus::unsubscribe`])
/// withdraws interest without affecting the underlying poll.
pub struct Subscription {
    pub scan_id: Uuid,
    token: u64,
    receiver: UnboundedReceiver<ScanEvent>,
}

impl Subscription {
    /// Receive the next event. Returns `None` once the topic is retired
    /// (terminal event delivered) or the subscription is removed.
    pub async fn next(&mut self) -> Option<ScanEvent> {
        self.receiver.recv().await
    }

    /// Non-blocking variant for pull-style consumers.
    pub fn try_next(&mut self) -> Option<ScanEvent> {
        self.receiver.try_recv().ok()
    }
}

struct Topic {
    subscribers: Vec<(u64, UnboundedSender<ScanEvent>)>,
    last_timestamp: Option<DateTime<Utc>>,
}

impl Topic {
    fn new() -> Self {
        Self {
            subscribers: Vec::new(),
            last_timestamp: None,
        }
    }
}

/// Topic-based pub/sub hub keyed by scan id.
///
/// Delivery order to each subscriber matches publish order for that scan
/// (FIFO per topic); there is no cross-scan ordering guarantee.
#[derive(Clone)]
pub struct NotificationBus {
    topics: Arc<Mutex<HashMap<Uuid, Topic>>>,
    next_token: Arc<AtomicU64>,
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationBus {
    pub fn new() -> Self {
        Self {
            topics: Arc::new(Mutex::new(HashMap::new())),
            next_token: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Register interest in a scan. Subscribers receive only events
    /// published after this call; there is no history replay.
    pub fn subscribe(&self, scan_id: Uuid) -> Subscription {
        let (sender, receiver) = unbounded_channel();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);

        let mut topics = self.topics.lock().unwrap();
        topics
            .entry(scan_id)
            .or_insert_with(Topic::new)
            .subscribers
            .push((token, sender));
        tracing::debug!(scan_id = %scan_id, token, "Observer subscribed");

        Subscription {
            scan_id,
            token,
            receiver,
        }
    }

    /// Withdraw one observer's interest. Other observers, and future
    /// observers, are unaffected.
    pub fn unsubscribe(&self, subscription: &Subscription) {
        let mut topics = self.topics.lock().unwrap();
        if let Some(topic) = topics.get_mut(&subscription.scan_id) {
            topic.subscribers.retain(|(t, _)| *t != subscription.token);
            if topic.subscribers.is_empty() && topic.last_timestamp.is_none() {
                topics.remove(&subscription.scan_id);
            }
        }
        tracing::debug!(scan_id = %subscription.scan_id, token = subscription.token, "Observer unsubscribed");
    }

    /// Deliver a full-snapshot event to every current subscriber of the scan.
    ///
    /// A no-op (not an error) with zero subscribers. After a terminal event
    /// is delivered, the topic is retired and remaining subscriptions close.
    pub fn publish(
        &self,
        scan_id: Uuid,
        state: ScanState,
        results: Option<ScanReport>,
        error: Option<String>,
    ) {
        let mut topics = self.topics.lock().unwrap();
        let Some(topic) = topics.get_mut(&scan_id) else {
            tracing::trace!(scan_id = %scan_id, %state, "No subscribers, event dropped");
            return;
        };

        // Clock skew between quick successive publishes must not reorder
        // events for consumers that sort by timestamp.
        let mut timestamp = Utc::now();
        if let Some(last) = topic.last_timestamp {
            if timestamp <= last {
                timestamp = last + TimeDelta::microseconds(1);
            }
        }
        topic.last_timestamp = Some(timestamp);

        let event = ScanEvent {
            scan_id,
            state,
            timestamp,
            results,
            error,
        };

        // Drop subscribers whose receiver side is gone.
        topic
            .subscribers
            .retain(|(_, sender)| sender.send(event.clone()).is_ok());

        tracing::debug!(
            scan_id = %scan_id,
            %state,
            subscribers = topic.subscribers.len(),
            "Event published"
        );

        if state.is_terminal() {
            topics.remove(&scan_id);
        }
    }

    /// Number of current subscribers for a scan.
    pub fn subscriber_count(&self, scan_id: Uuid) -> usize {
        self.topics
            .lock()
            .unwrap()
            .get(&scan_id)
            .map(|t| t.subscribers.len())
            .unwrap_or(0)
    }
}
