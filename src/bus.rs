//! Typed publish/subscribe event bus.
//!
//! A bus instance owns a subscription table and a bounded buffer of recent
//! envelopes. Dispatch is synchronous and in registration order; matching
//! is a pure function of the envelope and the subscription's filters.
//!
//! The bus is explicitly constructed and shared by `Arc` — there is no
//! process-global instance. Cross-process fan-out happens only through the
//! transport forwarder, never through shared memory.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::{Envelope, EventType};

/// Handle returned by `subscribe`, used for `unsubscribe`.
pub type SubscriptionId = u64;

/// Callback invoked for each matching envelope.
pub type EventCallback = Arc<dyn Fn(&Envelope) + Send + Sync>;

/// Predicate applied to the whole envelope (field-level filtering).
pub type EventPredicate = Arc<dyn Fn(&Envelope) -> bool + Send + Sync>;

/// Bus errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    InvalidSubscription(SubscriptionId),
}

impl std::fmt::Display for BusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidSubscription(id) => write!(f, "Unknown subscription id {id}"),
        }
    }
}

impl std::error::Error for BusError {}

/// Optional constraints a subscription places on matching envelopes.
#[derive(Clone, Default)]
pub struct EventFilter {
    pub room_id: Option<String>,
    pub user_id: Option<Uuid>,
    pub predicate: Option<EventPredicate>,
}

impl EventFilter {
    pub fn room(room_id: impl Into<String>) -> Self {
        Self {
            room_id: Some(room_id.into()),
            ..Self::default()
        }
    }

    pub fn with_user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_predicate(mut self, predicate: EventPredicate) -> Self {
        self.predicate = Some(predicate);
        self
    }
}

struct Subscription {
    id: SubscriptionId,
    types: Vec<EventType>,
    subtypes: Option<Vec<String>>,
    filter: Option<EventFilter>,
    callback: EventCallback,
}

/// Pure matching: same (envelope, subscription) inputs always give the
/// same result.
fn matches(sub: &Subscription, envelope: &Envelope) -> bool {
    if !sub.types.contains(&envelope.event_type) {
        return false;
    }
    if let Some(ref subtypes) = sub.subtypes {
        match envelope.subtype {
            Some(ref st) if subtypes.iter().any(|s| s == st) => {}
            _ => return false,
        }
    }
    if let Some(ref filter) = sub.filter {
        if let Some(ref room) = filter.room_id {
            if envelope.room_id.as_deref() != Some(room.as_str()) {
                return false;
            }
        }
        if let Some(user) = filter.user_id {
            if envelope.user_id != Some(user) {
                return false;
            }
        }
        if let Some(ref pred) = filter.predicate {
            if !pred(envelope) {
                return false;
            }
        }
    }
    true
}

struct BufferedEvent {
    inserted_at: Instant,
    envelope: Envelope,
}

/// Bus configuration.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Maximum buffered envelopes.
    pub buffer_capacity: usize,
    /// Non-persistent entries older than this are pruned.
    pub retention: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 1000,
            retention: Duration::from_secs(300),
        }
    }
}

/// The event bus.
pub struct EventBus {
    config: BusConfig,
    next_id: AtomicU64,
    subscriptions: Mutex<Vec<Subscription>>,
    buffer: Mutex<VecDeque<BufferedEvent>>,
    /// Installed while a transport channel is up; locally emitted envelopes
    /// are forwarded through it for remote distribution.
    forwarder: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
}

impl EventBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            config,
            next_id: AtomicU64::new(1),
            subscriptions: Mutex::new(Vec::new()),
            buffer: Mutex::new(VecDeque::new()),
            forwarder: Mutex::new(None),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(BusConfig::default())
    }

    /// Register a subscription for the given event types.
    pub fn subscribe(&self, types: Vec<EventType>, callback: EventCallback) -> SubscriptionId {
        self.subscribe_filtered(types, None, None, callback)
    }

    /// Register a subscription with subtype and filter constraints.
    pub fn subscribe_filtered(
        &self,
        types: Vec<EventType>,
        subtypes: Option<Vec<String>>,
        filter: Option<EventFilter>,
        callback: EventCallback,
    ) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut subs = self.subscriptions.lock().unwrap();
        subs.push(Subscription {
            id,
            types,
            subtypes,
            filter,
            callback,
        });
        id
    }

    /// Remove a subscription. Envelopes emitted after this returns will not
    /// reach the callback; in-flight dispatches are unaffected.
    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<(), BusError> {
        let mut subs = self.subscriptions.lock().unwrap();
        let before = subs.len();
        subs.retain(|s| s.id != id);
        if subs.len() == before {
            return Err(BusError::InvalidSubscription(id));
        }
        Ok(())
    }

    /// Emit a locally produced envelope: buffer it, dispatch to matching
    /// subscriptions in registration order, and forward over the transport
    /// if one is installed.
    pub fn emit(&self, envelope: Envelope) {
        self.buffer_event(&envelope);
        self.dispatch(&envelope);

        let forwarder = self.forwarder.lock().unwrap();
        if let Some(ref tx) = *forwarder {
            if tx.send(envelope).is_err() {
                log::debug!("Transport forwarder closed; envelope not forwarded");
            }
        }
    }

    /// Dispatch an envelope that arrived from the transport. Buffered and
    /// dispatched locally but never forwarded back out (loop prevention).
    pub fn dispatch_remote(&self, envelope: &Envelope) {
        self.buffer_event(envelope);
        self.dispatch(envelope);
    }

    /// Install the transport forwarder (called on connect).
    pub fn set_forwarder(&self, tx: mpsc::UnboundedSender<Envelope>) {
        *self.forwarder.lock().unwrap() = Some(tx);
    }

    /// Remove the transport forwarder (called on disconnect).
    pub fn clear_forwarder(&self) {
        *self.forwarder.lock().unwrap() = None;
    }

    /// Most recent buffered envelopes, newest first, optionally filtered by
    /// type. Lets late-joining consumers catch up without a durable log.
    pub fn recent_events(&self, event_type: Option<EventType>, limit: usize) -> Vec<Envelope> {
        let mut buffer = self.buffer.lock().unwrap();
        Self::prune(&mut buffer, &self.config, Instant::now());
        buffer
            .iter()
            .rev()
            .filter(|e| event_type.map_or(true, |t| e.envelope.event_type == t))
            .take(limit)
            .map(|e| e.envelope.clone())
            .collect()
    }

    /// Number of buffered envelopes.
    pub fn buffered_len(&self) -> usize {
        self.buffer.lock().unwrap().len()
    }

    /// Number of active subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().unwrap().len()
    }

    fn buffer_event(&self, envelope: &Envelope) {
        let mut buffer = self.buffer.lock().unwrap();
        let now = Instant::now();
        Self::prune(&mut buffer, &self.config, now);
        buffer.push_back(BufferedEvent {
            inserted_at: now,
            envelope: envelope.clone(),
        });
        while buffer.len() > self.config.buffer_capacity {
            buffer.pop_front();
        }
    }

    fn prune(buffer: &mut VecDeque<BufferedEvent>, config: &BusConfig, now: Instant) {
        buffer.retain(|e| {
            e.envelope.persistent || now.duration_since(e.inserted_at) < config.retention
        });
    }

    /// Callbacks are collected under the lock but invoked after it is
    /// released, so a callback may re-enter the bus without deadlocking.
    fn dispatch(&self, envelope: &Envelope) {
        let matching: Vec<EventCallback> = {
            let subs = self.subscriptions.lock().unwrap();
            subs.iter()
                .filter(|s| matches(s, envelope))
                .map(|s| s.callback.clone())
                .collect()
        };
        for callback in matching {
            callback(envelope);
        }
    }
}
