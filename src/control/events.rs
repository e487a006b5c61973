//! Typed asynchronous events delivered by the control channel's
//! `650` lines, and the subscription registry that fans them out.
//!
//! Per the design notes, handlers never mutate a [`crate::record::Probe`]
//! directly: the reader task that owns the TCP connection sends typed
//! messages into per-subscriber mailboxes, and whichever task is
//! waiting on that mailbox (a [`crate::worker::ProbeWorker`] or the
//! [`crate::sampler::PathSampler`]) does the mutation itself. This
//! keeps the reader task free of borrow conflicts and makes the
//! worker's state machine explicit.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::record::{CircuitEvent, StreamEvent};

/// An event delivered asynchronously by the control channel.
#[derive(Debug, Clone)]
pub enum Event {
    /// A `CIRC` event.
    Circ(CircuitEvent),
    /// A `STREAM` event.
    Stream(StreamEvent),
    /// An `INFO` log line.
    Info {
        /// The raw log message.
        message: String,
    },
    /// A `NOTICE` log line.
    Notice {
        /// The raw log message.
        message: String,
    },
}

/// Which event class a subscriber wants to receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Circuit lifecycle events.
    Circ,
    /// Stream lifecycle events.
    Stream,
    /// Informational log lines.
    Info,
    /// Notice-level log lines.
    Notice,
}

impl Event {
    /// This event's [`EventKind`].
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Circ(_) => EventKind::Circ,
            Event::Stream(_) => EventKind::Stream,
            Event::Info { .. } => EventKind::Info,
            Event::Notice { .. } => EventKind::Notice,
        }
    }
}

/// Opaque handle returned by [`EventBus::subscribe`]; pass it to
/// [`EventBus::unsubscribe`] to stop receiving events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Registry of live subscriptions, and the single point through which
/// the control-channel reader task dispatches `650` events.
///
/// Dispatch preserves arrival order: the reader task calls
/// [`EventBus::dispatch`] once per event, synchronously, in the order
/// lines arrived on the wire, and each subscriber's `mpsc` channel is
/// unbounded so a slow consumer never causes events to be dropped or
/// reordered.
pub struct EventBus {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<u64, (EventKind, mpsc::UnboundedSender<Event>)>>,
}

impl EventBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to events of the given kind, returning a handle and a
    /// receiver of every matching event from this point forward.
    pub fn subscribe(&self, kind: EventKind) -> (SubscriptionId, mpsc::UnboundedReceiver<Event>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().insert(id, (kind, tx));
        (SubscriptionId(id), rx)
    }

    /// Stop delivering events to the given subscription.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.lock().unwrap().remove(&id.0);
    }

    /// Deliver `event` to every subscriber whose kind matches. Dead
    /// subscribers (receiver dropped) are pruned lazily.
    pub fn dispatch(&self, event: Event) {
        let kind = event.kind();
        let mut subs = self.subscribers.lock().unwrap();
        subs.retain(|_, (sub_kind, tx)| {
            if *sub_kind != kind {
                return true;
            }
            tx.send(event.clone()).is_ok()
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
