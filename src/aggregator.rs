// ===============================
// src/aggregator.rs
// ===============================
//
// Synchronous publish/subscribe: `publish` runs every handler registered for
// the event's kind, on the caller's thread, in registration order, before it
// returns. A handler that blocks stalls the publisher.
//
use ahash::AHashMap as HashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::domain::{Event, EventKind};

pub type SubscriptionId = u64;
pub type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// An object handling several kinds of events.
pub trait EventSubscriber: Send + Sync {
    fn kinds(&self) -> Vec<EventKind>;
    fn on_event(&self, event: &Event);
}

#[derive(Default)]
pub struct EventAggregator {
    table: RwLock<HashMap<EventKind, Vec<(SubscriptionId, Handler)>>>,
    next_id: AtomicU64,
}

impl EventAggregator {
    pub fn new() -> Self { Self::default() }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.insert(kind, Arc::new(handler))
    }

    /// Register one handler entry per kind the subscriber declares.
    pub fn register(&self, subscriber: Arc<dyn EventSubscriber>) -> Vec<SubscriptionId> {
        subscriber
            .kinds()
            .into_iter()
            .map(|kind| {
                let s = subscriber.clone();
                self.insert(kind, Arc::new(move |ev: &Event| s.on_event(ev)))
            })
            .collect()
    }

    fn insert(&self, kind: EventKind, handler: Handler) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.table.write().entry(kind).or_default().push((id, handler));
        debug!(subscription = id, kind = kind.label(), "subscribed");
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut table = self.table.write();
        let mut removed = false;
        for handlers in table.values_mut() {
            let before = handlers.len();
            handlers.retain(|(sid, _)| *sid != id);
            removed |= handlers.len() != before;
        }
        removed
    }

    /// Returns the number of handlers invoked.
    pub fn publish(&self, event: &Event) -> usize {
        // snapshot first: handlers may (un)subscribe while being called
        let handlers: Vec<Handler> = match self.table.read().get(&event.kind()) {
            Some(list) => list.iter().map(|(_, h)| h.clone()).collect(),
            None => return 0,
        };
        for h in &handlers {
            h(event);
        }
        handlers.len()
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.table.read().get(&kind).map_or(0, Vec::len)
    }
}
