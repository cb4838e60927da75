use parking_lot::Mutex;
use std::sync::Arc;

use crate::events::{EngineEvent, EventKind};

pub type SubscriberId = u64;

type Callback = Arc<dyn Fn(&EngineEvent) + Send + Sync>;

struct Subscriber {
    id: SubscriberId,
    kind: Option<EventKind>,
    callback: Callback,
}

/// Typed synchronous multicast for engine events.
///
/// Emission iterates a snapshot of the subscriber list, so a handler may
/// subscribe or unsubscribe (itself included) during delivery without
/// affecting the in-flight emission.
#[derive(Default)]
pub struct EventEmitter {
    inner: Mutex<EmitterInner>,
}

#[derive(Default)]
struct EmitterInner {
    next_id: SubscriberId,
    subscribers: Vec<Subscriber>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to every event.
    pub fn subscribe<F>(&self, callback: F) -> SubscriberId
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        self.register(None, Arc::new(callback))
    }

    /// Subscribe to a single event kind.
    pub fn subscribe_kind<F>(&self, kind: EventKind, callback: F) -> SubscriberId
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        self.register(Some(kind), Arc::new(callback))
    }

    fn register(&self, kind: Option<EventKind>, callback: Callback) -> SubscriberId {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.subscribers.push(Subscriber { id, kind, callback });
        id
    }

    /// Remove one subscriber. Unknown ids are ignored, so double
    /// unsubscription is harmless.
    pub fn unsubscribe(&self, id: SubscriberId) {
        self.inner.lock().subscribers.retain(|s| s.id != id);
    }

    pub fn emit(&self, event: &EngineEvent) {
        let kind = event.kind();
        let callbacks: Vec<Callback> = {
            let inner = self.inner.lock();
            inner
                .subscribers
                .iter()
                .filter(|s| s.kind.is_none() || s.kind == Some(kind))
                .map(|s| Arc::clone(&s.callback))
                .collect()
        };
        for callback in callbacks {
            callback(event);
        }
    }

    /// Remove every subscriber.
    pub fn clear(&self) {
        self.inner.lock().subscribers.clear();
    }

    /// Remove every subscriber for one event kind (kind-filtered
    /// subscriptions only).
    pub fn clear_kind(&self, kind: EventKind) {
        self.inner
            .lock()
            .subscribers
            .retain(|s| s.kind != Some(kind));
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }
}
