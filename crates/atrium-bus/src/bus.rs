//! The in-process publish/subscribe hub.
//!
//! Dispatch is synchronous with respect to the emitting call: `emit`
//! invokes every current subscriber inline before returning, and a handler
//! may itself emit (the nested dispatch completes first). A depth counter
//! caps pathological emit chains.
//!
//! The hub is never handed out whole. [`SystemBus::split`] produces a
//! [`BusProducer`] (emit-only) and a [`BusConsumer`] (subscribe-only) so a
//! component holding one half cannot accidentally re-emit what it consumes.

use std::cell::Cell;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::{AtomicU64, Ordering};

use atrium_protocol::SystemEvent;
use parking_lot::Mutex;
use tracing::{trace, warn};

/// Hard cap on reentrant emit depth before events are dropped.
const MAX_EMIT_DEPTH: usize = 64;

thread_local! {
    // Reentrant dispatch is synchronous, so recursion is a per-thread
    // property; concurrent emits from other threads must not share the
    // budget.
    static EMIT_DEPTH: Cell<usize> = const { Cell::new(0) };
}

type Handler = Arc<dyn Fn(&SystemEvent) + Send + Sync>;

struct SubscriberEntry {
    id: u64,
    tag: Option<&'static str>,
    handler: Handler,
}

#[derive(Default)]
struct HubInner {
    subscribers: Mutex<Vec<SubscriberEntry>>,
    next_id: AtomicU64,
}

impl HubInner {
    fn emit(self: &Arc<Self>, event: &SystemEvent) {
        let depth = EMIT_DEPTH.with(|d| {
            let depth = d.get();
            d.set(depth + 1);
            depth
        });
        if depth >= MAX_EMIT_DEPTH {
            warn!(tag = event.tag(), depth, "emit depth exceeded; event dropped");
            EMIT_DEPTH.with(|d| d.set(d.get() - 1));
            return;
        }

        // Snapshot the handler list so a handler can subscribe, unsubscribe,
        // or emit without deadlocking on the registry lock.
        let handlers: Vec<Handler> = {
            let subscribers = self.subscribers.lock();
            subscribers
                .iter()
                .filter(|entry| entry.tag.is_none_or(|tag| tag == event.tag()))
                .map(|entry| Arc::clone(&entry.handler))
                .collect()
        };
        trace!(tag = event.tag(), handlers = handlers.len(), "dispatching event");
        for handler in handlers {
            handler(event);
        }
        EMIT_DEPTH.with(|d| d.set(d.get() - 1));
    }

    fn subscribe(self: &Arc<Self>, tag: Option<&'static str>, handler: Handler) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subscribers
            .lock()
            .push(SubscriberEntry { id, tag, handler });
        Subscription {
            hub: Arc::downgrade(self),
            id,
        }
    }

    fn remove(&self, id: u64) {
        self.subscribers.lock().retain(|entry| entry.id != id);
    }
}

/// The shared hub. Cheap to clone; all clones dispatch to the same
/// subscriber set.
#[derive(Clone, Default)]
pub struct SystemBus {
    inner: Arc<HubInner>,
}

impl SystemBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Split into the two capability halves.
    pub fn split(&self) -> (BusProducer, BusConsumer) {
        (self.producer(), self.consumer())
    }

    pub fn producer(&self) -> BusProducer {
        BusProducer {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn consumer(&self) -> BusConsumer {
        BusConsumer {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Emit-only capability over the shared hub.
#[derive(Clone)]
pub struct BusProducer {
    inner: Arc<HubInner>,
}

impl BusProducer {
    /// Deliver `event` to every current subscriber, synchronously.
    pub fn emit(&self, event: &SystemEvent) {
        self.inner.emit(event);
    }
}

/// Subscribe-only capability over the shared hub.
#[derive(Clone)]
pub struct BusConsumer {
    inner: Arc<HubInner>,
}

impl BusConsumer {
    /// Subscribe to every event.
    pub fn on_any(&self, handler: impl Fn(&SystemEvent) + Send + Sync + 'static) -> Subscription {
        self.inner.subscribe(None, Arc::new(handler))
    }

    /// Subscribe to events with a single wire tag (see `EventKind::tag`).
    pub fn on_tag(
        &self,
        tag: &'static str,
        handler: impl Fn(&SystemEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.subscribe(Some(tag), Arc::new(handler))
    }
}

/// Removes its handler on drop, so subscriptions are released on every
/// exit path of the code that owns them.
#[must_use = "dropping a Subscription immediately unsubscribes the handler"]
pub struct Subscription {
    hub: Weak<HubInner>,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {
        // Drop does the work.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.remove(self.id);
        }
    }
}
