//! Filtered in-memory event bus broadcasting graph mutations.
//!
//! Listeners register with an optional [`EventFilter`]; `emit` walks a
//! snapshot of the listener list so a listener unsubscribing mid-emission
//! cannot corrupt iteration. Listener futures are awaited in registration
//! order and each listener is error- and panic-isolated from the rest.
//!
//! Awaiting listeners inline is deliberate: it lets a mutation cascade
//! (mutation → re-evaluation → automation action → nested mutation) settle
//! within the emitting task, which the automation engine's cycle protection
//! relies on.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::defaults::EVENT_BUS_LEAK_THRESHOLD;
use crate::error::Result;
use crate::models::{EventFilter, MutationEvent};

/// Listener callback invoked for each matching mutation event.
pub type MutationListener =
    Arc<dyn Fn(MutationEvent) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Wrap an async closure into a [`MutationListener`].
pub fn listener_fn<F, Fut>(f: F) -> MutationListener
where
    F: Fn(MutationEvent) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |event| f(event).boxed())
}

#[derive(Clone)]
struct ListenerEntry {
    id: Uuid,
    filter: Option<EventFilter>,
    listener: MutationListener,
}

#[derive(Default)]
struct BusState {
    listeners: Vec<ListenerEntry>,
    /// Set once the leak warning has fired; re-arms when the count drops
    /// back under the threshold.
    leak_warned: bool,
}

/// In-memory pub/sub for graph mutation events.
///
/// Has no knowledge of queries; the subscription service attaches to it
/// lazily and the node repository emits into it.
#[derive(Default)]
pub struct EventBus {
    state: Mutex<BusState>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener, optionally constrained by a filter.
    ///
    /// Returns the listener id for [`EventBus::unsubscribe`].
    pub fn subscribe(&self, filter: Option<EventFilter>, listener: MutationListener) -> Uuid {
        let id = Uuid::new_v4();
        let mut state = self.state.lock().expect("event bus lock poisoned");
        state.listeners.push(ListenerEntry {
            id,
            filter,
            listener,
        });

        let count = state.listeners.len();
        if count > EVENT_BUS_LEAK_THRESHOLD && !state.leak_warned {
            state.leak_warned = true;
            warn!(
                listener_count = count,
                threshold = EVENT_BUS_LEAK_THRESHOLD,
                "Event bus listener count exceeds leak threshold; check for missing unsubscribes"
            );
        }
        id
    }

    /// Remove a listener. Returns whether it was present.
    pub fn unsubscribe(&self, id: Uuid) -> bool {
        let mut state = self.state.lock().expect("event bus lock poisoned");
        let before = state.listeners.len();
        state.listeners.retain(|entry| entry.id != id);
        let removed = state.listeners.len() < before;
        if state.listeners.len() <= EVENT_BUS_LEAK_THRESHOLD {
            state.leak_warned = false;
        }
        removed
    }

    /// Deliver an event to every matching listener, in registration order.
    ///
    /// Iterates a snapshot of the listener list. Listener errors are logged
    /// and never propagate to other listeners or to the emitter; a panicking
    /// listener is caught and logged the same way.
    pub async fn emit(&self, event: MutationEvent) {
        let snapshot: Vec<ListenerEntry> = {
            let state = self.state.lock().expect("event bus lock poisoned");
            state.listeners.clone()
        };

        debug!(
            kind = ?event.kind(),
            node_id = %event.node_id(),
            listener_count = snapshot.len(),
            "EventBus emit"
        );

        for entry in snapshot {
            let matches = entry
                .filter
                .as_ref()
                .map(|f| f.matches(&event))
                .unwrap_or(true);
            if !matches {
                continue;
            }

            let fut = match std::panic::catch_unwind(AssertUnwindSafe(|| {
                (entry.listener)(event.clone())
            })) {
                Ok(fut) => fut,
                Err(_) => {
                    warn!(listener_id = %entry.id, "Event listener panicked during invocation");
                    continue;
                }
            };

            match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(listener_id = %entry.id, error = %e, "Event listener failed");
                }
                Err(_) => {
                    warn!(listener_id = %entry.id, "Event listener panicked");
                }
            }
        }
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.state
            .lock()
            .expect("event bus lock poisoned")
            .listeners
            .len()
    }

    /// Remove every listener and reset the leak warning.
    pub fn clear(&self) {
        let mut state = self.state.lock().expect("event bus lock poisoned");
        state.listeners.clear();
        state.leak_warned = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::models::MutationKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_listener(counter: Arc<AtomicUsize>) -> MutationListener {
        listener_fn(move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    fn created(node_id: Uuid) -> MutationEvent {
        MutationEvent::NodeCreated { node_id }
    }

    #[tokio::test]
    async fn test_emit_reaches_all_listeners() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        bus.subscribe(None, counting_listener(counter.clone()));
        bus.subscribe(None, counting_listener(counter.clone()));

        bus.emit(created(Uuid::new_v4())).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_filter_limits_delivery() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let node_id = Uuid::new_v4();
        bus.subscribe(
            Some(EventFilter::any().with_node(node_id)),
            counting_listener(counter.clone()),
        );

        bus.emit(created(Uuid::new_v4())).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        bus.emit(created(node_id)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_kind_filter() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        bus.subscribe(
            Some(EventFilter::any().with_kinds(vec![MutationKind::NodeDeleted])),
            counting_listener(counter.clone()),
        );

        bus.emit(created(Uuid::new_v4())).await;
        bus.emit(MutationEvent::NodeDeleted {
            node_id: Uuid::new_v4(),
        })
        .await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let id = bus.subscribe(None, counting_listener(counter.clone()));
        assert_eq!(bus.listener_count(), 1);

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert_eq!(bus.listener_count(), 0);

        bus.emit(created(Uuid::new_v4())).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_listener_error_is_isolated() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        bus.subscribe(
            None,
            listener_fn(|_| async { Err(Error::Internal("listener boom".to_string())) }),
        );
        bus.subscribe(None, counting_listener(counter.clone()));

        bus.emit(created(Uuid::new_v4())).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_listener_panic_is_isolated() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        bus.subscribe(
            None,
            listener_fn(|_| async { panic!("listener panic") }),
        );
        bus.subscribe(None, counting_listener(counter.clone()));

        bus.emit(created(Uuid::new_v4())).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_during_emission_does_not_corrupt_iteration() {
        let bus = Arc::new(EventBus::new());
        let counter = Arc::new(AtomicUsize::new(0));

        // First listener removes the second one mid-emission; the snapshot
        // still delivers this event to both.
        let bus_ref = bus.clone();
        let removed_id = Arc::new(Mutex::new(None::<Uuid>));
        let removed_ref = removed_id.clone();
        bus.subscribe(
            None,
            listener_fn(move |_| {
                let bus = bus_ref.clone();
                let removed = removed_ref.clone();
                async move {
                    if let Some(id) = removed.lock().unwrap().take() {
                        bus.unsubscribe(id);
                    }
                    Ok(())
                }
            }),
        );
        let second = bus.subscribe(None, counting_listener(counter.clone()));
        *removed_id.lock().unwrap() = Some(second);

        bus.emit(created(Uuid::new_v4())).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count(), 1);

        // Second event no longer reaches the removed listener.
        bus.emit(created(Uuid::new_v4())).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_leak_warning_flag_rearms() {
        let bus = EventBus::new();
        let mut ids = Vec::new();
        for _ in 0..=EVENT_BUS_LEAK_THRESHOLD {
            ids.push(bus.subscribe(None, listener_fn(|_| async { Ok(()) })));
        }
        assert!(bus.state.lock().unwrap().leak_warned);

        // Dropping back under the threshold re-arms the warning.
        bus.unsubscribe(ids.pop().unwrap());
        assert!(!bus.state.lock().unwrap().leak_warned);
    }

    #[tokio::test]
    async fn test_clear() {
        let bus = EventBus::new();
        bus.subscribe(None, listener_fn(|_| async { Ok(()) }));
        bus.subscribe(None, listener_fn(|_| async { Ok(()) }));
        bus.clear();
        assert_eq!(bus.listener_count(), 0);
    }
}
