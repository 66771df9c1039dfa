//! Typed observer lists with handle-based unsubscription.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

type Handler<E> = Box<dyn Fn(&E) + Send + Sync>;

struct Registry<E> {
    next_id: u64,
    handlers: BTreeMap<u64, Arc<Handler<E>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panicking handler must not take the whole bus down with it
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A list of handlers for events of type `E`.
///
/// Handlers run synchronously, in subscription order, on the thread that
/// emits. A handler may subscribe or unsubscribe while being called; the
/// change takes effect from the next emission.
pub struct EventBus<E> {
    registry: Arc<Mutex<Registry<E>>>,
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                handlers: BTreeMap::new(),
            })),
        }
    }
}

impl<E: 'static> std::fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.len())
            .finish()
    }
}

impl<E: 'static> EventBus<E> {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. It stays attached until the returned
    /// [`Subscription`] is dropped or explicitly unsubscribed.
    #[must_use = "dropping the subscription detaches the handler immediately"]
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = {
            let mut registry = lock(&self.registry);
            let id = registry.next_id;
            registry.next_id += 1;
            registry.handlers.insert(id, Arc::new(Box::new(handler)));
            id
        };
        let weak: Weak<Mutex<Registry<E>>> = Arc::downgrade(&self.registry);
        Subscription {
            detach: Some(Box::new(move || {
                if let Some(registry) = weak.upgrade() {
                    lock(&registry).handlers.remove(&id);
                }
            })),
        }
    }

    /// Call every attached handler with `event`.
    pub fn emit(&self, event: &E) {
        // Snapshot so handlers can touch the bus without deadlocking
        let handlers: Vec<_> = lock(&self.registry).handlers.values().cloned().collect();
        for handler in handlers {
            handler(event);
        }
    }

    /// Number of attached handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.registry).handlers.len()
    }

    /// Whether no handler is attached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle returned by [`EventBus::subscribe`].
pub struct Subscription {
    detach: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Detach the handler now.
    pub fn unsubscribe(mut self) {
        self.detach_now();
    }

    fn detach_now(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach_now();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("attached", &self.detach.is_some())
            .finish()
    }
}
