//! External listener registrations
//!
//! Listeners are plain callbacks bound to an adopted context. Dispatch works
//! on a snapshot, so a listener may be unregistered while a notification is
//! in flight; its context is released once that notification returns.

use crate::context::{Context, ContextGate, SharedContext};
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Registration handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

type Dispatch<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Set of listeners for events of type `E`
pub struct ListenerRegistry<E> {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(ListenerId, Dispatch<E>)>>,
}

/// A registered listener and the context it adopted
pub struct Listener<G: ContextGate> {
    pub id: ListenerId,
    pub context: SharedContext<G>,
}

impl<E: 'static> ListenerRegistry<E> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Adopt `context` and register `callback` under it
    pub fn register<G: ContextGate>(
        &self,
        context: Context<G>,
        callback: fn(&G::Data, &E),
    ) -> Listener<G> {
        self.register_shared(&context.adopt(), callback)
    }

    /// Register `callback` under a context adopted earlier
    pub fn register_shared<G: ContextGate>(
        &self,
        context: &SharedContext<G>,
        callback: fn(&G::Data, &E),
    ) -> Listener<G> {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let bound = context.clone();
        let dispatch: Dispatch<E> = Arc::new(move |event: &E| bound.enter(|d| callback(d, event)));
        self.listeners.write().push((id, dispatch));

        Listener {
            id,
            context: context.clone(),
        }
    }

    /// Remove a listener, returns false if it was not registered
    pub fn unregister(&self, id: ListenerId) -> bool {
        let removed = {
            let mut listeners = self.listeners.write();
            listeners
                .iter()
                .position(|(l, _)| *l == id)
                .map(|pos| listeners.remove(pos))
        };
        // Dropped outside the lock: this may run the context's release
        removed.is_some()
    }

    /// Deliver `event` to every listener
    pub fn notify(&self, event: &E) {
        let snapshot: Vec<Dispatch<E>> = {
            let listeners = self.listeners.read();
            if listeners.is_empty() {
                return;
            }
            listeners.iter().map(|(_, d)| Arc::clone(d)).collect()
        };
        for dispatch in snapshot {
            dispatch(event);
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }
}

impl<E: 'static> Default for ListenerRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for ListenerRegistry<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}
