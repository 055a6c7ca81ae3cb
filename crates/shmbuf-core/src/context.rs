//! Callback contexts
//!
//! A [`Context`] bundles user data with a one-shot release callback. It is
//! inert until the subsystem adopts it (for a callback-table backend, client,
//! segment or listener); adoption turns it into a [`SharedContext`]. The
//! release callback runs exactly once, when the last holder of the adopted
//! context goes away, which is necessarily after every callback borrowing it
//! has returned. A context that is never adopted never runs its release
//! callback.
//!
//! The flavour is part of the type:
//!
//! - [`Concurrent`] data is handed to callbacks without locking, so it must be
//!   `Sync`.
//! - [`Serialized`] data sits behind a mutex: callbacks sharing one context
//!   instance never overlap. Callbacks under other instances still may.

use parking_lot::Mutex;
use std::fmt;
use std::mem::ManuallyDrop;
use std::sync::Arc;

/// Whether callbacks bound to a context may run concurrently
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadSafety {
    Concurrent,
    Serialized,
}

/// Access policy for context data
pub trait ContextGate: Send + Sync + 'static {
    type Data: Send + 'static;

    const THREAD_SAFETY: ThreadSafety;

    /// Run `f` with access to the data, honouring the flavour's exclusion rules
    fn enter<R>(&self, f: impl FnOnce(&Self::Data) -> R) -> R;

    fn into_data(self) -> Self::Data;
}

/// Thread-safe context data
pub struct Concurrent<T>(T);

impl<T: Send + Sync + 'static> ContextGate for Concurrent<T> {
    type Data = T;

    const THREAD_SAFETY: ThreadSafety = ThreadSafety::Concurrent;

    fn enter<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.0)
    }

    fn into_data(self) -> T {
        self.0
    }
}

/// Single-threaded context data
pub struct Serialized<T>(Mutex<T>);

impl<T: Send + 'static> ContextGate for Serialized<T> {
    type Data = T;

    const THREAD_SAFETY: ThreadSafety = ThreadSafety::Serialized;

    fn enter<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let data = self.0.lock();
        f(&data)
    }

    fn into_data(self) -> T {
        self.0.into_inner()
    }
}

type ReleaseFn<D> = Box<dyn FnOnce(D) + Send>;

/// User data plus release callback, not yet owned by the subsystem
pub struct Context<G: ContextGate> {
    gate: G,
    on_release: Option<ReleaseFn<G::Data>>,
}

impl<T: Send + Sync + 'static> Context<Concurrent<T>> {
    /// Context whose callbacks may run concurrently
    pub fn threadsafe(data: T) -> Self {
        Self {
            gate: Concurrent(data),
            on_release: None,
        }
    }
}

impl<T: Send + 'static> Context<Serialized<T>> {
    /// Context whose callbacks are serialized
    pub fn single_threaded(data: T) -> Self {
        Self {
            gate: Serialized(Mutex::new(data)),
            on_release: None,
        }
    }
}

impl<G: ContextGate> Context<G> {
    /// Callback run with the data once the adopted context is released
    pub fn on_release(mut self, f: impl FnOnce(G::Data) + Send + 'static) -> Self {
        self.on_release = Some(Box::new(f));
        self
    }

    pub fn thread_safety(&self) -> ThreadSafety {
        G::THREAD_SAFETY
    }

    /// Take the data back; the release callback is discarded unrun
    pub fn into_data(self) -> G::Data {
        self.gate.into_data()
    }

    pub(crate) fn adopt(self) -> SharedContext<G> {
        SharedContext(Arc::new(AdoptedContext {
            gate: ManuallyDrop::new(self.gate),
            on_release: Mutex::new(self.on_release),
        }))
    }
}

impl<G: ContextGate> fmt::Debug for Context<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("thread_safety", &G::THREAD_SAFETY)
            .field("has_release", &self.on_release.is_some())
            .finish()
    }
}

struct AdoptedContext<G: ContextGate> {
    gate: ManuallyDrop<G>,
    on_release: Mutex<Option<ReleaseFn<G::Data>>>,
}

impl<G: ContextGate> Drop for AdoptedContext<G> {
    fn drop(&mut self) {
        // SAFETY: the gate is never touched again after this point
        let gate = unsafe { ManuallyDrop::take(&mut self.gate) };
        let data = gate.into_data();
        if let Some(release) = self.on_release.get_mut().take() {
            release(data);
        }
    }
}

/// Context adopted by the subsystem, shared between its registrations
pub struct SharedContext<G: ContextGate>(Arc<AdoptedContext<G>>);

impl<G: ContextGate> SharedContext<G> {
    /// Run a callback body under this context
    pub fn enter<R>(&self, f: impl FnOnce(&G::Data) -> R) -> R {
        self.0.gate.enter(f)
    }

    pub fn thread_safety(&self) -> ThreadSafety {
        G::THREAD_SAFETY
    }

    /// Number of registrations (and in-flight dispatches) holding this context
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

impl<G: ContextGate> Clone for SharedContext<G> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<G: ContextGate> fmt::Debug for SharedContext<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedContext")
            .field("thread_safety", &G::THREAD_SAFETY)
            .field("holders", &self.holders())
            .finish()
    }
}
