//! Subscription tokens and callback registries.
//!
//! Listener attachments across the crate are represented by [`Subscription`]
//! values: dropping one detaches the listener. [`CallbackSet`] is the shared
//! registry type behind store events, watcher notifications and performance
//! warnings.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

/// A listener attachment. Dropping the subscription detaches the listener;
/// call [`Subscription::forever`] to keep it attached for the process
/// lifetime instead.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub(crate) fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Explicitly detach the listener now.
    pub fn cancel(mut self) {
        if let Some(f) = self.cancel.take() {
            f();
        }
    }

    /// Keep the listener attached and discard the token.
    pub fn forever(mut self) {
        self.cancel.take();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(f) = self.cancel.take() {
            f();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

type Callback<A> = Arc<dyn Fn(&A) + Send + Sync>;

struct CallbackInner<A> {
    entries: RwLock<Vec<(u64, Callback<A>)>>,
    next_id: AtomicU64,
}

/// An ordered set of callbacks invoked with a shared event payload.
///
/// Callbacks run in registration order. The list is snapshotted before
/// emission, so a callback registered during an emit does not observe the
/// triggering event. Clones share the same callback list.
pub struct CallbackSet<A> {
    inner: Arc<CallbackInner<A>>,
}

impl<A> Clone for CallbackSet<A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<A: 'static> CallbackSet<A> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CallbackInner {
                entries: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register a callback; the returned subscription detaches it on drop.
    pub fn add(&self, callback: impl Fn(&A) + Send + Sync + 'static) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.entries.write().push((id, Arc::new(callback)));

        let inner: Weak<CallbackInner<A>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.entries.write().retain(|(entry_id, _)| *entry_id != id);
            }
        })
    }

    /// Invoke all registered callbacks with the payload.
    pub fn emit(&self, payload: &A) {
        let snapshot: Vec<Callback<A>> = self
            .inner
            .entries
            .read()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for callback in snapshot {
            callback(payload);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.read().is_empty()
    }
}

impl<A: 'static> Default for CallbackSet<A> {
    fn default() -> Self {
        Self::new()
    }
}
