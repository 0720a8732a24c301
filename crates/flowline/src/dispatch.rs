//! Synchronous publish/subscribe bus with delegation.
//!
//! # Guarantees
//!
//! - **Synchronous**: `dispatch` runs every subscriber before it returns
//! - **Ordered**: subscribers run in subscription order
//! - **Re-entrant**: a subscriber may dispatch again from inside its handler
//! - **Fail-fast**: a payload without a type is rejected at the call site
//!
//! There is no queue and no cycle detection. Forwarding trees built with
//! [`Dispatcher::pipe`] must be acyclic.
//!
//! # Delegation
//!
//! ```text
//! root Dispatcher ◄── use-case ◄── nested use-case
//!       │
//!       └──► StoreGroup ──► stores
//! ```
//!
//! A payload dispatched on a child is re-dispatched verbatim, with the same
//! meta, on every dispatcher it is piped into.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::trace;

use crate::core::{DispatcherPayloadMeta, Payload};
use crate::error::FlowlineError;

/// Acquire a mutex, recovering the guard if a handler panicked while it was
/// held.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Subscription
// =============================================================================

/// Handle returned by every `on_*` registration.
///
/// `unsubscribe` is idempotent. Dropping a subscription does NOT
/// unsubscribe; registrations live until removed or until their owner is
/// released.
#[derive(Clone)]
pub struct Subscription {
    cancel: Arc<Mutex<Option<Box<dyn FnOnce() + Send>>>>,
}

impl Subscription {
    /// Create a subscription that runs `cancel` on the first unsubscribe.
    pub fn new<F>(cancel: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            cancel: Arc::new(Mutex::new(Some(Box::new(cancel)))),
        }
    }

    /// A subscription with nothing to cancel.
    pub fn noop() -> Self {
        Self {
            cancel: Arc::new(Mutex::new(None)),
        }
    }

    /// Remove the registration. Calling this more than once is a no-op.
    pub fn unsubscribe(&self) {
        let cancel = lock(&self.cancel).take();
        if let Some(cancel) = cancel {
            cancel();
        }
    }

    /// Returns true until `unsubscribe` has been called.
    pub fn is_active(&self) -> bool {
        lock(&self.cancel).is_some()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

// =============================================================================
// Handler List
// =============================================================================

/// Ordered list of handlers keyed by registration id.
///
/// Handlers are invoked from a snapshot so that a handler may subscribe or
/// unsubscribe while the list is being walked.
pub(crate) struct HandlerList<H: ?Sized> {
    next_id: AtomicU64,
    handlers: Mutex<Vec<(u64, Arc<H>)>>,
}

impl<H: ?Sized> HandlerList<H> {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            handlers: Mutex::new(Vec::new()),
        }
    }

    fn add(&self, handler: Arc<H>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.handlers).push((id, handler));
        id
    }

    fn remove(&self, id: u64) {
        lock(&self.handlers).retain(|(existing, _)| *existing != id);
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<H>> {
        lock(&self.handlers)
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.handlers).len()
    }

    pub(crate) fn clear(&self) {
        lock(&self.handlers).clear();
    }
}

impl<H: ?Sized + Send + Sync + 'static> HandlerList<H> {
    /// Register a handler; the subscription removes it again.
    pub(crate) fn subscribe(self: &Arc<Self>, handler: Arc<H>) -> Subscription {
        let id = self.add(handler);
        let list: Weak<Self> = Arc::downgrade(self);
        Subscription::new(move || {
            if let Some(list) = list.upgrade() {
                list.remove(id);
            }
        })
    }
}

impl<H: ?Sized> Default for HandlerList<H> {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

pub type DispatchHandler = dyn Fn(&Payload, &DispatcherPayloadMeta) + Send + Sync;

/// Typed publish/subscribe bus.
///
/// The root bus of a [`Context`](crate::Context), every use-case instance and
/// every store group forwarding point is a `Dispatcher`. Cloning is cheap;
/// clones share subscribers.
///
/// # Example
///
/// ```ignore
/// let root = Dispatcher::new();
/// let child = Dispatcher::new();
/// child.pipe(&root);
///
/// root.on_dispatch(|payload, meta| println!("{payload} trusted={}", meta.is_trusted));
/// child.dispatch(&Payload::custom("increment"))?;
/// ```
#[derive(Clone, Default)]
pub struct Dispatcher {
    handlers: Arc<HandlerList<DispatchHandler>>,
}

impl Dispatcher {
    /// Create a dispatcher with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatch a payload with default (untrusted, use-case-less) meta.
    pub fn dispatch(&self, payload: &Payload) -> Result<(), FlowlineError> {
        self.dispatch_with_meta(payload, &DispatcherPayloadMeta::new())
    }

    /// Dispatch a payload with explicit meta.
    ///
    /// Every subscriber runs, in subscription order, before this returns.
    pub fn dispatch_with_meta(
        &self,
        payload: &Payload,
        meta: &DispatcherPayloadMeta,
    ) -> Result<(), FlowlineError> {
        if payload.kind().is_empty() {
            return Err(FlowlineError::MissingPayloadType);
        }
        self.deliver(payload, meta);
        Ok(())
    }

    /// Run subscribers without validating the payload.
    ///
    /// Used for built-in payloads, whose type is always present.
    pub(crate) fn deliver(&self, payload: &Payload, meta: &DispatcherPayloadMeta) {
        let handlers = self.handlers.snapshot();
        trace!(
            payload_type = payload.kind(),
            subscribers = handlers.len(),
            use_case = ?meta.use_case_id(),
            "dispatch"
        );
        for handler in handlers {
            handler(payload, meta);
        }
    }

    /// Subscribe to every payload dispatched on this dispatcher.
    pub fn on_dispatch<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Payload, &DispatcherPayloadMeta) + Send + Sync + 'static,
    {
        self.handlers.subscribe(Arc::new(handler))
    }

    /// Forward every payload dispatched here to `target`, unchanged.
    pub fn pipe(&self, target: &Dispatcher) -> Subscription {
        let target = target.clone();
        self.on_dispatch(move |payload, meta| target.deliver(payload, meta))
    }

    /// Returns the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.handlers.len()
    }

    /// Returns true if both handles refer to the same bus.
    pub fn same_as(&self, other: &Dispatcher) -> bool {
        Arc::ptr_eq(&self.handlers, &other.handlers)
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}
