//! Stores: owners of read-model state.
//!
//! A store holds one immutable state value behind an `Arc` and replaces it
//! wholesale on every change. The [`StoreGroup`](crate::StoreGroup) reads
//! stores through two calls only: `get_state` and `receive_payload`.
//!
//! # Example
//!
//! ```ignore
//! #[derive(Debug, Clone, PartialEq)]
//! struct Counter { count: i64 }
//!
//! struct CounterStore { core: StoreCore<Counter> }
//!
//! impl Store for CounterStore {
//!     type State = Counter;
//!
//!     fn core(&self) -> &StoreCore<Counter> {
//!         &self.core
//!     }
//!
//!     fn receive_payload(&self, payload: &Payload, _meta: &DispatcherPayloadMeta) {
//!         match payload.kind() {
//!             "increment" => self.core.update_state(|s| Counter { count: s.count + 1 }),
//!             "decrement" => self.core.update_state(|s| Counter { count: s.count - 1 }),
//!             _ => {}
//!         }
//!     }
//! }
//! ```

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::core::{DispatcherPayloadMeta, Payload};
use crate::dispatch::{lock, HandlerList, Subscription};

/// Type-erased store state.
pub type StateRef = Arc<dyn Any + Send + Sync>;

/// Type-erased store handle, as held by a [`StoreGroup`](crate::StoreGroup).
pub type StoreRef = Arc<dyn AnyStore>;

// =============================================================================
// Change Emitter
// =============================================================================

type ChangeHandler = dyn Fn() + Send + Sync;

/// Change notification plus the bookkeeping for strict mode.
///
/// A write phase is open between `begin_write` and `end_write`. In strict
/// mode, a state replacement outside of a write phase is recorded as a
/// violation and picked up by the store group on the next read.
/// The write-phase count is shared across threads, so a replacement on one
/// thread while another thread is inside a write phase is not flagged.
pub struct ChangeEmitter {
    handlers: Arc<HandlerList<ChangeHandler>>,
    strict: AtomicBool,
    writing: AtomicUsize,
    mutated_outside_write: AtomicBool,
}

impl ChangeEmitter {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(HandlerList::new()),
            strict: AtomicBool::new(false),
            writing: AtomicUsize::new(0),
            mutated_outside_write: AtomicBool::new(false),
        }
    }

    pub(crate) fn set_strict(&self, strict: bool) {
        self.strict.store(strict, Ordering::SeqCst);
    }

    pub(crate) fn begin_write(&self) {
        self.writing.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn end_write(&self) {
        self.writing.fetch_sub(1, Ordering::SeqCst);
    }

    /// Record that the state was replaced.
    pub fn note_mutation(&self) {
        if self.strict.load(Ordering::SeqCst) && self.writing.load(Ordering::SeqCst) == 0 {
            self.mutated_outside_write.store(true, Ordering::SeqCst);
        }
    }

    /// Returns true once per recorded strict-mode violation.
    pub(crate) fn take_violation(&self) -> bool {
        self.mutated_outside_write.swap(false, Ordering::SeqCst)
    }

    /// Notify every subscriber.
    pub fn emit(&self) {
        for handler in self.handlers.snapshot() {
            handler();
        }
    }

    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.handlers.subscribe(Arc::new(handler))
    }
}

impl Default for ChangeEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ChangeEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeEmitter")
            .field("subscribers", &self.handlers.len())
            .field("strict", &self.strict.load(Ordering::Relaxed))
            .finish()
    }
}

// =============================================================================
// Store Core
// =============================================================================

/// State cell and change emitter embedded in every store.
pub struct StoreCore<S> {
    name: String,
    state: Mutex<Arc<S>>,
    emitter: ChangeEmitter,
}

impl<S: Send + Sync + 'static> StoreCore<S> {
    pub fn new(name: impl Into<String>, initial: S) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(Arc::new(initial)),
            emitter: ChangeEmitter::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The current state.
    pub fn state(&self) -> Arc<S> {
        lock(&self.state).clone()
    }

    /// Replace the state and emit a change.
    pub fn set_state(&self, next: S) {
        self.replace_state(Arc::new(next));
    }

    /// Replace the state with an existing `Arc` and emit a change.
    ///
    /// Passing the current `Arc` back emits without changing anything, which
    /// the store group reports as an unchanged emit.
    pub fn replace_state(&self, next: Arc<S>) {
        *lock(&self.state) = next;
        self.emitter.note_mutation();
        self.emitter.emit();
    }

    /// Derive the next state from the current one.
    ///
    /// The closure runs while the state is locked, so concurrent updates
    /// never lose a write. It must not read this store's state itself.
    pub fn update_state<F>(&self, update: F)
    where
        F: FnOnce(&S) -> S,
    {
        {
            let mut state = lock(&self.state);
            let next = Arc::new(update(&state));
            *state = next;
        }
        self.emitter.note_mutation();
        self.emitter.emit();
    }

    /// Emit a change without replacing the state.
    pub fn emit_change(&self) {
        self.emitter.emit();
    }

    pub fn on_change<F>(&self, handler: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.emitter.subscribe(handler)
    }

    pub fn emitter(&self) -> &ChangeEmitter {
        &self.emitter
    }
}

impl<S: fmt::Debug> fmt::Debug for StoreCore<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreCore")
            .field("name", &self.name)
            .field("state", &*lock(&self.state))
            .finish()
    }
}

// =============================================================================
// Store Trait
// =============================================================================

/// An owner of one slice of read-model state.
///
/// Only [`core`](Store::core) is required. Stores react to payloads in
/// [`receive_payload`](Store::receive_payload) by replacing their state
/// through the core.
pub trait Store: Send + Sync + 'static {
    type State: Send + Sync + 'static;

    fn core(&self) -> &StoreCore<Self::State>;

    /// Diagnostic name. Must be non-empty.
    fn name(&self) -> &str {
        self.core().name()
    }

    fn get_state(&self) -> Arc<Self::State> {
        self.core().state()
    }

    /// Write phase hook. Called with every payload the group receives.
    fn receive_payload(&self, _payload: &Payload, _meta: &DispatcherPayloadMeta) {}

    /// Whether `next` counts as a change from `prev`. Defaults to reference
    /// inequality.
    fn should_state_update(&self, prev: &Arc<Self::State>, next: &Arc<Self::State>) -> bool {
        !Arc::ptr_eq(prev, next)
    }

    fn emit_change(&self) {
        self.core().emit_change();
    }

    fn on_change<F>(&self, handler: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
        Self: Sized,
    {
        self.core().on_change(handler)
    }
}

/// Object-safe view of a [`Store`], implemented for every store.
pub trait AnyStore: Send + Sync + 'static {
    fn store_name(&self) -> &str;

    fn current_state(&self) -> StateRef;

    fn deliver_payload(&self, payload: &Payload, meta: &DispatcherPayloadMeta);

    /// Compare two erased states with the store's own rule. States of the
    /// wrong type always count as changed.
    fn state_changed(&self, prev: &StateRef, next: &StateRef) -> bool;

    fn change_emitter(&self) -> &ChangeEmitter;

    fn type_name(&self) -> &'static str;

    fn as_any(&self) -> &dyn Any;
}

impl<T: Store> AnyStore for T {
    fn store_name(&self) -> &str {
        self.name()
    }

    fn current_state(&self) -> StateRef {
        self.get_state()
    }

    fn deliver_payload(&self, payload: &Payload, meta: &DispatcherPayloadMeta) {
        self.receive_payload(payload, meta);
    }

    fn state_changed(&self, prev: &StateRef, next: &StateRef) -> bool {
        match (
            prev.clone().downcast::<T::State>(),
            next.clone().downcast::<T::State>(),
        ) {
            (Ok(prev), Ok(next)) => self.should_state_update(&prev, &next),
            _ => true,
        }
    }

    fn change_emitter(&self) -> &ChangeEmitter {
        self.core().emitter()
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl dyn AnyStore {
    /// Borrow the concrete store.
    pub fn downcast_ref<T: Store>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }
}

impl fmt::Debug for dyn AnyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("name", &self.store_name())
            .field("type", &self.type_name())
            .finish()
    }
}
