//! StoreGroup: combines many stores into one observable state tree.
//!
//! # Write and Read Phases
//!
//! ```text
//! payload ──► write phase ──► every store.receive_payload, in binding order
//!         ──► try emit    ──► read phase ──► diff cache ──► on_change(changed)
//! ```
//!
//! The read phase compares each store's current state against the cached
//! one with the store's own `should_state_update`. Unchanged slots keep
//! their cached `Arc`, so consumers can compare slices by pointer.
//!
//! # Emission Gating
//!
//! - Between a use-case's `WillExecuted` and its terminal payload, the group
//!   only records changes. The read phase runs once, when nothing is in
//!   flight any more.
//! - A synchronous use-case finishes at `DidExecuted`; its `Completed` is
//!   recognised as a duplicate and ignored.
//! - Changes made inside an open transaction are held by that transaction.
//!   Global emissions skip held stores; `commit` emits them once and `exit`
//!   discards them. A store the transaction took over while it still had
//!   an unemitted change from elsewhere keeps that change on exit.
//! - A store that emits outside of any dispatch, with nothing in flight,
//!   is read and emitted immediately.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use smallvec::SmallVec;
use tracing::debug;

use crate::core::{DispatcherPayloadMeta, Payload, TransactionId, UseCaseId};
use crate::dispatch::{lock, Dispatcher, HandlerList, Subscription};
use crate::error::{Diagnostics, FlowlineError, Warning};
use crate::store::{ChangeEmitter, StateRef, Store, StoreRef};

type ChangeSetHandler = dyn Fn(&[StoreRef]) + Send + Sync;

type ChangeSet = SmallVec<[StoreRef; 4]>;

// =============================================================================
// Merged State
// =============================================================================

/// The consolidated `{state name: store state}` mapping, in binding order.
#[derive(Clone)]
pub struct MergedState {
    entries: Vec<(String, StateRef)>,
}

impl MergedState {
    /// Typed access to one slice.
    ///
    /// Returns `None` if the name is unknown or the state has another type.
    pub fn get<T>(&self, state_name: &str) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        self.get_any(state_name)?.clone().downcast::<T>().ok()
    }

    pub fn get_any(&self, state_name: &str) -> Option<&StateRef> {
        self.entries
            .iter()
            .find(|(name, _)| name == state_name)
            .map(|(_, state)| state)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &StateRef)> {
        self.entries.iter().map(|(name, state)| (name.as_str(), state))
    }
}

impl fmt::Debug for MergedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergedState")
            .field("names", &self.names().collect::<Vec<_>>())
            .finish()
    }
}

// =============================================================================
// Builder
// =============================================================================

struct Binding {
    state_name: String,
    store: StoreRef,
}

/// Builder for [`StoreGroup`].
///
/// # Example
///
/// ```ignore
/// let group = StoreGroup::builder()
///     .with_store("counter", counter_store.clone())
///     .with_store("todo", todo_store.clone())
///     .strict(true)
///     .build()?;
/// ```
#[derive(Default)]
pub struct StoreGroupBuilder {
    bindings: Vec<Binding>,
    strict: bool,
}

impl StoreGroupBuilder {
    /// Bind a store under a state name.
    pub fn with_store<S: Store>(self, state_name: impl Into<String>, store: Arc<S>) -> Self {
        self.with_store_ref(state_name, store)
    }

    /// Bind an already type-erased store.
    pub fn with_store_ref(mut self, state_name: impl Into<String>, store: StoreRef) -> Self {
        self.bindings.push(Binding {
            state_name: state_name.into(),
            store,
        });
        self
    }

    /// Warn when a store replaces its state outside of `receive_payload`.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Validate the bindings and subscribe to every store.
    pub fn build(self) -> Result<StoreGroup, FlowlineError> {
        validate(&self.bindings)?;

        let cache: Vec<StateRef> = self
            .bindings
            .iter()
            .map(|binding| binding.store.current_state())
            .collect();
        let merged = Arc::new(merge(&self.bindings, &cache));

        let group = StoreGroup {
            inner: Arc::new(Inner {
                bindings: self.bindings,
                state: Mutex::new(GroupState {
                    cache,
                    merged,
                    in_flight: HashSet::new(),
                    finished: HashSet::new(),
                    transactions: HashMap::new(),
                    emitted: HashSet::new(),
                    scopes: Vec::new(),
                }),
                change_handlers: Arc::new(HandlerList::new()),
                diagnostics: Diagnostics::new(),
                strict: AtomicBool::new(false),
                subscriptions: Mutex::new(Vec::new()),
                released: AtomicBool::new(false),
            }),
        };
        group.set_strict(self.strict);

        for (index, binding) in group.inner.bindings.iter().enumerate() {
            let weak = Arc::downgrade(&group.inner);
            let sub = binding.store.change_emitter().subscribe(move || {
                if let Some(group) = StoreGroup::upgrade(&weak) {
                    group.on_store_change(index);
                }
            });
            lock(&group.inner.subscriptions).push(sub);
        }

        debug!(stores = group.inner.bindings.len(), "store group built");
        Ok(group)
    }
}

fn validate(bindings: &[Binding]) -> Result<(), FlowlineError> {
    let mut names: HashSet<&str> = HashSet::new();
    for (index, binding) in bindings.iter().enumerate() {
        if binding.state_name.is_empty() {
            return Err(FlowlineError::InvalidStoreBinding {
                reason: format!("binding #{index} has an empty state name"),
            });
        }
        if binding.store.store_name().is_empty() {
            return Err(FlowlineError::InvalidStoreBinding {
                reason: format!("store bound as `{}` has an empty name", binding.state_name),
            });
        }
        if !names.insert(&binding.state_name) {
            return Err(FlowlineError::DuplicateStateName {
                state_name: binding.state_name.clone(),
            });
        }
        if let Some(first) = bindings[..index]
            .iter()
            .find(|earlier| same_store(&earlier.store, &binding.store))
        {
            return Err(FlowlineError::StoreBoundTwice {
                store: binding.store.store_name().to_string(),
                first: first.state_name.clone(),
                second: binding.state_name.clone(),
            });
        }
    }
    Ok(())
}

fn same_store(a: &StoreRef, b: &StoreRef) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

fn merge(bindings: &[Binding], cache: &[StateRef]) -> MergedState {
    MergedState {
        entries: bindings
            .iter()
            .zip(cache)
            .map(|(binding, state)| (binding.state_name.clone(), state.clone()))
            .collect(),
    }
}

// =============================================================================
// Group State
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Global,
    Transaction(TransactionId),
}

#[derive(Default)]
struct TransactionScope {
    in_flight: HashSet<UseCaseId>,
    /// Stores whose changes belong to this transaction.
    held: BTreeSet<usize>,
    /// Held stores that also carry an earlier, unemitted change.
    carried: BTreeSet<usize>,
}

/// Store states as a transactional write phase found them.
struct PreWrite {
    states: Vec<StateRef>,
    /// Whether each store already differed from the cache.
    pending: Vec<bool>,
    held: BTreeSet<usize>,
}

struct GroupState {
    cache: Vec<StateRef>,
    merged: Arc<MergedState>,
    /// Global executions between WillExecuted and their terminal payload.
    in_flight: HashSet<UseCaseId>,
    /// Synchronous executions whose Completed is still to be swallowed.
    finished: HashSet<UseCaseId>,
    transactions: HashMap<TransactionId, TransactionScope>,
    /// Stores that emitted since they were last read.
    emitted: HashSet<usize>,
    /// Write phases currently on the stack.
    scopes: Vec<Scope>,
}

impl GroupState {
    fn in_flight_mut(&mut self, scope: Scope) -> &mut HashSet<UseCaseId> {
        match scope {
            Scope::Transaction(id) => match self.transactions.get_mut(&id) {
                Some(transaction) => &mut transaction.in_flight,
                None => &mut self.in_flight,
            },
            Scope::Global => &mut self.in_flight,
        }
    }

    fn forget(&mut self, id: UseCaseId) {
        self.in_flight.remove(&id);
        for transaction in self.transactions.values_mut() {
            transaction.in_flight.remove(&id);
        }
    }

    fn held(&self) -> HashSet<usize> {
        self.transactions
            .values()
            .flat_map(|transaction| transaction.held.iter().copied())
            .collect()
    }
}

/// Outcome of closing a transaction window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransactionOutcome {
    Commit,
    Exit,
}

// =============================================================================
// Store Group
// =============================================================================

struct Inner {
    bindings: Vec<Binding>,
    state: Mutex<GroupState>,
    change_handlers: Arc<HandlerList<ChangeSetHandler>>,
    diagnostics: Diagnostics,
    strict: AtomicBool,
    subscriptions: Mutex<Vec<Subscription>>,
    released: AtomicBool,
}

/// Aggregates stores and coalesces their changes into single emissions.
///
/// Cheap to clone; clones share everything.
#[derive(Clone)]
pub struct StoreGroup {
    inner: Arc<Inner>,
}

/// Pops the write-phase scope, even if a store panics.
struct WritePhase<'a> {
    group: &'a StoreGroup,
}

impl Drop for WritePhase<'_> {
    fn drop(&mut self) {
        lock(&self.group.inner.state).scopes.pop();
    }
}

/// Closes a store's write window.
struct Writing<'a>(&'a ChangeEmitter);

impl Drop for Writing<'_> {
    fn drop(&mut self) {
        self.0.end_write();
    }
}

impl StoreGroup {
    pub fn builder() -> StoreGroupBuilder {
        StoreGroupBuilder::default()
    }

    fn upgrade(weak: &Weak<Inner>) -> Option<StoreGroup> {
        weak.upgrade().map(|inner| StoreGroup { inner })
    }

    /// The consolidated state, as of the last read phase.
    pub fn get_state(&self) -> Arc<MergedState> {
        lock(&self.inner.state).merged.clone()
    }

    /// Subscribe to emissions. The handler receives the stores whose state
    /// changed, in binding order.
    pub fn on_change<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&[StoreRef]) + Send + Sync + 'static,
    {
        self.inner.change_handlers.subscribe(Arc::new(handler))
    }

    /// Subscribe to warnings raised by this group.
    pub fn on_warning<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Warning) + Send + Sync + 'static,
    {
        self.inner.diagnostics.subscribe(handler)
    }

    pub(crate) fn diagnostics(&self) -> &Diagnostics {
        &self.inner.diagnostics
    }

    /// Bound stores, in binding order.
    pub fn stores(&self) -> Vec<StoreRef> {
        self.inner
            .bindings
            .iter()
            .map(|binding| binding.store.clone())
            .collect()
    }

    pub fn state_names(&self) -> Vec<String> {
        self.inner
            .bindings
            .iter()
            .map(|binding| binding.state_name.clone())
            .collect()
    }

    pub fn set_strict(&self, strict: bool) {
        self.inner.strict.store(strict, Ordering::SeqCst);
        for binding in &self.inner.bindings {
            binding.store.change_emitter().set_strict(strict);
        }
    }

    pub fn is_strict(&self) -> bool {
        self.inner.strict.load(Ordering::SeqCst)
    }

    /// Run a read phase now and emit whatever changed.
    ///
    /// Stores held by an open transaction are left for its commit. Inside a
    /// write phase this does nothing; the write phase emits when it ends.
    pub fn emit_change(&self) {
        if self.inner.released.load(Ordering::SeqCst) {
            return;
        }
        if !lock(&self.inner.state).scopes.is_empty() {
            return;
        }
        self.flush_global();
    }

    /// Receive every payload dispatched on `dispatcher`.
    pub fn attach_to(&self, dispatcher: &Dispatcher) -> Subscription {
        let weak = Arc::downgrade(&self.inner);
        let sub = dispatcher.on_dispatch(move |payload, meta| {
            if let Some(group) = StoreGroup::upgrade(&weak) {
                group.receive(payload, meta);
            }
        });
        lock(&self.inner.subscriptions).push(sub.clone());
        sub
    }

    /// Detach from every store and dispatcher and drop all change handlers.
    pub fn release(&self) {
        if self.inner.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let subscriptions = std::mem::take(&mut *lock(&self.inner.subscriptions));
        for sub in subscriptions {
            sub.unsubscribe();
        }
        self.inner.change_handlers.clear();
        debug!("store group released");
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::SeqCst)
    }

    // -------------------------------------------------------------------------
    // Payload handling
    // -------------------------------------------------------------------------

    /// Handle one payload from the bus.
    pub fn receive(&self, payload: &Payload, meta: &DispatcherPayloadMeta) {
        if self.is_released() {
            return;
        }

        let scope = {
            let mut state = lock(&self.inner.state);
            let scope = match meta.transaction_id() {
                Some(id) if state.transactions.contains_key(&id) => Scope::Transaction(id),
                _ => Scope::Global,
            };

            if meta.is_trusted {
                match payload {
                    Payload::TransactionBegan { id, name } => {
                        debug!(transaction = %name, %id, "transaction opened");
                        state.transactions.entry(*id).or_default();
                        return;
                    }
                    Payload::TransactionEnded { .. } | Payload::WillNotExecuted { .. } => return,
                    Payload::WillExecuted { .. } => {
                        if let Some(id) = meta.use_case_id() {
                            state.in_flight_mut(scope).insert(id);
                        }
                        return;
                    }
                    Payload::DidExecuted { .. } => {
                        if let (true, Some(id)) = (meta.is_use_case_finished, meta.use_case_id()) {
                            state.forget(id);
                            state.finished.insert(id);
                        }
                    }
                    Payload::Completed { .. } => {
                        if let Some(id) = meta.use_case_id() {
                            if state.finished.remove(&id) {
                                return;
                            }
                            state.forget(id);
                        }
                    }
                    Payload::Error { .. } | Payload::Custom(_) => {}
                }
            }
            scope
        };

        self.write_phase(scope, payload, meta);
        self.try_emit(scope);
    }

    fn write_phase(&self, scope: Scope, payload: &Payload, meta: &DispatcherPayloadMeta) {
        let before = match scope {
            Scope::Transaction(id) => self.pre_write(id),
            Scope::Global => None,
        };
        lock(&self.inner.state).scopes.push(scope);
        {
            let _phase = WritePhase { group: self };
            for binding in &self.inner.bindings {
                let emitter = binding.store.change_emitter();
                emitter.begin_write();
                let _writing = Writing(emitter);
                binding.store.deliver_payload(payload, meta);
            }
        }
        if let (Scope::Transaction(id), Some(before)) = (scope, before) {
            self.hold_changed(id, before);
        }
    }

    fn pre_write(&self, id: TransactionId) -> Option<PreWrite> {
        let (cache, held) = {
            let state = lock(&self.inner.state);
            let transaction = state.transactions.get(&id)?;
            (state.cache.clone(), transaction.held.clone())
        };
        let states: Vec<StateRef> = self
            .inner
            .bindings
            .iter()
            .map(|binding| binding.store.current_state())
            .collect();
        let pending = self
            .inner
            .bindings
            .iter()
            .zip(cache.iter().zip(&states))
            .map(|(binding, (cached, current))| binding.store.state_changed(cached, current))
            .collect();
        Some(PreWrite {
            states,
            pending,
            held,
        })
    }

    /// Attribute to the transaction every store its write phase changed.
    fn hold_changed(&self, id: TransactionId, before: PreWrite) {
        let changed: Vec<usize> = self
            .inner
            .bindings
            .iter()
            .enumerate()
            .filter(|(index, binding)| {
                binding
                    .store
                    .state_changed(&before.states[*index], &binding.store.current_state())
            })
            .map(|(index, _)| index)
            .collect();

        let mut state = lock(&self.inner.state);
        let Some(transaction) = state.transactions.get_mut(&id) else {
            return;
        };
        transaction.held.extend(changed);
        // A store taken over while it had an unemitted change still owes
        // that change to observers, whatever the transaction's outcome.
        let taken: Vec<usize> = transaction
            .held
            .difference(&before.held)
            .copied()
            .filter(|index| before.pending[*index])
            .collect();
        transaction.carried.extend(taken);
    }

    fn try_emit(&self, scope: Scope) {
        let flush = {
            let state = lock(&self.inner.state);
            if !state.scopes.is_empty() {
                false
            } else {
                match scope {
                    Scope::Transaction(id) if state.transactions.contains_key(&id) => false,
                    _ => state.in_flight.is_empty(),
                }
            }
        };
        if flush {
            self.flush_global();
        }
    }

    fn on_store_change(&self, index: usize) {
        if self.is_released() {
            return;
        }
        let store = &self.inner.bindings[index].store;
        self.check_strict(store);

        let flush = {
            let mut state = lock(&self.inner.state);
            state.emitted.insert(index);
            match state.scopes.last().copied() {
                Some(Scope::Transaction(id)) => {
                    if let Some(transaction) = state.transactions.get_mut(&id) {
                        transaction.held.insert(index);
                    }
                    false
                }
                Some(Scope::Global) => false,
                None => state.in_flight.is_empty(),
            }
        };
        if flush {
            self.flush_global();
        }
    }

    fn check_strict(&self, store: &StoreRef) {
        if store.change_emitter().take_violation() {
            self.inner.diagnostics.warn(Warning::StateMutatedOutsideWrite {
                store: store.store_name().to_string(),
            });
        }
    }

    // -------------------------------------------------------------------------
    // Read phase and emission
    // -------------------------------------------------------------------------

    fn flush_global(&self) {
        let targets: Vec<usize> = {
            let state = lock(&self.inner.state);
            let held = state.held();
            (0..self.inner.bindings.len())
                .filter(|index| !held.contains(index))
                .collect()
        };
        let changed = self.read_phase(&targets);
        self.emit(changed);
    }

    fn read_phase(&self, targets: &[usize]) -> ChangeSet {
        let (cache, emitted) = {
            let mut state = lock(&self.inner.state);
            let emitted: HashSet<usize> = targets
                .iter()
                .copied()
                .filter(|index| state.emitted.remove(index))
                .collect();
            (state.cache.clone(), emitted)
        };

        let mut updates: Vec<(usize, StateRef)> = Vec::new();
        for &index in targets {
            let store = &self.inner.bindings[index].store;
            self.check_strict(store);
            let next = store.current_state();
            if store.state_changed(&cache[index], &next) {
                updates.push((index, next));
            } else if emitted.contains(&index) {
                self.inner.diagnostics.warn(Warning::UnchangedEmit {
                    store: store.store_name().to_string(),
                });
            }
        }

        if updates.is_empty() {
            return ChangeSet::new();
        }

        let mut changed = ChangeSet::new();
        let mut state = lock(&self.inner.state);
        for (index, next) in updates {
            // Another read phase may have consumed this change already.
            if !Arc::ptr_eq(&state.cache[index], &cache[index]) {
                continue;
            }
            state.cache[index] = next;
            changed.push(self.inner.bindings[index].store.clone());
        }
        if !changed.is_empty() {
            state.merged = Arc::new(merge(&self.inner.bindings, &state.cache));
        }
        changed
    }

    fn emit(&self, changed: ChangeSet) {
        if changed.is_empty() {
            return;
        }
        debug!(
            stores = ?changed.iter().map(|s| s.store_name()).collect::<Vec<_>>(),
            "emit change"
        );
        for handler in self.inner.change_handlers.snapshot() {
            handler(changed.as_slice());
        }
    }

    /// Close a transaction window: emit the stores it held, or discard them.
    ///
    /// Stores that carried someone else's unemitted change when the
    /// transaction took them over are never discarded. On exit they are
    /// left for the next global emission.
    pub(crate) fn close_transaction(&self, id: TransactionId, outcome: TransactionOutcome) {
        let (owned, carried) = {
            let mut state = lock(&self.inner.state);
            let Some(closed) = state.transactions.remove(&id) else {
                return;
            };
            if !closed.in_flight.is_empty() {
                debug!(
                    transaction = %id,
                    still_running = closed.in_flight.len(),
                    "transaction closed with executions in flight"
                );
            }
            let still_held = state.held();
            let mut owned = Vec::new();
            let mut carried = Vec::new();
            for index in closed.held {
                let is_carried = closed.carried.contains(&index);
                if still_held.contains(&index) {
                    if is_carried {
                        // Hand the debt to the transaction that still holds it.
                        if let Some(other) = state
                            .transactions
                            .values_mut()
                            .find(|other| other.held.contains(&index))
                        {
                            other.carried.insert(index);
                        }
                    }
                } else if is_carried {
                    carried.push(index);
                } else {
                    owned.push(index);
                }
            }
            (owned, carried)
        };

        match outcome {
            TransactionOutcome::Commit => {
                let mut targets = owned;
                targets.extend(carried);
                targets.sort_unstable();
                let changed = self.read_phase(&targets);
                self.emit(changed);
            }
            TransactionOutcome::Exit => {
                let discarded = self.read_phase(&owned);
                debug!(transaction = %id, discarded = discarded.len(), "transaction exited");
                if !carried.is_empty() {
                    self.try_emit(Scope::Global);
                }
            }
        }
    }
}

impl fmt::Debug for StoreGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreGroup")
            .field("state_names", &self.state_names())
            .field("strict", &self.is_strict())
            .field("released", &self.is_released())
            .finish()
    }
}
