//! Use-case execution: lifecycle payloads, nesting, and the executor registry.
//!
//! # Lifecycle
//!
//! ```text
//! should_execute == false ──► WillNotExecuted                       (done)
//!
//! WillExecuted ──► execute() ─┬─ Ready(Ok)   ──► DidExecuted ──► Completed
//!                             ├─ Ready(Err)  ──► Error ──► DidExecuted ──► Completed
//!                             └─ Pending     ──► DidExecuted ·· await ·· [Error] ──► Completed
//! ```
//!
//! A ready body runs the whole lifecycle before [`UseCaseExecutor::execute`]
//! returns. A pending body dispatches `DidExecuted` immediately and the rest
//! when the returned [`UseCaseExecution`] is driven to completion.
//!
//! # Routing
//!
//! While it runs, a use-case's own dispatcher is piped into its parent's
//! dispatcher, or into the root dispatcher for a top-level execution. If a
//! child outlives its parent, a [`Warning::ParentReleased`] is raised once
//! and the child's remaining payloads go straight to the root.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tracing::debug;

use crate::core::{DispatcherPayloadMeta, Payload, TransactionId, TransactionRef, UseCaseId};
use crate::dispatch::{Dispatcher, Subscription};
use crate::error::{Diagnostics, FlowlineError, Warning};
use crate::use_case::{Execution, UseCaseContext, UseCaseHandle};

// =============================================================================
// Executor Registry
// =============================================================================

/// A running execution as seen by the registry.
#[derive(Debug, Clone)]
pub struct ExecutorEntry {
    pub name: String,
    pub parent: Option<UseCaseId>,
    pub transaction: Option<TransactionId>,
    pub started_at: DateTime<Utc>,
}

/// Tracks every execution between `WillExecuted` and `Completed`.
///
/// Owned by a [`Context`](crate::Context) rather than the process, so that
/// independent contexts (and tests) never observe each other.
#[derive(Default)]
pub struct ExecutorRegistry {
    entries: DashMap<UseCaseId, ExecutorEntry>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an execution. Returns false if this instance is already
    /// registered.
    pub(crate) fn register(
        &self,
        use_case: &UseCaseHandle,
        parent: Option<&UseCaseHandle>,
        transaction: Option<&TransactionRef>,
    ) -> bool {
        match self.entries.entry(use_case.id()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(ExecutorEntry {
                    name: use_case.name().to_string(),
                    parent: parent.map(UseCaseHandle::id),
                    transaction: transaction.map(|t| t.id),
                    started_at: Utc::now(),
                });
                true
            }
        }
    }

    pub(crate) fn release(&self, id: UseCaseId) {
        self.entries.remove(&id);
    }

    /// Returns true while the instance is executing.
    pub fn contains(&self, id: UseCaseId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up a running execution.
    pub fn get(&self, id: UseCaseId) -> Option<ExecutorEntry> {
        self.entries.get(&id).map(|entry| entry.clone())
    }

    /// Walk the parent chain starting at `start`, looking for `target`.
    pub(crate) fn chain_contains(&self, start: Option<UseCaseId>, target: UseCaseId) -> bool {
        let mut current = start;
        // Bounded by the number of entries; a chain can never be longer.
        for _ in 0..=self.entries.len() {
            let Some(id) = current else {
                return false;
            };
            if id == target {
                return true;
            }
            current = self.entries.get(&id).and_then(|entry| entry.parent);
        }
        false
    }

    /// Copy of every running execution, ordered by id.
    pub fn snapshot(&self) -> Vec<(UseCaseId, ExecutorEntry)> {
        let mut entries: Vec<_> = self
            .entries
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        entries.sort_by_key(|(id, _)| *id);
        entries
    }
}

impl fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("executing", &self.entries.len())
            .finish()
    }
}

// =============================================================================
// Execution Scope
// =============================================================================

/// Everything an execution inherits from whoever started it.
#[derive(Clone)]
pub(crate) struct ExecutionScope {
    pub(crate) root: Dispatcher,
    pub(crate) registry: Arc<ExecutorRegistry>,
    pub(crate) transaction: Option<TransactionRef>,
    pub(crate) diagnostics: Diagnostics,
}

impl ExecutionScope {
    pub(crate) fn new(
        root: Dispatcher,
        registry: Arc<ExecutorRegistry>,
        diagnostics: Diagnostics,
    ) -> Self {
        Self {
            root,
            registry,
            transaction: None,
            diagnostics,
        }
    }

    pub(crate) fn with_transaction(mut self, transaction: TransactionRef) -> Self {
        self.transaction = Some(transaction);
        self
    }
}

/// Where an execution's payloads go.
struct Route {
    use_case: String,
    parent: Option<UseCaseHandle>,
    scope: ExecutionScope,
    orphaned: AtomicBool,
}

impl Route {
    fn new(use_case: &UseCaseHandle, parent: Option<UseCaseHandle>, scope: ExecutionScope) -> Self {
        Self {
            use_case: use_case.name().to_string(),
            parent,
            scope,
            orphaned: AtomicBool::new(false),
        }
    }

    fn target(&self) -> Dispatcher {
        match &self.parent {
            None => self.scope.root.clone(),
            Some(parent) if self.scope.registry.contains(parent.id()) => {
                parent.dispatcher().clone()
            }
            Some(parent) => {
                if !self.orphaned.swap(true, Ordering::SeqCst) {
                    self.scope.diagnostics.warn(Warning::ParentReleased {
                        use_case: self.use_case.clone(),
                        parent: parent.name().to_string(),
                    });
                }
                self.scope.root.clone()
            }
        }
    }
}

// =============================================================================
// Lifecycle Guard
// =============================================================================

/// Owns an in-flight execution's registration and pipe.
///
/// `complete` dispatches the terminal payload and releases both. If the
/// guard is dropped first (a pending execution dropped before it settled),
/// `Completed` is still dispatched without a value so observers never see
/// an execution that never ends.
struct Lifecycle {
    handle: UseCaseHandle,
    parent: Option<UseCaseHandle>,
    transaction: Option<TransactionRef>,
    registry: Arc<ExecutorRegistry>,
    pipe: Subscription,
    completed: bool,
}

impl Lifecycle {
    fn deliver(&self, payload: Payload, finished: bool) {
        let meta = DispatcherPayloadMeta::lifecycle(
            &self.handle,
            self.parent.as_ref(),
            self.transaction.as_ref(),
            finished,
        );
        self.handle.dispatcher().deliver(&payload, &meta);
    }

    fn will_execute(&self, args: Value) {
        debug!(use_case = %self.handle.name(), id = %self.handle.id(), "will execute");
        self.deliver(Payload::WillExecuted { args }, false);
    }

    fn did_execute(&self, finished: bool, value: Option<Value>) {
        debug!(use_case = %self.handle.name(), finished, "did execute");
        self.deliver(Payload::DidExecuted { value }, finished);
    }

    fn error(&self, error: Arc<anyhow::Error>) {
        debug!(use_case = %self.handle.name(), error = %error, "use case failed");
        self.deliver(Payload::Error { error }, false);
    }

    fn complete(&mut self, value: Option<Value>) {
        self.completed = true;
        debug!(use_case = %self.handle.name(), ok = value.is_some(), "complete");
        self.deliver(Payload::Completed { value }, true);
        self.release();
    }

    fn release(&self) {
        self.pipe.unsubscribe();
        self.registry.release(self.handle.id());
    }

    fn failure(&self, error: Arc<anyhow::Error>) -> FlowlineError {
        FlowlineError::UseCaseFailed {
            use_case: self.handle.name().to_string(),
            error,
        }
    }
}

impl Drop for Lifecycle {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        if !std::thread::panicking() {
            debug!(use_case = %self.handle.name(), "execution dropped before it settled");
            self.deliver(Payload::Completed { value: None }, true);
        }
        self.release();
    }
}

// =============================================================================
// Use Case Executor
// =============================================================================

/// A prepared execution of one use-case instance.
///
/// Obtained from [`Context::use_case`](crate::Context::use_case),
/// [`UseCaseContext::use_case`] (nested) or
/// [`TransactionContext::use_case`](crate::TransactionContext::use_case).
#[must_use = "an executor does nothing until `execute` is called"]
pub struct UseCaseExecutor {
    use_case: UseCaseHandle,
    parent: Option<UseCaseHandle>,
    scope: ExecutionScope,
}

impl UseCaseExecutor {
    pub(crate) fn new(
        use_case: UseCaseHandle,
        parent: Option<UseCaseHandle>,
        scope: ExecutionScope,
    ) -> Self {
        Self {
            use_case,
            parent,
            scope,
        }
    }

    /// The instance this executor runs.
    pub fn use_case(&self) -> &UseCaseHandle {
        &self.use_case
    }

    /// Run the use-case. Contract violations surface as the output of the
    /// returned execution; see [`try_execute`](Self::try_execute) to get
    /// them at the call site instead.
    pub fn execute(self, args: impl Into<Value>) -> UseCaseExecution {
        match self.try_execute(args) {
            Ok(execution) => execution,
            Err(error) => UseCaseExecution::ready(Err(error)),
        }
    }

    /// Run the use-case, failing immediately on contract violations.
    ///
    /// On `Ok`, every payload up to and including `DidExecuted` has already
    /// been dispatched. For a ready body, so has `Completed`.
    pub fn try_execute(self, args: impl Into<Value>) -> Result<UseCaseExecution, FlowlineError> {
        let args = args.into();
        let UseCaseExecutor {
            use_case: handle,
            parent,
            scope,
        } = self;

        Self::ensure_not_running(&handle, parent.as_ref(), &scope)?;
        let route = Arc::new(Route::new(&handle, parent.clone(), scope.clone()));

        if !handle.use_case().should_execute(&args) {
            debug!(use_case = %handle.name(), "will not execute");
            let meta = DispatcherPayloadMeta::lifecycle(
                &handle,
                parent.as_ref(),
                scope.transaction.as_ref(),
                true,
            );
            route
                .target()
                .deliver(&Payload::WillNotExecuted { args }, &meta);
            return Ok(UseCaseExecution::ready(Ok(Value::Null)));
        }

        if !scope
            .registry
            .register(&handle, parent.as_ref(), scope.transaction.as_ref())
        {
            return Err(FlowlineError::AlreadyExecuting {
                use_case: handle.name().to_string(),
            });
        }

        let pipe = {
            let route = route.clone();
            handle
                .dispatcher()
                .on_dispatch(move |payload, meta| route.target().deliver(payload, meta))
        };
        let mut lifecycle = Lifecycle {
            handle: handle.clone(),
            parent: parent.clone(),
            transaction: scope.transaction.clone(),
            registry: scope.registry.clone(),
            pipe,
            completed: false,
        };

        lifecycle.will_execute(args.clone());
        let ctx = UseCaseContext::new(handle.clone(), parent, scope);

        match handle.use_case().execute(&ctx, args) {
            Execution::Ready(Ok(value)) => {
                lifecycle.did_execute(true, Some(value.clone()));
                lifecycle.complete(Some(value.clone()));
                Ok(UseCaseExecution::ready(Ok(value)))
            }
            Execution::Ready(Err(error)) => {
                let error = Arc::new(error);
                lifecycle.error(error.clone());
                lifecycle.did_execute(true, None);
                lifecycle.complete(None);
                Ok(UseCaseExecution::ready(Err(lifecycle.failure(error))))
            }
            Execution::Pending(body) => {
                lifecycle.did_execute(false, None);
                Ok(UseCaseExecution::pending(async move {
                    match body.await {
                        Ok(value) => {
                            lifecycle.complete(Some(value.clone()));
                            Ok(value)
                        }
                        Err(error) => {
                            let error = Arc::new(error);
                            lifecycle.error(error.clone());
                            lifecycle.complete(None);
                            Err(lifecycle.failure(error))
                        }
                    }
                }))
            }
        }
    }

    fn ensure_not_running(
        handle: &UseCaseHandle,
        parent: Option<&UseCaseHandle>,
        scope: &ExecutionScope,
    ) -> Result<(), FlowlineError> {
        let id = handle.id();
        if !scope.registry.contains(id) {
            return Ok(());
        }
        let name = handle.name().to_string();
        if scope
            .registry
            .chain_contains(parent.map(UseCaseHandle::id), id)
        {
            Err(FlowlineError::NestedSelfExecution { use_case: name })
        } else {
            Err(FlowlineError::AlreadyExecuting { use_case: name })
        }
    }
}

impl fmt::Debug for UseCaseExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UseCaseExecutor")
            .field("use_case", &self.use_case)
            .field("parent", &self.parent)
            .field("transaction", &self.scope.transaction)
            .finish()
    }
}

// =============================================================================
// Use Case Execution
// =============================================================================

/// The result of [`UseCaseExecutor::execute`].
///
/// Resolves to the use-case's value, or to
/// [`FlowlineError::UseCaseFailed`] after the failure was dispatched.
#[must_use = "a pending execution does not complete unless it is awaited"]
pub struct UseCaseExecution {
    inner: BoxFuture<'static, Result<Value, FlowlineError>>,
    settled: bool,
}

impl UseCaseExecution {
    fn ready(result: Result<Value, FlowlineError>) -> Self {
        Self {
            inner: futures::future::ready(result).boxed(),
            settled: true,
        }
    }

    fn pending<F>(future: F) -> Self
    where
        F: Future<Output = Result<Value, FlowlineError>> + Send + 'static,
    {
        Self {
            inner: future.boxed(),
            settled: false,
        }
    }

    /// Returns true if the whole lifecycle already ran before `execute`
    /// returned.
    pub fn is_settled(&self) -> bool {
        self.settled
    }
}

impl Future for UseCaseExecution {
    type Output = Result<Value, FlowlineError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        self.inner.poll_unpin(cx)
    }
}

impl fmt::Debug for UseCaseExecution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UseCaseExecution")
            .field("settled", &self.settled)
            .finish_non_exhaustive()
    }
}
