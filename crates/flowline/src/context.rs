//! Context: the entry point that wires a dispatcher, a store group and the
//! executor registry together.
//!
//! # Example
//!
//! ```ignore
//! let group = StoreGroup::builder()
//!     .with_store("counter", Arc::new(CounterStore::new()))
//!     .build()?;
//! let context = Context::builder(group).strict(true).build();
//!
//! context.on_change(|stores| println!("changed: {}", stores.len()));
//! context.use_case(Increment).execute(Value::Null).await?;
//!
//! context
//!     .transaction("batch", |tx| async move {
//!         tx.use_case(Increment).execute(Value::Null).await?;
//!         tx.use_case(Increment).execute(Value::Null).await?;
//!         tx.commit()?;
//!         Ok(())
//!     })
//!     .await?;
//! ```

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::{DispatcherPayloadMeta, Payload, TransactionRef, UseCaseId};
use crate::dispatch::{lock, Dispatcher, Subscription};
use crate::error::{FlowlineError, Warning};
use crate::executor::{ExecutionScope, ExecutorEntry, ExecutorRegistry, UseCaseExecutor};
use crate::store::StoreRef;
use crate::store_group::{MergedState, StoreGroup};
use crate::transaction::TransactionContext;
use crate::use_case::{IntoUseCase, UseCaseHandle};

/// Runtime options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextOptions {
    /// Warn when a store replaces its state outside of `receive_payload`.
    pub strict: bool,
}

/// Builder for [`Context`].
pub struct ContextBuilder {
    store_group: StoreGroup,
    dispatcher: Option<Dispatcher>,
    options: ContextOptions,
}

impl ContextBuilder {
    /// Use an existing root dispatcher instead of a fresh one.
    pub fn with_dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn with_options(mut self, options: ContextOptions) -> Self {
        self.options = options;
        self
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.options.strict = strict;
        self
    }

    pub fn build(self) -> Context {
        let dispatcher = self.dispatcher.unwrap_or_default();
        if self.options.strict {
            self.store_group.set_strict(true);
        }
        let attachment = self.store_group.attach_to(&dispatcher);
        debug!(strict = self.options.strict, "context built");

        Context {
            inner: Arc::new(ContextInner {
                dispatcher,
                store_group: self.store_group,
                registry: Arc::new(ExecutorRegistry::new()),
                options: self.options,
                subscriptions: Mutex::new(vec![attachment]),
                released: AtomicBool::new(false),
            }),
        }
    }
}

struct ContextInner {
    dispatcher: Dispatcher,
    store_group: StoreGroup,
    registry: Arc<ExecutorRegistry>,
    options: ContextOptions,
    subscriptions: Mutex<Vec<Subscription>>,
    released: AtomicBool,
}

/// Entry point for executing use-cases and observing their effects.
///
/// Cheap to clone; clones share the dispatcher, store group and registry.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    pub fn builder(store_group: StoreGroup) -> ContextBuilder {
        ContextBuilder {
            store_group,
            dispatcher: None,
            options: ContextOptions::default(),
        }
    }

    /// A context with a fresh dispatcher and default options.
    pub fn new(store_group: StoreGroup) -> Self {
        Self::builder(store_group).build()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub fn store_group(&self) -> &StoreGroup {
        &self.inner.store_group
    }

    pub fn options(&self) -> &ContextOptions {
        &self.inner.options
    }

    pub(crate) fn scope(&self) -> ExecutionScope {
        ExecutionScope::new(
            self.inner.dispatcher.clone(),
            self.inner.registry.clone(),
            self.inner.store_group.diagnostics().clone(),
        )
    }

    /// Prepare a top-level execution.
    pub fn use_case(&self, use_case: impl IntoUseCase) -> UseCaseExecutor {
        UseCaseExecutor::new(use_case.into_use_case(), None, self.scope())
    }

    /// Run `handler` inside a transaction.
    ///
    /// Store changes made by use-cases executed through the
    /// [`TransactionContext`] are emitted once on `commit()` or dropped on
    /// `exit()`. A handler that returns without closing the transaction gets
    /// a [`Warning::TransactionNotClosed`] and is exited.
    pub async fn transaction<F, Fut>(
        &self,
        name: impl Into<String>,
        handler: F,
    ) -> Result<(), FlowlineError>
    where
        F: FnOnce(TransactionContext) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let transaction = TransactionRef::new(name);
        debug!(transaction = %transaction.name, id = %transaction.id, "transaction began");
        self.inner.dispatcher.deliver(
            &Payload::TransactionBegan {
                name: transaction.name.clone(),
                id: transaction.id,
            },
            &DispatcherPayloadMeta::for_transaction(&transaction),
        );

        let tx = TransactionContext::new(self.clone(), transaction.clone());
        let result = handler(tx.clone()).await;

        if !tx.is_closed() {
            self.inner
                .store_group
                .diagnostics()
                .warn(Warning::TransactionNotClosed {
                    name: transaction.name.clone(),
                    id: transaction.id,
                });
            if let Err(error) = tx.exit() {
                debug!(error = %error, "transaction closed concurrently");
            }
        }

        result.map_err(|source| FlowlineError::TransactionFailed {
            name: transaction.name,
            source,
        })
    }

    pub fn get_state(&self) -> Arc<MergedState> {
        self.inner.store_group.get_state()
    }

    /// Subscribe to store group emissions.
    pub fn on_change<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&[StoreRef]) + Send + Sync + 'static,
    {
        self.track(self.inner.store_group.on_change(handler))
    }

    /// Subscribe to every warning raised by this context and its store
    /// group.
    pub fn on_warning<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Warning) + Send + Sync + 'static,
    {
        self.track(self.inner.store_group.on_warning(handler))
    }

    /// Number of executions currently in flight.
    pub fn executing_count(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn is_executing(&self, use_case: &UseCaseHandle) -> bool {
        self.inner.registry.contains(use_case.id())
    }

    /// Every execution currently in flight, ordered by id.
    pub fn executing(&self) -> Vec<(UseCaseId, ExecutorEntry)> {
        self.inner.registry.snapshot()
    }

    /// Detach from the dispatcher, release the store group and drop every
    /// subscription made through this context.
    pub fn release(&self) {
        if self.inner.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let subscriptions = std::mem::take(&mut *lock(&self.inner.subscriptions));
        for sub in subscriptions {
            sub.unsubscribe();
        }
        self.inner.store_group.release();
        debug!("context released");
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::SeqCst)
    }

    fn track(&self, sub: Subscription) -> Subscription {
        lock(&self.inner.subscriptions).push(sub.clone());
        sub
    }

    // =========================================================================
    // Lifecycle hub
    // =========================================================================

    fn on_matching<F>(
        &self,
        matches: fn(&Payload, &DispatcherPayloadMeta) -> bool,
        handler: F,
    ) -> Subscription
    where
        F: Fn(&Payload, &DispatcherPayloadMeta) + Send + Sync + 'static,
    {
        let sub = self.inner.dispatcher.on_dispatch(move |payload, meta| {
            if matches(payload, meta) {
                handler(payload, meta);
            }
        });
        self.track(sub)
    }

    pub fn on_will_execute_each_use_case<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Payload, &DispatcherPayloadMeta) + Send + Sync + 'static,
    {
        self.on_matching(
            |p, m| m.is_trusted && matches!(p, Payload::WillExecuted { .. }),
            handler,
        )
    }

    pub fn on_did_execute_each_use_case<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Payload, &DispatcherPayloadMeta) + Send + Sync + 'static,
    {
        self.on_matching(
            |p, m| m.is_trusted && matches!(p, Payload::DidExecuted { .. }),
            handler,
        )
    }

    pub fn on_complete_each_use_case<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Payload, &DispatcherPayloadMeta) + Send + Sync + 'static,
    {
        self.on_matching(
            |p, m| m.is_trusted && matches!(p, Payload::Completed { .. }),
            handler,
        )
    }

    pub fn on_will_not_execute_each_use_case<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Payload, &DispatcherPayloadMeta) + Send + Sync + 'static,
    {
        self.on_matching(
            |p, m| m.is_trusted && matches!(p, Payload::WillNotExecuted { .. }),
            handler,
        )
    }

    /// Subscribe to `Error` payloads, whether produced by a failing body or
    /// by `throw_error`.
    pub fn on_error_dispatch<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Payload, &DispatcherPayloadMeta) + Send + Sync + 'static,
    {
        self.on_matching(|p, _| p.is_error(), handler)
    }

    /// Subscribe to application payloads only.
    pub fn on_dispatch<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Payload, &DispatcherPayloadMeta) + Send + Sync + 'static,
    {
        self.on_matching(|p, _| !p.is_builtin(), handler)
    }

    pub fn on_begin_transaction<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Payload, &DispatcherPayloadMeta) + Send + Sync + 'static,
    {
        self.on_matching(
            |p, m| m.is_trusted && matches!(p, Payload::TransactionBegan { .. }),
            handler,
        )
    }

    pub fn on_end_transaction<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Payload, &DispatcherPayloadMeta) + Send + Sync + 'static,
    {
        self.on_matching(
            |p, m| m.is_trusted && matches!(p, Payload::TransactionEnded { .. }),
            handler,
        )
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("store_group", &self.inner.store_group)
            .field("executing", &self.inner.registry.len())
            .field("options", &self.inner.options)
            .finish()
    }
}
