//! # Flowline
//!
//! A unidirectional coordination core where use-cases write, stores read,
//! and transactions decide what observers see.
//!
//! ## Core Concepts
//!
//! Flowline separates **writes** from **reads**:
//! - [`UseCase`] = Write side (units of application logic that dispatch payloads)
//! - [`Store`] = Read side (owners of one immutable slice of state)
//!
//! The key principle: **One execution = One emission**.
//! However many stores change across however many nested use-cases, the
//! [`StoreGroup`] reports them together, once.
//!
//! ## Architecture
//!
//! ```text
//! Context.use_case(x).execute(args)
//!     │
//!     ▼
//! UseCaseExecutor ── WillExecuted ─► body ─► DidExecuted ─► Completed
//!     │                               │
//!     │                 dispatch() / nested use_case()
//!     ▼                               │
//! use-case Dispatcher ──pipe──► parent Dispatcher ──pipe──► root Dispatcher
//!                                                               │
//!                                                               ▼
//!                                                          StoreGroup
//!                                                               │
//!                                   write phase: receive_payload on every store
//!                                   read phase:  diff against cached state
//!                                                               │
//!                                                               ▼
//!                                                 on_change(&[changed stores])
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Dispatch is synchronous** - every subscriber runs before `dispatch` returns
//! 2. **Lifecycle is ordered** - `WillExecuted` < `DidExecuted` < `Completed`
//! 3. **Children nest inside parents** - a child's lifecycle sits between its
//!    parent's `DidExecuted` and `Completed`
//! 4. **State is replaced, never mutated** - unchanged slices keep their `Arc`
//! 5. **Emissions are complete** - a change may be deferred but is never dropped
//!
//! ## Error Boundaries
//!
//! - Contract violations (untyped payloads, bad bindings, self-nesting,
//!   double commit) fail at the call site with [`FlowlineError`]
//! - Use-case failures are dispatched as an `Error` payload AND returned as
//!   [`FlowlineError::UseCaseFailed`]
//! - Invariant drift is reported as a [`Warning`] and never alters control flow
//!
//! ## Example
//!
//! ```ignore
//! use flowline_core::{Context, Execution, IntoExecution, Payload, Store, StoreCore,
//!     StoreGroup, UseCase, UseCaseContext, DispatcherPayloadMeta};
//! use serde_json::Value;
//! use std::sync::Arc;
//!
//! // 1. Define a store (read side)
//! #[derive(Debug, Clone, PartialEq)]
//! struct Counter { count: i64 }
//!
//! struct CounterStore { core: StoreCore<Counter> }
//!
//! impl Store for CounterStore {
//!     type State = Counter;
//!
//!     fn core(&self) -> &StoreCore<Counter> { &self.core }
//!
//!     fn receive_payload(&self, payload: &Payload, _meta: &DispatcherPayloadMeta) {
//!         if payload.kind() == "increment" {
//!             self.core.update_state(|s| Counter { count: s.count + 1 });
//!         }
//!     }
//! }
//!
//! // 2. Define a use-case (write side)
//! struct Increment;
//!
//! impl UseCase for Increment {
//!     fn execute(&self, ctx: &UseCaseContext, _args: Value) -> Execution {
//!         ctx.dispatch(Payload::custom("increment")).into_execution()
//!     }
//! }
//!
//! // 3. Wire together and run
//! let group = StoreGroup::builder()
//!     .with_store("counter", Arc::new(CounterStore {
//!         core: StoreCore::new("Counter", Counter { count: 0 }),
//!     }))
//!     .build()?;
//! let context = Context::new(group);
//!
//! context.on_change(|stores| println!("{} store(s) changed", stores.len()));
//! context.use_case(Increment).execute(Value::Null).await?;
//! ```
//!
//! ## What This Is Not
//!
//! Flowline is **not**:
//! - A UI binding layer
//! - A logger or devtools bridge
//! - A persistence or event-sourcing engine
//!
//! Flowline **is**:
//! > A unidirectional coordination core where use-cases write, stores read,
//! > and transactions decide what observers see.

// Core modules
mod context;
mod core;
mod dispatch;
mod error;
mod executor;
mod store;
mod store_group;
mod transaction;
mod use_case;


pub use crate::core::{
    DispatcherPayloadMeta, Payload, TransactionId, TransactionRef, UseCaseId, UserPayload,
};
pub use context::{Context, ContextBuilder, ContextOptions};
pub use dispatch::{DispatchHandler, Dispatcher, Subscription};
pub use error::{Diagnostics, FlowlineError, Warning, WarningHandler};
pub use executor::{ExecutorEntry, ExecutorRegistry, UseCaseExecution, UseCaseExecutor};
pub use store::{AnyStore, ChangeEmitter, StateRef, Store, StoreCore, StoreRef};
pub use store_group::{MergedState, StoreGroup, StoreGroupBuilder};
pub use transaction::TransactionContext;
pub use use_case::{
    use_case_fn, Execution, FunctionalUseCase, IntoExecution, IntoUseCase, UseCase,
    UseCaseContext, UseCaseHandle,
};
