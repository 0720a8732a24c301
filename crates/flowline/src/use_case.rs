//! UseCase trait, handles, and the context passed to a running use-case.
//!
//! Use-cases are the write side: units of application logic that dispatch
//! payloads and may nest other use-cases.
//!
//! # Key Properties
//!
//! - **Two-branch execution**: [`Execution::Ready`] finishes in the calling
//!   stack frame, [`Execution::Pending`] finishes when its future settles
//! - **Identity by instance**: every [`UseCaseHandle`] carries its own
//!   [`UseCaseId`], even when two handles wrap equal values
//! - **Narrow context**: a body can only dispatch, nest, and report errors
//!   through its [`UseCaseContext`]

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;

use crate::core::{DispatcherPayloadMeta, Payload, TransactionRef, UseCaseId};
use crate::dispatch::Dispatcher;
use crate::error::FlowlineError;
use crate::executor::{ExecutionScope, UseCaseExecutor};

// =============================================================================
// Execution
// =============================================================================

/// What a use-case body returns.
///
/// The variant decides the lifecycle path: a ready result runs
/// Did-Execute and Complete before `execute` returns; a pending one
/// dispatches Did-Execute immediately and Complete once the future settles.
pub enum Execution {
    Ready(anyhow::Result<Value>),
    Pending(BoxFuture<'static, anyhow::Result<Value>>),
}

impl Execution {
    /// A synchronous success.
    pub fn ok(value: impl Into<Value>) -> Self {
        Execution::Ready(Ok(value.into()))
    }

    /// A synchronous success with no value.
    pub fn done() -> Self {
        Execution::Ready(Ok(Value::Null))
    }

    /// A synchronous failure.
    pub fn fail(error: impl Into<anyhow::Error>) -> Self {
        Execution::Ready(Err(error.into()))
    }

    /// An asynchronous execution.
    pub fn pending<F>(future: F) -> Self
    where
        F: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Execution::Pending(future.boxed())
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Execution::Pending(_))
    }
}

impl From<anyhow::Result<Value>> for Execution {
    fn from(result: anyhow::Result<Value>) -> Self {
        Execution::Ready(result)
    }
}

impl fmt::Debug for Execution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Execution::Ready(result) => f.debug_tuple("Ready").field(result).finish(),
            Execution::Pending(_) => f.debug_tuple("Pending").finish_non_exhaustive(),
        }
    }
}

// =============================================================================
// UseCase Trait
// =============================================================================

/// A unit of application logic.
///
/// # Example
///
/// ```ignore
/// struct Increment;
///
/// impl UseCase for Increment {
///     fn execute(&self, ctx: &UseCaseContext, _args: Value) -> Execution {
///         match ctx.dispatch(Payload::custom("increment")) {
///             Ok(()) => Execution::done(),
///             Err(e) => Execution::fail(e),
///         }
///     }
/// }
///
/// struct Refresh { api: Arc<Api> }
///
/// impl UseCase for Refresh {
///     fn execute(&self, ctx: &UseCaseContext, _args: Value) -> Execution {
///         let api = self.api.clone();
///         let ctx = ctx.clone();
///         Execution::pending(async move {
///             let items = api.fetch().await?;
///             ctx.dispatch(UserPayload::new("loaded").with("items", items))?;
///             Ok(Value::Null)
///         })
///     }
/// }
/// ```
pub trait UseCase: Send + Sync + 'static {
    /// Name used in meta, logs, and warnings. Defaults to the type name.
    fn name(&self) -> &str {
        short_type_name(std::any::type_name::<Self>())
    }

    /// Guard evaluated before anything is dispatched. Returning false
    /// dispatches only `WillNotExecuted` and resolves immediately.
    fn should_execute(&self, _args: &Value) -> bool {
        true
    }

    /// Run the use-case.
    fn execute(&self, ctx: &UseCaseContext, args: Value) -> Execution;
}

fn short_type_name(full: &str) -> &str {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

// =============================================================================
// Functional UseCase
// =============================================================================

/// A use-case defined by a closure.
///
/// ```ignore
/// let reset = FunctionalUseCase::new("Reset", |ctx, _args| {
///     ctx.dispatch(Payload::custom("reset")).into_execution()
/// });
/// context.use_case(reset).execute(Value::Null).await?;
/// ```
pub struct FunctionalUseCase<F> {
    name: String,
    body: F,
}

impl<F> FunctionalUseCase<F>
where
    F: Fn(&UseCaseContext, Value) -> Execution + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, body: F) -> Self {
        Self {
            name: name.into(),
            body,
        }
    }
}

impl<F> UseCase for FunctionalUseCase<F>
where
    F: Fn(&UseCaseContext, Value) -> Execution + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, ctx: &UseCaseContext, args: Value) -> Execution {
        (self.body)(ctx, args)
    }
}

/// Shorthand for [`FunctionalUseCase::new`].
pub fn use_case_fn<F>(name: impl Into<String>, body: F) -> FunctionalUseCase<F>
where
    F: Fn(&UseCaseContext, Value) -> Execution + Send + Sync + 'static,
{
    FunctionalUseCase::new(name, body)
}

/// Turn a dispatch result into an execution outcome.
pub trait IntoExecution {
    fn into_execution(self) -> Execution;
}

impl IntoExecution for Result<(), FlowlineError> {
    fn into_execution(self) -> Execution {
        match self {
            Ok(()) => Execution::done(),
            Err(e) => Execution::fail(e),
        }
    }
}

// =============================================================================
// UseCase Handle
// =============================================================================

struct UseCaseSlot {
    id: UseCaseId,
    name: String,
    dispatcher: Dispatcher,
    use_case: Box<dyn UseCase>,
}

/// A use-case instance with identity.
///
/// Each handle owns a fresh [`UseCaseId`] and its own [`Dispatcher`].
/// Clones share both, so a clone IS the same instance.
#[derive(Clone)]
pub struct UseCaseHandle {
    slot: Arc<UseCaseSlot>,
}

impl UseCaseHandle {
    /// Wrap a use-case into a new instance.
    pub fn new<U: UseCase>(use_case: U) -> Self {
        let name = use_case.name().to_string();
        Self {
            slot: Arc::new(UseCaseSlot {
                id: UseCaseId::next(),
                name,
                dispatcher: Dispatcher::new(),
                use_case: Box::new(use_case),
            }),
        }
    }

    pub fn id(&self) -> UseCaseId {
        self.slot.id
    }

    pub fn name(&self) -> &str {
        &self.slot.name
    }

    /// The instance's own dispatcher. While executing, it is piped into the
    /// parent's dispatcher (or the root).
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.slot.dispatcher
    }

    /// Returns true if both handles are the same instance.
    pub fn ptr_eq(&self, other: &UseCaseHandle) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }

    pub(crate) fn use_case(&self) -> &dyn UseCase {
        self.slot.use_case.as_ref()
    }
}

impl PartialEq for UseCaseHandle {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for UseCaseHandle {}

impl fmt::Debug for UseCaseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UseCaseHandle")
            .field("id", &self.slot.id)
            .field("name", &self.slot.name)
            .finish()
    }
}

/// Anything that can be executed: a use-case value (wrapped into a new
/// instance) or an existing handle (reused as-is).
pub trait IntoUseCase {
    fn into_use_case(self) -> UseCaseHandle;
}

impl<U: UseCase> IntoUseCase for U {
    fn into_use_case(self) -> UseCaseHandle {
        UseCaseHandle::new(self)
    }
}

impl IntoUseCase for UseCaseHandle {
    fn into_use_case(self) -> UseCaseHandle {
        self
    }
}

impl IntoUseCase for &UseCaseHandle {
    fn into_use_case(self) -> UseCaseHandle {
        self.clone()
    }
}

// =============================================================================
// UseCase Context
// =============================================================================

/// Context handed to [`UseCase::execute`].
///
/// Cheap to clone, and `'static`, so asynchronous bodies can move a clone
/// into their future.
#[derive(Clone)]
pub struct UseCaseContext {
    current: UseCaseHandle,
    parent: Option<UseCaseHandle>,
    scope: ExecutionScope,
}

impl UseCaseContext {
    pub(crate) fn new(
        current: UseCaseHandle,
        parent: Option<UseCaseHandle>,
        scope: ExecutionScope,
    ) -> Self {
        Self {
            current,
            parent,
            scope,
        }
    }

    /// The running instance.
    pub fn current(&self) -> &UseCaseHandle {
        &self.current
    }

    /// The instance this one was nested from.
    pub fn parent(&self) -> Option<&UseCaseHandle> {
        self.parent.as_ref()
    }

    /// The transaction this execution belongs to.
    pub fn transaction(&self) -> Option<&TransactionRef> {
        self.scope.transaction.as_ref()
    }

    /// Dispatch an application payload, attributed to this use-case.
    pub fn dispatch(&self, payload: impl Into<Payload>) -> Result<(), FlowlineError> {
        let meta = DispatcherPayloadMeta::from_use_case(
            &self.current,
            self.parent.as_ref(),
            self.scope.transaction.as_ref(),
        );
        self.current
            .dispatcher()
            .dispatch_with_meta(&payload.into(), &meta)
    }

    /// Report an error without failing the execution.
    pub fn throw_error(&self, error: anyhow::Error) {
        let meta = DispatcherPayloadMeta::lifecycle(
            &self.current,
            self.parent.as_ref(),
            self.scope.transaction.as_ref(),
            false,
        );
        self.current.dispatcher().deliver(
            &Payload::Error {
                error: Arc::new(error),
            },
            &meta,
        );
    }

    /// Prepare a nested execution with this use-case as parent.
    pub fn use_case(&self, child: impl IntoUseCase) -> UseCaseExecutor {
        UseCaseExecutor::new(
            child.into_use_case(),
            Some(self.current.clone()),
            self.scope.clone(),
        )
    }
}

impl fmt::Debug for UseCaseContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UseCaseContext")
            .field("use_case", &self.current)
            .field("parent", &self.parent)
            .field("transaction", &self.scope.transaction)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named;

    impl UseCase for Named {
        fn execute(&self, _ctx: &UseCaseContext, _args: Value) -> Execution {
            Execution::done()
        }
    }

    #[test]
    fn test_default_name_is_short_type_name() {
        let handle = UseCaseHandle::new(Named);
        assert_eq!(handle.name(), "Named");
        assert_eq!(short_type_name("a::b::Thing<c::D>"), "Thing");
    }

    #[test]
    fn test_handles_have_distinct_identity() {
        let a = UseCaseHandle::new(Named);
        let b = UseCaseHandle::new(Named);
        assert_ne!(a.id(), b.id());
        assert_ne!(a, b);

        let a2 = a.clone();
        assert_eq!(a, a2);
        assert!(a.dispatcher().same_as(a2.dispatcher()));
        assert_eq!(a.clone().into_use_case().id(), a.id());
    }

    #[test]
    fn test_functional_use_case_name() {
        let handle = use_case_fn("Reset", |_ctx, _args| Execution::done()).into_use_case();
        assert_eq!(handle.name(), "Reset");
    }

    #[test]
    fn test_execution_variants() {
        assert!(!Execution::ok(1).is_pending());
        assert!(Execution::pending(async { Ok(Value::Null) }).is_pending());
        assert!(matches!(
            Execution::fail(anyhow::anyhow!("nope")),
            Execution::Ready(Err(_))
        ));
        let done: Execution = Ok::<(), FlowlineError>(()).into_execution();
        assert!(matches!(done, Execution::Ready(Ok(Value::Null))));
    }
}
