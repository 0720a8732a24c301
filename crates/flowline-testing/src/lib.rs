//! Testing utilities for the flowline coordination core.
//!
//! # Quick Start
//!
//! ## Recording a lifecycle
//!
//! ```ignore
//! use flowline_testing::{assert_lifecycle, LifecycleRecorder, Step};
//!
//! let recorder = LifecycleRecorder::attach(context.dispatcher());
//! context.use_case(Increment).execute(Value::Null).await?;
//!
//! assert_lifecycle!(
//!     recorder,
//!     Step::will("Increment"),
//!     Step::dispatch("increment"),
//!     Step::did("Increment"),
//!     Step::complete("Increment"),
//! );
//! ```
//!
//! ## Counting emissions
//!
//! ```ignore
//! let changes = ChangeRecorder::attach(context.store_group());
//! context.use_case(Increment).execute(Value::Null).await?;
//! assert_eq!(changes.emissions(), vec![vec!["Counter".to_string()]]);
//! ```
//!
//! ## Holding an async use-case open
//!
//! ```ignore
//! let gate = Gate::new();
//! let held = gate.clone();
//! let slow = use_case_fn("Slow", move |_, _| {
//!     let held = held.clone();
//!     Execution::pending(async move {
//!         held.wait().await;
//!         Ok(Value::Null)
//!     })
//! });
//!
//! let execution = context.use_case(slow).execute(Value::Null);
//! // ... assert on the in-flight state ...
//! gate.open();
//! execution.await?;
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use flowline_core::{
    Dispatcher, DispatcherPayloadMeta, Payload, StoreGroup, Subscription, Warning,
};
use serde_json::Value;
use tokio::sync::Notify;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Asserts the exact sequence of steps a [`LifecycleRecorder`] saw.
///
/// # Syntax
///
/// ```ignore
/// assert_lifecycle!(
///     recorder,
///     Step::will("Parent"),
///     Step::did("Parent"),
///     Step::complete("Parent"),
/// );
/// ```
///
/// # Panics
///
/// Panics if the recorded steps differ from the expected ones.
#[macro_export]
macro_rules! assert_lifecycle {
    ($recorder:expr, $($step:expr),+ $(,)?) => {{
        let actual = $recorder.steps();
        let expected: Vec<$crate::Step> = vec![$($step),+];
        assert_eq!(
            actual, expected,
            "Unexpected lifecycle\n  expected: {:?}\n  actual: {:?}",
            expected, actual
        );
    }};
}

// =============================================================================
// Lifecycle Recorder
// =============================================================================

/// One observed payload, reduced to what tests assert on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    WillExecute(String),
    DidExecute(String),
    Complete(String),
    Error(String),
    WillNotExecute(String),
    TransactionBegan(String),
    TransactionEnded(String),
    /// An application payload, by type.
    Dispatch(String),
}

impl Step {
    pub fn will(use_case: &str) -> Self {
        Step::WillExecute(use_case.to_string())
    }

    pub fn did(use_case: &str) -> Self {
        Step::DidExecute(use_case.to_string())
    }

    pub fn complete(use_case: &str) -> Self {
        Step::Complete(use_case.to_string())
    }

    pub fn error(use_case: &str) -> Self {
        Step::Error(use_case.to_string())
    }

    pub fn will_not(use_case: &str) -> Self {
        Step::WillNotExecute(use_case.to_string())
    }

    pub fn began(transaction: &str) -> Self {
        Step::TransactionBegan(transaction.to_string())
    }

    pub fn ended(transaction: &str) -> Self {
        Step::TransactionEnded(transaction.to_string())
    }

    pub fn dispatch(kind: &str) -> Self {
        Step::Dispatch(kind.to_string())
    }

    fn from_dispatch(payload: &Payload, meta: &DispatcherPayloadMeta) -> Self {
        let owner = meta
            .use_case
            .as_ref()
            .map(|u| u.name().to_string())
            .unwrap_or_default();
        match payload {
            Payload::WillExecuted { .. } => Step::WillExecute(owner),
            Payload::DidExecuted { .. } => Step::DidExecute(owner),
            Payload::Completed { .. } => Step::Complete(owner),
            Payload::Error { .. } => Step::Error(owner),
            Payload::WillNotExecuted { .. } => Step::WillNotExecute(owner),
            Payload::TransactionBegan { name, .. } => Step::TransactionBegan(name.clone()),
            Payload::TransactionEnded { name, .. } => Step::TransactionEnded(name.clone()),
            Payload::Custom(user) => Step::Dispatch(user.kind.clone()),
        }
    }
}

/// A payload as recorded, with its meta flattened.
#[derive(Debug, Clone)]
pub struct RecordedPayload {
    pub step: Step,
    pub payload: Value,
    pub use_case: Option<String>,
    pub parent_use_case: Option<String>,
    pub transaction: Option<String>,
    pub is_trusted: bool,
    pub is_use_case_finished: bool,
}

/// Records every payload dispatched on a dispatcher.
#[derive(Clone)]
pub struct LifecycleRecorder {
    records: Arc<Mutex<Vec<RecordedPayload>>>,
    subscription: Subscription,
}

impl LifecycleRecorder {
    pub fn attach(dispatcher: &Dispatcher) -> Self {
        let records = Arc::new(Mutex::new(Vec::new()));
        let sink = records.clone();
        let subscription = dispatcher.on_dispatch(move |payload, meta| {
            lock(&sink).push(RecordedPayload {
                step: Step::from_dispatch(payload, meta),
                payload: payload.to_json(),
                use_case: meta.use_case.as_ref().map(|u| u.name().to_string()),
                parent_use_case: meta.parent_use_case.as_ref().map(|u| u.name().to_string()),
                transaction: meta.transaction.as_ref().map(|t| t.name.clone()),
                is_trusted: meta.is_trusted,
                is_use_case_finished: meta.is_use_case_finished,
            });
        });
        Self {
            records,
            subscription,
        }
    }

    pub fn records(&self) -> Vec<RecordedPayload> {
        lock(&self.records).clone()
    }

    pub fn steps(&self) -> Vec<Step> {
        lock(&self.records).iter().map(|r| r.step.clone()).collect()
    }

    /// Records owned by one use-case, by name.
    pub fn records_for(&self, use_case: &str) -> Vec<RecordedPayload> {
        lock(&self.records)
            .iter()
            .filter(|r| r.use_case.as_deref() == Some(use_case))
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        lock(&self.records).clear();
    }

    /// Stop recording. Already recorded payloads are kept.
    pub fn detach(&self) {
        self.subscription.unsubscribe();
    }
}

// =============================================================================
// Change Recorder
// =============================================================================

/// Records every emission of a store group as a list of store names.
#[derive(Clone)]
pub struct ChangeRecorder {
    emissions: Arc<Mutex<Vec<Vec<String>>>>,
    subscription: Subscription,
}

impl ChangeRecorder {
    pub fn attach(group: &StoreGroup) -> Self {
        let emissions = Arc::new(Mutex::new(Vec::new()));
        let sink = emissions.clone();
        let subscription = group.on_change(move |stores| {
            lock(&sink).push(stores.iter().map(|s| s.store_name().to_string()).collect());
        });
        Self {
            emissions,
            subscription,
        }
    }

    pub fn emissions(&self) -> Vec<Vec<String>> {
        lock(&self.emissions).clone()
    }

    pub fn count(&self) -> usize {
        lock(&self.emissions).len()
    }

    pub fn last(&self) -> Option<Vec<String>> {
        lock(&self.emissions).last().cloned()
    }

    pub fn clear(&self) {
        lock(&self.emissions).clear();
    }

    pub fn detach(&self) {
        self.subscription.unsubscribe();
    }
}

// =============================================================================
// Warning Recorder
// =============================================================================

/// Records every warning raised through a store group (and so through the
/// context that owns it).
#[derive(Clone)]
pub struct WarningRecorder {
    warnings: Arc<Mutex<Vec<Warning>>>,
}

impl WarningRecorder {
    pub fn attach(group: &StoreGroup) -> Self {
        let warnings = Arc::new(Mutex::new(Vec::new()));
        let sink = warnings.clone();
        group.on_warning(move |warning| lock(&sink).push(warning.clone()));
        Self { warnings }
    }

    pub fn warnings(&self) -> Vec<Warning> {
        lock(&self.warnings).clone()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.warnings).is_empty()
    }

    pub fn count(&self) -> usize {
        lock(&self.warnings).len()
    }
}

// =============================================================================
// Gate
// =============================================================================

/// A one-shot gate for holding asynchronous use-cases open.
///
/// Tests should wait for meaning, not time: instead of sleeping until an
/// async body has probably reached a point, park it on a gate and open the
/// gate when the test is ready.
///
/// Clones share the same gate.
#[derive(Debug, Clone, Default)]
pub struct Gate {
    inner: Arc<GateInner>,
}

#[derive(Debug, Default)]
struct GateInner {
    open: AtomicBool,
    notify: Notify,
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Release every current and future waiter.
    pub fn open(&self) {
        self.inner.open.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    /// Wait until the gate is opened. Returns immediately if it already is.
    pub async fn wait(&self) {
        loop {
            // Register for notification BEFORE checking the flag
            let notified = self.inner.notify.notified();
            if self.is_open() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowline_core::{
        use_case_fn, Context, Execution, IntoExecution, Store, StoreCore, UserPayload,
    };
    use std::time::Duration;

    struct NoteStore {
        core: StoreCore<Vec<String>>,
    }

    impl Store for NoteStore {
        type State = Vec<String>;

        fn core(&self) -> &StoreCore<Vec<String>> {
            &self.core
        }

        fn receive_payload(&self, payload: &Payload, _meta: &DispatcherPayloadMeta) {
            if let Some(text) = payload
                .as_custom()
                .filter(|p| p.kind == "note")
                .and_then(|p| p.get("text"))
                .and_then(Value::as_str)
            {
                self.core.update_state(|notes| {
                    let mut notes = notes.clone();
                    notes.push(text.to_string());
                    notes
                });
            }
        }
    }

    fn context() -> Context {
        let group = StoreGroup::builder()
            .with_store(
                "notes",
                Arc::new(NoteStore {
                    core: StoreCore::new("Notes", Vec::new()),
                }),
            )
            .build()
            .unwrap();
        Context::new(group)
    }

    #[tokio::test]
    async fn test_recorders_capture_execution() {
        let context = context();
        let recorder = LifecycleRecorder::attach(context.dispatcher());
        let changes = ChangeRecorder::attach(context.store_group());
        let warnings = WarningRecorder::attach(context.store_group());

        let note = use_case_fn("Note", |ctx, _| {
            ctx.dispatch(UserPayload::new("note").with("text", "hello"))
                .into_execution()
        });
        context.use_case(note).execute(Value::Null).await.unwrap();

        assert_lifecycle!(
            recorder,
            Step::will("Note"),
            Step::dispatch("note"),
            Step::did("Note"),
            Step::complete("Note"),
        );
        assert_eq!(changes.emissions(), vec![vec!["Notes".to_string()]]);
        assert!(warnings.is_empty());

        let records = recorder.records_for("Note");
        assert_eq!(records.len(), 4);
        assert!(!records[1].is_trusted);
        assert_eq!(records[1].payload["text"], "hello");
        assert!(records[3].is_use_case_finished);

        recorder.detach();
        changes.detach();
        context
            .dispatcher()
            .dispatch(&UserPayload::new("note").with("text", "late").into())
            .unwrap();
        assert_eq!(recorder.steps().len(), 4);
        assert_eq!(changes.count(), 1);
    }

    #[tokio::test]
    async fn test_gate_releases_waiters() {
        let gate = Gate::new();
        let waiter = gate.clone();
        let handle = tokio::spawn(async move {
            waiter.wait().await;
            "released"
        });

        tokio::task::yield_now().await;
        assert!(!gate.is_open());
        gate.open();

        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("gate timed out")
            .unwrap();
        assert_eq!(result, "released");

        // Already open: returns immediately.
        gate.wait().await;
    }

    #[tokio::test]
    async fn test_gate_holds_pending_use_case() {
        let context = context();
        let gate = Gate::new();
        let held = gate.clone();
        let slow = use_case_fn("Slow", move |_, _| {
            let held = held.clone();
            Execution::pending(async move {
                held.wait().await;
                Ok(Value::from("opened"))
            })
        });

        let execution = context.use_case(slow).execute(Value::Null);
        assert_eq!(context.executing_count(), 1);
        gate.open();
        assert_eq!(execution.await.unwrap(), Value::from("opened"));
        assert_eq!(context.executing_count(), 0);
    }
}
