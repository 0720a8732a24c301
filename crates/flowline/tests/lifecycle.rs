//! Lifecycle ordering and parent attribution across nested executions.

mod common;

use std::sync::{Arc, Mutex};

use common::{fixture, AddNote, Increment};
use flowline_core::{
    use_case_fn, Execution, FlowlineError, IntoExecution, Payload, Store, UseCase,
    UseCaseContext, Warning,
};
use flowline_testing::{assert_lifecycle, LifecycleRecorder, Step, WarningRecorder};
use serde_json::Value;

// =============================================================================
// Ordering
// =============================================================================

#[tokio::test]
async fn test_sync_use_case_lifecycle_order() {
    let f = fixture();
    let recorder = LifecycleRecorder::attach(f.context.dispatcher());

    let value = f.context.use_case(Increment).execute(Value::Null).await.unwrap();

    assert_eq!(value, Value::Null);
    assert_lifecycle!(
        recorder,
        Step::will("Increment"),
        Step::dispatch("increment"),
        Step::did("Increment"),
        Step::complete("Increment"),
    );
}

#[tokio::test]
async fn test_async_parent_with_nested_child() {
    let f = fixture();
    let recorder = LifecycleRecorder::attach(f.context.dispatcher());

    let parent = use_case_fn("Parent", |ctx, _| {
        let ctx = ctx.clone();
        Execution::pending(async move {
            ctx.dispatch(Payload::custom("increment"))?;
            ctx.use_case(AddNote).execute("nested").await?;
            Ok(Value::from(1))
        })
    });
    let value = f.context.use_case(parent).execute(Value::Null).await.unwrap();

    assert_eq!(value, Value::from(1));
    assert_lifecycle!(
        recorder,
        Step::will("Parent"),
        Step::did("Parent"),
        Step::dispatch("increment"),
        Step::will("AddNote"),
        Step::dispatch("note"),
        Step::did("AddNote"),
        Step::complete("AddNote"),
        Step::complete("Parent"),
    );

    let completed = recorder.records().last().cloned().unwrap();
    assert!(completed.is_use_case_finished);
    assert!(completed.is_trusted);
    assert_eq!(completed.payload["value"], 1);
}

#[tokio::test]
async fn test_sync_failure_dispatches_error_before_did() {
    let f = fixture();
    let recorder = LifecycleRecorder::attach(f.context.dispatcher());

    let failing = use_case_fn("Failing", |_, _| Execution::fail(anyhow::anyhow!("boom")));
    let err = f
        .context
        .use_case(failing)
        .execute(Value::Null)
        .await
        .unwrap_err();

    assert!(matches!(err, FlowlineError::UseCaseFailed { .. }));
    assert_eq!(err.use_case_error().unwrap().to_string(), "boom");
    assert!(!err.is_contract_violation());
    assert_lifecycle!(
        recorder,
        Step::will("Failing"),
        Step::error("Failing"),
        Step::did("Failing"),
        Step::complete("Failing"),
    );
}

#[tokio::test]
async fn test_async_failure_dispatches_error_before_complete() {
    let f = fixture();
    let recorder = LifecycleRecorder::attach(f.context.dispatcher());

    let failing = use_case_fn("LateFailure", |_, _| {
        Execution::pending(async { Err(anyhow::anyhow!("late")) })
    });
    let err = f
        .context
        .use_case(failing)
        .execute(Value::Null)
        .await
        .unwrap_err();

    assert_eq!(err.use_case_error().unwrap().to_string(), "late");
    assert_lifecycle!(
        recorder,
        Step::will("LateFailure"),
        Step::did("LateFailure"),
        Step::error("LateFailure"),
        Step::complete("LateFailure"),
    );
    assert_eq!(f.context.executing_count(), 0);
}

struct Guarded;

impl UseCase for Guarded {
    fn should_execute(&self, args: &Value) -> bool {
        args.as_bool().unwrap_or(false)
    }

    fn execute(&self, ctx: &UseCaseContext, _args: Value) -> Execution {
        ctx.dispatch(Payload::custom("increment")).into_execution()
    }
}

#[tokio::test]
async fn test_should_execute_false_dispatches_only_will_not() {
    let f = fixture();
    let recorder = LifecycleRecorder::attach(f.context.dispatcher());

    let value = f.context.use_case(Guarded).execute(false).await.unwrap();

    assert_eq!(value, Value::Null);
    assert_lifecycle!(recorder, Step::will_not("Guarded"));
    assert!(recorder.records()[0].is_use_case_finished);
    assert_eq!(f.counter.get_state().count, 0);

    recorder.clear();
    f.context.use_case(Guarded).execute(true).await.unwrap();
    assert_eq!(recorder.steps()[0], Step::will("Guarded"));
    assert_eq!(f.counter.get_state().count, 1);
}

#[tokio::test]
async fn test_throw_error_keeps_use_case_running() {
    let f = fixture();
    let recorder = LifecycleRecorder::attach(f.context.dispatcher());

    let recovering = use_case_fn("Recovering", |ctx, _| {
        ctx.throw_error(anyhow::anyhow!("soft failure"));
        ctx.dispatch(Payload::custom("increment")).into_execution()
    });
    f.context
        .use_case(recovering)
        .execute(Value::Null)
        .await
        .unwrap();

    assert_lifecycle!(
        recorder,
        Step::will("Recovering"),
        Step::error("Recovering"),
        Step::dispatch("increment"),
        Step::did("Recovering"),
        Step::complete("Recovering"),
    );
    let error = &recorder.records()[1];
    assert!(error.is_trusted);
    assert!(!error.is_use_case_finished);
}

// =============================================================================
// Parent attribution
// =============================================================================

#[tokio::test]
async fn test_nested_payloads_name_their_parent() {
    let f = fixture();
    let recorder = LifecycleRecorder::attach(f.context.dispatcher());

    let parent = use_case_fn("Parent", |ctx, _| {
        let ctx = ctx.clone();
        Execution::pending(async move {
            ctx.use_case(Increment).execute(Value::Null).await?;
            Ok(Value::Null)
        })
    });
    f.context.use_case(parent).execute(Value::Null).await.unwrap();

    for record in recorder.records_for("Increment") {
        assert_eq!(record.parent_use_case.as_deref(), Some("Parent"), "{:?}", record);
    }
    for record in recorder.records_for("Parent") {
        assert_eq!(record.parent_use_case, None, "{:?}", record);
    }
    assert_eq!(recorder.records_for("Increment").len(), 4);
}

#[tokio::test]
async fn test_hub_sees_nested_lifecycles() {
    let f = fixture();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    f.context.on_will_execute_each_use_case(move |_, meta| {
        let use_case = meta.use_case.as_ref().map(|u| u.name().to_string());
        let parent = meta.parent_use_case.as_ref().map(|u| u.name().to_string());
        sink.lock().unwrap().push((use_case, parent));
    });

    let parent = use_case_fn("Outer", |ctx, _| {
        let ctx = ctx.clone();
        Execution::pending(async move {
            ctx.use_case(AddNote).execute("inner").await?;
            Ok(Value::Null)
        })
    });
    f.context.use_case(parent).execute(Value::Null).await.unwrap();

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            (Some("Outer".to_string()), None),
            (Some("AddNote".to_string()), Some("Outer".to_string())),
        ]
    );
}

// =============================================================================
// Contract violations
// =============================================================================

#[tokio::test]
async fn test_self_nesting_is_rejected() {
    let f = fixture();
    let outcome = Arc::new(Mutex::new(None));
    let sink = outcome.clone();

    let recursive = use_case_fn("Recursive", move |ctx, _| {
        let nested = ctx.use_case(ctx.current()).try_execute(Value::Null);
        *sink.lock().unwrap() = Some(nested.map(|_| ()));
        Execution::done()
    });
    f.context
        .use_case(recursive)
        .execute(Value::Null)
        .await
        .unwrap();

    let nested = outcome.lock().unwrap().take().unwrap();
    let err = nested.unwrap_err();
    assert!(matches!(err, FlowlineError::NestedSelfExecution { .. }));
    assert!(err.is_contract_violation());
    assert_eq!(f.context.executing_count(), 0);
}

#[tokio::test]
async fn test_empty_payload_type_is_rejected() {
    let f = fixture();
    let recorder = LifecycleRecorder::attach(f.context.dispatcher());

    let untyped = use_case_fn("Untyped", |ctx, _| {
        ctx.dispatch(Payload::custom("")).into_execution()
    });
    let err = f
        .context
        .use_case(untyped)
        .execute(Value::Null)
        .await
        .unwrap_err();

    let cause = err.use_case_error().unwrap();
    assert!(matches!(
        cause.downcast_ref::<FlowlineError>(),
        Some(FlowlineError::MissingPayloadType)
    ));
    assert!(!recorder
        .steps()
        .iter()
        .any(|s| matches!(s, Step::Dispatch(_))));
}

// =============================================================================
// Orphaned children
// =============================================================================

#[tokio::test]
async fn test_child_of_released_parent_routes_to_root() {
    let f = fixture();
    let recorder = LifecycleRecorder::attach(f.context.dispatcher());
    let warnings = WarningRecorder::attach(f.context.store_group());

    let kept: Arc<Mutex<Option<UseCaseContext>>> = Arc::new(Mutex::new(None));
    let sink = kept.clone();
    let parent = use_case_fn("ShortLived", move |ctx, _| {
        *sink.lock().unwrap() = Some(ctx.clone());
        Execution::done()
    });
    f.context.use_case(parent).execute(Value::Null).await.unwrap();
    recorder.clear();

    let ctx = kept.lock().unwrap().take().unwrap();
    ctx.use_case(Increment).execute(Value::Null).await.unwrap();

    assert_lifecycle!(
        recorder,
        Step::will("Increment"),
        Step::dispatch("increment"),
        Step::did("Increment"),
        Step::complete("Increment"),
    );
    assert_eq!(f.counter.get_state().count, 1);
    assert_eq!(
        warnings.warnings(),
        vec![Warning::ParentReleased {
            use_case: "Increment".to_string(),
            parent: "ShortLived".to_string(),
        }]
    );
}
