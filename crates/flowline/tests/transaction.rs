//! Transactions: deferred emission, commit, exit and misuse.

mod common;

use common::{fixture, names, AddNote, Counter, Increment};
use flowline_core::{use_case_fn, Execution, FlowlineError, UserPayload, Warning};
use flowline_testing::{assert_lifecycle, ChangeRecorder, Gate, LifecycleRecorder, Step, WarningRecorder};
use serde_json::Value;

// =============================================================================
// Commit
// =============================================================================

#[tokio::test]
async fn test_commit_emits_once_with_final_state() {
    let f = fixture();
    let changes = ChangeRecorder::attach(f.context.store_group());

    let observer = changes.clone();
    let context = f.context.clone();
    f.context
        .transaction("five increments", |tx| async move {
            for _ in 0..5 {
                tx.use_case(Increment).execute(Value::Null).await?;
            }
            // Nothing visible until commit.
            assert_eq!(observer.count(), 0);
            assert_eq!(context.get_state().get::<Counter>("counter").unwrap().count, 0);
            tx.commit()?;
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(changes.emissions(), vec![names(&["Counter"])]);
    assert_eq!(f.context.get_state().get::<Counter>("counter").unwrap().count, 5);
}

#[tokio::test]
async fn test_transaction_payloads_carry_the_transaction() {
    let f = fixture();
    let recorder = LifecycleRecorder::attach(f.context.dispatcher());

    f.context
        .transaction("tagged", |tx| async move {
            tx.use_case(Increment).execute(Value::Null).await?;
            tx.commit()?;
            Ok(())
        })
        .await
        .unwrap();

    assert_lifecycle!(
        recorder,
        Step::began("tagged"),
        Step::will("Increment"),
        Step::dispatch("increment"),
        Step::did("Increment"),
        Step::complete("Increment"),
        Step::ended("tagged"),
    );
    assert!(recorder
        .records()
        .iter()
        .all(|r| r.transaction.as_deref() == Some("tagged")));
}

// =============================================================================
// Isolation
// =============================================================================

#[tokio::test]
async fn test_global_use_case_is_not_blocked_by_open_transaction() {
    let f = fixture();
    let changes = ChangeRecorder::attach(f.context.store_group());
    let gate = Gate::new();

    let held = gate.clone();
    let transaction = f.context.transaction("held open", |tx| async move {
        tx.use_case(Increment).execute(Value::Null).await?;
        held.wait().await;
        tx.commit()?;
        Ok(())
    });

    let context = f.context.clone();
    let observer = changes.clone();
    let outside = async move {
        context.use_case(AddNote).execute("outside").await?;
        // Emitted while the transaction is still open.
        let seen = observer.emissions();
        gate.open();
        Ok::<_, FlowlineError>(seen)
    };

    let (tx_result, outside_result) = tokio::join!(transaction, outside);
    tx_result.unwrap();
    let seen_before_commit = outside_result.unwrap();

    assert_eq!(seen_before_commit, vec![names(&["Notes"])]);
    assert_eq!(
        changes.emissions(),
        vec![names(&["Notes"]), names(&["Counter"])]
    );
}

/// A global use-case writes the notes store and stays in flight while a
/// transaction writes the counter. The global emission has to arrive when
/// the global use-case settles, before the transaction closes.
async fn global_settles_inside_transaction(commit: bool) -> (Vec<Vec<String>>, i64) {
    let f = fixture();
    let changes = ChangeRecorder::attach(f.context.store_group());
    let noted = Gate::new();
    let release = Gate::new();
    let finished = Gate::new();

    let (noted_in, release_in) = (noted.clone(), release.clone());
    let slow_note = use_case_fn("SlowNote", move |ctx, _| {
        let ctx = ctx.clone();
        let (noted, release) = (noted_in.clone(), release_in.clone());
        Execution::pending(async move {
            ctx.dispatch(UserPayload::new("note").with("text", "global"))?;
            noted.open();
            release.wait().await;
            Ok(Value::Null)
        })
    });

    let context = f.context.clone();
    let settled = finished.clone();
    let global = async move {
        let result = context.use_case(slow_note).execute(Value::Null).await;
        settled.open();
        result
    };

    let observer = changes.clone();
    let transaction = f.context.transaction("around global", |tx| async move {
        noted.wait().await;
        tx.use_case(Increment).execute(Value::Null).await?;
        release.open();
        finished.wait().await;
        assert_eq!(observer.emissions(), vec![names(&["Notes"])]);
        if commit {
            tx.commit()?;
        } else {
            tx.exit()?;
        }
        Ok(())
    });

    let (global_result, tx_result) = tokio::join!(global, transaction);
    global_result.unwrap();
    tx_result.unwrap();

    let count = f.context.get_state().get::<Counter>("counter").unwrap().count;
    (changes.emissions(), count)
}

#[tokio::test]
async fn test_global_change_emitted_before_commit_of_disjoint_transaction() {
    let (emissions, count) = global_settles_inside_transaction(true).await;
    assert_eq!(emissions, vec![names(&["Notes"]), names(&["Counter"])]);
    assert_eq!(count, 1);
}

#[tokio::test]
async fn test_global_change_survives_exit_of_disjoint_transaction() {
    let (emissions, count) = global_settles_inside_transaction(false).await;
    assert_eq!(emissions, vec![names(&["Notes"])]);
    assert_eq!(count, 1);
}

// =============================================================================
// Exit and misuse
// =============================================================================

#[tokio::test]
async fn test_exit_discards_emission() {
    let f = fixture();
    let changes = ChangeRecorder::attach(f.context.store_group());
    let recorder = LifecycleRecorder::attach(f.context.dispatcher());

    f.context
        .transaction("abandoned", |tx| async move {
            tx.use_case(Increment).execute(Value::Null).await?;
            tx.exit()?;
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(changes.count(), 0);
    assert_eq!(recorder.steps().last(), Some(&Step::ended("abandoned")));

    // Later global changes are reported on their own.
    f.context.use_case(AddNote).execute("after").await.unwrap();
    assert_eq!(changes.emissions(), vec![names(&["Notes"])]);
}

#[tokio::test]
async fn test_double_commit_is_rejected() {
    let f = fixture();
    let changes = ChangeRecorder::attach(f.context.store_group());

    f.context
        .transaction("twice", |tx| async move {
            tx.use_case(Increment).execute(Value::Null).await?;
            tx.commit()?;
            let second = tx.commit();
            assert!(matches!(second, Err(FlowlineError::TransactionClosed { .. })));
            assert!(matches!(tx.exit(), Err(FlowlineError::TransactionClosed { .. })));
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(changes.count(), 1);
}

#[tokio::test]
async fn test_unclosed_transaction_warns_and_exits() {
    let f = fixture();
    let changes = ChangeRecorder::attach(f.context.store_group());
    let warnings = WarningRecorder::attach(f.context.store_group());
    let recorder = LifecycleRecorder::attach(f.context.dispatcher());

    f.context
        .transaction("forgotten", |tx| async move {
            tx.use_case(Increment).execute(Value::Null).await?;
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(changes.count(), 0);
    assert_eq!(recorder.steps().last(), Some(&Step::ended("forgotten")));
    let warnings = warnings.warnings();
    assert_eq!(warnings.len(), 1);
    assert!(matches!(
        &warnings[0],
        Warning::TransactionNotClosed { name, .. } if name == "forgotten"
    ));
}

#[tokio::test]
async fn test_failing_handler_reports_transaction_failed() {
    let f = fixture();
    let warnings = WarningRecorder::attach(f.context.store_group());

    let err = f
        .context
        .transaction("broken", |tx| async move {
            tx.use_case(Increment).execute(Value::Null).await?;
            tx.exit()?;
            anyhow::bail!("handler gave up");
        })
        .await
        .unwrap_err();

    match err {
        FlowlineError::TransactionFailed { name, source } => {
            assert_eq!(name, "broken");
            assert_eq!(source.to_string(), "handler gave up");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(warnings.is_empty());
}
