//! # Counter Demo
//!
//! Two stores, a handful of use-cases and one transaction.
//! Run with `RUST_LOG=flowline_core=debug` to watch the bus.

use std::sync::Arc;

use anyhow::Result;
use flowline_core::{
    use_case_fn, Context, DispatcherPayloadMeta, Execution, IntoExecution, Payload, Store,
    StoreCore, StoreGroup, UseCase, UseCaseContext, UserPayload,
};
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;

// ============================================================================
// Stores (Read side)
// ============================================================================

#[derive(Debug, Clone)]
struct Counter {
    count: i64,
}

struct CounterStore {
    core: StoreCore<Counter>,
}

impl Store for CounterStore {
    type State = Counter;

    fn core(&self) -> &StoreCore<Counter> {
        &self.core
    }

    fn receive_payload(&self, payload: &Payload, _meta: &DispatcherPayloadMeta) {
        let Some(user) = payload.as_custom() else {
            return;
        };
        let by = user.get("by").and_then(Value::as_i64).unwrap_or(1);
        match user.kind.as_str() {
            "increment" => self.core.update_state(|s| Counter { count: s.count + by }),
            "decrement" => self.core.update_state(|s| Counter { count: s.count - by }),
            _ => {}
        }
    }
}

/// Keeps every error reported on the bus.
struct ErrorLogStore {
    core: StoreCore<Vec<String>>,
}

impl Store for ErrorLogStore {
    type State = Vec<String>;

    fn core(&self) -> &StoreCore<Vec<String>> {
        &self.core
    }

    fn receive_payload(&self, payload: &Payload, meta: &DispatcherPayloadMeta) {
        let Payload::Error { error } = payload else {
            return;
        };
        let source = meta
            .use_case
            .as_ref()
            .map(|u| u.name().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let entry = format!("{}: {}", source, error);
        self.core.update_state(|log| {
            let mut log = log.clone();
            log.push(entry);
            log
        });
    }
}

// ============================================================================
// Use Cases (Write side)
// ============================================================================

struct Increment;

impl UseCase for Increment {
    fn execute(&self, ctx: &UseCaseContext, args: Value) -> Execution {
        let by = args.as_i64().unwrap_or(1);
        ctx.dispatch(UserPayload::new("increment").with("by", by))
            .into_execution()
    }
}

struct Decrement {
    counter: Arc<CounterStore>,
}

impl UseCase for Decrement {
    /// Never go below zero.
    fn should_execute(&self, _args: &Value) -> bool {
        self.counter.get_state().count > 0
    }

    fn execute(&self, ctx: &UseCaseContext, _args: Value) -> Execution {
        ctx.dispatch(Payload::custom("decrement")).into_execution()
    }
}

/// Increments, waits, then increments again through a nested use-case.
struct DoubleStep;

impl UseCase for DoubleStep {
    fn execute(&self, ctx: &UseCaseContext, _args: Value) -> Execution {
        let ctx = ctx.clone();
        Execution::pending(async move {
            ctx.dispatch(Payload::custom("increment"))?;
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            ctx.use_case(Increment).execute(1).await?;
            Ok(Value::from("double stepped"))
        })
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let counter = Arc::new(CounterStore {
        core: StoreCore::new("Counter", Counter { count: 0 }),
    });
    let errors = Arc::new(ErrorLogStore {
        core: StoreCore::new("ErrorLog", Vec::new()),
    });
    let group = StoreGroup::builder()
        .with_store("counter", counter.clone())
        .with_store("errors", errors)
        .build()?;
    let context = Context::builder(group).strict(true).build();

    context.on_change(|stores| {
        let names: Vec<&str> = stores.iter().map(|s| s.store_name()).collect();
        info!(stores = ?names, "changed");
    });
    context.on_warning(|warning| println!("warning: {}", warning));
    context.on_error_dispatch(|payload, meta| {
        let use_case = meta.use_case.as_ref().map(|u| u.name().to_string());
        println!("error from {:?}: {}", use_case, payload.to_json()["error"]);
    });

    // One emission per execution
    context.use_case(Increment).execute(Value::Null).await?;
    context.use_case(Increment).execute(5).await?;
    let decrement = Decrement {
        counter: counter.clone(),
    };
    context.use_case(decrement).execute(Value::Null).await?;
    println!("count after three use-cases: {}", counter.get_state().count);

    // Nested and asynchronous: still one emission
    let result = context.use_case(DoubleStep).execute(Value::Null).await?;
    println!("{} -> count {}", result, counter.get_state().count);

    // A failing use-case reports through the error hub and the return value
    let failing = use_case_fn("Overflow", |_, _| {
        Execution::fail(anyhow::anyhow!("counter refused to overflow"))
    });
    if let Err(e) = context.use_case(failing).execute(Value::Null).await {
        println!("execution failed: {}", e);
    }

    // A transaction: three use-cases, one emission on commit
    context
        .transaction("bulk", |tx| async move {
            for step in 1..=3 {
                tx.use_case(Increment).execute(step).await?;
            }
            tx.commit()?;
            Ok(())
        })
        .await?;

    let state = context.get_state();
    if let Some(count) = state.get::<Counter>("counter") {
        println!("final count: {}", count.count);
    }
    if let Some(errors) = state.get::<Vec<String>>("errors") {
        println!("errors seen: {}", errors.join("; "));
    }

    context.release();
    Ok(())
}
