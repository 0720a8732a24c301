//! Stores and use-cases shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use flowline_core::{
    Context, DispatcherPayloadMeta, Execution, IntoExecution, Payload, Store, StoreCore,
    StoreGroup, UseCase, UseCaseContext, UserPayload,
};
use serde_json::Value;

// =============================================================================
// Stores
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Counter {
    pub count: i64,
}

pub struct CounterStore {
    pub core: StoreCore<Counter>,
}

impl CounterStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            core: StoreCore::new("Counter", Counter { count: 0 }),
        })
    }
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

pub struct NoteStore {
    pub core: StoreCore<Vec<String>>,
}

impl NoteStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            core: StoreCore::new("Notes", Vec::new()),
        })
    }
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

/// Announces a change on `poke` without replacing its state.
pub struct NoisyStore {
    pub core: StoreCore<u32>,
}

impl NoisyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            core: StoreCore::new("Noisy", 0),
        })
    }
}

impl Store for NoisyStore {
    type State = u32;

    fn core(&self) -> &StoreCore<u32> {
        &self.core
    }

    fn receive_payload(&self, payload: &Payload, _meta: &DispatcherPayloadMeta) {
        if payload.kind() == "poke" {
            self.core.emit_change();
        }
    }
}

// =============================================================================
// Use Cases
// =============================================================================

pub struct Increment;

impl UseCase for Increment {
    fn execute(&self, ctx: &UseCaseContext, _args: Value) -> Execution {
        ctx.dispatch(Payload::custom("increment")).into_execution()
    }
}

pub struct Decrement;

impl UseCase for Decrement {
    fn execute(&self, ctx: &UseCaseContext, _args: Value) -> Execution {
        ctx.dispatch(Payload::custom("decrement")).into_execution()
    }
}

/// Appends its string argument to the notes.
pub struct AddNote;

impl UseCase for AddNote {
    fn execute(&self, ctx: &UseCaseContext, args: Value) -> Execution {
        let text = args.as_str().unwrap_or_default().to_string();
        ctx.dispatch(UserPayload::new("note").with("text", text))
            .into_execution()
    }
}

// =============================================================================
// Fixture
// =============================================================================

pub struct Fixture {
    pub context: Context,
    pub counter: Arc<CounterStore>,
    pub notes: Arc<NoteStore>,
    pub noisy: Arc<NoisyStore>,
}

pub fn fixture() -> Fixture {
    fixture_with(false)
}

pub fn fixture_with(strict: bool) -> Fixture {
    let counter = CounterStore::new();
    let notes = NoteStore::new();
    let noisy = NoisyStore::new();
    let group = StoreGroup::builder()
        .with_store("counter", counter.clone())
        .with_store("notes", notes.clone())
        .with_store("noisy", noisy.clone())
        .build()
        .unwrap();
    let context = Context::builder(group).strict(strict).build();
    Fixture {
        context,
        counter,
        notes,
        noisy,
    }
}

pub fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}
