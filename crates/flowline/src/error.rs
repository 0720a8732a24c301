//! Structured errors and non-fatal warnings.
//!
//! `FlowlineError` provides pattern-matchable errors for contract violations
//! and for use-case failures propagated back to the caller.
//! `Warning` is the side channel for invariant drift that must be visible
//! during development but must not alter control flow.
//!
//! # The Error Boundary Rule
//!
//! > **Contract violations fail at the call site. Execution failures travel
//! > twice: as an `Error` payload on the bus and as `Err` to the caller.**
//!
//! - `anyhow` is the error type of use-case bodies and transaction handlers
//! - `FlowlineError` is what the coordination core returns
//!
//! # Error Example
//!
//! ```ignore
//! use flowline_core::FlowlineError;
//!
//! match context.use_case(SaveDraft).execute(args).await {
//!     Ok(value) => println!("saved: {value}"),
//!     Err(FlowlineError::UseCaseFailed { use_case, error }) => {
//!         eprintln!("{use_case} failed: {error}");
//!     }
//!     Err(other) => eprintln!("contract violation: {other}"),
//! }
//! ```
//!
//! # Warning Example
//!
//! ```ignore
//! context.on_warning(|warning| {
//!     if let Warning::UnchangedEmit { store } = warning {
//!         eprintln!("{store} emitted a change without replacing its state");
//!     }
//! });
//! ```

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::warn;

use crate::core::TransactionId;
use crate::dispatch::{HandlerList, Subscription};

// =============================================================================
// Flowline Error
// =============================================================================

/// Errors returned by the coordination core.
#[derive(Debug, Error)]
pub enum FlowlineError {
    /// A payload without a `type` was dispatched.
    #[error("payload has no type")]
    MissingPayloadType,

    /// A store binding used an empty state name or store name.
    #[error("store binding is invalid: {reason}")]
    InvalidStoreBinding { reason: String },

    /// Two bindings used the same state name.
    #[error("state name `{state_name}` is bound more than once")]
    DuplicateStateName { state_name: String },

    /// The same store instance was bound under two state names.
    #[error("store `{store}` is bound under both `{first}` and `{second}`")]
    StoreBoundTwice {
        store: String,
        first: String,
        second: String,
    },

    /// A use-case tried to execute itself from inside its own execution.
    #[error("use case `{use_case}` cannot be nested inside itself")]
    NestedSelfExecution { use_case: String },

    /// The same use-case instance was executed while already running.
    #[error("use case `{use_case}` is already executing")]
    AlreadyExecuting { use_case: String },

    /// `commit()` or `exit()` was called on a closed transaction.
    #[error("transaction `{name}` ({id}) is already closed")]
    TransactionClosed { name: String, id: TransactionId },

    /// A use-case body returned an error. The same error was dispatched as
    /// an `Error` payload before this was returned.
    #[error("use case `{use_case}` failed: {error}")]
    UseCaseFailed {
        use_case: String,
        error: Arc<anyhow::Error>,
    },

    /// A transaction handler returned an error.
    #[error("transaction `{name}` failed: {source}")]
    TransactionFailed {
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

impl FlowlineError {
    /// The error raised by the use-case body, if this is a use-case failure.
    pub fn use_case_error(&self) -> Option<&anyhow::Error> {
        match self {
            FlowlineError::UseCaseFailed { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Returns true for errors that indicate programmer error rather than
    /// a failed execution.
    pub fn is_contract_violation(&self) -> bool {
        !matches!(
            self,
            FlowlineError::UseCaseFailed { .. } | FlowlineError::TransactionFailed { .. }
        )
    }
}

// =============================================================================
// Warnings
// =============================================================================

/// Non-fatal diagnostics reported on the side channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Warning {
    /// A store emitted a change but its state compared as unchanged.
    UnchangedEmit { store: String },
    /// In strict mode, a store replaced its state outside of
    /// `receive_payload`.
    StateMutatedOutsideWrite { store: String },
    /// A nested use-case outlived the parent it was executed from.
    ParentReleased { use_case: String, parent: String },
    /// A transaction handler returned without `commit()` or `exit()`.
    TransactionNotClosed { name: String, id: TransactionId },
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Warning::UnchangedEmit { store } => write!(
                f,
                "store `{store}` emitted a change but its state did not change; \
                 replace the state instead of mutating it"
            ),
            Warning::StateMutatedOutsideWrite { store } => write!(
                f,
                "store `{store}` updated its state outside of receive_payload"
            ),
            Warning::ParentReleased { use_case, parent } => write!(
                f,
                "use case `{use_case}` completed after its parent `{parent}` was released"
            ),
            Warning::TransactionNotClosed { name, id } => write!(
                f,
                "transaction `{name}` ({id}) finished without commit() or exit()"
            ),
        }
    }
}

pub type WarningHandler = dyn Fn(&Warning) + Send + Sync;

/// Fan-out point for [`Warning`]s.
///
/// Every warning is logged through `tracing` and then handed to each
/// subscriber. Cheap to clone; clones share subscribers.
#[derive(Clone, Default)]
pub struct Diagnostics {
    handlers: Arc<HandlerList<WarningHandler>>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report a warning.
    pub fn warn(&self, warning: Warning) {
        warn!(warning = ?warning, "{}", warning);
        for handler in self.handlers.snapshot() {
            handler(&warning);
        }
    }

    /// Subscribe to warnings.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Warning) + Send + Sync + 'static,
    {
        self.handlers.subscribe(Arc::new(handler))
    }
}

impl fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Diagnostics")
            .field("subscribers", &self.handlers.len())
            .finish()
    }
}
