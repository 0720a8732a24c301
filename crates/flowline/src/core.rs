//! Core message types for the flowline coordination layer.
//!
//! # Overview
//!
//! Everything that travels through a [`Dispatcher`](crate::Dispatcher) is a
//! [`Payload`] accompanied by a [`DispatcherPayloadMeta`]:
//! - [`Payload`] = what happened (a lifecycle step or an application message)
//! - [`DispatcherPayloadMeta`] = who produced it, under which use-case and
//!   transaction, and whether the system generated it
//!
//! Payloads are immutable once dispatched. Meta lives for exactly one
//! dispatch call and is handed to every subscriber by reference.
//!
//! # Identity
//!
//! - [`UseCaseId`] is a process-unique, monotonically increasing number
//!   assigned when a use-case instance is wrapped into a handle.
//! - [`TransactionId`] is a random UUID generated per transaction.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::error::FlowlineError;
use crate::use_case::UseCaseHandle;

static NEXT_USE_CASE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a use-case instance.
///
/// Identity is by instance, not by value: two handles wrapping equal
/// use-case values still carry different ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UseCaseId(u64);

impl UseCaseId {
    /// Allocate the next id from the process-wide counter.
    pub(crate) fn next() -> Self {
        Self(NEXT_USE_CASE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw counter value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for UseCaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "use-case#{}", self.0)
    }
}

/// Identity of a transaction (unit of work).
///
/// # Example
///
/// ```ignore
/// let id = TransactionId::new();
/// assert_ne!(id, TransactionId::new());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(Uuid);

impl TransactionId {
    /// Create a new random transaction ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get a reference to the inner UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for TransactionId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name and identity of a transaction, carried in meta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRef {
    pub id: TransactionId,
    pub name: String,
}

impl TransactionRef {
    /// Create a reference for a fresh transaction.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: TransactionId::new(),
            name: name.into(),
        }
    }
}

// =============================================================================
// User Payload
// =============================================================================

/// An application-defined payload: a `type` tag plus arbitrary fields.
///
/// Serializes flat, the way it is usually written by hand:
///
/// ```ignore
/// let payload = UserPayload::new("increment").with("by", 2);
/// assert_eq!(payload.to_json(), json!({ "type": "increment", "by": 2 }));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPayload {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl UserPayload {
    /// Create a payload with the given type and no fields.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            body: Map::new(),
        }
    }

    /// Add a field.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.body.insert(key.into(), value.into());
        self
    }

    /// Read a field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }

    /// Render as a flat JSON object.
    pub fn to_json(&self) -> Value {
        let mut object = self.body.clone();
        object.insert("type".to_string(), Value::String(self.kind.clone()));
        Value::Object(object)
    }
}

// =============================================================================
// Payload
// =============================================================================

/// A tagged message dispatched on the bus.
///
/// The lifecycle variants are produced by the executor and by transactions;
/// [`Payload::Custom`] carries application messages. Every payload has a
/// non-empty type (see [`Payload::kind`]); dispatching one without fails.
#[derive(Debug, Clone)]
pub enum Payload {
    /// A use-case is about to run with these arguments.
    WillExecuted { args: Value },
    /// The use-case body returned. `value` is `None` while an asynchronous
    /// result is still unresolved, or when the body failed synchronously.
    DidExecuted { value: Option<Value> },
    /// The execution settled. `value` is `None` on failure.
    Completed { value: Option<Value> },
    /// The use-case reported a failure.
    Error { error: Arc<anyhow::Error> },
    TransactionBegan { name: String, id: TransactionId },
    TransactionEnded { name: String, id: TransactionId },
    /// `should_execute` declined; nothing else is dispatched for this run.
    WillNotExecuted { args: Value },
    Custom(UserPayload),
}

impl Payload {
    pub const WILL_EXECUTED: &'static str = "flowline/will-executed";
    pub const DID_EXECUTED: &'static str = "flowline/did-executed";
    pub const COMPLETED: &'static str = "flowline/completed";
    pub const ERROR: &'static str = "flowline/error";
    pub const TRANSACTION_BEGAN: &'static str = "flowline/transaction-began";
    pub const TRANSACTION_ENDED: &'static str = "flowline/transaction-ended";
    pub const WILL_NOT_EXECUTED: &'static str = "flowline/will-not-executed";

    /// Shorthand for a user payload with no fields.
    pub fn custom(kind: impl Into<String>) -> Self {
        Payload::Custom(UserPayload::new(kind))
    }

    /// Parse a `{ "type": ..., ... }` object into a user payload.
    ///
    /// Fails with [`FlowlineError::MissingPayloadType`] when the value is not
    /// an object or has no non-empty string `type`.
    pub fn from_json(value: Value) -> Result<Self, FlowlineError> {
        let payload: UserPayload =
            serde_json::from_value(value).map_err(|_| FlowlineError::MissingPayloadType)?;
        if payload.kind.is_empty() {
            return Err(FlowlineError::MissingPayloadType);
        }
        Ok(Payload::Custom(payload))
    }

    /// The payload's `type` tag.
    pub fn kind(&self) -> &str {
        match self {
            Payload::WillExecuted { .. } => Self::WILL_EXECUTED,
            Payload::DidExecuted { .. } => Self::DID_EXECUTED,
            Payload::Completed { .. } => Self::COMPLETED,
            Payload::Error { .. } => Self::ERROR,
            Payload::TransactionBegan { .. } => Self::TRANSACTION_BEGAN,
            Payload::TransactionEnded { .. } => Self::TRANSACTION_ENDED,
            Payload::WillNotExecuted { .. } => Self::WILL_NOT_EXECUTED,
            Payload::Custom(user) => &user.kind,
        }
    }

    /// Returns true for payloads generated by the system rather than the
    /// application.
    pub fn is_builtin(&self) -> bool {
        !matches!(self, Payload::Custom(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Payload::Error { .. })
    }

    /// Borrow the user payload, if this is one.
    pub fn as_custom(&self) -> Option<&UserPayload> {
        match self {
            Payload::Custom(user) => Some(user),
            _ => None,
        }
    }

    /// A JSON rendering for logs and recorders. Errors render as their
    /// display string.
    pub fn to_json(&self) -> Value {
        match self {
            Payload::WillExecuted { args } => json!({ "type": self.kind(), "args": args }),
            Payload::DidExecuted { value } | Payload::Completed { value } => {
                json!({ "type": self.kind(), "value": value })
            }
            Payload::Error { error } => {
                json!({ "type": self.kind(), "error": error.to_string() })
            }
            Payload::TransactionBegan { name, id } | Payload::TransactionEnded { name, id } => {
                json!({ "type": self.kind(), "name": name, "id": id })
            }
            Payload::WillNotExecuted { args } => json!({ "type": self.kind(), "args": args }),
            Payload::Custom(user) => user.to_json(),
        }
    }
}

impl From<UserPayload> for Payload {
    fn from(user: UserPayload) -> Self {
        Payload::Custom(user)
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

// =============================================================================
// Meta
// =============================================================================

/// Out-of-band context for one dispatch.
///
/// # Fields
///
/// - `use_case`: the use-case that owns this payload, if any
/// - `parent_use_case`: set only when `use_case` runs nested inside another
/// - `transaction`: the open transaction the payload belongs to
/// - `is_trusted`: true for payloads generated by the executor or a
///   transaction, false for payloads dispatched by application code
/// - `is_use_case_finished`: true iff this is the terminal dispatch of the
///   owning use-case's execution
#[derive(Clone)]
pub struct DispatcherPayloadMeta {
    pub use_case: Option<UseCaseHandle>,
    pub parent_use_case: Option<UseCaseHandle>,
    pub transaction: Option<TransactionRef>,
    pub is_trusted: bool,
    pub is_use_case_finished: bool,
    pub time_stamp: DateTime<Utc>,
}

impl DispatcherPayloadMeta {
    /// Meta for a payload dispatched directly, outside any use-case.
    pub fn new() -> Self {
        Self {
            use_case: None,
            parent_use_case: None,
            transaction: None,
            is_trusted: false,
            is_use_case_finished: false,
            time_stamp: Utc::now(),
        }
    }

    /// Meta for a lifecycle payload produced by an executor.
    pub(crate) fn lifecycle(
        use_case: &UseCaseHandle,
        parent: Option<&UseCaseHandle>,
        transaction: Option<&TransactionRef>,
        is_use_case_finished: bool,
    ) -> Self {
        Self {
            use_case: Some(use_case.clone()),
            parent_use_case: parent.cloned(),
            transaction: transaction.cloned(),
            is_trusted: true,
            is_use_case_finished,
            time_stamp: Utc::now(),
        }
    }

    /// Meta for a payload dispatched from inside a use-case body.
    pub(crate) fn from_use_case(
        use_case: &UseCaseHandle,
        parent: Option<&UseCaseHandle>,
        transaction: Option<&TransactionRef>,
    ) -> Self {
        Self {
            is_trusted: false,
            ..Self::lifecycle(use_case, parent, transaction, false)
        }
    }

    /// Meta for transaction boundary payloads.
    pub(crate) fn for_transaction(transaction: &TransactionRef) -> Self {
        Self {
            transaction: Some(transaction.clone()),
            is_trusted: true,
            ..Self::new()
        }
    }

    /// Attach a transaction.
    pub fn with_transaction(mut self, transaction: TransactionRef) -> Self {
        self.transaction = Some(transaction);
        self
    }

    pub fn use_case_id(&self) -> Option<UseCaseId> {
        self.use_case.as_ref().map(UseCaseHandle::id)
    }

    pub fn parent_use_case_id(&self) -> Option<UseCaseId> {
        self.parent_use_case.as_ref().map(UseCaseHandle::id)
    }

    pub fn transaction_id(&self) -> Option<TransactionId> {
        self.transaction.as_ref().map(|t| t.id)
    }
}

impl Default for DispatcherPayloadMeta {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DispatcherPayloadMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatcherPayloadMeta")
            .field("use_case", &self.use_case)
            .field("parent_use_case", &self.parent_use_case)
            .field("transaction", &self.transaction)
            .field("is_trusted", &self.is_trusted)
            .field("is_use_case_finished", &self.is_use_case_finished)
            .field("time_stamp", &self.time_stamp)
            .finish()
    }
}
