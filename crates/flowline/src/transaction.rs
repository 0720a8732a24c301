//! Transactions: group several executions into one observable transition.
//!
//! A transaction is open from `TransactionBegan` until exactly one of
//! [`TransactionContext::commit`] or [`TransactionContext::exit`] runs.
//! Closing twice is an error.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::context::Context;
use crate::core::{DispatcherPayloadMeta, Payload, TransactionId, TransactionRef};
use crate::error::FlowlineError;
use crate::executor::UseCaseExecutor;
use crate::store_group::TransactionOutcome;
use crate::use_case::IntoUseCase;

/// Handle passed to a [`Context::transaction`] handler.
#[derive(Clone)]
pub struct TransactionContext {
    context: Context,
    transaction: TransactionRef,
    closed: Arc<AtomicBool>,
}

impl TransactionContext {
    pub(crate) fn new(context: Context, transaction: TransactionRef) -> Self {
        Self {
            context,
            transaction,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.transaction.id
    }

    pub fn name(&self) -> &str {
        &self.transaction.name
    }

    pub fn transaction(&self) -> &TransactionRef {
        &self.transaction
    }

    /// Prepare an execution that belongs to this transaction.
    pub fn use_case(&self, use_case: impl IntoUseCase) -> UseCaseExecutor {
        UseCaseExecutor::new(
            use_case.into_use_case(),
            None,
            self.context
                .scope()
                .with_transaction(self.transaction.clone()),
        )
    }

    /// End the transaction and emit every change it made, once.
    pub fn commit(&self) -> Result<(), FlowlineError> {
        self.close(TransactionOutcome::Commit)
    }

    /// End the transaction without emitting its changes.
    pub fn exit(&self) -> Result<(), FlowlineError> {
        self.close(TransactionOutcome::Exit)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self, outcome: TransactionOutcome) -> Result<(), FlowlineError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(FlowlineError::TransactionClosed {
                name: self.transaction.name.clone(),
                id: self.transaction.id,
            });
        }
        debug!(
            transaction = %self.transaction.name,
            id = %self.transaction.id,
            ?outcome,
            "transaction ended"
        );
        self.context.dispatcher().deliver(
            &Payload::TransactionEnded {
                name: self.transaction.name.clone(),
                id: self.transaction.id,
            },
            &DispatcherPayloadMeta::for_transaction(&self.transaction),
        );
        self.context
            .store_group()
            .close_transaction(self.transaction.id, outcome);
        Ok(())
    }
}

impl fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionContext")
            .field("transaction", &self.transaction)
            .field("closed", &self.is_closed())
            .finish()
    }
}
