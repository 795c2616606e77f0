//! Ledger client abstraction.
//!
//! The ledger is the source of truth: it validates, orders and stores
//! transactions and relays messages between participants. The ticket layer
//! consumes it through [`LedgerClient`], one client per participant identity.
//!
//! Inbound traffic arrives on a single [`NotificationStream`] as a small closed
//! set of [`LedgerNotification`] variants, dispatched by the service facade.
//!
//! # Implementations
//!
//! - `InMemoryLedger` (in `ticket-ledger-testing`): simulated ledger network
//!
//! # Dyn Compatibility
//!
//! Methods return `Pin<Box<dyn Future>>` so clients can be shared as
//! `Arc<dyn LedgerClient>`.

use crate::ids::{TxId, UserId};
use crate::transaction::{SignatureEntry, Transaction};
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors reported by the ledger or its transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// The ledger refused the transaction.
    #[error("Transaction rejected: {reason}")]
    Rejected {
        /// Ledger-provided reason.
        reason: String,
    },

    /// No transaction with this id is recorded.
    #[error("Transaction not found: {0}")]
    NotFound(TxId),

    /// The counter-party refused to sign.
    #[error("Signature denied: {reason}")]
    SignatureDenied {
        /// Counter-party-provided reason.
        reason: String,
    },

    /// The response channel closed before an answer arrived.
    #[error("Ledger response channel closed")]
    ChannelClosed,

    /// Connection or transport failure.
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Inbound message from the ledger.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LedgerNotification {
    /// Another participant asks this identity to counter-sign a transaction.
    SignatureRequested {
        /// Who to answer.
        requester: UserId,
        /// Raw transaction to sign.
        transaction: Vec<u8>,
    },
    /// The ledger durably accepted a transaction touching the subscribed
    /// asset group.
    TransactionAccepted {
        /// The accepted transaction.
        tx_id: TxId,
    },
}

/// Stream of inbound notifications.
pub type NotificationStream = Pin<Box<dyn Stream<Item = LedgerNotification> + Send>>;

/// Boxed future returned by [`LedgerClient`] methods.
pub type LedgerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, LedgerError>> + Send + 'a>>;

/// Client for the external ledger, bound to one participant identity.
pub trait LedgerClient: Send + Sync {
    /// Identity this client acts for.
    fn user_id(&self) -> UserId;

    /// Submit a signed, digested transaction and wait for the ledger's verdict.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Rejected`] with the ledger's reason, or a transport error.
    fn submit_transaction(&self, tx: &Transaction) -> LedgerFuture<'_, ()>;

    /// Look up a recorded transaction.
    ///
    /// # Errors
    ///
    /// Transport errors only; an unknown id yields `Ok(None)`.
    fn fetch_transaction(&self, tx_id: TxId) -> LedgerFuture<'_, Option<Transaction>>;

    /// Ask `counterparty` to sign `tx` and wait for its signature.
    ///
    /// # Errors
    ///
    /// [`LedgerError::SignatureDenied`] if the counter-party refuses.
    fn gather_remote_signature(
        &self,
        tx: &Transaction,
        counterparty: UserId,
    ) -> LedgerFuture<'_, SignatureEntry>;

    /// Subscribe to acceptance notices for transactions in `service_id`'s
    /// asset group, plus signature requests addressed to this identity.
    ///
    /// # Errors
    ///
    /// Transport errors.
    fn subscribe_accepted_transactions(&self, service_id: UserId) -> LedgerFuture<'_, NotificationStream>;

    /// Answer a signature request.
    ///
    /// # Errors
    ///
    /// Transport errors.
    fn send_signature_response(
        &self,
        requester: UserId,
        tx_id: TxId,
        signature: SignatureEntry,
    ) -> LedgerFuture<'_, ()>;

    /// Refuse a signature request.
    ///
    /// # Errors
    ///
    /// Transport errors.
    fn send_signature_denial(&self, requester: UserId, reason: String) -> LedgerFuture<'_, ()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_error_display() {
        let error = LedgerError::Rejected {
            reason: "reference already spent".to_string(),
        };
        assert_eq!(error.to_string(), "Transaction rejected: reference already spent");
    }
}
