//! Error taxonomy of the ticket layer.

use crate::codec::DecodeError;
use crate::ledger::LedgerError;
use crate::spec::ValidationError;
use crate::table::TableError;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by ticket operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TicketError {
    /// Malformed `TicketSpec` field. The caller must fix its input.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Corrupt or truncated wire payload.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Operation not allowed: non-transferable ticket, wrong issuer, unverified signers.
    #[error("Policy violation: {0}")]
    Policy(String),

    /// No usable UTXO, or unknown ticket.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The ledger rejected the transaction.
    #[error("Submission failed: {0}")]
    Submission(String),

    /// The counter-party refused to sign, or no signing key is configured.
    #[error("Signing denied: {0}")]
    SigningDenied(String),

    /// No response within the configured bound.
    ///
    /// The request may still complete later; a submission that timed out can
    /// still be accepted and reach the notification handler.
    #[error("Timed out after {after:?} waiting for {operation}")]
    Timeout {
        /// What was being waited for.
        operation: &'static str,
        /// The bound that elapsed.
        after: Duration,
    },

    /// Table backend failure.
    #[error(transparent)]
    Storage(#[from] TableError),

    /// Ledger transport failure.
    #[error("Ledger error: {0}")]
    Ledger(LedgerError),
}

impl TicketError {
    /// Whether retrying with a fresh transaction may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Submission(_)
                | Self::SigningDenied(_)
                | Self::Timeout { .. }
                | Self::Ledger(LedgerError::Transport(_) | LedgerError::ChannelClosed)
        )
    }
}

impl From<LedgerError> for TicketError {
    fn from(error: LedgerError) -> Self {
        match error {
            LedgerError::Rejected { reason } => Self::Submission(reason),
            LedgerError::SignatureDenied { reason } => Self::SigningDenied(reason),
            other => Self::Ledger(other),
        }
    }
}

/// Result alias for ticket operations.
pub type Result<T> = std::result::Result<T, TicketError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::TxId;

    #[test]
    fn ledger_rejection_maps_to_submission() {
        let error = TicketError::from(LedgerError::Rejected {
            reason: "reference already spent".to_string(),
        });
        assert_eq!(
            error,
            TicketError::Submission("reference already spent".to_string())
        );
        assert!(error.is_retryable());
    }

    #[test]
    fn denial_maps_to_signing_denied() {
        let error = TicketError::from(LedgerError::SignatureDenied {
            reason: "no signing key configured".to_string(),
        });
        assert!(matches!(error, TicketError::SigningDenied(_)));
    }

    #[test]
    fn connectivity_failures_are_retryable() {
        let error = TicketError::from(LedgerError::Transport("counter-party is not connected".to_string()));
        assert!(matches!(error, TicketError::Ledger(LedgerError::Transport(_))));
        assert!(error.is_retryable());
        assert!(TicketError::from(LedgerError::ChannelClosed).is_retryable());
        assert!(!TicketError::from(LedgerError::NotFound(TxId::new([1; 32]))).is_retryable());
    }

    #[test]
    fn local_errors_are_not_retryable() {
        assert!(!TicketError::Policy("not transferable".to_string()).is_retryable());
        assert!(!TicketError::NotFound("ticket".to_string()).is_retryable());
        assert!(
            TicketError::Timeout {
                operation: "submission",
                after: Duration::from_secs(1)
            }
            .is_retryable()
        );
    }
}
