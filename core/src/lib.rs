//! # Ticket Ledger Core
//!
//! Core types and collaborator traits for tracking ownership of non-fungible
//! tickets recorded on an external append-only ledger.
//!
//! The ledger holds the truth. This crate provides what every participant
//! needs to talk about it:
//!
//! - **Codec**: [`spec::TicketSpec`] and [`ticket::Ticket`] wire encodings
//! - **Transactions**: the ledger's [`transaction::Transaction`] model
//! - **Collaborators**: [`ledger::LedgerClient`], [`table::TableStore`],
//!   [`signing::Signer`] and friends, all injected as trait objects
//! - **Errors**: the [`error::TicketError`] taxonomy
//!
//! The ownership index, transaction builder, signing coordinator and service
//! facade live in `ticket-ledger-runtime`.
//!
//! ## Example
//!
//! ```
//! use ticket_ledger_core::spec::TicketSpec;
//! use ticket_ledger_core::ticket::Ticket;
//! use serde_json::json;
//!
//! let spec = TicketSpec::from_json(&json!({
//!     "description": "Denki Groove:Zepp Tokyo:S3-16",
//!     "value": 1,
//!     "unit": "person",
//!     "option_transferable": true,
//! }))
//! .unwrap();
//!
//! let bytes = Ticket::embedded(spec, 1_552_600_000).serialize();
//! assert!(Ticket::from_bytes(&bytes).unwrap().is_transferable().unwrap());
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};

pub mod codec;
pub mod correlation;
pub mod error;
pub mod ids;
pub mod ledger;
pub mod signing;
pub mod spec;
pub mod table;
pub mod ticket;
pub mod transaction;

pub use error::{Result, TicketError};
pub use ids::{TicketId, TxId, UserId};

/// Environment module - Dependency injection traits
///
/// All time reads go through [`Clock`](environment::Clock) so tests can pin
/// `last_modified` and transaction timestamps.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use ticket_ledger_core::environment::{Clock, SystemClock};
    ///
    /// let now = SystemClock.epoch_seconds();
    /// assert!(now > 0);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;

        /// Current time as non-negative epoch seconds
        #[allow(clippy::cast_sign_loss)] // clamped to zero first
        fn epoch_seconds(&self) -> u64 {
            self.now().timestamp().max(0) as u64
        }
    }

    /// Production clock reading the system time
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
