//! Persistent table abstraction backing the ownership index.
//!
//! Three tables, mirroring the layout every backend must provide:
//!
//! ```text
//! ticket_table(service_id, user_id, tx_id, event_idx, ticket_id,
//!              is_single, state, last_modified)
//!     UNIQUE (tx_id, event_idx)
//!     INDEX  (service_id, user_id, ticket_id), (tx_id)
//! ticket_tx_id_table(tx_id PRIMARY KEY, tx)
//! ticket_id_table(ticket_id PRIMARY KEY, ticket)
//! ```
//!
//! The trait is row-oriented: it stores and filters rows and
//! applies conditional state updates, while every rule about *when* a row moves
//! between states lives in the runtime's `TicketStore`.
//!
//! # Implementations
//!
//! - `PostgresTableStore` (in `ticket-ledger-postgres`): production storage
//! - `InMemoryTableStore` (in `ticket-ledger-testing`): fast, deterministic tests

use crate::ids::{TicketId, TxId, UserId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors from the table backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TableError {
    /// A row with the same key already exists.
    #[error("Duplicate key in {table}: {key}")]
    Duplicate {
        /// Table name.
        table: &'static str,
        /// Rendered key.
        key: String,
    },

    /// Backend connection or query failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A stored value could not be converted.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Lifecycle of a spendable reference.
///
/// `Free → Reserved → Taken` or `Free → Taken`; nothing leaves `Taken`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UtxoState {
    /// Spendable.
    Free,
    /// Committed to an in-flight transaction.
    Reserved,
    /// Consumed by an accepted transaction.
    Taken,
}

impl UtxoState {
    /// Stored integer code.
    #[must_use]
    pub const fn code(self) -> i16 {
        match self {
            Self::Free => 0,
            Self::Reserved => 1,
            Self::Taken => 2,
        }
    }

    /// Parse a stored integer code.
    ///
    /// # Errors
    ///
    /// [`TableError::Serialization`] for unknown codes.
    pub fn from_code(code: i16) -> Result<Self, TableError> {
        match code {
            0 => Ok(Self::Free),
            1 => Ok(Self::Reserved),
            2 => Ok(Self::Taken),
            other => Err(TableError::Serialization(format!("unknown UTXO state {other}"))),
        }
    }
}

impl fmt::Display for UtxoState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Free => write!(f, "FREE"),
            Self::Reserved => write!(f, "RESERVED"),
            Self::Taken => write!(f, "TAKEN"),
        }
    }
}

/// One row of `ticket_table`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoRecord {
    /// Ticket service identity.
    pub service_id: UserId,
    /// Current holder.
    pub user_id: UserId,
    /// Transaction owning this output.
    pub tx_id: TxId,
    /// Output index within that transaction.
    pub event_idx: u16,
    /// Ticket this output carries.
    pub ticket_id: TicketId,
    /// Single ticket (as opposed to a future bundle).
    pub is_single: bool,
    /// Lifecycle state.
    pub state: UtxoState,
    /// Last state change, epoch seconds.
    pub last_modified: i64,
}

/// Filter over `ticket_table`, always scoped to a service and holder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UtxoQuery {
    /// Ticket service identity.
    pub service_id: UserId,
    /// Holder.
    pub user_id: UserId,
    /// Restrict to one ticket.
    pub ticket_id: Option<TicketId>,
    /// Restrict to one state.
    pub state: Option<UtxoState>,
}

/// Boxed future returned by [`TableStore`] methods.
pub type TableFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, TableError>> + Send + 'a>>;

/// Generic indexed store holding the three ticket tables.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; row-level writes are expected to be
/// atomic, which is all the ownership index relies on.
pub trait TableStore: Send + Sync {
    /// Insert a `ticket_table` row.
    ///
    /// # Errors
    ///
    /// [`TableError::Duplicate`] if `(tx_id, event_idx)` already exists.
    fn insert_utxo(&self, record: UtxoRecord) -> TableFuture<'_, ()>;

    /// Set `state` and `last_modified` on the row `(tx_id, event_idx)`,
    /// only if its current state is `expected` (any state when `None`).
    ///
    /// Returns the number of rows changed (0 or 1).
    ///
    /// # Errors
    ///
    /// Backend failures.
    fn update_utxo_state(
        &self,
        tx_id: TxId,
        event_idx: u16,
        expected: Option<UtxoState>,
        state: UtxoState,
        last_modified: i64,
    ) -> TableFuture<'_, u64>;

    /// Fetch the row `(tx_id, event_idx)`.
    ///
    /// # Errors
    ///
    /// Backend failures.
    fn select_utxo(&self, tx_id: TxId, event_idx: u16) -> TableFuture<'_, Option<UtxoRecord>>;

    /// Rows matching `query`, ordered by `last_modified` then `(tx_id, event_idx)`.
    ///
    /// # Errors
    ///
    /// Backend failures.
    fn select_utxos(&self, query: UtxoQuery) -> TableFuture<'_, Vec<UtxoRecord>>;

    /// Insert a `ticket_tx_id_table` row.
    ///
    /// # Errors
    ///
    /// [`TableError::Duplicate`] if `tx_id` already exists.
    fn insert_tx(&self, tx_id: TxId, tx: Vec<u8>) -> TableFuture<'_, ()>;

    /// Raw transaction stored under `tx_id`.
    ///
    /// # Errors
    ///
    /// Backend failures.
    fn select_tx(&self, tx_id: TxId) -> TableFuture<'_, Option<Vec<u8>>>;

    /// Remove `tx_id`, returning whether a row existed.
    ///
    /// # Errors
    ///
    /// Backend failures.
    fn delete_tx(&self, tx_id: TxId) -> TableFuture<'_, bool>;

    /// Insert a `ticket_id_table` row.
    ///
    /// # Errors
    ///
    /// [`TableError::Duplicate`] if `ticket_id` already exists.
    fn insert_ticket(&self, ticket_id: TicketId, ticket: Vec<u8>) -> TableFuture<'_, ()>;

    /// Raw ticket stored under `ticket_id`.
    ///
    /// # Errors
    ///
    /// Backend failures.
    fn select_ticket(&self, ticket_id: TicketId) -> TableFuture<'_, Option<Vec<u8>>>;
}
