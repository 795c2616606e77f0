//! Ownership index.
//!
//! [`TicketStore`] mirrors, for one ticket service, which ledger outputs are
//! currently spendable tickets and by whom. Each row moves through
//!
//! ```text
//!   FREE ──reserve──▶ RESERVED ──accepted──▶ TAKEN
//!     ▲                  │
//!     └────release───────┘      FREE ──accepted──▶ TAKEN
//! ```
//!
//! A row leaves FREE the moment its output is committed to an outgoing
//! transaction, before any other party sees that transaction. Only
//! [`TicketStore::inserted`], driven by ledger acceptance notices, creates new
//! FREE rows and moves rows to TAKEN.
//!
//! When the store is offline ([`TicketStore::set_online`]) every table
//! operation is a no-op: reads come back empty and writes are dropped. Empty
//! results then mean "unknown", not "nonexistent".

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use ticket_ledger_core::environment::Clock;
use ticket_ledger_core::ids::{TicketId, TxId, UserId};
use ticket_ledger_core::ledger::LedgerClient;
use ticket_ledger_core::signing::Signer;
use ticket_ledger_core::table::{TableError, TableStore, UtxoQuery, UtxoRecord, UtxoState};
use ticket_ledger_core::ticket::Ticket;
use ticket_ledger_core::transaction::{SignatureEntry, Transaction};
use ticket_ledger_core::{Result, TicketError};

/// Outcome of [`TicketStore::reserve_utxo`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Reservation {
    /// The row moved FREE → RESERVED.
    Reserved,
    /// No such row in this index (or the store is offline).
    NotFound,
    /// The row exists but is not FREE.
    Unavailable(UtxoState),
}

/// Summary of one applied acceptance notice.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Applied {
    /// New FREE rows written.
    pub created: usize,
    /// Rows moved to TAKEN.
    pub consumed: usize,
}

/// Local UTXO index for one ticket service.
pub struct TicketStore {
    service_id: UserId,
    tables: Arc<dyn TableStore>,
    ledger: Arc<dyn LedgerClient>,
    clock: Arc<dyn Clock>,
    independent: bool,
    online: AtomicBool,
}

impl TicketStore {
    /// Create an index over `tables` for `service_id`'s tickets.
    ///
    /// An `independent` index deletes pending transactions once it has read
    /// them back, because nothing else cleans its cache.
    #[must_use]
    pub fn new(
        service_id: UserId,
        tables: Arc<dyn TableStore>,
        ledger: Arc<dyn LedgerClient>,
        clock: Arc<dyn Clock>,
        independent: bool,
    ) -> Self {
        Self {
            service_id,
            tables,
            ledger,
            clock,
            independent,
            online: AtomicBool::new(true),
        }
    }

    /// Ticket service this index tracks.
    #[must_use]
    pub const fn service_id(&self) -> UserId {
        self.service_id
    }

    /// Whether pending transactions are deleted on read.
    #[must_use]
    pub const fn is_independent(&self) -> bool {
        self.independent
    }

    /// Switch the table store on or off (test and degraded mode).
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
        tracing::info!(service_id = %self.service_id, online, "ticket store availability changed");
    }

    /// Whether the table store is in use.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn offline(&self, operation: &'static str) -> bool {
        let offline = !self.is_online();
        if offline {
            tracing::warn!(operation, "ticket store offline, skipping");
        }
        offline
    }

    fn now(&self) -> i64 {
        self.clock.now().timestamp()
    }

    /// Insert a FREE row for `user_id` holding `ticket_id` at `(tx_id, event_idx)`.
    ///
    /// # Errors
    ///
    /// [`TicketError::Storage`] with [`TableError::Duplicate`] if the output is
    /// already indexed.
    pub async fn write_utxo(
        &self,
        user_id: UserId,
        tx_id: TxId,
        event_idx: u16,
        ticket_id: TicketId,
        is_single: bool,
    ) -> Result<()> {
        if self.offline("write_utxo") {
            return Ok(());
        }
        self.tables
            .insert_utxo(UtxoRecord {
                service_id: self.service_id,
                user_id,
                tx_id,
                event_idx,
                ticket_id,
                is_single,
                state: UtxoState::Free,
                last_modified: self.now(),
            })
            .await?;
        tracing::debug!(%tx_id, event_idx, %user_id, %ticket_id, "utxo written");
        Ok(())
    }

    /// Move `(tx_id, event_idx)` from FREE to RESERVED.
    ///
    /// # Errors
    ///
    /// Table backend failures.
    pub async fn reserve_utxo(&self, tx_id: TxId, event_idx: u16) -> Result<Reservation> {
        if self.offline("reserve_utxo") {
            return Ok(Reservation::NotFound);
        }
        let changed = self
            .tables
            .update_utxo_state(
                tx_id,
                event_idx,
                Some(UtxoState::Free),
                UtxoState::Reserved,
                self.now(),
            )
            .await?;
        if changed > 0 {
            tracing::debug!(%tx_id, event_idx, "utxo reserved");
            return Ok(Reservation::Reserved);
        }
        Ok(match self.tables.select_utxo(tx_id, event_idx).await? {
            Some(row) => Reservation::Unavailable(row.state),
            None => Reservation::NotFound,
        })
    }

    /// Move `(tx_id, event_idx)` from RESERVED back to FREE.
    ///
    /// Only for reservations whose transaction was explicitly rejected or
    /// denied. Returns whether a row changed.
    ///
    /// # Errors
    ///
    /// Table backend failures.
    pub async fn release_utxo(&self, tx_id: TxId, event_idx: u16) -> Result<bool> {
        if self.offline("release_utxo") {
            return Ok(false);
        }
        let changed = self
            .tables
            .update_utxo_state(
                tx_id,
                event_idx,
                Some(UtxoState::Reserved),
                UtxoState::Free,
                self.now(),
            )
            .await?;
        if changed > 0 {
            tracing::warn!(%tx_id, event_idx, "utxo reservation released");
        }
        Ok(changed > 0)
    }

    /// Mark `(tx_id, event_idx)` TAKEN. The row is kept.
    ///
    /// # Errors
    ///
    /// Table backend failures.
    pub async fn delete_utxo(&self, tx_id: TxId, event_idx: u16) -> Result<bool> {
        if self.offline("delete_utxo") {
            return Ok(false);
        }
        let changed = self
            .tables
            .update_utxo_state(tx_id, event_idx, None, UtxoState::Taken, self.now())
            .await?;
        tracing::debug!(%tx_id, event_idx, found = changed > 0, "utxo taken");
        Ok(changed > 0)
    }

    async fn free_rows(&self, user_id: UserId, ticket_id: Option<TicketId>) -> Result<Vec<UtxoRecord>> {
        if self.offline("read_utxo") {
            return Ok(Vec::new());
        }
        Ok(self
            .tables
            .select_utxos(UtxoQuery {
                service_id: self.service_id,
                user_id,
                ticket_id,
                state: Some(UtxoState::Free),
            })
            .await?)
    }

    /// The FREE row proving `user_id` holds `ticket_id`, if any.
    ///
    /// # Errors
    ///
    /// Table backend failures.
    pub async fn read_utxo(&self, user_id: UserId, ticket_id: TicketId) -> Result<Option<UtxoRecord>> {
        Ok(self.free_rows(user_id, Some(ticket_id)).await?.into_iter().next())
    }

    /// Every FREE row of `user_id`, oldest first.
    ///
    /// # Errors
    ///
    /// Table backend failures.
    pub async fn read_utxo_list(&self, user_id: UserId) -> Result<Vec<UtxoRecord>> {
        self.free_rows(user_id, None).await
    }

    /// Sum of `value` over the tickets `user_id` currently holds.
    ///
    /// Values are added regardless of their `unit`.
    ///
    /// # Errors
    ///
    /// [`TicketError::NotFound`] if a held ticket is missing from the registry.
    pub async fn get_balance_of(&self, user_id: UserId) -> Result<i64> {
        let mut balance: i64 = 0;
        for row in self.read_utxo_list(user_id).await? {
            let ticket = self
                .get_ticket(row.ticket_id)
                .await?
                .ok_or_else(|| TicketError::NotFound(format!("ticket {}", row.ticket_id)))?;
            let value = ticket.spec().map_or(0, |spec| spec.value());
            balance = balance.saturating_add(value);
        }
        Ok(balance)
    }

    /// Whether `user_id` currently holds `ticket_id`.
    ///
    /// # Errors
    ///
    /// Table backend failures.
    pub async fn is_valid_holder(&self, user_id: UserId, ticket_id: TicketId) -> Result<bool> {
        Ok(self.read_utxo(user_id, ticket_id).await?.is_some())
    }

    /// Registered ticket for `ticket_id`.
    ///
    /// # Errors
    ///
    /// Table backend failures, or a corrupt registry payload.
    pub async fn get_ticket(&self, ticket_id: TicketId) -> Result<Option<Ticket>> {
        if self.offline("get_ticket") {
            return Ok(None);
        }
        match self.tables.select_ticket(ticket_id).await? {
            Some(raw) => Ok(Some(Ticket::from_bytes(&raw)?)),
            None => Ok(None),
        }
    }

    /// Register `payload` (a serialized ticket) under `ticket_id`.
    ///
    /// Write-once: an existing entry is left untouched.
    ///
    /// # Errors
    ///
    /// Table backend failures.
    pub async fn put_ticket(&self, ticket_id: TicketId, payload: Vec<u8>) -> Result<()> {
        if self.offline("put_ticket") {
            return Ok(());
        }
        match self.tables.insert_ticket(ticket_id, payload).await {
            Ok(()) => {
                tracing::debug!(%ticket_id, "ticket registered");
                Ok(())
            }
            Err(TableError::Duplicate { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Cache `tx` as pending under its id.
    ///
    /// # Errors
    ///
    /// Table backend failures.
    pub async fn push_tx(&self, tx: &Transaction) -> Result<()> {
        if self.offline("push_tx") {
            return Ok(());
        }
        let tx_id = tx.tx_id();
        match self.tables.insert_tx(tx_id, tx.to_bytes()).await {
            Ok(()) | Err(TableError::Duplicate { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Read a pending transaction back, deleting it if this index is independent.
    ///
    /// # Errors
    ///
    /// Table backend failures, or a corrupt cached payload.
    pub async fn take_tx(&self, tx_id: TxId) -> Result<Option<Transaction>> {
        if self.offline("take_tx") {
            return Ok(None);
        }
        let Some(raw) = self.tables.select_tx(tx_id).await? else {
            return Ok(None);
        };
        let tx = Transaction::from_bytes(&raw)?;
        if self.independent {
            self.tables.delete_tx(tx_id).await?;
        }
        Ok(Some(tx))
    }

    /// Recorded transaction, straight from the ledger.
    ///
    /// # Errors
    ///
    /// Ledger transport failures.
    pub async fn get_tx(&self, tx_id: TxId) -> Result<Option<Transaction>> {
        Ok(self.ledger.fetch_transaction(tx_id).await?)
    }

    /// Transaction and output index of `user_id`'s usable event for `ticket_id`.
    ///
    /// # Errors
    ///
    /// [`TicketError::NotFound`] if the indexed transaction is unknown to the
    /// ledger; table and ledger failures.
    pub async fn usable_event(
        &self,
        user_id: UserId,
        ticket_id: TicketId,
    ) -> Result<Option<(Transaction, u16)>> {
        let Some(row) = self.read_utxo(user_id, ticket_id).await? else {
            return Ok(None);
        };
        let tx = self
            .get_tx(row.tx_id)
            .await?
            .ok_or_else(|| TicketError::NotFound(format!("transaction {}", row.tx_id)))?;
        Ok(Some((tx, row.event_idx)))
    }

    /// Reserve every output of this service that `tx` spends.
    ///
    /// All-or-nothing: if one referenced row is not FREE, the rows reserved by
    /// this call are released again. Rows unknown to this index are skipped.
    /// Returns the rows this call reserved.
    ///
    /// # Errors
    ///
    /// [`TicketError::Policy`] if a referenced row is RESERVED or TAKEN; table
    /// backend failures.
    pub async fn reserve_referred_utxos(&self, tx: &Transaction) -> Result<Vec<(TxId, u16)>> {
        let mut reserved = Vec::new();
        for reference in tx.references_in(&self.service_id) {
            let key = (reference.transaction_id, reference.event_index);
            match self.reserve_utxo(key.0, key.1).await {
                Ok(Reservation::Reserved) => reserved.push(key),
                Ok(Reservation::NotFound) => {}
                Ok(Reservation::Unavailable(state)) => {
                    self.release_all(&reserved).await;
                    return Err(TicketError::Policy(format!(
                        "reference {}/{} is already {state}",
                        key.0, key.1
                    )));
                }
                Err(e) => {
                    self.release_all(&reserved).await;
                    return Err(e);
                }
            }
        }
        Ok(reserved)
    }

    /// Release reservations, logging failures.
    pub async fn release_all(&self, keys: &[(TxId, u16)]) {
        for (tx_id, event_idx) in keys {
            if let Err(e) = self.release_utxo(*tx_id, *event_idx).await {
                tracing::error!(%tx_id, event_idx, error = %e, "failed to release reservation");
            }
        }
    }

    /// Sign `tx` as `user_id` and attach the signature.
    pub fn sign(&self, tx: &mut Transaction, user_id: UserId, signer: &dyn Signer) -> SignatureEntry {
        tx.sign(user_id, signer)
    }

    /// Apply the ledger's acceptance of `tx_id`.
    ///
    /// Reads the transaction from the pending cache, falling back to the
    /// ledger. Outputs in this service's asset group become FREE rows (embedded
    /// tickets are registered under their asset id); references into it become
    /// TAKEN. Outputs already indexed are skipped, so a repeated notice changes
    /// nothing.
    ///
    /// Returns `None` when the transaction cannot be found.
    ///
    /// # Errors
    ///
    /// Table and ledger failures, or an undecodable ticket payload.
    #[tracing::instrument(skip(self), fields(service_id = %self.service_id))]
    pub async fn inserted(&self, tx_id: TxId) -> Result<Option<Applied>> {
        if self.offline("inserted") {
            return Ok(None);
        }
        let tx = match self.take_tx(tx_id).await? {
            Some(tx) => tx,
            None => match self.get_tx(tx_id).await? {
                Some(tx) => tx,
                None => {
                    tracing::warn!(%tx_id, "accepted transaction not found");
                    return Ok(None);
                }
            },
        };

        let mut applied = Applied::default();
        for (idx, event) in tx.events.iter().enumerate() {
            if event.asset_group_id != self.service_id {
                continue;
            }
            let event_idx = u16::try_from(idx)
                .map_err(|_| TicketError::Policy(format!("event index {idx} out of range")))?;
            let ticket = Ticket::from_bytes(&event.asset.body)?;
            let ticket_id = match ticket.ticket_id() {
                Some(ticket_id) => ticket_id,
                None => {
                    self.put_ticket(event.asset.asset_id, event.asset.body.clone())
                        .await?;
                    event.asset.asset_id
                }
            };
            match self
                .write_utxo(event.asset.user_id, tx_id, event_idx, ticket_id, true)
                .await
            {
                Ok(()) => applied.created += 1,
                Err(TicketError::Storage(TableError::Duplicate { .. })) => {
                    tracing::debug!(%tx_id, event_idx, "output already indexed");
                }
                Err(e) => return Err(e),
            }
        }

        for reference in tx.references_in(&self.service_id) {
            if self
                .delete_utxo(reference.transaction_id, reference.event_index)
                .await?
            {
                applied.consumed += 1;
            }
        }

        tracing::info!(%tx_id, created = applied.created, consumed = applied.consumed, "accepted transaction applied");
        Ok(Some(applied))
    }
}

impl std::fmt::Debug for TicketStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TicketStore")
            .field("service_id", &self.service_id)
            .field("independent", &self.independent)
            .field("online", &self.is_online())
            .finish_non_exhaustive()
    }
}
