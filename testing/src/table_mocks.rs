//! In-memory table store for fast, deterministic testing.
//!
//! Complements `InMemoryLedger` so a whole ticket flow runs without a
//! database.

#![allow(clippy::missing_panics_doc)] // Test utilities document panics where critical

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use ticket_ledger_core::ids::{TicketId, TxId};
use ticket_ledger_core::table::{
    TableError, TableFuture, TableStore, UtxoQuery, UtxoRecord, UtxoState,
};

#[derive(Debug, Default)]
struct Tables {
    utxos: BTreeMap<(TxId, u16), UtxoRecord>,
    txs: HashMap<TxId, Vec<u8>>,
    tickets: HashMap<TicketId, Vec<u8>>,
    fail_next_insert_tx: Option<String>,
}

fn poisoned() -> TableError {
    TableError::Storage("lock poisoned".to_string())
}

/// `HashMap`-backed implementation of [`TableStore`].
///
/// # Example
///
/// ```
/// use ticket_ledger_testing::InMemoryTableStore;
/// use ticket_ledger_core::table::TableStore;
/// use ticket_ledger_core::ids::TxId;
///
/// # tokio_test::block_on(async {
/// let tables = InMemoryTableStore::new();
/// let tx_id = TxId::new([1; 32]);
/// tables.insert_tx(tx_id, vec![1, 2, 3]).await.unwrap();
/// assert_eq!(tables.select_tx(tx_id).await.unwrap(), Some(vec![1, 2, 3]));
/// # });
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryTableStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryTableStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `ticket_table` row, in key order
    ///
    /// Useful for asserting on RESERVED and TAKEN rows, which the ownership
    /// index never returns.
    #[must_use]
    pub fn all_utxos(&self) -> Vec<UtxoRecord> {
        self.tables
            .read()
            .map(|t| t.utxos.values().cloned().collect())
            .unwrap_or_default()
    }

    /// State of the row `(tx_id, event_idx)`, if it exists
    #[must_use]
    pub fn utxo_state(&self, tx_id: TxId, event_idx: u16) -> Option<UtxoState> {
        self.tables
            .read()
            .ok()
            .and_then(|t| t.utxos.get(&(tx_id, event_idx)).map(|r| r.state))
    }

    /// Number of cached pending transactions
    #[must_use]
    pub fn pending_tx_count(&self) -> usize {
        self.tables.read().map(|t| t.txs.len()).unwrap_or(0)
    }

    /// Make the next `insert_tx` fail with [`TableError::Storage`].
    pub fn fail_next_insert_tx(&self, reason: impl Into<String>) {
        if let Ok(mut tables) = self.tables.write() {
            tables.fail_next_insert_tx = Some(reason.into());
        }
    }
}

impl TableStore for InMemoryTableStore {
    fn insert_utxo(&self, record: UtxoRecord) -> TableFuture<'_, ()> {
        Box::pin(async move {
            let mut tables = self.tables.write().map_err(|_| poisoned())?;
            let key = (record.tx_id, record.event_idx);
            if tables.utxos.contains_key(&key) {
                return Err(TableError::Duplicate {
                    table: "ticket_table",
                    key: format!("{}/{}", record.tx_id, record.event_idx),
                });
            }
            tables.utxos.insert(key, record);
            Ok(())
        })
    }

    fn update_utxo_state(
        &self,
        tx_id: TxId,
        event_idx: u16,
        expected: Option<UtxoState>,
        state: UtxoState,
        last_modified: i64,
    ) -> TableFuture<'_, u64> {
        Box::pin(async move {
            let mut tables = self.tables.write().map_err(|_| poisoned())?;
            match tables.utxos.get_mut(&(tx_id, event_idx)) {
                Some(row) if expected.is_none_or(|e| e == row.state) => {
                    row.state = state;
                    row.last_modified = last_modified;
                    Ok(1)
                }
                _ => Ok(0),
            }
        })
    }

    fn select_utxo(&self, tx_id: TxId, event_idx: u16) -> TableFuture<'_, Option<UtxoRecord>> {
        Box::pin(async move {
            let tables = self.tables.read().map_err(|_| poisoned())?;
            Ok(tables.utxos.get(&(tx_id, event_idx)).cloned())
        })
    }

    fn select_utxos(&self, query: UtxoQuery) -> TableFuture<'_, Vec<UtxoRecord>> {
        Box::pin(async move {
            let tables = self.tables.read().map_err(|_| poisoned())?;
            let mut rows: Vec<UtxoRecord> = tables
                .utxos
                .values()
                .filter(|r| r.service_id == query.service_id && r.user_id == query.user_id)
                .filter(|r| query.ticket_id.is_none_or(|t| t == r.ticket_id))
                .filter(|r| query.state.is_none_or(|s| s == r.state))
                .cloned()
                .collect();
            rows.sort_by_key(|r| (r.last_modified, r.tx_id, r.event_idx));
            Ok(rows)
        })
    }

    fn insert_tx(&self, tx_id: TxId, tx: Vec<u8>) -> TableFuture<'_, ()> {
        Box::pin(async move {
            let mut tables = self.tables.write().map_err(|_| poisoned())?;
            if let Some(reason) = tables.fail_next_insert_tx.take() {
                return Err(TableError::Storage(reason));
            }
            if tables.txs.contains_key(&tx_id) {
                return Err(TableError::Duplicate {
                    table: "ticket_tx_id_table",
                    key: tx_id.to_string(),
                });
            }
            tables.txs.insert(tx_id, tx);
            Ok(())
        })
    }

    fn select_tx(&self, tx_id: TxId) -> TableFuture<'_, Option<Vec<u8>>> {
        Box::pin(async move {
            let tables = self.tables.read().map_err(|_| poisoned())?;
            Ok(tables.txs.get(&tx_id).cloned())
        })
    }

    fn delete_tx(&self, tx_id: TxId) -> TableFuture<'_, bool> {
        Box::pin(async move {
            let mut tables = self.tables.write().map_err(|_| poisoned())?;
            Ok(tables.txs.remove(&tx_id).is_some())
        })
    }

    fn insert_ticket(&self, ticket_id: TicketId, ticket: Vec<u8>) -> TableFuture<'_, ()> {
        Box::pin(async move {
            let mut tables = self.tables.write().map_err(|_| poisoned())?;
            if tables.tickets.contains_key(&ticket_id) {
                return Err(TableError::Duplicate {
                    table: "ticket_id_table",
                    key: ticket_id.to_string(),
                });
            }
            tables.tickets.insert(ticket_id, ticket);
            Ok(())
        })
    }

    fn select_ticket(&self, ticket_id: TicketId) -> TableFuture<'_, Option<Vec<u8>>> {
        Box::pin(async move {
            let tables = self.tables.read().map_err(|_| poisoned())?;
            Ok(tables.tickets.get(&ticket_id).cloned())
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use ticket_ledger_core::ids::UserId;

    fn row(tx: u8, idx: u16, user: u8, last_modified: i64) -> UtxoRecord {
        UtxoRecord {
            service_id: UserId::new([0; 32]),
            user_id: UserId::new([user; 32]),
            tx_id: TxId::new([tx; 32]),
            event_idx: idx,
            ticket_id: TicketId::new([tx; 32]),
            is_single: true,
            state: UtxoState::Free,
            last_modified,
        }
    }

    #[tokio::test]
    async fn duplicate_utxo_is_rejected() {
        let tables = InMemoryTableStore::new();
        tables.insert_utxo(row(1, 0, 7, 0)).await.unwrap();
        let err = tables.insert_utxo(row(1, 0, 8, 0)).await.unwrap_err();
        assert!(matches!(err, TableError::Duplicate { table: "ticket_table", .. }));
        tables.insert_utxo(row(1, 1, 7, 0)).await.unwrap();
        assert_eq!(tables.all_utxos().len(), 2);
    }

    #[tokio::test]
    async fn conditional_update_checks_expected_state() {
        let tables = InMemoryTableStore::new();
        let tx = TxId::new([1; 32]);
        tables.insert_utxo(row(1, 0, 7, 0)).await.unwrap();

        let changed = tables
            .update_utxo_state(tx, 0, Some(UtxoState::Free), UtxoState::Reserved, 5)
            .await
            .unwrap();
        assert_eq!(changed, 1);

        let changed = tables
            .update_utxo_state(tx, 0, Some(UtxoState::Free), UtxoState::Reserved, 6)
            .await
            .unwrap();
        assert_eq!(changed, 0);

        let changed = tables
            .update_utxo_state(tx, 0, None, UtxoState::Taken, 7)
            .await
            .unwrap();
        assert_eq!(changed, 1);

        let stored = tables.select_utxo(tx, 0).await.unwrap().unwrap();
        assert_eq!(stored.state, UtxoState::Taken);
        assert_eq!(stored.last_modified, 7);
    }

    #[tokio::test]
    async fn select_filters_and_orders() {
        let tables = InMemoryTableStore::new();
        tables.insert_utxo(row(2, 0, 7, 20)).await.unwrap();
        tables.insert_utxo(row(1, 0, 7, 10)).await.unwrap();
        tables.insert_utxo(row(3, 0, 8, 0)).await.unwrap();

        let query = UtxoQuery {
            service_id: UserId::new([0; 32]),
            user_id: UserId::new([7; 32]),
            ticket_id: None,
            state: Some(UtxoState::Free),
        };
        let rows = tables.select_utxos(query.clone()).await.unwrap();
        assert_eq!(
            rows.iter().map(|r| r.last_modified).collect::<Vec<_>>(),
            vec![10, 20]
        );

        let one = tables
            .select_utxos(UtxoQuery {
                ticket_id: Some(TicketId::new([2; 32])),
                ..query
            })
            .await
            .unwrap();
        assert_eq!(one.len(), 1);
    }

    #[tokio::test]
    async fn tx_cache_insert_select_delete() {
        let tables = InMemoryTableStore::new();
        let tx = TxId::new([4; 32]);
        tables.insert_tx(tx, vec![1]).await.unwrap();
        assert!(tables.insert_tx(tx, vec![2]).await.is_err());
        assert_eq!(tables.pending_tx_count(), 1);
        assert!(tables.delete_tx(tx).await.unwrap());
        assert!(!tables.delete_tx(tx).await.unwrap());
        assert_eq!(tables.select_tx(tx).await.unwrap(), None);
    }

    #[tokio::test]
    async fn injected_insert_tx_failure_applies_once() {
        let tables = InMemoryTableStore::new();
        let tx = TxId::new([5; 32]);
        tables.fail_next_insert_tx("disk full");
        let err = tables.insert_tx(tx, vec![1]).await.unwrap_err();
        assert_eq!(err, TableError::Storage("disk full".to_string()));
        assert_eq!(tables.pending_tx_count(), 0);

        tables.insert_tx(tx, vec![1]).await.unwrap();
        assert_eq!(tables.pending_tx_count(), 1);
    }
}
