//! `PostgreSQL` table store for the ticket ownership index.
//!
//! Implements [`TableStore`] from `ticket-ledger-core` over three tables
//! (`ticket_table`, `ticket_tx_id_table`, `ticket_id_table`) created by the
//! bundled migrations. Identifiers are stored as 32-byte `BYTEA` values and the
//! UTXO state as its `SMALLINT` code.
//!
//! # Example
//!
//! ```ignore
//! use ticket_ledger_postgres::{PostgresConfig, PostgresTableStore};
//!
//! let store = PostgresTableStore::connect(&PostgresConfig::from_env()?).await?;
//! store.migrate().await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use sqlx::Row;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use std::time::Duration;
use thiserror::Error;
use ticket_ledger_core::ids::{TicketId, TxId, UserId};
use ticket_ledger_core::table::{
    TableError, TableFuture, TableStore, UtxoQuery, UtxoRecord, UtxoState,
};

/// Errors loading [`PostgresConfig`] from the environment.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PostgresConfigError {
    /// `DATABASE_URL` is missing.
    #[error("Environment variable not set: {0}")]
    EnvVarNotSet(&'static str),

    /// A numeric variable did not parse.
    #[error("Failed to parse {var}: {reason}")]
    ParseError {
        /// Variable name.
        var: &'static str,
        /// Parser message.
        reason: String,
    },
}

/// Connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostgresConfig {
    /// Connection string.
    pub database_url: String,
    /// Pool size.
    pub max_connections: u32,
    /// How long to wait for a pooled connection.
    pub acquire_timeout: Duration,
}

impl PostgresConfig {
    /// Settings for `database_url` with default pool limits.
    #[must_use]
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
        }
    }

    /// Load from `DATABASE_URL`, `TICKET_DB_MAX_CONNECTIONS` and
    /// `TICKET_DB_ACQUIRE_TIMEOUT_SECS`.
    ///
    /// # Errors
    ///
    /// [`PostgresConfigError`] when the URL is missing or a number is malformed.
    pub fn from_env() -> Result<Self, PostgresConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(
        lookup: impl Fn(&'static str) -> Option<String>,
    ) -> Result<Self, PostgresConfigError> {
        let database_url =
            lookup("DATABASE_URL").ok_or(PostgresConfigError::EnvVarNotSet("DATABASE_URL"))?;
        let mut config = Self::new(database_url);

        if let Some(raw) = lookup("TICKET_DB_MAX_CONNECTIONS") {
            config.max_connections = raw.parse().map_err(|e: std::num::ParseIntError| {
                PostgresConfigError::ParseError {
                    var: "TICKET_DB_MAX_CONNECTIONS",
                    reason: e.to_string(),
                }
            })?;
        }
        if let Some(raw) = lookup("TICKET_DB_ACQUIRE_TIMEOUT_SECS") {
            let secs: u64 = raw.parse().map_err(|e: std::num::ParseIntError| {
                PostgresConfigError::ParseError {
                    var: "TICKET_DB_ACQUIRE_TIMEOUT_SECS",
                    reason: e.to_string(),
                }
            })?;
            config.acquire_timeout = Duration::from_secs(secs);
        }
        Ok(config)
    }
}

/// `PostgreSQL`-backed [`TableStore`].
#[derive(Clone)]
pub struct PostgresTableStore {
    pool: PgPool,
}

impl PostgresTableStore {
    /// Open a connection pool.
    ///
    /// # Errors
    ///
    /// [`TableError::Storage`] if the database is unreachable.
    pub async fn connect(config: &PostgresConfig) -> Result<Self, TableError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.database_url)
            .await
            .map_err(|e| TableError::Storage(format!("Failed to connect: {e}")))?;
        tracing::info!(max_connections = config.max_connections, "ticket table store connected");
        Ok(Self::from_pool(pool))
    }

    /// Store over an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the ticket tables and indexes if missing.
    ///
    /// # Errors
    ///
    /// [`TableError::Storage`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), TableError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| TableError::Storage(format!("Migration failed: {e}")))?;
        Ok(())
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl std::fmt::Debug for PostgresTableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresTableStore")
            .field("pool_size", &self.pool.size())
            .finish()
    }
}

/// Map a failed insert, turning unique violations into [`TableError::Duplicate`].
fn insert_error(e: sqlx::Error, table: &'static str, key: impl FnOnce() -> String) -> TableError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => TableError::Duplicate {
            table,
            key: key(),
        },
        _ => storage("insert into", table, &e),
    }
}

fn storage(action: &str, table: &str, e: &sqlx::Error) -> TableError {
    TableError::Storage(format!("Failed to {action} {table}: {e}"))
}

fn column<T>(row: &PgRow, name: &str) -> Result<T, TableError>
where
    T: for<'r> sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(name)
        .map_err(|e| TableError::Serialization(format!("column {name}: {e}")))
}

fn id_column<T>(
    row: &PgRow,
    name: &str,
    parse: impl FnOnce(&[u8]) -> Result<T, ticket_ledger_core::ids::ParseIdError>,
) -> Result<T, TableError> {
    let raw: Vec<u8> = column(row, name)?;
    parse(&raw).map_err(|e| TableError::Serialization(format!("column {name}: {e}")))
}

fn decode_utxo(row: &PgRow) -> Result<UtxoRecord, TableError> {
    let event_idx: i32 = column(row, "event_idx")?;
    Ok(UtxoRecord {
        service_id: id_column(row, "service_id", UserId::from_slice)?,
        user_id: id_column(row, "user_id", UserId::from_slice)?,
        tx_id: id_column(row, "tx_id", TxId::from_slice)?,
        event_idx: u16::try_from(event_idx)
            .map_err(|_| TableError::Serialization(format!("event index {event_idx} out of range")))?,
        ticket_id: id_column(row, "ticket_id", TicketId::from_slice)?,
        is_single: column(row, "is_single")?,
        state: UtxoState::from_code(column(row, "state")?)?,
        last_modified: column(row, "last_modified")?,
    })
}

const UTXO_COLUMNS: &str =
    "service_id, user_id, tx_id, event_idx, ticket_id, is_single, state, last_modified";

impl TableStore for PostgresTableStore {
    fn insert_utxo(&self, record: UtxoRecord) -> TableFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO ticket_table
                    (service_id, user_id, tx_id, event_idx, ticket_id, is_single, state, last_modified)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ",
            )
            .bind(record.service_id.as_bytes().as_slice())
            .bind(record.user_id.as_bytes().as_slice())
            .bind(record.tx_id.as_bytes().as_slice())
            .bind(i32::from(record.event_idx))
            .bind(record.ticket_id.as_bytes().as_slice())
            .bind(record.is_single)
            .bind(record.state.code())
            .bind(record.last_modified)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                insert_error(e, "ticket_table", || {
                    format!("{}:{}", record.tx_id, record.event_idx)
                })
            })?;
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
            let result = sqlx::query(
                r"
                UPDATE ticket_table
                SET state = $1, last_modified = $2
                WHERE tx_id = $3 AND event_idx = $4
                  AND ($5::SMALLINT IS NULL OR state = $5)
                ",
            )
            .bind(state.code())
            .bind(last_modified)
            .bind(tx_id.as_bytes().as_slice())
            .bind(i32::from(event_idx))
            .bind(expected.map(UtxoState::code))
            .execute(&self.pool)
            .await
            .map_err(|e| storage("update", "ticket_table", &e))?;
            Ok(result.rows_affected())
        })
    }

    fn select_utxo(&self, tx_id: TxId, event_idx: u16) -> TableFuture<'_, Option<UtxoRecord>> {
        Box::pin(async move {
            let query = format!(
                "SELECT {UTXO_COLUMNS} FROM ticket_table WHERE tx_id = $1 AND event_idx = $2"
            );
            let row = sqlx::query(&query)
                .bind(tx_id.as_bytes().as_slice())
                .bind(i32::from(event_idx))
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| storage("select from", "ticket_table", &e))?;
            row.as_ref().map(decode_utxo).transpose()
        })
    }

    fn select_utxos(&self, query: UtxoQuery) -> TableFuture<'_, Vec<UtxoRecord>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT {UTXO_COLUMNS} FROM ticket_table
                 WHERE service_id = $1 AND user_id = $2
                   AND ($3::BYTEA IS NULL OR ticket_id = $3)
                   AND ($4::SMALLINT IS NULL OR state = $4)
                 ORDER BY last_modified, tx_id, event_idx"
            );
            let rows = sqlx::query(&sql)
                .bind(query.service_id.as_bytes().as_slice())
                .bind(query.user_id.as_bytes().as_slice())
                .bind(query.ticket_id.map(|id| id.as_bytes().to_vec()))
                .bind(query.state.map(UtxoState::code))
                .fetch_all(&self.pool)
                .await
                .map_err(|e| storage("select from", "ticket_table", &e))?;
            rows.iter().map(decode_utxo).collect()
        })
    }

    fn insert_tx(&self, tx_id: TxId, tx: Vec<u8>) -> TableFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query("INSERT INTO ticket_tx_id_table (tx_id, tx) VALUES ($1, $2)")
                .bind(tx_id.as_bytes().as_slice())
                .bind(tx)
                .execute(&self.pool)
                .await
                .map_err(|e| insert_error(e, "ticket_tx_id_table", || tx_id.to_string()))?;
            Ok(())
        })
    }

    fn select_tx(&self, tx_id: TxId) -> TableFuture<'_, Option<Vec<u8>>> {
        Box::pin(async move {
            let row: Option<(Vec<u8>,)> =
                sqlx::query_as("SELECT tx FROM ticket_tx_id_table WHERE tx_id = $1")
                    .bind(tx_id.as_bytes().as_slice())
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(|e| storage("select from", "ticket_tx_id_table", &e))?;
            Ok(row.map(|(tx,)| tx))
        })
    }

    fn delete_tx(&self, tx_id: TxId) -> TableFuture<'_, bool> {
        Box::pin(async move {
            let result = sqlx::query("DELETE FROM ticket_tx_id_table WHERE tx_id = $1")
                .bind(tx_id.as_bytes().as_slice())
                .execute(&self.pool)
                .await
                .map_err(|e| storage("delete from", "ticket_tx_id_table", &e))?;
            Ok(result.rows_affected() > 0)
        })
    }

    fn insert_ticket(&self, ticket_id: TicketId, ticket: Vec<u8>) -> TableFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query("INSERT INTO ticket_id_table (ticket_id, ticket) VALUES ($1, $2)")
                .bind(ticket_id.as_bytes().as_slice())
                .bind(ticket)
                .execute(&self.pool)
                .await
                .map_err(|e| insert_error(e, "ticket_id_table", || ticket_id.to_string()))?;
            Ok(())
        })
    }

    fn select_ticket(&self, ticket_id: TicketId) -> TableFuture<'_, Option<Vec<u8>>> {
        Box::pin(async move {
            let row: Option<(Vec<u8>,)> =
                sqlx::query_as("SELECT ticket FROM ticket_id_table WHERE ticket_id = $1")
                    .bind(ticket_id.as_bytes().as_slice())
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(|e| storage("select from", "ticket_id_table", &e))?;
            Ok(row.map(|(ticket,)| ticket))
        })
    }
}
