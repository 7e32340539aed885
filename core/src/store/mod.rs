//! SQLite persistence layer.
//!
//! RULE: Only the store talks to the database.
//! Components call typed methods on a [`UnitOfWork`]: they never execute SQL
//! directly. Each component's tables live in their own file here, and
//! balance-writing methods are crate-private so only the ledger reaches them.

use crate::{
    config::StoreConfig,
    context::RequestContext,
    error::{CoreError, CoreResult},
    event::{AuditEvent, AuditRecord},
    money::{Currency, Money},
    types::{ts_from_secs, ts_to_secs, EntityId, Timestamp},
};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use rusqlite::{params, types::Type, Connection, OpenFlags, Row};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

mod account;
mod audit;
mod loan;
mod position;
mod risk;
mod transaction;

pub use account::AccountObligations;
pub use transaction::TransactionQuery;

const MIGRATIONS: &[(&str, &str)] = &[
    ("001_accounts", include_str!("../../../migrations/001_accounts.sql")),
    ("002_transactions", include_str!("../../../migrations/002_transactions.sql")),
    ("003_loans", include_str!("../../../migrations/003_loans.sql")),
    ("004_positions", include_str!("../../../migrations/004_positions.sql")),
    ("005_audit", include_str!("../../../migrations/005_audit.sql")),
];

/// Shared handle to the database. Cheap to clone; every clone draws from the
/// same bounded pool of connections.
#[derive(Clone)]
pub struct Store {
    pool: Arc<Pool>,
}

struct Pool {
    idle_tx: Sender<Connection>,
    idle_rx: Receiver<Connection>,
    busy_timeout: Duration,
    path: Option<String>,
}

impl Store {
    /// Open (or create) the database at `path` with a pool of connections.
    pub fn open(path: &str, config: &StoreConfig) -> CoreResult<Self> {
        let size = config.pool_size.max(1);
        let (idle_tx, idle_rx) = bounded(size);
        for _ in 0..size {
            let conn = Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_URI
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            // WAL lets readers proceed while one writer holds the lock.
            let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
            conn.execute_batch("PRAGMA foreign_keys=ON;")?;
            idle_tx
                .send(conn)
                .map_err(|_| CoreError::Internal("connection pool closed while opening".into()))?;
        }
        log::debug!("store opened at {path} with {size} connections");
        Ok(Self {
            pool: Arc::new(Pool {
                idle_tx,
                idle_rx,
                busy_timeout: Duration::from_millis(config.busy_timeout_ms),
                path: Some(path.to_string()),
            }),
        })
    }

    /// Open an in-memory database (used in tests). A private in-memory
    /// database cannot be shared between connections, so the pool holds one
    /// and units of work serialize on it.
    pub fn in_memory() -> CoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let (idle_tx, idle_rx) = bounded(1);
        idle_tx
            .send(conn)
            .map_err(|_| CoreError::Internal("connection pool closed while opening".into()))?;
        Ok(Self {
            pool: Arc::new(Pool {
                idle_tx,
                idle_rx,
                busy_timeout: Duration::from_millis(StoreConfig::default().busy_timeout_ms),
                path: None,
            }),
        })
    }

    pub fn path(&self) -> Option<&str> {
        self.pool.path.as_deref()
    }

    /// Apply all schema migrations in order. Safe to run repeatedly.
    pub fn migrate(&self) -> CoreResult<()> {
        let conn = self.checkout(&RequestContext::system())?;
        for (name, sql) in MIGRATIONS {
            conn.execute_batch(sql)?;
            log::debug!("migration {name} applied");
        }
        Ok(())
    }

    /// Begin a write unit of work. Takes the database write lock up front so
    /// balance reads inside it cannot go stale before the write.
    pub fn begin(&self, ctx: &RequestContext) -> CoreResult<UnitOfWork> {
        UnitOfWork::start(self.checkout(ctx)?, ctx.clone(), Mode::Write)
    }

    /// Begin a read-only unit of work over a consistent snapshot.
    pub fn read(&self, ctx: &RequestContext) -> CoreResult<UnitOfWork> {
        UnitOfWork::start(self.checkout(ctx)?, ctx.clone(), Mode::Read)
    }

    fn checkout(&self, ctx: &RequestContext) -> CoreResult<PooledConnection> {
        ctx.check()?;
        let wait = ctx.clamp(self.pool.busy_timeout);
        let conn = match self.pool.idle_rx.recv_timeout(wait) {
            Ok(conn) => conn,
            Err(RecvTimeoutError::Timeout) => {
                ctx.check()?;
                return Err(CoreError::Unavailable {
                    dependency: "store".into(),
                    message: format!("no connection free within {wait:?}"),
                });
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(CoreError::Internal("connection pool disconnected".into()))
            }
        };
        conn.busy_timeout(wait)?;
        Ok(PooledConnection {
            conn: Some(conn),
            home: self.pool.idle_tx.clone(),
        })
    }
}

struct PooledConnection {
    conn: Option<Connection>,
    home: Sender<Connection>,
}

impl std::ops::Deref for PooledConnection {
    type Target = Connection;
    fn deref(&self) -> &Connection {
        // Only taken in Drop.
        self.conn.as_ref().expect("pooled connection present until drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let _ = self.home.send(conn);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Read,
    Write,
}

/// A transactional boundary over the store. Rolls back on drop unless
/// [`commit`](UnitOfWork::commit) succeeded.
pub struct UnitOfWork {
    conn: PooledConnection,
    ctx: RequestContext,
    mode: Mode,
    open: bool,
    savepoints: u32,
}

impl UnitOfWork {
    fn start(conn: PooledConnection, ctx: RequestContext, mode: Mode) -> CoreResult<Self> {
        let begin = match mode {
            Mode::Write => "BEGIN IMMEDIATE",
            Mode::Read => "BEGIN DEFERRED",
        };
        conn.execute_batch(begin).map_err(|e| match e.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked) => {
                if ctx.check().is_err() {
                    CoreError::DeadlineExceeded
                } else {
                    CoreError::Unavailable {
                        dependency: "store".into(),
                        message: "write lock not acquired within busy timeout".into(),
                    }
                }
            }
            _ => CoreError::Database(e),
        })?;
        Ok(Self { conn, ctx, mode, open: true, savepoints: 0 })
    }

    pub fn context(&self) -> &RequestContext {
        &self.ctx
    }

    /// Connection for one statement. Fails fast once the deadline passes so
    /// nothing further is written to a unit that will be rolled back anyway.
    fn conn(&self) -> CoreResult<&Connection> {
        self.ctx.check()?;
        Ok(&self.conn)
    }

    fn require_write(&self) -> CoreResult<()> {
        if self.mode == Mode::Read {
            return Err(CoreError::Internal("write attempted in a read-only unit of work".into()));
        }
        Ok(())
    }

    /// Commit. If the caller's deadline expired meanwhile, roll back instead:
    /// a late result is never partially committed.
    pub fn commit(mut self) -> CoreResult<()> {
        if let Err(e) = self.ctx.check() {
            self.finish("ROLLBACK");
            log::warn!("[{}] unit of work rolled back: {e}", self.ctx.correlation_id);
            return Err(e);
        }
        self.conn.execute_batch("COMMIT")?;
        self.open = false;
        Ok(())
    }

    pub fn rollback(mut self) {
        self.finish("ROLLBACK");
    }

    fn finish(&mut self, sql: &str) {
        if self.open {
            if let Err(e) = self.conn.execute_batch(sql) {
                log::warn!("[{}] {sql} failed: {e}", self.ctx.correlation_id);
            }
            self.open = false;
        }
    }

    /// Run `f` inside a savepoint. On error only the savepoint's writes are
    /// undone and the error is returned; the unit of work stays usable.
    pub fn attempt<T>(&mut self, f: impl FnOnce(&mut UnitOfWork) -> CoreResult<T>) -> CoreResult<T> {
        self.savepoints += 1;
        let name = format!("sp_{}", self.savepoints);
        self.conn()?.execute_batch(&format!("SAVEPOINT {name}"))?;
        match f(self) {
            Ok(value) => {
                self.conn.execute_batch(&format!("RELEASE {name}"))?;
                Ok(value)
            }
            Err(e) => {
                self.conn
                    .execute_batch(&format!("ROLLBACK TO {name}; RELEASE {name}"))?;
                Err(e)
            }
        }
    }

    // ── History ────────────────────────────────────────────────

    /// Append the full prior state of an entity to its history table.
    pub(crate) fn record_history<T: Serialize>(
        &self,
        table: HistoryTable,
        entity_id: EntityId,
        event: AuditEvent,
        prior: Option<&T>,
        at: Timestamp,
    ) -> CoreResult<()> {
        self.require_write()?;
        let prior_json = prior.map(serde_json::to_string).transpose()?;
        let sql = format!(
            "INSERT INTO {} (entity_id, event, prior_state, recorded_at) VALUES (?1, ?2, ?3, ?4)",
            table.name()
        );
        self.conn()?.execute(
            &sql,
            params![entity_id.to_string(), event.code(), prior_json, ts_to_secs(&at)],
        )?;
        Ok(())
    }

    /// History rows recorded for an entity, oldest first.
    pub fn history(&self, table: HistoryTable, entity_id: EntityId) -> CoreResult<Vec<HistoryEntry>> {
        let sql = format!(
            "SELECT history_id, entity_id, event, prior_state, recorded_at
             FROM {} WHERE entity_id = ?1 ORDER BY history_id ASC",
            table.name()
        );
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![entity_id.to_string()], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    uuid_col(row, 1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    ts_col(row, 4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(history_id, entity_id, event, prior, recorded_at)| -> CoreResult<HistoryEntry> {
                Ok(HistoryEntry {
                    history_id,
                    entity_id,
                    event,
                    prior_state: prior.map(|p| serde_json::from_str(&p)).transpose()?,
                    recorded_at,
                })
            })
            .collect()
    }

    pub fn append_audit(&self, record: &AuditRecord) -> CoreResult<()> {
        self.require_write()?;
        audit::insert(self.conn()?, record)
    }
}

impl Drop for UnitOfWork {
    fn drop(&mut self) {
        if self.open && self.mode == Mode::Write {
            log::debug!("[{}] unit of work dropped without commit, rolling back", self.ctx.correlation_id);
        }
        self.finish("ROLLBACK");
    }
}

/// One row of a `*_history` table: the entity as it was before `event`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub history_id: i64,
    pub entity_id: EntityId,
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prior_state: Option<serde_json::Value>,
    pub recorded_at: Timestamp,
}

/// Append-only history tables, one per owned entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryTable {
    Account,
    Transaction,
    Loan,
    Position,
}

impl HistoryTable {
    fn name(&self) -> &'static str {
        match self {
            HistoryTable::Account => "account_history",
            HistoryTable::Transaction => "txn_history",
            HistoryTable::Loan => "loan_history",
            HistoryTable::Position => "position_history",
        }
    }
}

// ── Column helpers ─────────────────────────────────────────────

fn conversion_err<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

pub(crate) fn uuid_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let s: String = row.get(idx)?;
    Uuid::parse_str(&s).map_err(|e| conversion_err(idx, e))
}

pub(crate) fn opt_uuid_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    let s: Option<String> = row.get(idx)?;
    s.map(|s| Uuid::parse_str(&s).map_err(|e| conversion_err(idx, e)))
        .transpose()
}

pub(crate) fn money_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Money> {
    Ok(Money::from_minor(row.get::<_, i64>(idx)?))
}

pub(crate) fn decimal_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let s: String = row.get(idx)?;
    Decimal::from_str(&s).map_err(|e| conversion_err(idx, e))
}

pub(crate) fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Timestamp> {
    Ok(ts_from_secs(row.get::<_, i64>(idx)?))
}

pub(crate) fn opt_ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Timestamp>> {
    Ok(row.get::<_, Option<i64>>(idx)?.map(ts_from_secs))
}

pub(crate) fn currency_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Currency> {
    let s: String = row.get(idx)?;
    Currency::parse(&s).map_err(|e| conversion_err(idx, e))
}

/// Parse an enum persisted by its `as_str()` form.
pub(crate) fn enum_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = CoreError>,
{
    let s: String = row.get(idx)?;
    s.parse::<T>().map_err(|e| conversion_err(idx, e))
}

pub(crate) fn opt_enum_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr<Err = CoreError>,
{
    let s: Option<String> = row.get(idx)?;
    s.map(|s| s.parse::<T>().map_err(|e| conversion_err(idx, e)))
        .transpose()
}

pub(crate) fn opt_ts(ts: &Option<Timestamp>) -> Option<i64> {
    ts.as_ref().map(ts_to_secs)
}
