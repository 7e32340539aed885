use super::{currency_col, enum_col, money_col, opt_enum_col, opt_ts, opt_ts_col, opt_uuid_col, ts_col, uuid_col, UnitOfWork};
use crate::{
    error::{CoreError, CoreResult},
    transaction_engine::{Transaction, TransactionStatus, TransactionType},
    types::{ts_to_secs, AccountId, Timestamp, TransactionId, UserId},
};
use rusqlite::{params, types::Value as SqlValue, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

const TXN_COLS: &str = "txn_id, user_id, idempotency_key, txn_type, source_account_id, destination_account_id,
     amount_minor, currency, status, status_reason, risk_level, risk_score, description, category,
     metadata, reviewed_by, review_notes, created_at, updated_at, approved_at, flagged_at,
     rejected_at, completed_at, failed_at, cancelled_at";

const DEFAULT_PAGE: u32 = 100;
const MAX_PAGE: u32 = 1000;

/// Listing filter. Every field is optional; results are newest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionQuery {
    pub status: Option<TransactionStatus>,
    pub txn_type: Option<TransactionType>,
    /// Inclusive lower bound on `created_at`.
    pub from: Option<Timestamp>,
    /// Exclusive upper bound on `created_at`.
    pub to: Option<Timestamp>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// Raw row; metadata is decoded after the statement finishes.
struct TxnRow {
    txn: Transaction,
    metadata: String,
}

fn txn_from_row(row: &Row<'_>) -> rusqlite::Result<TxnRow> {
    Ok(TxnRow {
        txn: Transaction {
            id: uuid_col(row, 0)?,
            user_id: uuid_col(row, 1)?,
            idempotency_key: row.get(2)?,
            txn_type: enum_col(row, 3)?,
            source_account_id: opt_uuid_col(row, 4)?,
            destination_account_id: opt_uuid_col(row, 5)?,
            amount: money_col(row, 6)?,
            currency: currency_col(row, 7)?,
            status: enum_col(row, 8)?,
            status_reason: row.get(9)?,
            risk_level: opt_enum_col(row, 10)?,
            risk_score: row.get(11)?,
            description: row.get(12)?,
            category: row.get(13)?,
            metadata: Default::default(),
            reviewed_by: opt_uuid_col(row, 15)?,
            review_notes: row.get(16)?,
            created_at: ts_col(row, 17)?,
            updated_at: ts_col(row, 18)?,
            approved_at: opt_ts_col(row, 19)?,
            flagged_at: opt_ts_col(row, 20)?,
            rejected_at: opt_ts_col(row, 21)?,
            completed_at: opt_ts_col(row, 22)?,
            failed_at: opt_ts_col(row, 23)?,
            cancelled_at: opt_ts_col(row, 24)?,
        },
        metadata: row.get(14)?,
    })
}

fn decode(raw: TxnRow) -> CoreResult<Transaction> {
    let mut txn = raw.txn;
    txn.metadata = serde_json::from_str(&raw.metadata)?;
    Ok(txn)
}

impl UnitOfWork {
    // ── Transactions ──────────────────────────────────────────────

    pub(crate) fn insert_transaction(&self, t: &Transaction, fingerprint: Option<&str>) -> CoreResult<()> {
        self.require_write()?;
        self.conn()?.execute(
            &format!(
                "INSERT INTO txn ({TXN_COLS}, request_fingerprint)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                         ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26)"
            ),
            params![
                t.id.to_string(),
                t.user_id.to_string(),
                t.idempotency_key,
                t.txn_type.as_str(),
                t.source_account_id.map(|id| id.to_string()),
                t.destination_account_id.map(|id| id.to_string()),
                t.amount.to_minor()?,
                t.currency.as_str(),
                t.status.as_str(),
                t.status_reason,
                t.risk_level.map(|l| l.as_str()),
                t.risk_score,
                t.description,
                t.category,
                serde_json::to_string(&t.metadata)?,
                t.reviewed_by.map(|id| id.to_string()),
                t.review_notes,
                ts_to_secs(&t.created_at),
                ts_to_secs(&t.updated_at),
                opt_ts(&t.approved_at),
                opt_ts(&t.flagged_at),
                opt_ts(&t.rejected_at),
                opt_ts(&t.completed_at),
                opt_ts(&t.failed_at),
                opt_ts(&t.cancelled_at),
                fingerprint,
            ],
        )?;
        Ok(())
    }

    /// Persist the mutable part of a transaction: status, reasons, risk,
    /// review and lifecycle timestamps. Amount, accounts and currency are
    /// never rewritten.
    pub(crate) fn update_transaction(&self, t: &Transaction) -> CoreResult<()> {
        self.require_write()?;
        let n = self.conn()?.execute(
            "UPDATE txn SET status = ?1, status_reason = ?2, risk_level = ?3, risk_score = ?4,
                            reviewed_by = ?5, review_notes = ?6, updated_at = ?7, approved_at = ?8,
                            flagged_at = ?9, rejected_at = ?10, completed_at = ?11, failed_at = ?12,
                            cancelled_at = ?13
             WHERE txn_id = ?14",
            params![
                t.status.as_str(),
                t.status_reason,
                t.risk_level.map(|l| l.as_str()),
                t.risk_score,
                t.reviewed_by.map(|id| id.to_string()),
                t.review_notes,
                ts_to_secs(&t.updated_at),
                opt_ts(&t.approved_at),
                opt_ts(&t.flagged_at),
                opt_ts(&t.rejected_at),
                opt_ts(&t.completed_at),
                opt_ts(&t.failed_at),
                opt_ts(&t.cancelled_at),
                t.id.to_string(),
            ],
        )?;
        if n != 1 {
            return Err(CoreError::Internal(format!("transaction {} vanished during update", t.id)));
        }
        Ok(())
    }

    pub fn transaction(&self, id: TransactionId) -> CoreResult<Option<Transaction>> {
        let sql = format!("SELECT {TXN_COLS} FROM txn WHERE txn_id = ?1");
        self.conn()?
            .query_row(&sql, params![id.to_string()], txn_from_row)
            .optional()?
            .map(decode)
            .transpose()
    }

    /// The stored transaction for `(user, key)` and the fingerprint of the
    /// request that created it.
    pub(crate) fn transaction_by_key(&self, user_id: UserId, key: &str) -> CoreResult<Option<(Transaction, Option<String>)>> {
        let sql = format!(
            "SELECT {TXN_COLS}, request_fingerprint FROM txn WHERE user_id = ?1 AND idempotency_key = ?2"
        );
        let found = self
            .conn()?
            .query_row(&sql, params![user_id.to_string(), key], |row| {
                Ok((txn_from_row(row)?, row.get::<_, Option<String>>(25)?))
            })
            .optional()?;
        match found {
            Some((raw, fingerprint)) => Ok(Some((decode(raw)?, fingerprint))),
            None => Ok(None),
        }
    }

    pub fn transactions_for_user(&self, user_id: UserId, q: &TransactionQuery) -> CoreResult<Vec<Transaction>> {
        self.query_transactions("user_id = ?", vec![SqlValue::Text(user_id.to_string())], q)
    }

    pub fn transactions_for_account(&self, account_id: AccountId, q: &TransactionQuery) -> CoreResult<Vec<Transaction>> {
        let id = account_id.to_string();
        self.query_transactions(
            "(source_account_id = ? OR destination_account_id = ?)",
            vec![SqlValue::Text(id.clone()), SqlValue::Text(id)],
            q,
        )
    }

    fn query_transactions(&self, scope: &str, mut args: Vec<SqlValue>, q: &TransactionQuery) -> CoreResult<Vec<Transaction>> {
        let mut sql = format!("SELECT {TXN_COLS} FROM txn WHERE {scope}");
        if let Some(status) = q.status {
            sql.push_str(" AND status = ?");
            args.push(SqlValue::Text(status.as_str().into()));
        }
        if let Some(kind) = q.txn_type {
            sql.push_str(" AND txn_type = ?");
            args.push(SqlValue::Text(kind.as_str().into()));
        }
        if let Some(from) = &q.from {
            sql.push_str(" AND created_at >= ?");
            args.push(SqlValue::Integer(ts_to_secs(from)));
        }
        if let Some(to) = &q.to {
            sql.push_str(" AND created_at < ?");
            args.push(SqlValue::Integer(ts_to_secs(to)));
        }
        sql.push_str(" ORDER BY created_at DESC, rowid DESC LIMIT ? OFFSET ?");
        args.push(SqlValue::Integer(i64::from(q.limit.unwrap_or(DEFAULT_PAGE).min(MAX_PAGE))));
        args.push(SqlValue::Integer(i64::from(q.offset.unwrap_or(0))));

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let raw = stmt
            .query_map(rusqlite::params_from_iter(args), txn_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter().map(decode).collect()
    }

    /// The user's last `limit` completed transactions created at or before
    /// `at`, newest first, excluding `exclude`.
    pub fn scoring_history(
        &self,
        user_id: UserId,
        exclude: TransactionId,
        at: Timestamp,
        limit: usize,
    ) -> CoreResult<Vec<Transaction>> {
        let sql = format!(
            "SELECT {TXN_COLS} FROM txn
             WHERE user_id = ?1 AND status = 'completed' AND txn_id <> ?2 AND created_at <= ?3
             ORDER BY created_at DESC, rowid DESC LIMIT ?4"
        );
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let raw = stmt
            .query_map(
                params![user_id.to_string(), exclude.to_string(), ts_to_secs(&at), limit as i64],
                txn_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter().map(decode).collect()
    }
}
