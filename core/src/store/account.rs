use super::{currency_col, enum_col, money_col, opt_ts_col, ts_col, uuid_col, UnitOfWork};
use crate::{
    error::CoreResult,
    ledger::Account,
    money::{Currency, Money},
    types::{ts_to_secs, AccountId, Timestamp, UserId},
};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

const ACCOUNT_COLS: &str = "account_id, account_number, user_id, name, account_type, balance_minor,
     credit_limit_minor, currency, active, created_at, updated_at, closed_at";

fn account_from_row(row: &Row<'_>) -> rusqlite::Result<Account> {
    Ok(Account {
        id: uuid_col(row, 0)?,
        account_number: row.get(1)?,
        user_id: uuid_col(row, 2)?,
        name: row.get(3)?,
        account_type: enum_col(row, 4)?,
        balance: money_col(row, 5)?,
        credit_limit: money_col(row, 6)?,
        currency: currency_col(row, 7)?,
        active: row.get(8)?,
        created_at: ts_col(row, 9)?,
        updated_at: ts_col(row, 10)?,
        closed_at: opt_ts_col(row, 11)?,
    })
}

/// Open references that keep an account from being closed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountObligations {
    pub open_loans: i64,
    pub active_positions: i64,
    pub open_transactions: i64,
}

impl AccountObligations {
    pub fn is_empty(&self) -> bool {
        self.open_loans == 0 && self.active_positions == 0 && self.open_transactions == 0
    }

    pub fn describe(&self) -> String {
        format!(
            "{} open loan(s), {} active position(s), {} unsettled transaction(s)",
            self.open_loans, self.active_positions, self.open_transactions
        )
    }
}

impl UnitOfWork {
    // ── Account ───────────────────────────────────────────────────

    pub(crate) fn insert_account(&self, a: &Account) -> CoreResult<()> {
        self.require_write()?;
        self.conn()?.execute(
            "INSERT INTO account (account_id, account_number, user_id, name, account_type, balance_minor,
                                  credit_limit_minor, currency, active, created_at, updated_at, closed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, NULL)",
            params![
                a.id.to_string(),
                a.account_number,
                a.user_id.to_string(),
                a.name,
                a.account_type.as_str(),
                a.balance.to_minor()?,
                a.credit_limit.to_minor()?,
                a.currency.as_str(),
                a.active,
                ts_to_secs(&a.created_at),
                ts_to_secs(&a.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn account(&self, id: AccountId) -> CoreResult<Option<Account>> {
        let sql = format!("SELECT {ACCOUNT_COLS} FROM account WHERE account_id = ?1");
        let account = self
            .conn()?
            .query_row(&sql, params![id.to_string()], account_from_row)
            .optional()?;
        Ok(account)
    }

    pub fn account_by_number(&self, number: &str) -> CoreResult<Option<Account>> {
        let sql = format!("SELECT {ACCOUNT_COLS} FROM account WHERE account_number = ?1");
        let account = self
            .conn()?
            .query_row(&sql, params![number], account_from_row)
            .optional()?;
        Ok(account)
    }

    pub fn accounts_for_user(&self, user_id: UserId) -> CoreResult<Vec<Account>> {
        let sql = format!(
            "SELECT {ACCOUNT_COLS} FROM account WHERE user_id = ?1 ORDER BY created_at ASC, account_number ASC"
        );
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![user_id.to_string()], account_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn account_number_exists(&self, number: &str) -> CoreResult<bool> {
        let n: i64 = self.conn()?.query_row(
            "SELECT COUNT(*) FROM account WHERE account_number = ?1",
            params![number],
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }

    pub(crate) fn set_account_balance(&self, id: AccountId, balance: Money, at: Timestamp) -> CoreResult<()> {
        self.require_write()?;
        self.conn()?.execute(
            "UPDATE account SET balance_minor = ?1, updated_at = ?2 WHERE account_id = ?3",
            params![balance.to_minor()?, ts_to_secs(&at), id.to_string()],
        )?;
        Ok(())
    }

    pub(crate) fn mark_account_closed(&self, id: AccountId, at: Timestamp) -> CoreResult<()> {
        self.require_write()?;
        self.conn()?.execute(
            "UPDATE account SET active = 0, closed_at = ?1, updated_at = ?1 WHERE account_id = ?2",
            params![ts_to_secs(&at), id.to_string()],
        )?;
        Ok(())
    }

    pub fn account_obligations(&self, id: AccountId) -> CoreResult<AccountObligations> {
        let conn = self.conn()?;
        let id = id.to_string();
        let open_loans: i64 = conn.query_row(
            "SELECT COUNT(*) FROM loan
             WHERE account_id = ?1 AND status IN ('pending', 'approved', 'active')",
            params![id],
            |row| row.get(0),
        )?;
        let active_positions: i64 = conn.query_row(
            "SELECT COUNT(*) FROM position WHERE account_id = ?1 AND status IN ('active', 'pending')",
            params![id],
            |row| row.get(0),
        )?;
        let open_transactions: i64 = conn.query_row(
            "SELECT COUNT(*) FROM txn
             WHERE (source_account_id = ?1 OR destination_account_id = ?1)
               AND status IN ('pending', 'approved', 'flagged')",
            params![id],
            |row| row.get(0),
        )?;
        Ok(AccountObligations { open_loans, active_positions, open_transactions })
    }

    /// Sum of every account balance held in `currency`.
    pub fn total_balance(&self, currency: &Currency) -> CoreResult<Money> {
        let minor: i64 = self.conn()?.query_row(
            "SELECT COALESCE(SUM(balance_minor), 0) FROM account WHERE currency = ?1",
            params![currency.as_str()],
            |row| row.get(0),
        )?;
        Ok(Money::from_minor(minor))
    }
}
