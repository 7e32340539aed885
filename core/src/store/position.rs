use super::{currency_col, decimal_col, enum_col, money_col, opt_ts, opt_ts_col, opt_uuid_col, ts_col, uuid_col, UnitOfWork};
use crate::{
    error::{CoreError, CoreResult},
    money::Money,
    position_keeper::{Position, PriceTick},
    types::{ts_to_secs, AccountId, PositionId, Timestamp, UserId},
};
use rusqlite::{params, OptionalExtension, Row};

const POSITION_COLS: &str = "position_id, user_id, account_id, instrument_type, symbol, quantity,
     purchase_price_minor, current_price_minor, currency, status, purchased_at, last_priced_at,
     sale_price_minor, sold_at, sale_txn_id";

fn position_from_row(row: &Row<'_>) -> rusqlite::Result<Position> {
    Ok(Position {
        id: uuid_col(row, 0)?,
        user_id: uuid_col(row, 1)?,
        account_id: uuid_col(row, 2)?,
        instrument_type: enum_col(row, 3)?,
        symbol: row.get(4)?,
        quantity: decimal_col(row, 5)?,
        purchase_price: money_col(row, 6)?,
        current_price: money_col(row, 7)?,
        currency: currency_col(row, 8)?,
        status: enum_col(row, 9)?,
        purchased_at: ts_col(row, 10)?,
        last_priced_at: ts_col(row, 11)?,
        sale_price: row.get::<_, Option<i64>>(12)?.map(Money::from_minor),
        sold_at: opt_ts_col(row, 13)?,
        sale_transaction_id: opt_uuid_col(row, 14)?,
    })
}

fn tick_from_row(row: &Row<'_>) -> rusqlite::Result<PriceTick> {
    Ok(PriceTick {
        symbol: row.get(0)?,
        price: money_col(row, 1)?,
        tick_at: ts_col(row, 2)?,
        positions_updated: row.get::<_, i64>(3)?.max(0) as u64,
        applied_at: ts_col(row, 4)?,
    })
}

impl UnitOfWork {
    // ── Positions ─────────────────────────────────────────────────

    pub(crate) fn insert_position(&self, p: &Position) -> CoreResult<()> {
        self.require_write()?;
        self.conn()?.execute(
            &format!(
                "INSERT INTO position ({POSITION_COLS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
            ),
            params![
                p.id.to_string(),
                p.user_id.to_string(),
                p.account_id.to_string(),
                p.instrument_type.as_str(),
                p.symbol,
                p.quantity.to_string(),
                p.purchase_price.to_minor()?,
                p.current_price.to_minor()?,
                p.currency.as_str(),
                p.status.as_str(),
                ts_to_secs(&p.purchased_at),
                ts_to_secs(&p.last_priced_at),
                p.sale_price.map(|m| m.to_minor()).transpose()?,
                opt_ts(&p.sold_at),
                p.sale_transaction_id.map(|id| id.to_string()),
            ],
        )?;
        Ok(())
    }

    /// Quantity, symbol and currency are immutable once opened.
    pub(crate) fn update_position(&self, p: &Position) -> CoreResult<()> {
        self.require_write()?;
        let n = self.conn()?.execute(
            "UPDATE position SET current_price_minor = ?1, status = ?2, last_priced_at = ?3,
                                 sale_price_minor = ?4, sold_at = ?5, sale_txn_id = ?6
             WHERE position_id = ?7",
            params![
                p.current_price.to_minor()?,
                p.status.as_str(),
                ts_to_secs(&p.last_priced_at),
                p.sale_price.map(|m| m.to_minor()).transpose()?,
                opt_ts(&p.sold_at),
                p.sale_transaction_id.map(|id| id.to_string()),
                p.id.to_string(),
            ],
        )?;
        if n != 1 {
            return Err(CoreError::Internal(format!("position {} vanished during update", p.id)));
        }
        Ok(())
    }

    pub fn position(&self, id: PositionId) -> CoreResult<Option<Position>> {
        let sql = format!("SELECT {POSITION_COLS} FROM position WHERE position_id = ?1");
        let position = self
            .conn()?
            .query_row(&sql, params![id.to_string()], position_from_row)
            .optional()?;
        Ok(position)
    }

    pub fn positions_for_user(&self, user_id: UserId) -> CoreResult<Vec<Position>> {
        self.query_positions("user_id", &user_id.to_string())
    }

    pub fn positions_for_account(&self, account_id: AccountId) -> CoreResult<Vec<Position>> {
        self.query_positions("account_id", &account_id.to_string())
    }

    pub fn positions_for_symbol(&self, symbol: &str) -> CoreResult<Vec<Position>> {
        self.query_positions("symbol", symbol)
    }

    fn query_positions(&self, column: &str, value: &str) -> CoreResult<Vec<Position>> {
        let sql = format!(
            "SELECT {POSITION_COLS} FROM position WHERE {column} = ?1 ORDER BY purchased_at ASC, rowid ASC"
        );
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![value], position_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Price ticks ───────────────────────────────────────────────

    pub(crate) fn insert_price_tick(&self, t: &PriceTick) -> CoreResult<()> {
        self.require_write()?;
        self.conn()?.execute(
            "INSERT INTO price_tick (symbol, price_minor, tick_at, positions_updated, applied_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                t.symbol,
                t.price.to_minor()?,
                ts_to_secs(&t.tick_at),
                t.positions_updated as i64,
                ts_to_secs(&t.applied_at),
            ],
        )?;
        Ok(())
    }

    pub fn price_tick(&self, symbol: &str, price: Money, tick_at: Timestamp) -> CoreResult<Option<PriceTick>> {
        let tick = self
            .conn()?
            .query_row(
                "SELECT symbol, price_minor, tick_at, positions_updated, applied_at FROM price_tick
                 WHERE symbol = ?1 AND price_minor = ?2 AND tick_at = ?3",
                params![symbol, price.to_minor()?, ts_to_secs(&tick_at)],
                tick_from_row,
            )
            .optional()?;
        Ok(tick)
    }

    pub fn latest_price_tick(&self, symbol: &str) -> CoreResult<Option<PriceTick>> {
        let tick = self
            .conn()?
            .query_row(
                "SELECT symbol, price_minor, tick_at, positions_updated, applied_at FROM price_tick
                 WHERE symbol = ?1 ORDER BY tick_at DESC, tick_id DESC LIMIT 1",
                params![symbol],
                tick_from_row,
            )
            .optional()?;
        Ok(tick)
    }
}
