//! Investment Position Keeper: holdings in investment accounts and their
//! revaluation on external price ticks.
//!
//! RULES:
//!   - Positions live only in active investment accounts owned by the holder,
//!     in the account's currency. Currency never changes after open.
//!   - A price tick `(symbol, price, tick_at)` is applied at most once.
//!     Replaying it reports the count recorded the first time.
//!   - A tick older than a position's `last_priced_at` leaves that position alone.
//!   - Closing posts the sale proceeds `round4(quantity · sale_price)` to the
//!     account inside the same Unit of Work.

use crate::{
    clock::Clock,
    component::Component,
    config::CoreConfig,
    context::{PrincipalRole, RequestContext},
    error::{CoreError, CoreResult, Validator},
    event::AuditEvent,
    ledger::AccountType,
    money::{Currency, Money},
    store::{HistoryEntry, HistoryTable, Store},
    transaction_engine::{InternalPosting, TransactionEngine, TransactionType},
    types::{new_id, AccountId, PositionId, Timestamp, TransactionId, UserId},
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

const MAX_SYMBOL_LEN: usize = 16;

// ── Types ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentType {
    Stock,
    Bond,
    MutualFund,
    Etf,
    Crypto,
}

impl InstrumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstrumentType::Stock => "stock",
            InstrumentType::Bond => "bond",
            InstrumentType::MutualFund => "mutual_fund",
            InstrumentType::Etf => "etf",
            InstrumentType::Crypto => "crypto",
        }
    }
}

impl FromStr for InstrumentType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stock" => Ok(InstrumentType::Stock),
            "bond" => Ok(InstrumentType::Bond),
            "mutual_fund" => Ok(InstrumentType::MutualFund),
            "etf" => Ok(InstrumentType::Etf),
            "crypto" => Ok(InstrumentType::Crypto),
            other => Err(CoreError::validation("instrument_type", format!("unknown instrument type '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Pending,
    Active,
    Sold,
    Failed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Pending => "pending",
            PositionStatus::Active => "active",
            PositionStatus::Sold => "sold",
            PositionStatus::Failed => "failed",
        }
    }
}

impl FromStr for PositionStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PositionStatus::Pending),
            "active" => Ok(PositionStatus::Active),
            "sold" => Ok(PositionStatus::Sold),
            "failed" => Ok(PositionStatus::Failed),
            other => Err(CoreError::validation("status", format!("unknown position status '{other}'"))),
        }
    }
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: PositionId,
    pub user_id: UserId,
    pub account_id: AccountId,
    pub instrument_type: InstrumentType,
    pub symbol: String,
    #[serde(with = "rust_decimal::serde::arbitrary_precision")]
    pub quantity: Decimal,
    /// Unit price paid.
    pub purchase_price: Money,
    /// Unit price from the most recent tick (or the sale price once sold).
    pub current_price: Money,
    pub currency: Currency,
    pub status: PositionStatus,
    pub purchased_at: Timestamp,
    pub last_priced_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sale_price: Option<Money>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sold_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sale_transaction_id: Option<TransactionId>,
}

impl Position {
    /// `round4(quantity · purchase_price)`. Fails when the product is not a
    /// representable amount.
    pub fn cost_basis(&self) -> CoreResult<Money> {
        self.purchase_price.checked_scale_by(self.quantity, "quantity")
    }

    pub fn market_value(&self) -> CoreResult<Money> {
        self.current_price.checked_scale_by(self.quantity, "quantity")
    }

    pub fn unrealized_pnl(&self) -> CoreResult<Money> {
        Ok(self.market_value()? - self.cost_basis()?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenPosition {
    pub user_id: UserId,
    pub account_id: AccountId,
    pub instrument_type: InstrumentType,
    pub symbol: String,
    #[serde(with = "rust_decimal::serde::arbitrary_precision")]
    pub quantity: Decimal,
    pub price: Money,
    pub currency: Currency,
}

/// An applied price update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTick {
    pub symbol: String,
    pub price: Money,
    pub tick_at: Timestamp,
    pub positions_updated: u64,
    pub applied_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevalueOutcome {
    pub symbol: String,
    pub price: Money,
    pub tick_at: Timestamp,
    pub positions_updated: u64,
    /// True when this tick had already been applied.
    pub replayed: bool,
}

/// Active holdings of one user in one currency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrencyHoldings {
    pub currency: Currency,
    pub positions: usize,
    pub cost_basis: Money,
    pub market_value: Money,
    pub unrealized_pnl: Money,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSummary {
    pub user_id: UserId,
    pub holdings: Vec<CurrencyHoldings>,
}

fn normalize_symbol(symbol: &str) -> String {
    symbol.trim().to_ascii_uppercase()
}

fn check_symbol(v: &mut Validator, symbol: &str) {
    v.check(
        !symbol.is_empty()
            && symbol.len() <= MAX_SYMBOL_LEN
            && symbol.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '/')),
        "symbol",
        format!("1 to {MAX_SYMBOL_LEN} letters, digits, '.', '-' or '/'"),
    );
}

// ── Component ────────────────────────────────────────────────────────────────

pub struct PositionKeeper {
    store: Store,
    clock: Arc<dyn Clock>,
    transactions: Arc<TransactionEngine>,
    config: Arc<CoreConfig>,
}

impl Component for PositionKeeper {
    fn name(&self) -> &'static str {
        "position_keeper"
    }
}

impl PositionKeeper {
    pub fn new(
        store: Store,
        clock: Arc<dyn Clock>,
        transactions: Arc<TransactionEngine>,
        config: Arc<CoreConfig>,
    ) -> Self {
        Self { store, clock, transactions, config }
    }

    /// Record a purchase. The position is active immediately; funding the
    /// purchase is the caller's concern.
    pub fn open(&self, ctx: &RequestContext, cmd: OpenPosition) -> CoreResult<Position> {
        let symbol = normalize_symbol(&cmd.symbol);
        let mut v = Validator::new();
        check_symbol(&mut v, &symbol);
        v.check(cmd.quantity > Decimal::ZERO, "quantity", "must be greater than zero")
            .check(cmd.price.is_positive(), "price", "must be greater than zero")
            .check(cmd.price.in_range(), "price", "exceeds the largest amount")
            .check(
                self.config.is_allowed_currency(&cmd.currency),
                "currency",
                format!("{} is not an accepted currency", cmd.currency),
            )
            .finish()?;
        cmd.price.checked_scale_by(cmd.quantity, "quantity")?;

        let uow = self.store.begin(ctx)?;
        let account = uow
            .account(cmd.account_id)?
            .ok_or_else(|| CoreError::not_found("account", cmd.account_id))?;
        Validator::new()
            .check(account.user_id == cmd.user_id, "account_id", "account does not belong to the holder")
            .check(
                account.account_type == AccountType::Investment,
                "account_id",
                "positions can only be held in investment accounts",
            )
            .finish()?;
        if !account.active {
            return Err(CoreError::AccountInactive { account_id: account.id });
        }
        if account.currency != cmd.currency {
            return Err(CoreError::CurrencyMismatch {
                expected: account.currency.to_string(),
                actual: cmd.currency.to_string(),
            });
        }

        let now = self.clock.now();
        let position = Position {
            id: new_id(),
            user_id: cmd.user_id,
            account_id: cmd.account_id,
            instrument_type: cmd.instrument_type,
            symbol,
            quantity: cmd.quantity.normalize(),
            purchase_price: cmd.price,
            current_price: cmd.price,
            currency: cmd.currency,
            status: PositionStatus::Active,
            purchased_at: now,
            last_priced_at: now,
            sale_price: None,
            sold_at: None,
            sale_transaction_id: None,
        };
        uow.insert_position(&position)?;
        uow.record_history::<Position>(HistoryTable::Position, position.id, AuditEvent::PositionOpened, None, now)?;
        self.audit(&uow, position.id, AuditEvent::PositionOpened, None, Some(serde_json::to_value(&position)?), now)?;
        uow.commit()?;
        log::debug!(
            "[{}] position {} opened: {} {} @ {}",
            ctx.correlation_id, position.id, position.quantity, position.symbol, position.purchase_price
        );
        Ok(position)
    }

    /// Apply a price tick to every active position in `symbol` that has not
    /// already been priced by a later tick. `tick_at` defaults to now.
    pub fn revalue(
        &self,
        ctx: &RequestContext,
        symbol: &str,
        price: Money,
        tick_at: Option<Timestamp>,
    ) -> CoreResult<RevalueOutcome> {
        if ctx.principal.role == PrincipalRole::Customer {
            return Err(CoreError::validation("principal", "price updates come from the system price feed"));
        }
        let symbol = normalize_symbol(symbol);
        let mut v = Validator::new();
        check_symbol(&mut v, &symbol);
        v.check(price.is_positive(), "price", "must be greater than zero")
            .check(price.in_range(), "price", "exceeds the largest amount")
            .finish()?;

        let now = self.clock.now();
        let tick_at = tick_at.unwrap_or(now);
        let uow = self.store.begin(ctx)?;
        if let Some(recorded) = uow.price_tick(&symbol, price, tick_at)? {
            log::debug!("[{}] tick {symbol} {price} @ {tick_at} already applied", ctx.correlation_id);
            return Ok(RevalueOutcome {
                symbol,
                price,
                tick_at,
                positions_updated: recorded.positions_updated,
                replayed: true,
            });
        }

        let mut updated = 0u64;
        for mut position in uow.positions_for_symbol(&symbol)? {
            if position.status != PositionStatus::Active || position.last_priced_at > tick_at {
                continue;
            }
            let prior = position.clone();
            position.current_price = price;
            position.last_priced_at = tick_at;
            uow.record_history(HistoryTable::Position, position.id, AuditEvent::PositionRevalued, Some(&prior), now)?;
            uow.update_position(&position)?;
            self.audit(
                &uow,
                position.id,
                AuditEvent::PositionRevalued,
                Some(serde_json::json!({ "current_price": prior.current_price, "last_priced_at": prior.last_priced_at })),
                Some(serde_json::json!({ "current_price": price, "last_priced_at": tick_at })),
                now,
            )?;
            updated += 1;
        }
        uow.insert_price_tick(&PriceTick {
            symbol: symbol.clone(),
            price,
            tick_at,
            positions_updated: updated,
            applied_at: now,
        })?;
        uow.commit()?;
        log::debug!("[{}] tick {symbol} {price} @ {tick_at} revalued {updated} position(s)", ctx.correlation_id);
        Ok(RevalueOutcome { symbol, price, tick_at, positions_updated: updated, replayed: false })
    }

    /// active → sold. Credits `round4(quantity · sale_price)` to the account;
    /// proceeds that round to zero close the position without a posting.
    pub fn close(&self, ctx: &RequestContext, id: PositionId, sale_price: Money) -> CoreResult<Position> {
        Validator::new()
            .check(sale_price.is_positive(), "sale_price", "must be greater than zero")
            .check(sale_price.in_range(), "sale_price", "exceeds the largest amount")
            .finish()?;

        let uow = self.store.begin(ctx)?;
        let mut position = uow
            .position(id)?
            .ok_or_else(|| CoreError::not_found("position", id))?;
        if ctx.principal.role == PrincipalRole::Customer && position.user_id != ctx.principal.user_id {
            return Err(CoreError::not_found("position", id));
        }
        if position.status != PositionStatus::Active {
            return Err(CoreError::WrongState {
                entity: "position",
                id,
                state: position.status.to_string(),
                action: "close",
            });
        }

        let proceeds = sale_price.checked_scale_by(position.quantity, "sale_price")?;
        let sale = if proceeds.is_positive() {
            let posted = self.transactions.post_internal(
                &uow,
                InternalPosting {
                    user_id: position.user_id,
                    txn_type: TransactionType::Deposit,
                    source_account_id: None,
                    destination_account_id: Some(position.account_id),
                    amount: proceeds,
                    currency: position.currency.clone(),
                    description: format!("sale of {} {}", position.quantity, position.symbol),
                    category: "position_sale",
                },
            )?;
            Some(posted.id)
        } else {
            None
        };

        let now = self.clock.now();
        let prior = position.clone();
        position.status = PositionStatus::Sold;
        position.current_price = sale_price;
        position.sale_price = Some(sale_price);
        position.sold_at = Some(now);
        position.sale_transaction_id = sale;
        uow.record_history(HistoryTable::Position, id, AuditEvent::PositionClosed, Some(&prior), now)?;
        uow.update_position(&position)?;
        self.audit(
            &uow,
            id,
            AuditEvent::PositionClosed,
            Some(serde_json::to_value(&prior)?),
            Some(serde_json::to_value(&position)?),
            now,
        )?;
        uow.commit()?;
        match sale {
            Some(txn) => log::debug!(
                "[{}] position {id} sold at {sale_price}, proceeds {proceeds} via {txn}",
                ctx.correlation_id
            ),
            None => log::debug!("[{}] position {id} sold at {sale_price}, proceeds round to zero", ctx.correlation_id),
        }
        Ok(position)
    }

    pub fn get(&self, ctx: &RequestContext, id: PositionId) -> CoreResult<Position> {
        let uow = self.store.read(ctx)?;
        uow.position(id)?.ok_or_else(|| CoreError::not_found("position", id))
    }

    pub fn list_by_user(&self, ctx: &RequestContext, user_id: UserId) -> CoreResult<Vec<Position>> {
        let uow = self.store.read(ctx)?;
        uow.positions_for_user(user_id)
    }

    pub fn list_by_account(&self, ctx: &RequestContext, account_id: AccountId) -> CoreResult<Vec<Position>> {
        let uow = self.store.read(ctx)?;
        uow.positions_for_account(account_id)
    }

    pub fn list_by_symbol(&self, ctx: &RequestContext, symbol: &str) -> CoreResult<Vec<Position>> {
        let uow = self.store.read(ctx)?;
        uow.positions_for_symbol(&normalize_symbol(symbol))
    }

    /// Most recent applied tick for `symbol`, by tick time.
    pub fn latest_price(&self, ctx: &RequestContext, symbol: &str) -> CoreResult<PriceTick> {
        let symbol = normalize_symbol(symbol);
        let uow = self.store.read(ctx)?;
        uow.latest_price_tick(&symbol)?
            .ok_or_else(|| CoreError::not_found("price", symbol))
    }

    pub fn portfolio(&self, ctx: &RequestContext, user_id: UserId) -> CoreResult<PortfolioSummary> {
        let uow = self.store.read(ctx)?;
        let mut by_currency: BTreeMap<String, CurrencyHoldings> = BTreeMap::new();
        for p in uow.positions_for_user(user_id)? {
            if p.status != PositionStatus::Active {
                continue;
            }
            let entry = by_currency
                .entry(p.currency.to_string())
                .or_insert_with(|| CurrencyHoldings {
                    currency: p.currency.clone(),
                    positions: 0,
                    cost_basis: Money::ZERO,
                    market_value: Money::ZERO,
                    unrealized_pnl: Money::ZERO,
                });
            entry.positions += 1;
            entry.cost_basis = entry.cost_basis.checked_add(p.cost_basis()?, "cost_basis")?;
            entry.market_value = entry.market_value.checked_add(p.market_value()?, "market_value")?;
            entry.unrealized_pnl = entry.market_value - entry.cost_basis;
        }
        Ok(PortfolioSummary { user_id, holdings: by_currency.into_values().collect() })
    }

    pub fn history(&self, ctx: &RequestContext, id: PositionId) -> CoreResult<Vec<HistoryEntry>> {
        let uow = self.store.read(ctx)?;
        if uow.position(id)?.is_none() {
            return Err(CoreError::not_found("position", id));
        }
        uow.history(HistoryTable::Position, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ts_from_secs;

    fn position(qty: &str, bought: i64, now: i64) -> Position {
        Position {
            id: new_id(),
            user_id: new_id(),
            account_id: new_id(),
            instrument_type: InstrumentType::Stock,
            symbol: "ACME".into(),
            quantity: qty.parse().unwrap(),
            purchase_price: Money::from_major(bought),
            current_price: Money::from_major(now),
            currency: Currency::parse("USD").unwrap(),
            status: PositionStatus::Active,
            purchased_at: ts_from_secs(0),
            last_priced_at: ts_from_secs(0),
            sale_price: None,
            sold_at: None,
            sale_transaction_id: None,
        }
    }

    #[test]
    fn valuation_uses_fractional_quantity() {
        let p = position("2.5", 100, 120);
        assert_eq!(p.cost_basis().unwrap(), Money::from_major(250));
        assert_eq!(p.market_value().unwrap(), Money::from_major(300));
        assert_eq!(p.unrealized_pnl().unwrap(), Money::from_major(50));
    }

    #[test]
    fn valuation_out_of_range_is_invalid() {
        let p = position("100000000000000000000", 1_000_000_000, 1);
        let err = p.cost_basis().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
        assert!(p.market_value().is_err());
        assert!(p.unrealized_pnl().is_err());
        let p = position("1000", 1_000_000_000, 1);
        assert_eq!(p.cost_basis().unwrap(), Money::from_major(1_000_000_000_000));
    }

    #[test]
    fn valuation_rounds_to_money_scale() {
        let mut p = position("0.333333", 1, 1);
        p.current_price = "10.0001".parse().unwrap();
        assert_eq!(p.market_value().unwrap().to_string(), "3.3334");
    }

    #[test]
    fn symbols_are_normalized_and_checked() {
        assert_eq!(normalize_symbol("  brk.b "), "BRK.B");
        let mut v = Validator::new();
        check_symbol(&mut v, "");
        assert!(v.finish().is_err());
        let mut v = Validator::new();
        check_symbol(&mut v, "BTC-USD");
        assert!(v.finish().is_ok());
    }
}
