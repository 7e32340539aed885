//! Account Ledger: owns accounts and is the only component that writes
//! balance fields.
//!
//! RULES:
//!   - `apply_delta` is crate-private and only runs inside a caller's write
//!     Unit of Work (Transaction Engine, Loan Amortizer, Position Keeper).
//!   - Non-credit balances never go below zero; credit balances never go
//!     below minus the account's credit line.
//!   - Currency and account number are immutable after create.
//!   - Accounts are soft-closed, never deleted.

use crate::{
    clock::Clock,
    component::Component,
    config::CoreConfig,
    context::RequestContext,
    error::{CoreError, CoreResult, Validator},
    event::AuditEvent,
    money::{Currency, Money},
    rng::SuffixSource,
    store::{HistoryEntry, HistoryTable, Store, UnitOfWork},
    types::{new_id, AccountId, Timestamp, UserId},
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

const MAX_NAME_LEN: usize = 100;

// ── Types ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    Savings,
    Checking,
    Investment,
    Credit,
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::Savings => "savings",
            AccountType::Checking => "checking",
            AccountType::Investment => "investment",
            AccountType::Credit => "credit",
        }
    }

    /// Leading characters of every account number of this type.
    pub fn prefix(&self) -> &'static str {
        match self {
            AccountType::Savings => "SAV",
            AccountType::Checking => "CHK",
            AccountType::Investment => "INV",
            AccountType::Credit => "CRD",
        }
    }
}

impl FromStr for AccountType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "savings" => Ok(AccountType::Savings),
            "checking" => Ok(AccountType::Checking),
            "investment" => Ok(AccountType::Investment),
            "credit" => Ok(AccountType::Credit),
            other => Err(CoreError::validation(
                "account_type",
                format!("'{other}' is not one of savings, checking, investment, credit"),
            )),
        }
    }
}

impl fmt::Display for AccountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub account_number: String,
    pub user_id: UserId,
    pub name: String,
    pub account_type: AccountType,
    pub balance: Money,
    /// Only ever non-zero on credit accounts.
    pub credit_limit: Money,
    pub currency: Currency,
    pub active: bool,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<Timestamp>,
}

impl Account {
    /// Lowest balance this account may reach.
    pub fn floor(&self) -> Money {
        match self.account_type {
            AccountType::Credit => -self.credit_limit,
            _ => Money::ZERO,
        }
    }

    /// Amount that can still be debited.
    pub fn available(&self) -> Money {
        self.balance - self.floor()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenAccount {
    pub user_id: UserId,
    pub name: String,
    pub account_type: AccountType,
    pub currency: Currency,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credit_limit: Option<Money>,
}

/// Result of one balance mutation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BalanceChange {
    pub account_id: AccountId,
    pub before: Money,
    pub after: Money,
}

// ── Component ────────────────────────────────────────────────────────────────

pub struct AccountLedger {
    store: Store,
    clock: Arc<dyn Clock>,
    suffixes: Arc<dyn SuffixSource>,
    config: Arc<CoreConfig>,
}

impl Component for AccountLedger {
    fn name(&self) -> &'static str {
        "account_ledger"
    }
}

impl AccountLedger {
    pub fn new(
        store: Store,
        clock: Arc<dyn Clock>,
        suffixes: Arc<dyn SuffixSource>,
        config: Arc<CoreConfig>,
    ) -> Self {
        Self { store, clock, suffixes, config }
    }

    pub fn create(&self, ctx: &RequestContext, req: OpenAccount) -> CoreResult<Account> {
        let name = req.name.trim().to_string();
        let credit_limit = req.credit_limit.unwrap_or(Money::ZERO);
        Validator::new()
            .check(!name.is_empty(), "name", "must not be empty")
            .check(name.chars().count() <= MAX_NAME_LEN, "name", format!("at most {MAX_NAME_LEN} characters"))
            .check(
                self.config.is_allowed_currency(&req.currency),
                "currency",
                format!("{} is not an accepted currency", req.currency),
            )
            .check(!credit_limit.is_negative(), "credit_limit", "must not be negative")
            .check(credit_limit.in_range(), "credit_limit", "exceeds the largest amount")
            .check(
                req.account_type == AccountType::Credit || credit_limit.is_zero(),
                "credit_limit",
                "only credit accounts carry a credit line",
            )
            .finish()?;

        let uow = self.store.begin(ctx)?;
        let account_number = self.allocate_number(&uow, req.account_type)?;
        let now = self.clock.now();
        let account = Account {
            id: new_id(),
            account_number,
            user_id: req.user_id,
            name,
            account_type: req.account_type,
            balance: Money::ZERO,
            credit_limit,
            currency: req.currency,
            active: true,
            created_at: now,
            updated_at: now,
            closed_at: None,
        };
        uow.insert_account(&account)?;
        uow.record_history::<Account>(HistoryTable::Account, account.id, AuditEvent::AccountOpened, None, now)?;
        self.audit(&uow, account.id, AuditEvent::AccountOpened, None, Some(serde_json::to_value(&account)?), now)?;
        uow.commit()?;

        log::debug!(
            "[{}] account {} opened as {} for user {}",
            ctx.correlation_id, account.id, account.account_number, account.user_id
        );
        Ok(account)
    }

    /// Draw suffixes until one is unused, at most K times.
    fn allocate_number(&self, uow: &UnitOfWork, account_type: AccountType) -> CoreResult<String> {
        let attempts = self.config.ledger.account_number_attempts;
        for attempt in 1..=attempts {
            let candidate = format!("{}{}", account_type.prefix(), self.suffixes.next_suffix());
            if !uow.account_number_exists(&candidate)? {
                return Ok(candidate);
            }
            log::warn!(
                "[{}] account number {candidate} already taken (attempt {attempt}/{attempts})",
                uow.context().correlation_id
            );
        }
        Err(CoreError::DuplicateAccountNumber { attempts })
    }

    pub fn get(&self, ctx: &RequestContext, id: AccountId) -> CoreResult<Account> {
        let uow = self.store.read(ctx)?;
        uow.account(id)?.ok_or_else(|| CoreError::not_found("account", id))
    }

    pub fn get_by_number(&self, ctx: &RequestContext, number: &str) -> CoreResult<Account> {
        let uow = self.store.read(ctx)?;
        uow.account_by_number(number)?
            .ok_or_else(|| CoreError::not_found("account", number))
    }

    pub fn list_by_user(&self, ctx: &RequestContext, user_id: UserId) -> CoreResult<Vec<Account>> {
        let uow = self.store.read(ctx)?;
        uow.accounts_for_user(user_id)
    }

    /// Soft-close. Requires a zero balance and no open loans, active positions
    /// or in-flight transactions referencing the account.
    pub fn close(&self, ctx: &RequestContext, id: AccountId) -> CoreResult<Account> {
        let uow = self.store.begin(ctx)?;
        let account = uow.account(id)?.ok_or_else(|| CoreError::not_found("account", id))?;
        if !account.active {
            return Err(CoreError::AccountInactive { account_id: id });
        }
        if !account.balance.is_zero() {
            return Err(CoreError::AccountHasBalance { account_id: id, balance: account.balance });
        }
        let obligations = uow.account_obligations(id)?;
        if !obligations.is_empty() {
            return Err(CoreError::AccountHasObligations { account_id: id, detail: obligations.describe() });
        }

        let now = self.clock.now();
        uow.record_history(HistoryTable::Account, id, AuditEvent::AccountClosed, Some(&account), now)?;
        uow.mark_account_closed(id, now)?;
        let closed = Account {
            active: false,
            closed_at: Some(now),
            updated_at: now,
            ..account.clone()
        };
        self.audit(
            &uow,
            id,
            AuditEvent::AccountClosed,
            Some(serde_json::to_value(&account)?),
            Some(serde_json::to_value(&closed)?),
            now,
        )?;
        uow.commit()?;
        log::debug!("[{}] account {id} closed", ctx.correlation_id);
        Ok(closed)
    }

    /// Full prior-state history of an account, oldest first.
    pub fn history(&self, ctx: &RequestContext, id: AccountId) -> CoreResult<Vec<HistoryEntry>> {
        let uow = self.store.read(ctx)?;
        if uow.account(id)?.is_none() {
            return Err(CoreError::not_found("account", id));
        }
        uow.history(HistoryTable::Account, id)
    }

    // ── Unit-of-Work contract (crate-private) ───────────────────────────────

    /// Read the given accounts in ascending id order so every writer touches
    /// rows in the same sequence. Duplicates are collapsed.
    pub(crate) fn lock_accounts(&self, uow: &UnitOfWork, ids: &[AccountId]) -> CoreResult<Vec<Account>> {
        let mut ordered = ids.to_vec();
        ordered.sort();
        ordered.dedup();
        ordered
            .into_iter()
            .map(|id| uow.account(id)?.ok_or_else(|| CoreError::not_found("account", id)))
            .collect()
    }

    /// Add `delta` to the balance of `id`. Fails without writing anything if
    /// the account is inactive, in another currency, or would cross its floor.
    pub(crate) fn apply_delta(
        &self,
        uow: &UnitOfWork,
        id: AccountId,
        delta: Money,
        currency: &Currency,
    ) -> CoreResult<BalanceChange> {
        let account = uow.account(id)?.ok_or_else(|| CoreError::not_found("account", id))?;
        if !account.active {
            return Err(CoreError::AccountInactive { account_id: id });
        }
        if &account.currency != currency {
            return Err(CoreError::CurrencyMismatch {
                expected: account.currency.to_string(),
                actual: currency.to_string(),
            });
        }
        let after = account.balance.checked_add(delta, "balance")?;
        if after < account.floor() {
            return Err(CoreError::Insufficient {
                account_id: id,
                available: account.available(),
                requested: delta.abs(),
            });
        }

        let now = self.clock.now();
        uow.record_history(HistoryTable::Account, id, AuditEvent::BalanceApplied, Some(&account), now)?;
        uow.set_account_balance(id, after, now)?;
        let change = BalanceChange { account_id: id, before: account.balance, after };
        self.audit(
            uow,
            id,
            AuditEvent::BalanceApplied,
            Some(serde_json::json!({ "balance": account.balance })),
            Some(serde_json::json!({ "balance": after })),
            now,
        )?;
        log::debug!(
            "[{}] account {id} balance {} -> {after}",
            uow.context().correlation_id, account.balance
        );
        Ok(change)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes_follow_type() {
        assert_eq!(AccountType::Savings.prefix(), "SAV");
        assert_eq!(AccountType::Checking.prefix(), "CHK");
        assert_eq!(AccountType::Investment.prefix(), "INV");
        assert_eq!(AccountType::Credit.prefix(), "CRD");
    }

    #[test]
    fn unknown_type_is_a_validation_error() {
        let err = "brokerage".parse::<AccountType>().unwrap_err();
        assert_eq!(err.code(), "validation");
    }
}
