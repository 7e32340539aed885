//! Loan Amortizer: loan lifecycle, schedules and payment application.
//!
//! LIFECYCLE:
//!   pending → approved | rejected
//!   approved → active        (disburse)
//!   active → paid            (remaining principal ≤ epsilon)
//!   active → defaulted       (missed installments > D, via check_overdue or decide)
//!
//! RULES:
//!   - Derived terms (monthly payment, totals) are fixed when the loan is applied for.
//!   - Money reaches the borrower's account only through internal postings of
//!     the Transaction Engine, inside the same Unit of Work as the loan update.
//!   - Applied principal never exceeds the outstanding balance; any excess is
//!     returned to the borrower in the same Unit of Work.

use crate::{
    amortization::{self, LoanTerms, ScheduledInstallment},
    clock::Clock,
    component::Component,
    config::CoreConfig,
    context::{PrincipalRole, RequestContext},
    error::{CoreError, CoreResult, Validator},
    event::AuditEvent,
    ledger::Account,
    money::{Currency, Money},
    store::{HistoryEntry, HistoryTable, Store, UnitOfWork},
    transaction_engine::{InternalPosting, TransactionEngine, TransactionType},
    types::{new_id, AccountId, LoanId, Timestamp, TransactionId, UserId},
};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

const MAX_TERM_MONTHS: u32 = 600;

// ── Types ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoanType {
    Personal,
    Mortgage,
    Business,
    Education,
}

impl LoanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoanType::Personal => "personal",
            LoanType::Mortgage => "mortgage",
            LoanType::Business => "business",
            LoanType::Education => "education",
        }
    }
}

impl FromStr for LoanType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "personal" => Ok(LoanType::Personal),
            "mortgage" => Ok(LoanType::Mortgage),
            "business" => Ok(LoanType::Business),
            "education" => Ok(LoanType::Education),
            other => Err(CoreError::validation("loan_type", format!("unknown loan type '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoanStatus {
    Pending,
    Approved,
    Rejected,
    Active,
    Paid,
    Defaulted,
}

impl LoanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoanStatus::Pending => "pending",
            LoanStatus::Approved => "approved",
            LoanStatus::Rejected => "rejected",
            LoanStatus::Active => "active",
            LoanStatus::Paid => "paid",
            LoanStatus::Defaulted => "defaulted",
        }
    }

    pub fn can_transition_to(&self, next: LoanStatus) -> bool {
        use LoanStatus::*;
        matches!(
            (self, next),
            (Pending, Approved) | (Pending, Rejected) | (Approved, Active) | (Active, Paid) | (Active, Defaulted)
        )
    }

    fn event(&self) -> AuditEvent {
        match self {
            LoanStatus::Pending => AuditEvent::LoanApplied,
            LoanStatus::Approved => AuditEvent::LoanApproved,
            LoanStatus::Rejected => AuditEvent::LoanRejected,
            LoanStatus::Active => AuditEvent::LoanDisbursed,
            LoanStatus::Paid => AuditEvent::LoanPaid,
            LoanStatus::Defaulted => AuditEvent::LoanDefaulted,
        }
    }
}

impl FromStr for LoanStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(LoanStatus::Pending),
            "approved" => Ok(LoanStatus::Approved),
            "rejected" => Ok(LoanStatus::Rejected),
            "active" => Ok(LoanStatus::Active),
            "paid" => Ok(LoanStatus::Paid),
            "defaulted" => Ok(LoanStatus::Defaulted),
            other => Err(CoreError::validation("status", format!("unknown loan status '{other}'"))),
        }
    }
}

impl fmt::Display for LoanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Loan {
    pub id: LoanId,
    pub user_id: UserId,
    pub account_id: AccountId,
    pub loan_type: LoanType,
    pub principal: Money,
    /// Principal not yet repaid.
    pub outstanding: Money,
    #[serde(with = "rust_decimal::serde::arbitrary_precision")]
    pub annual_rate: Decimal,
    pub term_months: u32,
    pub monthly_payment: Money,
    pub total_interest: Money,
    pub total_amount: Money,
    pub currency: Currency,
    pub status: LoanStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
    /// Reviewer notes from the last decision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewed_by: Option<UserId>,
    pub applied_at: Timestamp,
    pub updated_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejected_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disbursed_at: Option<Timestamp>,
    /// Interest has been settled up to this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_accrual_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paid_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defaulted_at: Option<Timestamp>,
}

impl Loan {
    pub fn terms(&self) -> LoanTerms {
        LoanTerms {
            monthly_payment: self.monthly_payment,
            total_amount: self.total_amount,
            total_interest: self.total_interest,
        }
    }

    fn stamp(&mut self, status: LoanStatus, at: Timestamp) {
        self.status = status;
        self.updated_at = at;
        match status {
            LoanStatus::Pending => {}
            LoanStatus::Approved => self.approved_at = Some(at),
            LoanStatus::Rejected => self.rejected_at = Some(at),
            LoanStatus::Active => {
                self.disbursed_at = Some(at);
                self.last_accrual_at = Some(at);
            }
            LoanStatus::Paid => self.paid_at = Some(at),
            LoanStatus::Defaulted => self.defaulted_at = Some(at),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoanPayment {
    pub id: uuid::Uuid,
    pub loan_id: LoanId,
    /// The payment transaction debiting the borrower account.
    pub transaction_id: TransactionId,
    pub amount: Money,
    pub principal_portion: Money,
    pub interest_portion: Money,
    /// Part of `amount` credited back because it exceeded the outstanding principal.
    pub refunded: Money,
    pub paid_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyLoan {
    pub user_id: UserId,
    pub account_id: AccountId,
    pub loan_type: LoanType,
    pub principal: Money,
    #[serde(with = "rust_decimal::serde::arbitrary_precision")]
    pub annual_rate: Decimal,
    pub term_months: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoanDecision {
    Approve,
    Reject,
    Default,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverdueReport {
    pub loan_id: LoanId,
    pub status: LoanStatus,
    pub installments_due: u32,
    pub installments_paid: u32,
    pub missed: u32,
    pub threshold: u32,
    /// True if this call moved the loan to `defaulted`.
    pub defaulted: bool,
}

// ── Component ────────────────────────────────────────────────────────────────

pub struct LoanAmortizer {
    store: Store,
    clock: Arc<dyn Clock>,
    transactions: Arc<TransactionEngine>,
    config: Arc<CoreConfig>,
}

impl Component for LoanAmortizer {
    fn name(&self) -> &'static str {
        "loan_amortizer"
    }
}

impl LoanAmortizer {
    pub fn new(
        store: Store,
        clock: Arc<dyn Clock>,
        transactions: Arc<TransactionEngine>,
        config: Arc<CoreConfig>,
    ) -> Self {
        Self { store, clock, transactions, config }
    }

    pub fn apply(&self, ctx: &RequestContext, cmd: ApplyLoan) -> CoreResult<Loan> {
        Validator::new()
            .check(cmd.principal.is_positive(), "principal", "must be greater than zero")
            .check(cmd.principal.in_range(), "principal", "exceeds the largest amount")
            .check(
                cmd.annual_rate >= Decimal::ZERO && cmd.annual_rate <= Decimal::ONE,
                "annual_rate",
                "must be between 0 and 1",
            )
            .check(
                (1..=MAX_TERM_MONTHS).contains(&cmd.term_months),
                "term_months",
                format!("must be between 1 and {MAX_TERM_MONTHS}"),
            )
            .finish()?;

        let terms = amortization::loan_terms(cmd.principal, cmd.annual_rate, cmd.term_months)?;

        let uow = self.store.begin(ctx)?;
        let account = self.borrower_account(&uow, cmd.account_id, cmd.user_id)?;
        let now = self.clock.now();
        let loan = Loan {
            id: new_id(),
            user_id: cmd.user_id,
            account_id: cmd.account_id,
            loan_type: cmd.loan_type,
            principal: cmd.principal,
            outstanding: cmd.principal,
            annual_rate: cmd.annual_rate.normalize(),
            term_months: cmd.term_months,
            monthly_payment: terms.monthly_payment,
            total_interest: terms.total_interest,
            total_amount: terms.total_amount,
            currency: account.currency,
            status: LoanStatus::Pending,
            purpose: cmd.purpose,
            notes: None,
            reviewed_by: None,
            applied_at: now,
            updated_at: now,
            approved_at: None,
            rejected_at: None,
            disbursed_at: None,
            last_accrual_at: None,
            paid_at: None,
            defaulted_at: None,
        };
        uow.insert_loan(&loan)?;
        uow.record_history::<Loan>(HistoryTable::Loan, loan.id, AuditEvent::LoanApplied, None, now)?;
        self.audit(&uow, loan.id, AuditEvent::LoanApplied, None, Some(serde_json::to_value(&loan)?), now)?;
        uow.commit()?;
        log::debug!(
            "[{}] loan {} applied: {} over {} months at {}, monthly {}",
            ctx.correlation_id, loan.id, loan.principal, loan.term_months, loan.annual_rate, loan.monthly_payment
        );
        Ok(loan)
    }

    fn borrower_account(&self, uow: &UnitOfWork, account_id: AccountId, user_id: UserId) -> CoreResult<Account> {
        let account = uow
            .account(account_id)?
            .ok_or_else(|| CoreError::not_found("account", account_id))?;
        if account.user_id != user_id {
            return Err(CoreError::validation("account_id", "account does not belong to the borrower"));
        }
        if !account.active {
            return Err(CoreError::AccountInactive { account_id });
        }
        Ok(account)
    }

    fn load(&self, uow: &UnitOfWork, id: LoanId) -> CoreResult<Loan> {
        uow.loan(id)?.ok_or_else(|| CoreError::not_found("loan", id))
    }

    fn transition(&self, uow: &UnitOfWork, loan: &mut Loan, to: LoanStatus) -> CoreResult<()> {
        if !loan.status.can_transition_to(to) {
            return Err(CoreError::InvalidTransition {
                entity: "loan",
                id: loan.id,
                from: loan.status.to_string(),
                to: to.to_string(),
            });
        }
        let prior = loan.clone();
        let now = self.clock.now();
        loan.stamp(to, now);
        uow.record_history(HistoryTable::Loan, loan.id, to.event(), Some(&prior), now)?;
        uow.update_loan(loan)?;
        self.audit(
            uow,
            loan.id,
            to.event(),
            Some(serde_json::to_value(&prior)?),
            Some(serde_json::to_value(&*loan)?),
            now,
        )
    }

    /// Reviewer decision. `Default` is only accepted once the loan has
    /// missed more than D installments.
    pub fn decide(
        &self,
        ctx: &RequestContext,
        id: LoanId,
        decision: LoanDecision,
        notes: Option<String>,
    ) -> CoreResult<Loan> {
        if ctx.principal.role == PrincipalRole::Customer {
            return Err(CoreError::validation("reviewer", "a reviewer principal is required"));
        }
        let uow = self.store.begin(ctx)?;
        let mut loan = self.load(&uow, id)?;
        loan.notes = notes;
        loan.reviewed_by = Some(ctx.principal.user_id);
        let to = match decision {
            LoanDecision::Approve => LoanStatus::Approved,
            LoanDecision::Reject => LoanStatus::Rejected,
            LoanDecision::Default => {
                if loan.status == LoanStatus::Active {
                    let report = self.overdue(&uow, &loan)?;
                    if report.missed <= report.threshold {
                        return Err(CoreError::WrongState {
                            entity: "loan",
                            id,
                            state: format!("active with {} missed installment(s)", report.missed),
                            action: "default",
                        });
                    }
                }
                LoanStatus::Defaulted
            }
        };
        self.transition(&uow, &mut loan, to)?;
        uow.commit()?;
        log::debug!("[{}] loan {id} decided: {}", ctx.correlation_id, loan.status);
        Ok(loan)
    }

    /// approved → active. Credits the principal to the borrower account.
    pub fn disburse(&self, ctx: &RequestContext, id: LoanId) -> CoreResult<Loan> {
        let uow = self.store.begin(ctx)?;
        let mut loan = self.load(&uow, id)?;
        self.transition(&uow, &mut loan, LoanStatus::Active)?;
        self.transactions.post_internal(
            &uow,
            InternalPosting {
                user_id: loan.user_id,
                txn_type: TransactionType::Deposit,
                source_account_id: None,
                destination_account_id: Some(loan.account_id),
                amount: loan.principal,
                currency: loan.currency.clone(),
                description: format!("disbursement of loan {id}"),
                category: "loan_disbursement",
            },
        )?;
        uow.commit()?;
        log::debug!("[{}] loan {id} disbursed {} {}", ctx.correlation_id, loan.principal, loan.currency);
        Ok(loan)
    }

    /// Apply a repayment: accrued interest first (30/360), then principal.
    /// Principal beyond the outstanding balance is credited back.
    pub fn record_payment(&self, ctx: &RequestContext, id: LoanId, amount: Money) -> CoreResult<LoanPayment> {
        Validator::new()
            .check(amount.is_positive(), "amount", "must be greater than zero")
            .check(amount.in_range(), "amount", "exceeds the largest amount")
            .finish()?;

        let uow = self.store.begin(ctx)?;
        let mut loan = self.load(&uow, id)?;
        if loan.status != LoanStatus::Active {
            return Err(CoreError::WrongState {
                entity: "loan",
                id,
                state: loan.status.to_string(),
                action: "record_payment",
            });
        }

        let now = self.clock.now();
        let since = loan.last_accrual_at.or(loan.disbursed_at).unwrap_or(loan.applied_at);
        let days = amortization::days_30_360(since, now);
        let accrued = amortization::accrued_interest(loan.outstanding, loan.annual_rate, days);
        let split = amortization::split_payment(amount, accrued, loan.outstanding);

        let debit = self.transactions.post_internal(
            &uow,
            InternalPosting {
                user_id: loan.user_id,
                txn_type: TransactionType::Payment,
                source_account_id: Some(loan.account_id),
                destination_account_id: None,
                amount,
                currency: loan.currency.clone(),
                description: format!("repayment of loan {id}"),
                category: "loan_payment",
            },
        )?;
        if split.excess.is_positive() {
            self.transactions.post_internal(
                &uow,
                InternalPosting {
                    user_id: loan.user_id,
                    txn_type: TransactionType::Deposit,
                    source_account_id: None,
                    destination_account_id: Some(loan.account_id),
                    amount: split.excess,
                    currency: loan.currency.clone(),
                    description: format!("overpayment refund for loan {id}"),
                    category: "loan_refund",
                },
            )?;
        }

        let payment = LoanPayment {
            id: new_id(),
            loan_id: id,
            transaction_id: debit.id,
            amount,
            principal_portion: split.principal,
            interest_portion: split.interest,
            refunded: split.excess,
            paid_at: now,
        };
        uow.insert_loan_payment(&payment)?;

        let prior = loan.clone();
        loan.outstanding = loan.outstanding - split.principal;
        loan.last_accrual_at = Some(now);
        loan.updated_at = now;
        uow.record_history(HistoryTable::Loan, id, AuditEvent::LoanPaymentRecorded, Some(&prior), now)?;
        uow.update_loan(&loan)?;
        self.audit(
            &uow,
            id,
            AuditEvent::LoanPaymentRecorded,
            Some(serde_json::json!({ "outstanding": prior.outstanding })),
            Some(serde_json::to_value(&payment)?),
            now,
        )?;

        if loan.outstanding <= self.config.loans.epsilon {
            self.transition(&uow, &mut loan, LoanStatus::Paid)?;
        }
        uow.commit()?;
        log::debug!(
            "[{}] loan {id} payment {amount}: interest {}, principal {}, refunded {}, outstanding {}",
            ctx.correlation_id, split.interest, split.principal, split.excess, loan.outstanding
        );
        Ok(payment)
    }

    fn overdue(&self, uow: &UnitOfWork, loan: &Loan) -> CoreResult<OverdueReport> {
        let threshold = self.config.loans.default_after_missed;
        let mut report = OverdueReport {
            loan_id: loan.id,
            status: loan.status,
            installments_due: 0,
            installments_paid: 0,
            missed: 0,
            threshold,
            defaulted: false,
        };
        let Some(start) = loan.disbursed_at else {
            return Ok(report);
        };
        if loan.status != LoanStatus::Active {
            return Ok(report);
        }

        let now = self.clock.now();
        report.installments_due = (1..=loan.term_months)
            .take_while(|k| amortization::add_months(start, *k) <= now)
            .count() as u32;
        let paid = uow.loan_amount_paid(loan.id)?;
        report.installments_paid = if loan.monthly_payment.is_positive() {
            (paid.as_decimal() / loan.monthly_payment.as_decimal())
                .floor()
                .to_u32()
                .unwrap_or(u32::MAX)
        } else {
            0
        };
        report.missed = report.installments_due.saturating_sub(report.installments_paid);
        Ok(report)
    }

    /// Count missed installments against wall-clock time and default the
    /// loan when they exceed D. Called by an external scheduler.
    pub fn check_overdue(&self, ctx: &RequestContext, id: LoanId) -> CoreResult<OverdueReport> {
        let uow = self.store.begin(ctx)?;
        let mut loan = self.load(&uow, id)?;
        let mut report = self.overdue(&uow, &loan)?;
        if loan.status == LoanStatus::Active && report.missed > report.threshold {
            self.transition(&uow, &mut loan, LoanStatus::Defaulted)?;
            report.status = loan.status;
            report.defaulted = true;
            log::warn!(
                "[{}] loan {id} defaulted after {} missed installment(s)",
                ctx.correlation_id, report.missed
            );
        }
        uow.commit()?;
        Ok(report)
    }

    pub fn get(&self, ctx: &RequestContext, id: LoanId) -> CoreResult<Loan> {
        let uow = self.store.read(ctx)?;
        self.load(&uow, id)
    }

    pub fn list_by_user(&self, ctx: &RequestContext, user_id: UserId) -> CoreResult<Vec<Loan>> {
        let uow = self.store.read(ctx)?;
        uow.loans_for_user(user_id)
    }

    pub fn list_by_account(&self, ctx: &RequestContext, account_id: AccountId) -> CoreResult<Vec<Loan>> {
        let uow = self.store.read(ctx)?;
        uow.loans_for_account(account_id)
    }

    pub fn list_payments(&self, ctx: &RequestContext, id: LoanId) -> CoreResult<Vec<LoanPayment>> {
        let uow = self.store.read(ctx)?;
        self.load(&uow, id)?;
        uow.loan_payments(id)
    }

    /// Amortization table from disbursement (or application, before then).
    pub fn get_schedule(&self, ctx: &RequestContext, id: LoanId) -> CoreResult<Vec<ScheduledInstallment>> {
        let loan = self.get(ctx, id)?;
        let start = loan.disbursed_at.unwrap_or(loan.applied_at);
        Ok(amortization::schedule(
            loan.principal,
            loan.annual_rate,
            loan.term_months,
            loan.monthly_payment,
            start,
        ))
    }

    pub fn history(&self, ctx: &RequestContext, id: LoanId) -> CoreResult<Vec<HistoryEntry>> {
        let uow = self.store.read(ctx)?;
        self.load(&uow, id)?;
        uow.history(HistoryTable::Loan, id)
    }
}
