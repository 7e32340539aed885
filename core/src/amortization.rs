//! Fixed-point amortization math. Pure functions, no I/O.
//!
//! All monetary results are rounded to scale 4 with banker's rounding.
//! Interest accrual uses the 30/360 day count.

use crate::error::{CoreError, CoreResult};
use crate::money::Money;
use crate::types::Timestamp;
use chrono::{Datelike, Months};
use rust_decimal::{Decimal, MathematicalOps};
use serde::{Deserialize, Serialize};

const MONTHS_PER_YEAR: u32 = 12;
const DAYS_PER_MONTH: u32 = 30;

/// Derived figures fixed at application time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoanTerms {
    pub monthly_payment: Money,
    pub total_amount: Money,
    pub total_interest: Money,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledInstallment {
    pub number: u32,
    pub due: Timestamp,
    pub payment: Money,
    pub principal: Money,
    pub interest: Money,
    /// Remaining principal after this installment.
    pub balance: Money,
}

pub fn monthly_rate(annual_rate: Decimal) -> Decimal {
    annual_rate / Decimal::from(MONTHS_PER_YEAR)
}

/// P·r·(1+r)ⁿ / ((1+r)ⁿ − 1), or P/n when r = 0. Evaluated as
/// P·r·(g / (g − 1)) so the intermediate never exceeds the payment's own size.
pub fn monthly_payment(principal: Money, annual_rate: Decimal, term_months: u32) -> CoreResult<Money> {
    let p = principal.as_decimal();
    let n = term_months.max(1);
    let r = monthly_rate(annual_rate);
    if r.is_zero() {
        return Ok(Money::new(p / Decimal::from(n)));
    }
    let out_of_range = || CoreError::validation("principal", "loan figures are out of range");
    let growth = (Decimal::ONE + r).checked_powu(u64::from(n)).ok_or_else(out_of_range)?;
    let ratio = growth.checked_div(growth - Decimal::ONE).ok_or_else(out_of_range)?;
    let payment = p.checked_mul(r).and_then(|pr| pr.checked_mul(ratio)).ok_or_else(out_of_range)?;
    Money::checked_new(payment, "principal")
}

/// Payment, total repaid and total interest. Fails when the total repaid
/// would not fit an amount.
pub fn loan_terms(principal: Money, annual_rate: Decimal, term_months: u32) -> CoreResult<LoanTerms> {
    let monthly_payment = monthly_payment(principal, annual_rate, term_months)?;
    let total_amount = monthly_payment.checked_scale_by(Decimal::from(term_months), "principal")?;
    Ok(LoanTerms {
        monthly_payment,
        total_amount,
        total_interest: total_amount - principal,
    })
}

/// Calendar month `k` after `start`, clamped to month end.
pub fn add_months(start: Timestamp, k: u32) -> Timestamp {
    start
        .checked_add_months(Months::new(k))
        .unwrap_or_else(|| start + chrono::Duration::days(i64::from(k * DAYS_PER_MONTH)))
}

/// Standard amortization table. The last row absorbs rounding drift so the
/// closing balance is exactly zero.
pub fn schedule(
    principal: Money,
    annual_rate: Decimal,
    term_months: u32,
    monthly_payment: Money,
    start: Timestamp,
) -> Vec<ScheduledInstallment> {
    let r = monthly_rate(annual_rate);
    let mut balance = principal;
    let mut rows = Vec::with_capacity(term_months as usize);
    for number in 1..=term_months {
        let interest = balance.scale_by(r);
        let mut principal_part = monthly_payment - interest;
        if number == term_months || principal_part > balance {
            principal_part = balance;
        }
        balance = balance - principal_part;
        rows.push(ScheduledInstallment {
            number,
            due: add_months(start, number),
            payment: principal_part + interest,
            principal: principal_part,
            interest,
            balance,
        });
        if balance.is_zero() {
            break;
        }
    }
    rows
}

/// Days between two instants under the US 30/360 convention. Never negative.
pub fn days_30_360(from: Timestamp, to: Timestamp) -> i64 {
    if to <= from {
        return 0;
    }
    let d1 = from.day().min(30) as i64;
    let d2 = if to.day() == 31 && d1 == 30 { 30 } else { to.day() as i64 };
    let years = (to.year() - from.year()) as i64;
    let months = to.month() as i64 - from.month() as i64;
    (360 * years + 30 * months + (d2 - d1)).max(0)
}

/// balance · r · days / 30
pub fn accrued_interest(balance: Money, annual_rate: Decimal, days: i64) -> Money {
    if days <= 0 {
        return Money::ZERO;
    }
    let factor = monthly_rate(annual_rate) * Decimal::from(days) / Decimal::from(DAYS_PER_MONTH);
    balance.scale_by(factor)
}

/// How a payment splits against the loan.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PaymentSplit {
    pub interest: Money,
    pub principal: Money,
    /// Amount beyond the outstanding principal, returned to the borrower.
    pub excess: Money,
}

/// Interest first, then principal, truncated to what is outstanding.
pub fn split_payment(amount: Money, accrued: Money, outstanding: Money) -> PaymentSplit {
    let interest = amount.min(accrued);
    let toward_principal = amount - interest;
    let principal = toward_principal.min(outstanding);
    PaymentSplit {
        interest,
        principal,
        excess: toward_principal - principal,
    }
}
