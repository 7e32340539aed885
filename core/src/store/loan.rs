use super::{currency_col, decimal_col, enum_col, money_col, opt_ts, opt_ts_col, opt_uuid_col, ts_col, uuid_col, UnitOfWork};
use crate::{
    error::{CoreError, CoreResult},
    loan_amortizer::{Loan, LoanPayment},
    money::Money,
    types::{ts_to_secs, AccountId, LoanId, UserId},
};
use rusqlite::{params, OptionalExtension, Row};

const LOAN_COLS: &str = "loan_id, user_id, account_id, loan_type, principal_minor, outstanding_minor,
     annual_rate, term_months, monthly_payment_minor, total_interest_minor, total_amount_minor,
     currency, status, purpose, notes, reviewed_by, applied_at, updated_at, approved_at,
     rejected_at, disbursed_at, last_accrual_at, paid_at, defaulted_at";

fn loan_from_row(row: &Row<'_>) -> rusqlite::Result<Loan> {
    Ok(Loan {
        id: uuid_col(row, 0)?,
        user_id: uuid_col(row, 1)?,
        account_id: uuid_col(row, 2)?,
        loan_type: enum_col(row, 3)?,
        principal: money_col(row, 4)?,
        outstanding: money_col(row, 5)?,
        annual_rate: decimal_col(row, 6)?,
        term_months: row.get(7)?,
        monthly_payment: money_col(row, 8)?,
        total_interest: money_col(row, 9)?,
        total_amount: money_col(row, 10)?,
        currency: currency_col(row, 11)?,
        status: enum_col(row, 12)?,
        purpose: row.get(13)?,
        notes: row.get(14)?,
        reviewed_by: opt_uuid_col(row, 15)?,
        applied_at: ts_col(row, 16)?,
        updated_at: ts_col(row, 17)?,
        approved_at: opt_ts_col(row, 18)?,
        rejected_at: opt_ts_col(row, 19)?,
        disbursed_at: opt_ts_col(row, 20)?,
        last_accrual_at: opt_ts_col(row, 21)?,
        paid_at: opt_ts_col(row, 22)?,
        defaulted_at: opt_ts_col(row, 23)?,
    })
}

fn payment_from_row(row: &Row<'_>) -> rusqlite::Result<LoanPayment> {
    Ok(LoanPayment {
        id: uuid_col(row, 0)?,
        loan_id: uuid_col(row, 1)?,
        transaction_id: uuid_col(row, 2)?,
        amount: money_col(row, 3)?,
        principal_portion: money_col(row, 4)?,
        interest_portion: money_col(row, 5)?,
        refunded: money_col(row, 6)?,
        paid_at: ts_col(row, 7)?,
    })
}

impl UnitOfWork {
    // ── Loans ─────────────────────────────────────────────────────

    pub(crate) fn insert_loan(&self, l: &Loan) -> CoreResult<()> {
        self.require_write()?;
        self.conn()?.execute(
            &format!(
                "INSERT INTO loan ({LOAN_COLS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                         ?18, ?19, ?20, ?21, ?22, ?23, ?24)"
            ),
            params![
                l.id.to_string(),
                l.user_id.to_string(),
                l.account_id.to_string(),
                l.loan_type.as_str(),
                l.principal.to_minor()?,
                l.outstanding.to_minor()?,
                l.annual_rate.to_string(),
                l.term_months,
                l.monthly_payment.to_minor()?,
                l.total_interest.to_minor()?,
                l.total_amount.to_minor()?,
                l.currency.as_str(),
                l.status.as_str(),
                l.purpose,
                l.notes,
                l.reviewed_by.map(|id| id.to_string()),
                ts_to_secs(&l.applied_at),
                ts_to_secs(&l.updated_at),
                opt_ts(&l.approved_at),
                opt_ts(&l.rejected_at),
                opt_ts(&l.disbursed_at),
                opt_ts(&l.last_accrual_at),
                opt_ts(&l.paid_at),
                opt_ts(&l.defaulted_at),
            ],
        )?;
        Ok(())
    }

    /// Terms, principal and currency are fixed at application and never rewritten.
    pub(crate) fn update_loan(&self, l: &Loan) -> CoreResult<()> {
        self.require_write()?;
        let n = self.conn()?.execute(
            "UPDATE loan SET outstanding_minor = ?1, status = ?2, notes = ?3, reviewed_by = ?4,
                             updated_at = ?5, approved_at = ?6, rejected_at = ?7, disbursed_at = ?8,
                             last_accrual_at = ?9, paid_at = ?10, defaulted_at = ?11
             WHERE loan_id = ?12",
            params![
                l.outstanding.to_minor()?,
                l.status.as_str(),
                l.notes,
                l.reviewed_by.map(|id| id.to_string()),
                ts_to_secs(&l.updated_at),
                opt_ts(&l.approved_at),
                opt_ts(&l.rejected_at),
                opt_ts(&l.disbursed_at),
                opt_ts(&l.last_accrual_at),
                opt_ts(&l.paid_at),
                opt_ts(&l.defaulted_at),
                l.id.to_string(),
            ],
        )?;
        if n != 1 {
            return Err(CoreError::Internal(format!("loan {} vanished during update", l.id)));
        }
        Ok(())
    }

    pub fn loan(&self, id: LoanId) -> CoreResult<Option<Loan>> {
        let sql = format!("SELECT {LOAN_COLS} FROM loan WHERE loan_id = ?1");
        let loan = self
            .conn()?
            .query_row(&sql, params![id.to_string()], loan_from_row)
            .optional()?;
        Ok(loan)
    }

    pub fn loans_for_user(&self, user_id: UserId) -> CoreResult<Vec<Loan>> {
        self.query_loans("user_id", &user_id.to_string())
    }

    pub fn loans_for_account(&self, account_id: AccountId) -> CoreResult<Vec<Loan>> {
        self.query_loans("account_id", &account_id.to_string())
    }

    fn query_loans(&self, column: &str, value: &str) -> CoreResult<Vec<Loan>> {
        let sql = format!(
            "SELECT {LOAN_COLS} FROM loan WHERE {column} = ?1 ORDER BY applied_at DESC, rowid DESC"
        );
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![value], loan_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Loan payments ─────────────────────────────────────────────

    pub(crate) fn insert_loan_payment(&self, p: &LoanPayment) -> CoreResult<()> {
        self.require_write()?;
        self.conn()?.execute(
            "INSERT INTO loan_payment (payment_id, loan_id, txn_id, amount_minor, principal_minor,
                                       interest_minor, refunded_minor, paid_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                p.id.to_string(),
                p.loan_id.to_string(),
                p.transaction_id.to_string(),
                p.amount.to_minor()?,
                p.principal_portion.to_minor()?,
                p.interest_portion.to_minor()?,
                p.refunded.to_minor()?,
                ts_to_secs(&p.paid_at),
            ],
        )?;
        Ok(())
    }

    /// Payments for a loan, oldest first.
    pub fn loan_payments(&self, loan_id: LoanId) -> CoreResult<Vec<LoanPayment>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT payment_id, loan_id, txn_id, amount_minor, principal_minor, interest_minor,
                    refunded_minor, paid_at
             FROM loan_payment WHERE loan_id = ?1 ORDER BY paid_at ASC, rowid ASC",
        )?;
        let rows = stmt
            .query_map(params![loan_id.to_string()], payment_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Net amount the borrower has paid towards a loan (refunds excluded).
    pub fn loan_amount_paid(&self, loan_id: LoanId) -> CoreResult<Money> {
        let minor: i64 = self.conn()?.query_row(
            "SELECT COALESCE(SUM(amount_minor - refunded_minor), 0) FROM loan_payment WHERE loan_id = ?1",
            params![loan_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(Money::from_minor(minor))
    }
}
