//! Audit events: the append-only record of every state change.
//!
//! RULE: an audit record is written in the same Unit of Work as the
//! mutation it describes, so it becomes visible atomically with it.

use crate::types::{EntityId, Timestamp};
use serde::{Deserialize, Serialize};

/// Every auditable event. Variants are only ever appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    // ── Account ledger ─────────────────────────────
    AccountOpened,
    AccountClosed,
    BalanceApplied,

    // ── Transaction engine ─────────────────────────
    TransactionSubmitted,
    TransactionApproved,
    TransactionFlagged,
    TransactionRejected,
    TransactionCompleted,
    TransactionFailed,
    TransactionCancelled,

    // ── AML ────────────────────────────────────────
    RiskAssessed,
    TransactionReviewed,

    // ── Loans ──────────────────────────────────────
    LoanApplied,
    LoanApproved,
    LoanRejected,
    LoanDisbursed,
    LoanPaymentRecorded,
    LoanPaid,
    LoanDefaulted,

    // ── Positions ──────────────────────────────────
    PositionOpened,
    PositionRevalued,
    PositionClosed,
}

impl AuditEvent {
    /// Stable event code, also used for the `event` column of history tables.
    pub fn code(&self) -> &'static str {
        match self {
            AuditEvent::AccountOpened        => "account_opened",
            AuditEvent::AccountClosed        => "account_closed",
            AuditEvent::BalanceApplied       => "balance_applied",
            AuditEvent::TransactionSubmitted => "transaction_submitted",
            AuditEvent::TransactionApproved  => "transaction_approved",
            AuditEvent::TransactionFlagged   => "transaction_flagged",
            AuditEvent::TransactionRejected  => "transaction_rejected",
            AuditEvent::TransactionCompleted => "transaction_completed",
            AuditEvent::TransactionFailed    => "transaction_failed",
            AuditEvent::TransactionCancelled => "transaction_cancelled",
            AuditEvent::RiskAssessed         => "risk_assessed",
            AuditEvent::TransactionReviewed  => "transaction_reviewed",
            AuditEvent::LoanApplied          => "loan_applied",
            AuditEvent::LoanApproved         => "loan_approved",
            AuditEvent::LoanRejected         => "loan_rejected",
            AuditEvent::LoanDisbursed        => "loan_disbursed",
            AuditEvent::LoanPaymentRecorded  => "loan_payment_recorded",
            AuditEvent::LoanPaid             => "loan_paid",
            AuditEvent::LoanDefaulted        => "loan_defaulted",
            AuditEvent::PositionOpened       => "position_opened",
            AuditEvent::PositionRevalued     => "position_revalued",
            AuditEvent::PositionClosed       => "position_closed",
        }
    }
}

/// The audit log entry as persisted to SQLite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Option<i64>,
    pub ts: Timestamp,
    pub actor: String,
    pub component: String,
    pub entity_id: EntityId,
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<serde_json::Value>,
    pub correlation_id: String,
}
