use crate::{
    error::ErrorResponse,
    ledger::OpenAccount,
    loan_amortizer::{ApplyLoan, LoanDecision},
    money::Money,
    position_keeper::OpenPosition,
    store::TransactionQuery,
    transaction_engine::{ReviewDecision, SubmitTransaction},
    types::{AccountId, EntityId, LoanId, PositionId, Timestamp, TransactionId, UserId},
};
use serde::{Deserialize, Serialize};

/// Every operation the core exposes, as a decoded command.
/// Variants are only ever appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Command {
    // ── Account ledger ─────────────────────────────
    OpenAccount(OpenAccount),
    GetAccount { account_id: AccountId },
    GetAccountByNumber { account_number: String },
    ListAccounts { user_id: UserId },
    CloseAccount { account_id: AccountId },
    AccountHistory { account_id: AccountId },

    // ── Transactions ───────────────────────────────
    SubmitTransaction(SubmitTransaction),
    GetTransaction { transaction_id: TransactionId },
    CancelTransaction { transaction_id: TransactionId },
    ListUserTransactions {
        user_id: UserId,
        #[serde(default)]
        query: TransactionQuery,
    },
    ListAccountTransactions {
        account_id: AccountId,
        #[serde(default)]
        query: TransactionQuery,
    },
    TransactionHistory { transaction_id: TransactionId },

    // ── AML ────────────────────────────────────────
    GetAssessment { transaction_id: TransactionId },
    ReviewTransaction {
        transaction_id: TransactionId,
        decision: ReviewDecision,
        #[serde(default)]
        notes: Option<String>,
    },

    // ── Loans ──────────────────────────────────────
    ApplyLoan(ApplyLoan),
    DecideLoan {
        loan_id: LoanId,
        decision: LoanDecision,
        #[serde(default)]
        notes: Option<String>,
    },
    DisburseLoan { loan_id: LoanId },
    RecordLoanPayment { loan_id: LoanId, amount: Money },
    ListLoanPayments { loan_id: LoanId },
    LoanSchedule { loan_id: LoanId },
    GetLoan { loan_id: LoanId },
    ListUserLoans { user_id: UserId },
    ListAccountLoans { account_id: AccountId },
    CheckOverdue { loan_id: LoanId },
    LoanHistory { loan_id: LoanId },

    // ── Positions ──────────────────────────────────
    OpenPosition(OpenPosition),
    Revalue {
        symbol: String,
        price: Money,
        #[serde(default)]
        tick_at: Option<Timestamp>,
    },
    ClosePosition { position_id: PositionId, sale_price: Money },
    GetPosition { position_id: PositionId },
    ListUserPositions { user_id: UserId },
    ListAccountPositions { account_id: AccountId },
    ListSymbolPositions { symbol: String },
    LatestPrice { symbol: String },
    Portfolio { user_id: UserId },
    PositionHistory { position_id: PositionId },

    // ── Audit ──────────────────────────────────────
    AuditForEntity { entity_id: EntityId },
}

impl Command {
    /// Decode one command from JSON text. The text is read into a `Value`
    /// first: tagged decoding buffers every field, and only a `Value` replays
    /// plain floats (coordinates) as floats next to exact decimal amounts.
    pub fn from_json(text: &str) -> serde_json::Result<Command> {
        serde_json::from_value(serde_json::from_str(text)?)
    }

    /// Stable command name, used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Command::OpenAccount(_) => "open_account",
            Command::GetAccount { .. } => "get_account",
            Command::GetAccountByNumber { .. } => "get_account_by_number",
            Command::ListAccounts { .. } => "list_accounts",
            Command::CloseAccount { .. } => "close_account",
            Command::AccountHistory { .. } => "account_history",
            Command::SubmitTransaction(_) => "submit_transaction",
            Command::GetTransaction { .. } => "get_transaction",
            Command::CancelTransaction { .. } => "cancel_transaction",
            Command::ListUserTransactions { .. } => "list_user_transactions",
            Command::ListAccountTransactions { .. } => "list_account_transactions",
            Command::TransactionHistory { .. } => "transaction_history",
            Command::GetAssessment { .. } => "get_assessment",
            Command::ReviewTransaction { .. } => "review_transaction",
            Command::ApplyLoan(_) => "apply_loan",
            Command::DecideLoan { .. } => "decide_loan",
            Command::DisburseLoan { .. } => "disburse_loan",
            Command::RecordLoanPayment { .. } => "record_loan_payment",
            Command::ListLoanPayments { .. } => "list_loan_payments",
            Command::LoanSchedule { .. } => "loan_schedule",
            Command::GetLoan { .. } => "get_loan",
            Command::ListUserLoans { .. } => "list_user_loans",
            Command::ListAccountLoans { .. } => "list_account_loans",
            Command::CheckOverdue { .. } => "check_overdue",
            Command::LoanHistory { .. } => "loan_history",
            Command::OpenPosition(_) => "open_position",
            Command::Revalue { .. } => "revalue",
            Command::ClosePosition { .. } => "close_position",
            Command::GetPosition { .. } => "get_position",
            Command::ListUserPositions { .. } => "list_user_positions",
            Command::ListAccountPositions { .. } => "list_account_positions",
            Command::ListSymbolPositions { .. } => "list_symbol_positions",
            Command::LatestPrice { .. } => "latest_price",
            Command::Portfolio { .. } => "portfolio",
            Command::PositionHistory { .. } => "position_history",
            Command::AuditForEntity { .. } => "audit_for_entity",
        }
    }
}

/// One reply per command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Ok {
        correlation_id: String,
        data: serde_json::Value,
    },
    Error { error: ErrorResponse },
}

impl Response {
    pub fn is_ok(&self) -> bool {
        matches!(self, Response::Ok { .. })
    }
}
