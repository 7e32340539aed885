use crate::money::Money;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// The error taxonomy every variant folds into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    PreconditionFailed,
    Insufficient,
    Unavailable,
    DeadlineExceeded,
    Internal,
}

/// One offending input field of a validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        fields: Vec<FieldError>,
    },

    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Could not allocate a unique account number after {attempts} attempts")]
    DuplicateAccountNumber { attempts: u32 },

    #[error("Idempotency key '{key}' was already used for a different request")]
    IdempotencyConflict { key: String },

    #[error("{entity} {id} cannot move from '{from}' to '{to}'")]
    InvalidTransition {
        entity: &'static str,
        id: Uuid,
        from: String,
        to: String,
    },

    #[error("{entity} {id} is '{state}'; {action} is not allowed")]
    WrongState {
        entity: &'static str,
        id: Uuid,
        state: String,
        action: &'static str,
    },

    #[error("Account {account_id} still holds a balance of {balance}")]
    AccountHasBalance { account_id: Uuid, balance: Money },

    #[error("Account {account_id} has open obligations: {detail}")]
    AccountHasObligations { account_id: Uuid, detail: String },

    #[error("Account {account_id} is inactive")]
    AccountInactive { account_id: Uuid },

    #[error("Currency mismatch: expected {expected}, got {actual}")]
    CurrencyMismatch { expected: String, actual: String },

    #[error("Insufficient funds in {account_id}: balance {available}, requested {requested}")]
    Insufficient {
        account_id: Uuid,
        available: Money,
        requested: Money,
    },

    #[error("Dependency '{dependency}' unavailable: {message}")]
    Unavailable { dependency: String, message: String },

    #[error("Deadline exceeded")]
    DeadlineExceeded,

    #[error("Operation cancelled by caller")]
    Cancelled,

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    /// Single-field validation failure.
    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        CoreError::Validation {
            message: format!("{field}: {message}"),
            fields: vec![FieldError {
                field: field.to_string(),
                message,
            }],
        }
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        CoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Validation { .. } | CoreError::CurrencyMismatch { .. } => ErrorKind::Validation,
            CoreError::NotFound { .. } => ErrorKind::NotFound,
            CoreError::DuplicateAccountNumber { .. } | CoreError::IdempotencyConflict { .. } => {
                ErrorKind::Conflict
            }
            CoreError::InvalidTransition { .. }
            | CoreError::WrongState { .. }
            | CoreError::AccountHasBalance { .. }
            | CoreError::AccountHasObligations { .. }
            | CoreError::AccountInactive { .. } => ErrorKind::PreconditionFailed,
            CoreError::Insufficient { .. } => ErrorKind::Insufficient,
            CoreError::Unavailable { .. } => ErrorKind::Unavailable,
            CoreError::DeadlineExceeded | CoreError::Cancelled => ErrorKind::DeadlineExceeded,
            CoreError::Database(e) => match e.sqlite_error_code() {
                Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked) => {
                    ErrorKind::Unavailable
                }
                _ => ErrorKind::Internal,
            },
            CoreError::Serialization(_) | CoreError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Stable machine-readable code surfaced to callers.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Validation { .. } => "validation",
            CoreError::NotFound { .. } => "not_found",
            CoreError::DuplicateAccountNumber { .. } => "duplicate_account_number",
            CoreError::IdempotencyConflict { .. } => "idempotency_conflict",
            CoreError::InvalidTransition { .. } => "invalid_transition",
            CoreError::WrongState { .. } => "wrong_state",
            CoreError::AccountHasBalance { .. } => "account_has_balance",
            CoreError::AccountHasObligations { .. } => "account_has_obligations",
            CoreError::AccountInactive { .. } => "account_inactive",
            CoreError::CurrencyMismatch { .. } => "currency_mismatch",
            CoreError::Insufficient { .. } => "insufficient_funds",
            CoreError::Unavailable { .. } => "unavailable",
            CoreError::DeadlineExceeded => "deadline_exceeded",
            CoreError::Cancelled => "cancelled",
            CoreError::Database(_) if self.kind() == ErrorKind::Unavailable => "unavailable",
            CoreError::Database(_) | CoreError::Serialization(_) | CoreError::Internal(_) => "internal",
        }
    }

    /// Whether the caller may retry the same command unchanged.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Unavailable
    }

    /// Boundary shape. Internal errors are logged here and surfaced opaquely.
    pub fn to_response(&self, correlation_id: &str) -> ErrorResponse {
        let kind = self.kind();
        let message = if kind == ErrorKind::Internal {
            log::error!("[{correlation_id}] internal error: {self:?}");
            "internal error".to_string()
        } else {
            self.to_string()
        };
        let fields = match self {
            CoreError::Validation { fields, .. } => fields.clone(),
            _ => Vec::new(),
        };
        ErrorResponse {
            code: self.code().to_string(),
            kind,
            message,
            fields,
            correlation_id: correlation_id.to_string(),
        }
    }
}

/// Structured failure returned across the component boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldError>,
    pub correlation_id: String,
}

/// Collects field failures so one response can report all of them.
#[derive(Debug, Default)]
pub struct Validator {
    fields: Vec<FieldError>,
}

impl Validator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&mut self, ok: bool, field: &str, message: impl Into<String>) -> &mut Self {
        if !ok {
            self.fields.push(FieldError {
                field: field.to_string(),
                message: message.into(),
            });
        }
        self
    }

    pub fn push(&mut self, err: CoreError) -> &mut Self {
        match err {
            CoreError::Validation { fields, .. } => self.fields.extend(fields),
            other => self.fields.push(FieldError {
                field: "request".into(),
                message: other.to_string(),
            }),
        }
        self
    }

    pub fn finish(&mut self) -> CoreResult<()> {
        if self.fields.is_empty() {
            return Ok(());
        }
        let fields = std::mem::take(&mut self.fields);
        let message = fields
            .iter()
            .map(|f| format!("{}: {}", f.field, f.message))
            .collect::<Vec<_>>()
            .join("; ");
        Err(CoreError::Validation { message, fields })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validator_reports_every_field() {
        let err = Validator::new()
            .check(false, "amount", "must be positive")
            .check(true, "currency", "unused")
            .check(false, "source", "required for transfers")
            .finish()
            .unwrap_err();
        match err {
            CoreError::Validation { fields, .. } => {
                assert_eq!(fields.len(), 2);
                assert_eq!(fields[0].field, "amount");
                assert_eq!(fields[1].field, "source");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn internal_errors_are_opaque_at_the_boundary() {
        let resp = CoreError::Internal("row 7 had NULL balance".into()).to_response("c-1");
        assert_eq!(resp.code, "internal");
        assert_eq!(resp.message, "internal error");
        let resp = CoreError::not_found("account", "abc").to_response("c-2");
        assert_eq!(resp.kind, ErrorKind::NotFound);
        assert!(resp.message.contains("abc"));
    }
}
