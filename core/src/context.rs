//! Per-request context threaded through every component call: who is acting,
//! the correlation id for audit, and the caller's deadline/cancellation.

use crate::error::{CoreError, CoreResult};
use crate::types::UserId;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalRole {
    Customer,
    Reviewer,
    System,
}

/// An already-authenticated caller. Token validation happens upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: UserId,
    pub role: PrincipalRole,
}

impl Principal {
    pub fn customer(user_id: UserId) -> Self {
        Self { user_id, role: PrincipalRole::Customer }
    }

    pub fn reviewer(user_id: UserId) -> Self {
        Self { user_id, role: PrincipalRole::Reviewer }
    }

    pub fn system() -> Self {
        Self { user_id: uuid::Uuid::nil(), role: PrincipalRole::System }
    }

    /// Actor string recorded in the audit log.
    pub fn actor(&self) -> String {
        match self.role {
            PrincipalRole::Customer => format!("customer:{}", self.user_id),
            PrincipalRole::Reviewer => format!("reviewer:{}", self.user_id),
            PrincipalRole::System => "system".to_string(),
        }
    }
}

/// Cooperative cancellation flag shared between caller and operation.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub principal: Principal,
    pub correlation_id: String,
    pub deadline: Option<Instant>,
    pub cancel: CancelToken,
}

impl RequestContext {
    pub fn new(principal: Principal) -> Self {
        Self {
            principal,
            correlation_id: uuid::Uuid::new_v4().to_string(),
            deadline: None,
            cancel: CancelToken::new(),
        }
    }

    pub fn system() -> Self {
        Self::new(Principal::system())
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = id.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Same caller and deadline, acting under a different principal.
    pub fn acting_as(&self, principal: Principal) -> Self {
        Self {
            principal,
            ..self.clone()
        }
    }

    /// Time left before the deadline; `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Fails once the caller has cancelled or the deadline has passed.
    pub fn check(&self) -> CoreResult<()> {
        if self.cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        match self.deadline {
            Some(d) if Instant::now() >= d => Err(CoreError::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// Bound `wanted` by whatever is left of the deadline.
    pub fn clamp(&self, wanted: Duration) -> Duration {
        match self.remaining() {
            Some(left) => wanted.min(left),
            None => wanted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expired_deadline_fails_check() {
        let ctx = RequestContext::system().with_deadline(Instant::now());
        assert!(matches!(ctx.check(), Err(CoreError::DeadlineExceeded)));
    }

    #[test]
    fn cancellation_is_shared_between_clones() {
        let token = CancelToken::new();
        let ctx = RequestContext::system().with_cancel(token.clone());
        assert!(ctx.check().is_ok());
        token.cancel();
        assert!(matches!(ctx.clone().check(), Err(CoreError::Cancelled)));
    }

    #[test]
    fn clamp_respects_remaining_time() {
        let ctx = RequestContext::system().with_timeout(Duration::from_millis(50));
        assert!(ctx.clamp(Duration::from_secs(5)) <= Duration::from_millis(50));
        let unbounded = RequestContext::system();
        assert_eq!(unbounded.clamp(Duration::from_secs(5)), Duration::from_secs(5));
    }
}
