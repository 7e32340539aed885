//! Bounded exponential backoff for calls to external dependencies.
//!
//! RULE: only `Unavailable` failures are retried. Every other error kind
//! propagates on the first attempt.

use crate::{config::RetryPolicy, context::RequestContext, error::CoreResult};
use std::time::{Duration, Instant};

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based): base·2^attempt, clamped to max.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.min(32));
        let delay = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(delay)
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// the policy budget (or the caller's deadline) would be exceeded by the
/// next wait. The last error is returned on exhaustion.
pub fn retry_with_backoff<T>(
    policy: &RetryPolicy,
    ctx: &RequestContext,
    operation_name: &str,
    mut operation: impl FnMut(u32) -> CoreResult<T>,
) -> CoreResult<T> {
    let started = Instant::now();
    let budget = policy.budget();
    let mut attempt = 0u32;

    loop {
        ctx.check()?;
        let err = match operation(attempt) {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => e,
        };

        let delay = policy.delay_for_attempt(attempt);
        let out_of_budget = started.elapsed() + delay > budget;
        let out_of_time = ctx.remaining().is_some_and(|left| left <= delay);
        if out_of_budget || out_of_time {
            log::warn!(
                "[{}] {operation_name} gave up after {} attempt(s): {err}",
                ctx.correlation_id,
                attempt + 1
            );
            return Err(err);
        }

        log::warn!(
            "[{}] {operation_name} attempt {} failed: {err}. Retrying in {delay:?}",
            ctx.correlation_id,
            attempt + 1
        );
        std::thread::sleep(delay);
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use std::cell::Cell;

    fn unavailable() -> CoreError {
        CoreError::Unavailable { dependency: "screening".into(), message: "down".into() }
    }

    #[test]
    fn delays_double_then_clamp() {
        let policy = RetryPolicy { base_delay_ms: 100, max_delay_ms: 1000, budget_ms: 10_000 };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(60), Duration::from_millis(1000));
    }

    #[test]
    fn eventual_success_is_returned() {
        let policy = RetryPolicy { base_delay_ms: 1, max_delay_ms: 4, budget_ms: 1_000 };
        let calls = Cell::new(0);
        let result = retry_with_backoff(&policy, &RequestContext::system(), "lookup", |attempt| {
            calls.set(calls.get() + 1);
            if attempt < 2 { Err(unavailable()) } else { Ok(42) }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn non_retryable_errors_fail_fast() {
        let policy = RetryPolicy { base_delay_ms: 1, max_delay_ms: 4, budget_ms: 1_000 };
        let calls = Cell::new(0);
        let result: CoreResult<()> = retry_with_backoff(&policy, &RequestContext::system(), "lookup", |_| {
            calls.set(calls.get() + 1);
            Err(CoreError::validation("user_id", "unknown"))
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn gives_up_when_budget_is_spent() {
        let policy = RetryPolicy { base_delay_ms: 10, max_delay_ms: 20, budget_ms: 50 };
        let started = Instant::now();
        let result: CoreResult<()> =
            retry_with_backoff(&policy, &RequestContext::system(), "lookup", |_| Err(unavailable()));
        assert_eq!(result.unwrap_err().code(), "unavailable");
        assert!(started.elapsed() < Duration::from_millis(500));
    }
}
