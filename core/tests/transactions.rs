//! Transaction state machine: history, cancellation and deadlines.

mod common;

use common::*;
use pulse_core::{
    clock::Clock,
    error::{CoreError, ErrorKind},
    ledger::AccountType,
    money::Money,
    store::TransactionQuery,
    transaction_engine::{TransactionStatus, TransactionType},
};
use std::sync::Arc;
use std::time::Duration;

fn prior_status(entry: &pulse_core::store::HistoryEntry) -> Option<&str> {
    entry.prior_state.as_ref().and_then(|s| s["status"].as_str())
}

/// A completed transfer walks pending → approved → completed, and each
/// history row holds the state before its event.
#[test]
fn completed_transfer_history_walks_the_happy_path() {
    let (engine, _) = bank();
    let owner = user();
    let a = open_account(&engine, owner, AccountType::Checking);
    let b = open_account(&engine, owner, AccountType::Checking);
    deposit(&engine, owner, a.id, "20");

    let txn = engine.transactions().submit(&as_customer(owner), transfer(a.id, b.id, "5", "h")).unwrap();
    let history = engine.transactions().history(&as_system(), txn.id).unwrap();

    let events: Vec<_> = history.iter().map(|h| h.event.as_str()).collect();
    assert_eq!(events, ["transaction_submitted", "transaction_approved", "transaction_completed"]);
    let priors: Vec<_> = history.iter().map(prior_status).collect();
    assert_eq!(priors, [None, Some("pending"), Some("approved")]);
    assert!(history.windows(2).all(|w| w[0].history_id < w[1].history_id));
}

#[test]
fn failed_transfer_history_ends_in_failed() {
    let (engine, _) = bank();
    let owner = user();
    let a = open_account(&engine, owner, AccountType::Checking);
    let b = open_account(&engine, owner, AccountType::Checking);

    let txn = engine.transactions().submit(&as_customer(owner), transfer(a.id, b.id, "5", "f")).unwrap();
    assert_eq!(txn.status, TransactionStatus::Failed);
    let history = engine.transactions().history(&as_system(), txn.id).unwrap();
    let events: Vec<_> = history.iter().map(|h| h.event.as_str()).collect();
    assert_eq!(events, ["transaction_submitted", "transaction_approved", "transaction_failed"]);
}

/// Terminal transactions cannot be cancelled.
#[test]
fn cancel_after_completion_is_a_precondition_failure() {
    let (engine, _) = bank();
    let owner = user();
    let a = open_account(&engine, owner, AccountType::Checking);
    let txn = deposit(&engine, owner, a.id, "5");
    assert_eq!(txn.status, TransactionStatus::Completed);

    let err = engine.transactions().cancel(&as_customer(owner), txn.id).unwrap_err();
    assert!(matches!(err, CoreError::InvalidTransition { .. }), "{err:?}");
    assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
    assert_eq!(engine.transactions().get(&as_system(), txn.id).unwrap().status, TransactionStatus::Completed);
}

#[test]
fn customers_cannot_touch_other_users_transactions() {
    let (engine, _) = bank();
    let owner = user();
    let a = open_account(&engine, owner, AccountType::Checking);
    let txn = deposit(&engine, owner, a.id, "5");

    let err = engine.transactions().cancel(&as_customer(user()), txn.id).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn unknown_transaction_is_not_found() {
    let (engine, _) = bank();
    let ctx = as_system();
    assert_eq!(engine.transactions().get(&ctx, user()).unwrap_err().kind(), ErrorKind::NotFound);
    assert_eq!(engine.transactions().history(&ctx, user()).unwrap_err().kind(), ErrorKind::NotFound);
    assert_eq!(engine.transactions().assessment(&ctx, user()).unwrap_err().kind(), ErrorKind::NotFound);
}

/// A deadline hit while screening leaves the transaction pending and
/// unapplied. The caller may then cancel it; a replay returns the cancelled
/// transaction.
#[test]
fn deadline_leaves_pending_then_cancel_wins() {
    let (engine, _) = bank_with(Arc::new(SlowScreening(Duration::from_secs(5))));
    let owner = user();
    let a = open_account(&engine, owner, AccountType::Checking);
    let b = open_account(&engine, owner, AccountType::Checking);
    let hurried = as_customer(owner).with_timeout(Duration::from_millis(100));
    let cmd = request(TransactionType::Deposit, None, Some(a.id), "10", "slow");
    let err = engine.transactions().submit(&hurried, cmd.clone()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeadlineExceeded, "{err:?}");

    let ctx = as_customer(owner);
    let pending = engine
        .transactions()
        .list_for_user(&ctx, owner, &TransactionQuery { status: Some(TransactionStatus::Pending), ..Default::default() })
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(balance(&engine, a.id), Money::ZERO);

    let cancelled = engine.transactions().cancel(&ctx, pending[0].id).unwrap();
    assert_eq!(cancelled.status, TransactionStatus::Cancelled);
    assert_eq!(cancelled.status_reason.as_deref(), Some("cancelled_by_caller"));
    assert!(cancelled.cancelled_at.is_some());

    let replay = engine.transactions().submit(&ctx, cmd).unwrap();
    assert_eq!(replay.id, cancelled.id);
    assert_eq!(replay.status, TransactionStatus::Cancelled);
    assert_eq!(balance(&engine, a.id), Money::ZERO);
    assert_eq!(balance(&engine, b.id), Money::ZERO);
}

/// Resubmitting a transaction left pending by a deadline resumes the pipeline.
#[test]
fn replay_resumes_a_pending_transaction() {
    let (engine, _) = bank_with(Arc::new(SlowScreening(Duration::from_secs(5))));
    let owner = user();
    let a = open_account(&engine, owner, AccountType::Checking);
    let cmd = request(TransactionType::Deposit, None, Some(a.id), "10", "resume");

    let hurried = as_customer(owner).with_timeout(Duration::from_millis(100));
    assert!(engine.transactions().submit(&hurried, cmd.clone()).is_err());

    // The screening service still does not answer in time, so the resumed
    // run ends flagged for manual review rather than completed.
    let resumed = engine.transactions().submit(&as_customer(owner), cmd).unwrap();
    assert_eq!(resumed.status, TransactionStatus::Flagged);
    assert_eq!(resumed.status_reason.as_deref(), Some("screening_unavailable"));
    assert_eq!(balance(&engine, a.id), Money::ZERO);

    let all = engine.transactions().list_for_user(&as_system(), owner, &TransactionQuery::default()).unwrap();
    assert_eq!(all.len(), 1);
}

#[test]
fn cancelled_request_context_aborts_before_writing() {
    let (engine, _) = bank();
    let owner = user();
    let a = open_account(&engine, owner, AccountType::Checking);
    let token = pulse_core::context::CancelToken::new();
    token.cancel();
    let ctx = as_customer(owner).with_cancel(token);

    let err = engine
        .transactions()
        .submit(&ctx, request(TransactionType::Deposit, None, Some(a.id), "10", "gone"))
        .unwrap_err();
    assert!(matches!(err, CoreError::Cancelled), "{err:?}");
    let all = engine.transactions().list_for_user(&as_system(), owner, &TransactionQuery::default()).unwrap();
    assert!(all.is_empty());
}

/// Time-window filters are inclusive below and exclusive above.
#[test]
fn listing_respects_time_window() {
    let (engine, clock) = bank();
    let owner = user();
    let a = open_account(&engine, owner, AccountType::Checking);
    let start = clock.now();
    for _ in 0..4 {
        deposit(&engine, owner, a.id, "1");
        clock.advance(chrono::Duration::hours(1));
    }
    let q = TransactionQuery {
        from: Some(start + chrono::Duration::hours(1)),
        to: Some(start + chrono::Duration::hours(3)),
        ..Default::default()
    };
    let window = engine.transactions().list_for_user(&as_system(), owner, &q).unwrap();
    assert_eq!(window.len(), 2);
    assert_eq!(window[0].created_at, start + chrono::Duration::hours(2));
    assert_eq!(window[1].created_at, start + chrono::Duration::hours(1));
}

/// Amounts up to the largest representable one settle; a credit that would
/// carry a balance past it fails cleanly and an oversized request is invalid.
#[test]
fn balances_stop_at_the_largest_amount() {
    let (engine, _) = bank();
    let owner = user();
    let a = open_account(&engine, owner, AccountType::Savings);
    let ctx = as_customer(owner);

    let full = deposit(&engine, owner, a.id, "922337203685477.5807");
    assert_eq!(full.status, TransactionStatus::Completed);
    assert_eq!(balance(&engine, a.id), money("922337203685477.5807"));

    let over = engine
        .transactions()
        .submit(&ctx, request(TransactionType::Deposit, None, Some(a.id), "0.0001", "one-more"))
        .unwrap();
    assert_eq!(over.status, TransactionStatus::Failed);
    assert_eq!(over.status_reason.as_deref(), Some("validation"));
    assert_eq!(balance(&engine, a.id), money("922337203685477.5807"));

    let mut huge = request(TransactionType::Deposit, None, Some(a.id), "1", "huge");
    huge.amount = Money::new(pulse_core::money::max_amount() + rust_decimal::Decimal::new(1, 4));
    let err = engine.transactions().submit(&ctx, huge).unwrap_err();
    match err {
        CoreError::Validation { fields, .. } => assert_eq!(fields[0].field, "amount"),
        other => panic!("unexpected {other:?}"),
    }
    let recorded = engine.transactions().list_for_account(&as_system(), a.id, &TransactionQuery::default()).unwrap();
    assert_eq!(recorded.len(), 2);
}
