//! Account ledger: numbering, round-trips, credit lines and closing.

mod common;

use common::*;
use pulse_core::{
    aml_scorer::StaticScreening,
    clock::ManualClock,
    config::CoreConfig,
    engine::{Engine, TEST_EPOCH_SECS},
    error::{CoreError, ErrorKind},
    ledger::{AccountType, OpenAccount},
    money::{Currency, Money},
    rng::SuffixSource,
    store::Store,
    transaction_engine::{TransactionStatus, TransactionType},
    types::ts_from_secs,
};
use std::sync::Arc;

struct FixedSuffix;

impl SuffixSource for FixedSuffix {
    fn next_suffix(&self) -> String {
        "AAAAAAAA".into()
    }
}

/// Account numbers carry the type prefix and an 8-character suffix.
#[test]
fn account_numbers_follow_type_prefix() {
    let (engine, _) = bank();
    let owner = user();
    for (kind, prefix) in [
        (AccountType::Savings, "SAV"),
        (AccountType::Checking, "CHK"),
        (AccountType::Investment, "INV"),
        (AccountType::Credit, "CRD"),
    ] {
        let account = open_account(&engine, owner, kind);
        assert!(account.account_number.starts_with(prefix), "{}", account.account_number);
        assert_eq!(account.account_number.len(), 11);
        assert_eq!(account.balance, Money::ZERO);
        assert!(account.active);
    }
    assert_eq!(engine.ledger().list_by_user(&as_system(), owner).unwrap().len(), 4);
}

/// create then get returns the same entity, field for field.
#[test]
fn create_then_get_round_trips() {
    let (engine, _) = bank();
    let created = open_account(&engine, user(), AccountType::Checking);
    let fetched = engine.ledger().get(&as_system(), created.id).unwrap();
    assert_eq!(fetched, created);
    assert_eq!(
        serde_json::to_string(&fetched).unwrap(),
        serde_json::to_string(&created).unwrap()
    );
    let by_number = engine.ledger().get_by_number(&as_system(), &created.account_number).unwrap();
    assert_eq!(by_number.id, created.id);
}

#[test]
fn unknown_account_is_not_found() {
    let (engine, _) = bank();
    let err = engine.ledger().get(&as_system(), user()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    let err = engine.ledger().get_by_number(&as_system(), "CHKNOPE0000").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

/// Exhausting K attempts on a taken number fails with a conflict.
#[test]
fn colliding_numbers_exhaust_attempts() {
    let engine = Engine::build(
        Store::in_memory().unwrap(),
        CoreConfig::default_test(),
        Arc::new(ManualClock::new(ts_from_secs(TEST_EPOCH_SECS))),
        Arc::new(FixedSuffix),
        Arc::new(StaticScreening::new()),
    )
    .unwrap();
    let owner = user();
    let first = open_account(&engine, owner, AccountType::Savings);
    assert_eq!(first.account_number, "SAVAAAAAAAA");

    let err = engine
        .ledger()
        .create(
            &as_customer(owner),
            OpenAccount {
                user_id: owner,
                name: "second".into(),
                account_type: AccountType::Savings,
                currency: usd(),
                credit_limit: None,
            },
        )
        .unwrap_err();
    assert!(matches!(err, CoreError::DuplicateAccountNumber { attempts: 5 }), "{err:?}");
    assert_eq!(err.kind(), ErrorKind::Conflict);

    // A different prefix does not collide.
    let checking = open_account(&engine, owner, AccountType::Checking);
    assert_eq!(checking.account_number, "CHKAAAAAAAA");
}

#[test]
fn create_reports_every_bad_field() {
    let (engine, _) = bank();
    let owner = user();
    let err = engine
        .ledger()
        .create(
            &as_customer(owner),
            OpenAccount {
                user_id: owner,
                name: "   ".into(),
                account_type: AccountType::Savings,
                currency: Currency::parse("XYZ").unwrap(),
                credit_limit: Some(money("100")),
            },
        )
        .unwrap_err();
    match err {
        CoreError::Validation { fields, .. } => {
            let names: Vec<_> = fields.iter().map(|f| f.field.as_str()).collect();
            assert_eq!(names, ["name", "currency", "credit_limit"]);
        }
        other => panic!("unexpected {other:?}"),
    }
}

/// Credit accounts may go negative down to their credit line and no further.
#[test]
fn credit_line_bounds_withdrawals() {
    let (engine, _) = bank();
    let owner = user();
    let card = engine
        .ledger()
        .create(
            &as_customer(owner),
            OpenAccount {
                user_id: owner,
                name: "Card".into(),
                account_type: AccountType::Credit,
                currency: usd(),
                credit_limit: Some(money("500")),
            },
        )
        .unwrap();
    let ctx = as_customer(owner);
    let txns = engine.transactions();

    let first = txns.submit(&ctx, request(TransactionType::Withdrawal, Some(card.id), None, "300", "w1")).unwrap();
    assert_eq!(first.status, TransactionStatus::Completed);
    assert_eq!(balance(&engine, card.id), money("-300"));

    let second = txns.submit(&ctx, request(TransactionType::Withdrawal, Some(card.id), None, "200.0001", "w2")).unwrap();
    assert_eq!(second.status, TransactionStatus::Failed);
    assert_eq!(second.status_reason.as_deref(), Some("insufficient_funds"));
    assert_eq!(balance(&engine, card.id), money("-300"));

    let third = txns.submit(&ctx, request(TransactionType::Withdrawal, Some(card.id), None, "200", "w3")).unwrap();
    assert_eq!(third.status, TransactionStatus::Completed);
    assert_eq!(balance(&engine, card.id), money("-500"));
}

#[test]
fn close_requires_zero_balance() {
    let (engine, _) = bank();
    let owner = user();
    let account = open_account(&engine, owner, AccountType::Checking);
    deposit(&engine, owner, account.id, "25");

    let err = engine.ledger().close(&as_customer(owner), account.id).unwrap_err();
    assert!(matches!(err, CoreError::AccountHasBalance { .. }), "{err:?}");
    assert_eq!(err.kind(), ErrorKind::PreconditionFailed);

    let ctx = as_customer(owner);
    engine
        .transactions()
        .submit(&ctx, request(TransactionType::Withdrawal, Some(account.id), None, "25", "drain"))
        .unwrap();
    let closed = engine.ledger().close(&ctx, account.id).unwrap();
    assert!(!closed.active);
    assert!(closed.closed_at.is_some());
    assert_eq!(engine.ledger().get(&as_system(), account.id).unwrap(), closed);

    let err = engine.ledger().close(&ctx, account.id).unwrap_err();
    assert!(matches!(err, CoreError::AccountInactive { .. }), "{err:?}");
}

/// Money sent to a closed account is rejected without touching any balance.
#[test]
fn closed_account_rejects_deposits() {
    let (engine, _) = bank();
    let owner = user();
    let account = open_account(&engine, owner, AccountType::Savings);
    engine.ledger().close(&as_customer(owner), account.id).unwrap();

    let txn = deposit(&engine, owner, account.id, "10");
    assert_eq!(txn.status, TransactionStatus::Rejected);
    assert_eq!(txn.status_reason.as_deref(), Some("account_inactive"));
    assert_eq!(balance(&engine, account.id), Money::ZERO);
}

/// Every balance change leaves the prior account state in history.
#[test]
fn history_records_prior_states() {
    let (engine, _) = bank();
    let owner = user();
    let account = open_account(&engine, owner, AccountType::Checking);
    deposit(&engine, owner, account.id, "10");
    deposit(&engine, owner, account.id, "5");

    let history = engine.ledger().history(&as_system(), account.id).unwrap();
    let events: Vec<_> = history.iter().map(|h| h.event.as_str()).collect();
    assert_eq!(events, ["account_opened", "balance_applied", "balance_applied"]);
    assert!(history[0].prior_state.is_none());
    let prior_balance = &history[2].prior_state.as_ref().unwrap()["balance"];
    assert_eq!(prior_balance.as_f64(), Some(10.0));
    assert_eq!(balance(&engine, account.id), money("15"));
}

/// The same seed yields the same account numbers.
#[test]
fn seeded_numbering_is_reproducible() {
    let numbers = || -> Vec<String> {
        let (engine, _) = bank();
        let owner = user();
        [AccountType::Checking, AccountType::Savings, AccountType::Investment]
            .into_iter()
            .map(|kind| open_account(&engine, owner, kind).account_number)
            .collect()
    };
    assert_eq!(numbers(), numbers());
}
