//! Transaction engine: end-to-end transfers, boundaries and balance laws.

mod common;

use common::*;
use pulse_core::{
    aml_scorer::RiskLevel,
    error::{CoreError, ErrorKind},
    ledger::AccountType,
    money::Money,
    store::TransactionQuery,
    transaction_engine::{TransactionStatus, TransactionType},
};

/// A=100, B=0; transfer 30 → A=70, B=30, completed, low risk.
#[test]
fn simple_transfer_completes() {
    let (engine, _) = bank();
    let owner = user();
    let a = open_account(&engine, owner, AccountType::Checking);
    let b = open_account(&engine, owner, AccountType::Savings);
    deposit(&engine, owner, a.id, "100.0000");

    let txn = engine
        .transactions()
        .submit(&as_customer(owner), transfer(a.id, b.id, "30.0000", "k1"))
        .unwrap();

    assert_eq!(txn.status, TransactionStatus::Completed);
    assert_eq!(txn.risk_level, Some(RiskLevel::Low));
    assert!(txn.completed_at.is_some());
    assert_eq!(balance(&engine, a.id).to_string(), "70.0000");
    assert_eq!(balance(&engine, b.id).to_string(), "30.0000");
}

/// A=10; transfer 15 → failed (insufficient), balances untouched.
#[test]
fn insufficient_funds_fails_without_moving_money() {
    let (engine, _) = bank();
    let owner = user();
    let a = open_account(&engine, owner, AccountType::Checking);
    let b = open_account(&engine, owner, AccountType::Checking);
    deposit(&engine, owner, a.id, "10.0000");

    let txn = engine
        .transactions()
        .submit(&as_customer(owner), transfer(a.id, b.id, "15.0000", "k2"))
        .unwrap();

    assert_eq!(txn.status, TransactionStatus::Failed);
    assert_eq!(txn.status_reason.as_deref(), Some("insufficient_funds"));
    assert!(txn.failed_at.is_some());
    assert_eq!(balance(&engine, a.id), money("10"));
    assert_eq!(balance(&engine, b.id), Money::ZERO);
}

/// Resubmitting the same command under "k1" returns the first transaction
/// and moves no money.
#[test]
fn idempotent_resubmit_moves_money_once() {
    let (engine, _) = bank();
    let owner = user();
    let a = open_account(&engine, owner, AccountType::Checking);
    let b = open_account(&engine, owner, AccountType::Savings);
    deposit(&engine, owner, a.id, "100");
    let ctx = as_customer(owner);

    let first = engine.transactions().submit(&ctx, transfer(a.id, b.id, "30.0000", "k1")).unwrap();
    let again = engine.transactions().submit(&ctx, transfer(a.id, b.id, "30.0000", "k1")).unwrap();

    assert_eq!(again.id, first.id);
    assert_eq!(again, first);
    assert_eq!(balance(&engine, a.id).to_string(), "70.0000");
    assert_eq!(balance(&engine, b.id).to_string(), "30.0000");
    let listed = engine
        .transactions()
        .list_for_user(&ctx, owner, &TransactionQuery { txn_type: Some(TransactionType::Transfer), ..Default::default() })
        .unwrap();
    assert_eq!(listed.len(), 1);
}

/// The same key with a different payload is a conflict.
#[test]
fn reused_key_with_new_payload_conflicts() {
    let (engine, _) = bank();
    let owner = user();
    let a = open_account(&engine, owner, AccountType::Checking);
    let b = open_account(&engine, owner, AccountType::Savings);
    deposit(&engine, owner, a.id, "100");
    let ctx = as_customer(owner);

    engine.transactions().submit(&ctx, transfer(a.id, b.id, "30", "k1")).unwrap();
    let err = engine.transactions().submit(&ctx, transfer(a.id, b.id, "31", "k1")).unwrap_err();
    assert!(matches!(err, CoreError::IdempotencyConflict { .. }), "{err:?}");
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(balance(&engine, a.id), money("70"));
}

/// Keys are scoped per user.
#[test]
fn keys_are_scoped_to_the_user() {
    let (engine, _) = bank();
    let (alice, bob) = (user(), user());
    let a = open_account(&engine, alice, AccountType::Checking);
    let b = open_account(&engine, bob, AccountType::Checking);
    let first = engine
        .transactions()
        .submit(&as_customer(alice), request(TransactionType::Deposit, None, Some(a.id), "5", "same"))
        .unwrap();
    let second = engine
        .transactions()
        .submit(&as_customer(bob), request(TransactionType::Deposit, None, Some(b.id), "5", "same"))
        .unwrap();
    assert_ne!(first.id, second.id);
    assert_eq!(second.status, TransactionStatus::Completed);
}

#[test]
fn transfer_of_exact_balance_empties_account() {
    let (engine, _) = bank();
    let owner = user();
    let a = open_account(&engine, owner, AccountType::Checking);
    let b = open_account(&engine, owner, AccountType::Checking);
    deposit(&engine, owner, a.id, "42.4242");

    let txn = engine
        .transactions()
        .submit(&as_customer(owner), transfer(a.id, b.id, "42.4242", "all"))
        .unwrap();
    assert_eq!(txn.status, TransactionStatus::Completed);
    assert_eq!(balance(&engine, a.id), Money::ZERO);
    assert_eq!(balance(&engine, b.id), money("42.4242"));
}

#[test]
fn transfer_one_minor_unit_over_balance_fails() {
    let (engine, _) = bank();
    let owner = user();
    let a = open_account(&engine, owner, AccountType::Checking);
    let b = open_account(&engine, owner, AccountType::Checking);
    deposit(&engine, owner, a.id, "42.4242");

    let txn = engine
        .transactions()
        .submit(&as_customer(owner), transfer(a.id, b.id, "42.4243", "over"))
        .unwrap();
    assert_eq!(txn.status, TransactionStatus::Failed);
    assert_eq!(txn.status_reason.as_deref(), Some("insufficient_funds"));
    assert_eq!(balance(&engine, a.id), money("42.4242"));
    assert_eq!(balance(&engine, b.id), Money::ZERO);
}

/// Each completed transfer moves exactly its amount; the currency total is conserved.
#[test]
fn completed_transfers_conserve_total_balance() {
    let (engine, _) = bank();
    let owner = user();
    let accounts: Vec<_> = (0..4).map(|_| open_account(&engine, owner, AccountType::Checking)).collect();
    deposit(&engine, owner, accounts[0].id, "1000");
    deposit(&engine, owner, accounts[1].id, "250.5");
    let ctx = as_customer(owner);
    let total = || -> Money { accounts.iter().map(|a| balance(&engine, a.id)).sum() };
    let before = total();

    let moves = [(0, 1, "120.25"), (1, 2, "300"), (2, 3, "99.9999"), (3, 0, "5000"), (0, 3, "10")];
    for (i, (from, to, amount)) in moves.iter().enumerate() {
        let (src, dst) = (accounts[*from].id, accounts[*to].id);
        let (src_pre, dst_pre) = (balance(&engine, src), balance(&engine, dst));
        let txn = engine.transactions().submit(&ctx, transfer(src, dst, amount, &format!("m{i}"))).unwrap();
        match txn.status {
            TransactionStatus::Completed => {
                assert_eq!(balance(&engine, src), src_pre - txn.amount);
                assert_eq!(balance(&engine, dst), dst_pre + txn.amount);
            }
            TransactionStatus::Failed => {
                assert_eq!(balance(&engine, src), src_pre);
                assert_eq!(balance(&engine, dst), dst_pre);
            }
            other => panic!("unexpected status {other}"),
        }
        assert_eq!(total(), before);
    }
    assert_eq!(balance(&engine, accounts[3].id), money("109.9999"));
    let uow = engine.store().read(&as_system()).unwrap();
    assert_eq!(uow.total_balance(&usd()).unwrap(), before);
}

/// Two transfers over four distinct accounts end in the same state in either order.
#[test]
fn disjoint_transfers_commute() {
    let run = |reversed: bool| -> Vec<Money> {
        let (engine, _) = bank();
        let owner = user();
        let acc: Vec<_> = (0..4).map(|_| open_account(&engine, owner, AccountType::Checking)).collect();
        deposit(&engine, owner, acc[0].id, "100");
        deposit(&engine, owner, acc[2].id, "60");
        let ctx = as_customer(owner);
        let mut cmds = vec![transfer(acc[0].id, acc[1].id, "45", "x"), transfer(acc[2].id, acc[3].id, "60", "y")];
        if reversed {
            cmds.reverse();
        }
        for cmd in cmds {
            let txn = engine.transactions().submit(&ctx, cmd).unwrap();
            assert_eq!(txn.status, TransactionStatus::Completed);
        }
        acc.iter().map(|a| balance(&engine, a.id)).collect()
    };
    let forward = run(false);
    assert_eq!(forward, run(true));
    assert_eq!(forward, vec![money("55"), money("45"), Money::ZERO, money("60")]);
}

#[test]
fn static_validation_errors_persist_nothing() {
    let (engine, _) = bank();
    let owner = user();
    let a = open_account(&engine, owner, AccountType::Checking);
    let ctx = as_customer(owner);

    let err = engine.transactions().submit(&ctx, transfer(a.id, a.id, "10", "self")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    let err = engine.transactions().submit(&ctx, transfer(a.id, a.id, "0", "zero")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    let err = engine
        .transactions()
        .submit(&ctx, request(TransactionType::Deposit, Some(a.id), None, "10", "wrong-side"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let listed = engine.transactions().list_for_user(&ctx, owner, &TransactionQuery::default()).unwrap();
    assert!(listed.is_empty());
}

/// Store-level policy violations reject the transaction with a reason.
#[test]
fn policy_violations_are_rejected() {
    let (engine, _) = bank();
    let (owner, stranger) = (user(), user());
    let mine = open_account(&engine, owner, AccountType::Checking);
    let theirs = open_account(&engine, stranger, AccountType::Checking);
    deposit(&engine, stranger, theirs.id, "50");
    let ctx = as_customer(owner);

    let stolen = engine.transactions().submit(&ctx, transfer(theirs.id, mine.id, "50", "steal")).unwrap();
    assert_eq!(stolen.status, TransactionStatus::Rejected);
    assert_eq!(stolen.status_reason.as_deref(), Some("account_not_owned"));

    let missing = engine.transactions().submit(&ctx, transfer(mine.id, user(), "1", "ghost")).unwrap();
    assert_eq!(missing.status, TransactionStatus::Rejected);
    assert_eq!(missing.status_reason.as_deref(), Some("account_not_found"));
    assert_eq!(engine.transactions().get(&ctx, missing.id).unwrap(), missing);
    let replayed = engine.transactions().submit(&ctx, transfer(mine.id, missing.destination_account_id.unwrap(), "1", "ghost")).unwrap();
    assert_eq!(replayed, missing);

    let mut euros = request(TransactionType::Deposit, None, Some(mine.id), "1", "eur");
    euros.currency = pulse_core::money::Currency::parse("EUR").unwrap();
    let mismatch = engine.transactions().submit(&ctx, euros).unwrap();
    assert_eq!(mismatch.status, TransactionStatus::Rejected);
    assert_eq!(mismatch.status_reason.as_deref(), Some("currency_mismatch"));

    assert_eq!(balance(&engine, theirs.id), money("50"));
    assert_eq!(balance(&engine, mine.id), Money::ZERO);
}

/// Listings filter by status and type and page newest first.
#[test]
fn listings_filter_and_page() {
    let (engine, clock) = bank();
    let owner = user();
    let a = open_account(&engine, owner, AccountType::Checking);
    let b = open_account(&engine, owner, AccountType::Checking);
    let ctx = as_customer(owner);
    for i in 0..3 {
        deposit(&engine, owner, a.id, "10");
        clock.advance(chrono::Duration::days(1));
        engine.transactions().submit(&ctx, transfer(a.id, b.id, "1000", &format!("big{i}"))).unwrap();
        clock.advance(chrono::Duration::days(1));
    }

    let txns = engine.transactions();
    let failed = txns
        .list_for_user(&ctx, owner, &TransactionQuery { status: Some(TransactionStatus::Failed), ..Default::default() })
        .unwrap();
    assert_eq!(failed.len(), 3);
    assert!(failed.windows(2).all(|w| w[0].created_at >= w[1].created_at));

    let page = txns
        .list_for_user(&ctx, owner, &TransactionQuery { limit: Some(2), offset: Some(1), ..Default::default() })
        .unwrap();
    assert_eq!(page.len(), 2);

    let touching_b = txns.list_for_account(&ctx, b.id, &TransactionQuery::default()).unwrap();
    assert_eq!(touching_b.len(), 3);
    assert!(touching_b.iter().all(|t| t.txn_type == TransactionType::Transfer));
}
