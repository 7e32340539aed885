//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use pulse_core::{
    aml_scorer::{ScreeningFlags, ScreeningProvider},
    clock::ManualClock,
    context::{Principal, RequestContext},
    engine::Engine,
    error::{CoreError, CoreResult},
    ledger::{Account, AccountType, OpenAccount},
    money::{Currency, Money},
    transaction_engine::{SubmitTransaction, Transaction, TransactionMetadata, TransactionType},
    types::{AccountId, UserId},
};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub fn bank() -> (Engine, Arc<ManualClock>) {
    let _ = env_logger::builder().is_test(true).try_init();
    Engine::build_test(7).unwrap()
}

pub fn bank_with(screening: Arc<dyn ScreeningProvider>) -> (Engine, Arc<ManualClock>) {
    let _ = env_logger::builder().is_test(true).try_init();
    Engine::build_test_with(7, screening).unwrap()
}

pub fn usd() -> Currency {
    Currency::parse("USD").unwrap()
}

pub fn money(s: &str) -> Money {
    s.parse().unwrap()
}

pub fn user() -> UserId {
    Uuid::new_v4()
}

pub fn as_customer(user: UserId) -> RequestContext {
    RequestContext::new(Principal::customer(user))
}

pub fn as_reviewer() -> RequestContext {
    RequestContext::new(Principal::reviewer(Uuid::new_v4()))
}

pub fn as_system() -> RequestContext {
    RequestContext::system()
}

pub fn open_account(engine: &Engine, user: UserId, account_type: AccountType) -> Account {
    engine
        .ledger()
        .create(
            &as_customer(user),
            OpenAccount {
                user_id: user,
                name: format!("{account_type} account"),
                account_type,
                currency: usd(),
                credit_limit: None,
            },
        )
        .unwrap()
}

pub fn balance(engine: &Engine, id: AccountId) -> Money {
    engine.ledger().get(&as_system(), id).unwrap().balance
}

pub fn request(
    txn_type: TransactionType,
    source: Option<AccountId>,
    destination: Option<AccountId>,
    amount: &str,
    key: &str,
) -> SubmitTransaction {
    SubmitTransaction {
        txn_type,
        source_account_id: source,
        destination_account_id: destination,
        amount: money(amount),
        currency: usd(),
        metadata: TransactionMetadata::default(),
        idempotency_key: key.to_string(),
        description: None,
        category: None,
    }
}

pub fn transfer(source: AccountId, destination: AccountId, amount: &str, key: &str) -> SubmitTransaction {
    request(TransactionType::Transfer, Some(source), Some(destination), amount, key)
}

/// Credit `account` through a completed deposit.
pub fn deposit(engine: &Engine, user: UserId, account: AccountId, amount: &str) -> Transaction {
    let key = Uuid::new_v4().to_string();
    engine
        .transactions()
        .submit(&as_customer(user), request(TransactionType::Deposit, None, Some(account), amount, &key))
        .unwrap()
}

/// A screening service that never answers successfully.
pub struct DownScreening;

impl ScreeningProvider for DownScreening {
    fn screen(&self, _user: UserId) -> CoreResult<ScreeningFlags> {
        Err(CoreError::Unavailable { dependency: "screening".into(), message: "offline".into() })
    }
}

/// A screening service that answers cleanly, but only after `0`.
pub struct SlowScreening(pub Duration);

impl ScreeningProvider for SlowScreening {
    fn screen(&self, _user: UserId) -> CoreResult<ScreeningFlags> {
        std::thread::sleep(self.0);
        Ok(ScreeningFlags::default())
    }
}

/// A screening service whose lookups block until `release` is dropped,
/// counting every lookup that reached it.
pub struct HungScreening {
    pub calls: std::sync::atomic::AtomicUsize,
    release: crossbeam_channel::Receiver<()>,
}

impl HungScreening {
    pub fn new() -> (Arc<Self>, crossbeam_channel::Sender<()>) {
        let (tx, rx) = crossbeam_channel::bounded(0);
        (Arc::new(Self { calls: Default::default(), release: rx }), tx)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl ScreeningProvider for HungScreening {
    fn screen(&self, _user: UserId) -> CoreResult<ScreeningFlags> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let _ = self.release.recv();
        Err(CoreError::Unavailable { dependency: "screening".into(), message: "released".into() })
    }
}
