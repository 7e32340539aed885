//! The engine: wires the five components over one store and dispatches
//! decoded commands to them.
//!
//! WIRING ORDER (dependencies point upward only):
//!   1. Account Ledger
//!   2. AML Risk Scorer
//!   3. Transaction Engine      (ledger, scorer)
//!   4. Loan Amortizer          (transaction engine)
//!   5. Position Keeper         (transaction engine)
//!
//! RULES:
//!   - Components hold no mutable in-memory state; everything lives in the store.
//!   - Configuration is passed in explicitly. Nothing reads globals.
//!   - Every error leaving `dispatch` is folded into an `ErrorResponse`
//!     carrying the request's correlation id.

use crate::{
    aml_scorer::{AmlRiskScorer, ScreeningProvider, StaticScreening},
    clock::{Clock, ManualClock},
    command::{Command, Response},
    config::CoreConfig,
    context::RequestContext,
    error::CoreResult,
    event::AuditRecord,
    ledger::AccountLedger,
    loan_amortizer::LoanAmortizer,
    position_keeper::PositionKeeper,
    rng::{SeededSuffixes, SuffixSource},
    store::Store,
    transaction_engine::TransactionEngine,
    types::{ts_from_secs, EntityId},
};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

/// 2024-01-01T00:00:00Z, the fixed start of test clocks.
pub const TEST_EPOCH_SECS: i64 = 1_704_067_200;

pub struct Engine {
    store: Store,
    config: Arc<CoreConfig>,
    clock: Arc<dyn Clock>,
    ledger: Arc<AccountLedger>,
    scorer: Arc<AmlRiskScorer>,
    transactions: Arc<TransactionEngine>,
    loans: Arc<LoanAmortizer>,
    positions: Arc<PositionKeeper>,
}

impl Engine {
    /// Migrate `store` and wire every component over it.
    pub fn build(
        store: Store,
        config: CoreConfig,
        clock: Arc<dyn Clock>,
        suffixes: Arc<dyn SuffixSource>,
        screening: Arc<dyn ScreeningProvider>,
    ) -> CoreResult<Self> {
        store.migrate()?;
        let config = Arc::new(config);

        let ledger = Arc::new(AccountLedger::new(store.clone(), clock.clone(), suffixes, config.clone()));
        let scorer = Arc::new(AmlRiskScorer::new(config.clone(), screening));
        let transactions = Arc::new(TransactionEngine::new(
            store.clone(),
            clock.clone(),
            ledger.clone(),
            scorer.clone(),
            config.clone(),
        ));
        let loans = Arc::new(LoanAmortizer::new(store.clone(), clock.clone(), transactions.clone(), config.clone()));
        let positions = Arc::new(PositionKeeper::new(store.clone(), clock.clone(), transactions.clone(), config.clone()));

        log::info!(
            "engine ready: {} currencies, store {}",
            config.currencies.len(),
            store.path().unwrap_or(":memory:")
        );
        Ok(Self { store, config, clock, ledger, scorer, transactions, loans, positions })
    }

    /// In-memory store, test config, a manual clock at [`TEST_EPOCH_SECS`],
    /// seeded account numbers and an empty screening list.
    pub fn build_test(seed: u64) -> CoreResult<(Self, Arc<ManualClock>)> {
        Self::build_test_with(seed, Arc::new(StaticScreening::new()))
    }

    pub fn build_test_with(
        seed: u64,
        screening: Arc<dyn ScreeningProvider>,
    ) -> CoreResult<(Self, Arc<ManualClock>)> {
        let clock = Arc::new(ManualClock::new(ts_from_secs(TEST_EPOCH_SECS)));
        let engine = Self::build(
            Store::in_memory()?,
            CoreConfig::default_test(),
            clock.clone(),
            Arc::new(SeededSuffixes::new(seed)),
            screening,
        )?;
        Ok((engine, clock))
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn ledger(&self) -> &AccountLedger {
        &self.ledger
    }

    pub fn scorer(&self) -> &AmlRiskScorer {
        &self.scorer
    }

    pub fn transactions(&self) -> &TransactionEngine {
        &self.transactions
    }

    pub fn loans(&self) -> &LoanAmortizer {
        &self.loans
    }

    pub fn positions(&self) -> &PositionKeeper {
        &self.positions
    }

    /// Audit records for one entity, oldest first.
    pub fn audit_for_entity(&self, ctx: &RequestContext, entity_id: EntityId) -> CoreResult<Vec<AuditRecord>> {
        let uow = self.store.read(ctx)?;
        uow.audit_for_entity(entity_id)
    }

    /// Run one command and fold the outcome into a `Response`.
    pub fn dispatch(&self, ctx: &RequestContext, cmd: Command) -> Response {
        let name = cmd.name();
        log::debug!("[{}] dispatch {name} as {}", ctx.correlation_id, ctx.principal.actor());
        match self.execute(ctx, cmd) {
            Ok(data) => Response::Ok { correlation_id: ctx.correlation_id.clone(), data },
            Err(e) => {
                if e.is_retryable() {
                    log::warn!("[{}] {name} failed, retryable: {e}", ctx.correlation_id);
                } else {
                    log::debug!("[{}] {name} failed: {e}", ctx.correlation_id);
                }
                Response::Error { error: e.to_response(&ctx.correlation_id) }
            }
        }
    }

    /// Run one command and return its result as JSON.
    pub fn execute(&self, ctx: &RequestContext, cmd: Command) -> CoreResult<Value> {
        match cmd {
            Command::OpenAccount(req) => json(self.ledger.create(ctx, req)?),
            Command::GetAccount { account_id } => json(self.ledger.get(ctx, account_id)?),
            Command::GetAccountByNumber { account_number } => json(self.ledger.get_by_number(ctx, &account_number)?),
            Command::ListAccounts { user_id } => json(self.ledger.list_by_user(ctx, user_id)?),
            Command::CloseAccount { account_id } => json(self.ledger.close(ctx, account_id)?),
            Command::AccountHistory { account_id } => json(self.ledger.history(ctx, account_id)?),

            Command::SubmitTransaction(req) => json(self.transactions.submit(ctx, req)?),
            Command::GetTransaction { transaction_id } => json(self.transactions.get(ctx, transaction_id)?),
            Command::CancelTransaction { transaction_id } => json(self.transactions.cancel(ctx, transaction_id)?),
            Command::ListUserTransactions { user_id, query } => {
                json(self.transactions.list_for_user(ctx, user_id, &query)?)
            }
            Command::ListAccountTransactions { account_id, query } => {
                json(self.transactions.list_for_account(ctx, account_id, &query)?)
            }
            Command::TransactionHistory { transaction_id } => json(self.transactions.history(ctx, transaction_id)?),

            Command::GetAssessment { transaction_id } => json(self.transactions.assessment(ctx, transaction_id)?),
            Command::ReviewTransaction { transaction_id, decision, notes } => {
                json(self.transactions.review(ctx, transaction_id, decision, notes)?)
            }

            Command::ApplyLoan(req) => json(self.loans.apply(ctx, req)?),
            Command::DecideLoan { loan_id, decision, notes } => json(self.loans.decide(ctx, loan_id, decision, notes)?),
            Command::DisburseLoan { loan_id } => json(self.loans.disburse(ctx, loan_id)?),
            Command::RecordLoanPayment { loan_id, amount } => json(self.loans.record_payment(ctx, loan_id, amount)?),
            Command::ListLoanPayments { loan_id } => json(self.loans.list_payments(ctx, loan_id)?),
            Command::LoanSchedule { loan_id } => json(self.loans.get_schedule(ctx, loan_id)?),
            Command::GetLoan { loan_id } => json(self.loans.get(ctx, loan_id)?),
            Command::ListUserLoans { user_id } => json(self.loans.list_by_user(ctx, user_id)?),
            Command::ListAccountLoans { account_id } => json(self.loans.list_by_account(ctx, account_id)?),
            Command::CheckOverdue { loan_id } => json(self.loans.check_overdue(ctx, loan_id)?),
            Command::LoanHistory { loan_id } => json(self.loans.history(ctx, loan_id)?),

            Command::OpenPosition(req) => json(self.positions.open(ctx, req)?),
            Command::Revalue { symbol, price, tick_at } => json(self.positions.revalue(ctx, &symbol, price, tick_at)?),
            Command::ClosePosition { position_id, sale_price } => {
                json(self.positions.close(ctx, position_id, sale_price)?)
            }
            Command::GetPosition { position_id } => json(self.positions.get(ctx, position_id)?),
            Command::ListUserPositions { user_id } => json(self.positions.list_by_user(ctx, user_id)?),
            Command::ListAccountPositions { account_id } => json(self.positions.list_by_account(ctx, account_id)?),
            Command::ListSymbolPositions { symbol } => json(self.positions.list_by_symbol(ctx, &symbol)?),
            Command::LatestPrice { symbol } => json(self.positions.latest_price(ctx, &symbol)?),
            Command::Portfolio { user_id } => json(self.positions.portfolio(ctx, user_id)?),
            Command::PositionHistory { position_id } => json(self.positions.history(ctx, position_id)?),

            Command::AuditForEntity { entity_id } => json(self.audit_for_entity(ctx, entity_id)?),
        }
    }
}

fn json<T: Serialize>(value: T) -> CoreResult<Value> {
    Ok(serde_json::to_value(value)?)
}
