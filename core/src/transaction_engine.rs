//! Transaction Engine: accepts money-movement requests and drives each one
//! through the transaction state machine.
//!
//! STATE MACHINE (no other edges exist):
//!   pending  → approved | flagged | rejected | cancelled
//!   flagged  → approved | rejected
//!   approved → completed | failed
//!
//! RULES:
//!   - (user, idempotency key) identifies a request. A replay returns the
//!     stored transaction; a different payload under the same key conflicts.
//!   - Scoring runs outside any write lock. Balance application re-checks
//!     that the transaction is still pending under the lock.
//!   - Accounts are locked in ascending id order before any balance write.
//!   - A failed balance application rolls back only its own savepoint; the
//!     `failed` status and its audit record still commit.
//!   - Every status change writes a history row and an audit record in the
//!     same Unit of Work.

use crate::{
    aml_scorer::{AmlRiskScorer, Recommendation, RiskAssessment, RiskLevel, UserProfile},
    clock::Clock,
    component::Component,
    config::CoreConfig,
    context::{PrincipalRole, RequestContext},
    error::{CoreError, CoreResult, ErrorKind, Validator},
    event::AuditEvent,
    ledger::{AccountLedger, BalanceChange},
    money::{Currency, Money},
    store::{HistoryEntry, HistoryTable, Store, TransactionQuery, UnitOfWork},
    types::{new_id, AccountId, Timestamp, TransactionId, UserId},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

const MAX_KEY_LEN: usize = 128;
const MAX_TEXT_LEN: usize = 500;

// ── Types ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Deposit,
    Withdrawal,
    Transfer,
    Payment,
    Interest,
    Fee,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Deposit => "deposit",
            TransactionType::Withdrawal => "withdrawal",
            TransactionType::Transfer => "transfer",
            TransactionType::Payment => "payment",
            TransactionType::Interest => "interest",
            TransactionType::Fee => "fee",
        }
    }

    /// Check which account references this type requires or forbids.
    pub fn check_accounts(&self, source: Option<AccountId>, destination: Option<AccountId>) -> CoreResult<()> {
        let (needs_source, needs_destination, allows_destination) = match self {
            TransactionType::Deposit | TransactionType::Interest => (false, true, true),
            TransactionType::Withdrawal | TransactionType::Fee => (true, false, false),
            TransactionType::Transfer => (true, true, true),
            TransactionType::Payment => (true, false, true),
        };
        let mut v = Validator::new();
        v.check(
            needs_source == source.is_some(),
            "source_account_id",
            if needs_source {
                format!("required for {self}")
            } else {
                format!("not allowed for {self}")
            },
        );
        v.check(
            !needs_destination || destination.is_some(),
            "destination_account_id",
            format!("required for {self}"),
        );
        v.check(
            allows_destination || destination.is_none(),
            "destination_account_id",
            format!("not allowed for {self}"),
        );
        if let (Some(s), Some(d)) = (source, destination) {
            v.check(s != d, "destination_account_id", "must differ from the source account");
        }
        v.finish()
    }
}

impl FromStr for TransactionType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deposit" => Ok(TransactionType::Deposit),
            "withdrawal" => Ok(TransactionType::Withdrawal),
            "transfer" => Ok(TransactionType::Transfer),
            "payment" => Ok(TransactionType::Payment),
            "interest" => Ok(TransactionType::Interest),
            "fee" => Ok(TransactionType::Fee),
            other => Err(CoreError::validation("txn_type", format!("unknown type '{other}'"))),
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Approved,
    Rejected,
    Flagged,
    Completed,
    Cancelled,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Approved => "approved",
            TransactionStatus::Rejected => "rejected",
            TransactionStatus::Flagged => "flagged",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Cancelled => "cancelled",
            TransactionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Completed
                | TransactionStatus::Failed
                | TransactionStatus::Rejected
                | TransactionStatus::Cancelled
        )
    }

    /// The only edges of the state machine.
    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;
        matches!(
            (self, next),
            (Pending, Approved)
                | (Pending, Flagged)
                | (Pending, Rejected)
                | (Pending, Cancelled)
                | (Flagged, Approved)
                | (Flagged, Rejected)
                | (Approved, Completed)
                | (Approved, Failed)
        )
    }

    fn event(&self) -> AuditEvent {
        match self {
            TransactionStatus::Pending => AuditEvent::TransactionSubmitted,
            TransactionStatus::Approved => AuditEvent::TransactionApproved,
            TransactionStatus::Rejected => AuditEvent::TransactionRejected,
            TransactionStatus::Flagged => AuditEvent::TransactionFlagged,
            TransactionStatus::Completed => AuditEvent::TransactionCompleted,
            TransactionStatus::Cancelled => AuditEvent::TransactionCancelled,
            TransactionStatus::Failed => AuditEvent::TransactionFailed,
        }
    }
}

impl FromStr for TransactionStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TransactionStatus::Pending),
            "approved" => Ok(TransactionStatus::Approved),
            "rejected" => Ok(TransactionStatus::Rejected),
            "flagged" => Ok(TransactionStatus::Flagged),
            "completed" => Ok(TransactionStatus::Completed),
            "cancelled" => Ok(TransactionStatus::Cancelled),
            "failed" => Ok(TransactionStatus::Failed),
            other => Err(CoreError::validation("status", format!("unknown status '{other}'"))),
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

/// Request signals consumed by the AML scorer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoPoint>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    pub txn_type: TransactionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_account_id: Option<AccountId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_account_id: Option<AccountId>,
    pub amount: Money,
    pub currency: Currency,
    pub status: TransactionStatus,
    /// Machine-readable cause of rejected / failed / flagged outcomes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_level: Option<RiskLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default)]
    pub metadata: TransactionMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewed_by: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_notes: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flagged_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejected_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<Timestamp>,
}

impl Transaction {
    fn stamp(&mut self, status: TransactionStatus, at: Timestamp) {
        self.status = status;
        self.updated_at = at;
        let slot = match status {
            TransactionStatus::Pending => return,
            TransactionStatus::Approved => &mut self.approved_at,
            TransactionStatus::Flagged => &mut self.flagged_at,
            TransactionStatus::Rejected => &mut self.rejected_at,
            TransactionStatus::Completed => &mut self.completed_at,
            TransactionStatus::Failed => &mut self.failed_at,
            TransactionStatus::Cancelled => &mut self.cancelled_at,
        };
        *slot = Some(at);
    }

    /// Accounts this transaction touches, source first.
    pub fn accounts(&self) -> Vec<AccountId> {
        [self.source_account_id, self.destination_account_id]
            .into_iter()
            .flatten()
            .collect()
    }
}

/// A customer request to move money.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitTransaction {
    pub txn_type: TransactionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_account_id: Option<AccountId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_account_id: Option<AccountId>,
    pub amount: Money,
    pub currency: Currency,
    #[serde(default)]
    pub metadata: TransactionMetadata,
    pub idempotency_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Approve,
    Reject,
}

/// A system-originated movement (loan disbursement, repayment, sale proceeds)
/// posted inside another component's Unit of Work. Not scored.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct InternalPosting {
    pub user_id: UserId,
    pub txn_type: TransactionType,
    pub source_account_id: Option<AccountId>,
    pub destination_account_id: Option<AccountId>,
    pub amount: Money,
    pub currency: Currency,
    pub description: String,
    pub category: &'static str,
}

// ── Component ────────────────────────────────────────────────────────────────

pub struct TransactionEngine {
    store: Store,
    clock: Arc<dyn Clock>,
    ledger: Arc<AccountLedger>,
    scorer: Arc<AmlRiskScorer>,
    config: Arc<CoreConfig>,
}

impl Component for TransactionEngine {
    fn name(&self) -> &'static str {
        "transaction_engine"
    }
}

impl TransactionEngine {
    pub fn new(
        store: Store,
        clock: Arc<dyn Clock>,
        ledger: Arc<AccountLedger>,
        scorer: Arc<AmlRiskScorer>,
        config: Arc<CoreConfig>,
    ) -> Self {
        Self { store, clock, ledger, scorer, config }
    }

    fn validate(&self, cmd: &SubmitTransaction) -> CoreResult<()> {
        let key = cmd.idempotency_key.trim();
        let mut v = Validator::new();
        v.check(cmd.amount.is_positive(), "amount", "must be greater than zero")
            .check(cmd.amount.in_range(), "amount", "exceeds the largest amount")
            .check(
                self.config.is_allowed_currency(&cmd.currency),
                "currency",
                format!("{} is not an accepted currency", cmd.currency),
            )
            .check(!key.is_empty(), "idempotency_key", "required")
            .check(key.len() <= MAX_KEY_LEN, "idempotency_key", format!("at most {MAX_KEY_LEN} bytes"))
            .check(
                cmd.description.as_ref().map_or(true, |d| d.len() <= MAX_TEXT_LEN),
                "description",
                format!("at most {MAX_TEXT_LEN} bytes"),
            );
        if let Some(loc) = cmd.metadata.location {
            v.check(
                (-90.0..=90.0).contains(&loc.latitude) && (-180.0..=180.0).contains(&loc.longitude),
                "metadata.location",
                "latitude must be within ±90 and longitude within ±180",
            );
        }
        if let Err(e) = cmd.txn_type.check_accounts(cmd.source_account_id, cmd.destination_account_id) {
            v.push(e);
        }
        v.finish()
    }

    /// Submit a request. Returns the transaction in whatever state the
    /// pipeline left it: completed, failed, flagged, rejected, or (if the
    /// caller cancelled meanwhile) cancelled.
    pub fn submit(&self, ctx: &RequestContext, cmd: SubmitTransaction) -> CoreResult<Transaction> {
        self.validate(&cmd)?;
        let fingerprint = serde_json::to_string(&cmd)?;

        let txn = match self.record_pending(ctx, &cmd, &fingerprint)? {
            Recorded::Fresh(txn) => txn,
            Recorded::Replay(txn) if txn.status == TransactionStatus::Pending => {
                log::debug!("[{}] resuming pending transaction {}", ctx.correlation_id, txn.id);
                txn
            }
            Recorded::Replay(txn) | Recorded::Rejected(txn) => return Ok(txn),
        };

        let assessment = self.assess(ctx, &txn)?;
        self.apply_assessment(ctx, txn.id, assessment)
    }

    /// Unit of Work 1: replay check, then persist `pending`. Store-level
    /// policy violations reject immediately.
    fn record_pending(&self, ctx: &RequestContext, cmd: &SubmitTransaction, fingerprint: &str) -> CoreResult<Recorded> {
        let user_id = ctx.principal.user_id;
        let key = cmd.idempotency_key.trim().to_string();
        let uow = self.store.begin(ctx)?;

        if let Some((prior, prior_fingerprint)) = uow.transaction_by_key(user_id, &key)? {
            if prior_fingerprint.as_deref() != Some(fingerprint) {
                return Err(CoreError::IdempotencyConflict { key });
            }
            log::debug!("[{}] idempotent replay of {} ({key})", ctx.correlation_id, prior.id);
            return Ok(Recorded::Replay(prior));
        }

        let now = self.clock.now();
        let mut txn = Transaction {
            id: new_id(),
            user_id,
            idempotency_key: Some(key),
            txn_type: cmd.txn_type,
            source_account_id: cmd.source_account_id,
            destination_account_id: cmd.destination_account_id,
            amount: cmd.amount,
            currency: cmd.currency.clone(),
            status: TransactionStatus::Pending,
            status_reason: None,
            risk_level: None,
            risk_score: None,
            description: cmd.description.clone(),
            category: cmd.category.clone(),
            metadata: cmd.metadata.clone(),
            reviewed_by: None,
            review_notes: None,
            created_at: now,
            updated_at: now,
            approved_at: None,
            flagged_at: None,
            rejected_at: None,
            completed_at: None,
            failed_at: None,
            cancelled_at: None,
        };
        uow.insert_transaction(&txn, Some(fingerprint))?;
        uow.record_history::<Transaction>(HistoryTable::Transaction, txn.id, AuditEvent::TransactionSubmitted, None, now)?;
        self.audit(&uow, txn.id, AuditEvent::TransactionSubmitted, None, Some(serde_json::to_value(&txn)?), now)?;

        if let Some(reason) = self.policy_violation(ctx, &uow, &txn)? {
            log::debug!("[{}] transaction {} rejected: {reason}", ctx.correlation_id, txn.id);
            self.transition(&uow, &mut txn, TransactionStatus::Rejected, Some(reason), &[])?;
            uow.commit()?;
            return Ok(Recorded::Rejected(txn));
        }
        uow.commit()?;
        log::debug!("[{}] transaction {} pending", ctx.correlation_id, txn.id);
        Ok(Recorded::Fresh(txn))
    }

    /// Checks that need the store: accounts exist, are active, share the
    /// transaction currency, and the debited (or, for inbound types, the
    /// credited) account belongs to the caller.
    fn policy_violation(&self, ctx: &RequestContext, uow: &UnitOfWork, txn: &Transaction) -> CoreResult<Option<String>> {
        let owned_side = txn.source_account_id.or(txn.destination_account_id);
        for id in txn.accounts() {
            let Some(account) = uow.account(id)? else {
                return Ok(Some("account_not_found".into()));
            };
            if !account.active {
                return Ok(Some("account_inactive".into()));
            }
            if account.currency != txn.currency {
                return Ok(Some("currency_mismatch".into()));
            }
            let must_own = ctx.principal.role == PrincipalRole::Customer && Some(id) == owned_side;
            if must_own && account.user_id != txn.user_id {
                return Ok(Some("account_not_owned".into()));
            }
        }
        Ok(None)
    }

    /// Score outside any write lock: read history, screen, compute.
    fn assess(&self, ctx: &RequestContext, txn: &Transaction) -> CoreResult<RiskAssessment> {
        let history = {
            let uow = self.store.read(ctx)?;
            uow.scoring_history(txn.user_id, txn.id, txn.created_at, self.config.risk.history_window)?
        };
        let screening = self.scorer.screen(ctx, txn.user_id)?;
        let profile = UserProfile::from_history(txn.user_id, &history, screening);
        let assessment = self.scorer.score(txn, &profile, &history);
        log::debug!(
            "[{}] transaction {} scored {:.4} ({})",
            ctx.correlation_id, txn.id, assessment.risk_score, assessment.risk_level
        );
        Ok(assessment)
    }

    /// Unit of Work 2: persist the assessment, advance the state machine and,
    /// when approved, apply balances.
    fn apply_assessment(
        &self,
        ctx: &RequestContext,
        id: TransactionId,
        assessment: RiskAssessment,
    ) -> CoreResult<Transaction> {
        let mut uow = self.store.begin(ctx)?;
        let mut txn = uow
            .transaction(id)?
            .ok_or_else(|| CoreError::not_found("transaction", id))?;
        if txn.status != TransactionStatus::Pending {
            // Cancelled, or finished by a concurrent replay.
            log::debug!("[{}] transaction {id} already {}, assessment dropped", ctx.correlation_id, txn.status);
            return Ok(txn);
        }

        let now = self.clock.now();
        uow.insert_assessment(&assessment, now)?;
        txn.risk_score = Some(assessment.risk_score);
        txn.risk_level = Some(assessment.risk_level);

        match assessment.recommendation {
            Recommendation::Approve => {
                self.transition(&uow, &mut txn, TransactionStatus::Approved, None, &[])?;
                self.settle(&mut uow, &mut txn)?;
            }
            Recommendation::Review => {
                let reason = if assessment.screening_complete { "risk_review" } else { "screening_unavailable" };
                self.transition(&uow, &mut txn, TransactionStatus::Flagged, Some(reason.into()), &[])?;
            }
            Recommendation::Reject => {
                self.transition(&uow, &mut txn, TransactionStatus::Rejected, Some("sanctions_hit".into()), &[])?;
            }
        }
        self.audit(
            &uow,
            id,
            AuditEvent::RiskAssessed,
            None,
            Some(serde_json::to_value(&assessment)?),
            now,
        )?;
        uow.commit()?;
        log::debug!("[{}] transaction {id} finished as {}", ctx.correlation_id, txn.status);
        Ok(txn)
    }

    /// approved → completed, or approved → failed when the ledger refuses.
    /// Only errors the ledger raises about the accounts turn into `failed`;
    /// store errors and deadlines abort the whole Unit of Work.
    fn settle(&self, uow: &mut UnitOfWork, txn: &mut Transaction) -> CoreResult<()> {
        let ids = txn.accounts();
        let (source, destination) = (txn.source_account_id, txn.destination_account_id);
        let (amount, currency) = (txn.amount, txn.currency.clone());
        let ledger = &self.ledger;

        let outcome = uow.attempt(|uow| {
            ledger.lock_accounts(uow, &ids)?;
            let mut changes = Vec::with_capacity(2);
            if let Some(src) = source {
                changes.push(ledger.apply_delta(uow, src, -amount, &currency)?);
            }
            if let Some(dst) = destination {
                changes.push(ledger.apply_delta(uow, dst, amount, &currency)?);
            }
            Ok(changes)
        });

        match outcome {
            Ok(changes) => self.transition(uow, txn, TransactionStatus::Completed, None, &changes),
            Err(e) if is_account_refusal(&e) => {
                log::debug!(
                    "[{}] transaction {} failed: {e}",
                    uow.context().correlation_id, txn.id
                );
                self.transition(uow, txn, TransactionStatus::Failed, Some(e.code().to_string()), &[])
            }
            Err(e) => Err(e),
        }
    }

    /// Move `txn` to `to`, writing history and audit. `balances` are attached
    /// to the audit record when the transition moved money.
    fn transition(
        &self,
        uow: &UnitOfWork,
        txn: &mut Transaction,
        to: TransactionStatus,
        reason: Option<String>,
        balances: &[BalanceChange],
    ) -> CoreResult<()> {
        if !txn.status.can_transition_to(to) {
            return Err(CoreError::InvalidTransition {
                entity: "transaction",
                id: txn.id,
                from: txn.status.to_string(),
                to: to.to_string(),
            });
        }
        let prior = txn.clone();
        let now = self.clock.now();
        txn.stamp(to, now);
        if reason.is_some() {
            txn.status_reason = reason;
        }

        uow.record_history(HistoryTable::Transaction, txn.id, to.event(), Some(&prior), now)?;
        uow.update_transaction(txn)?;

        let mut before = serde_json::to_value(&prior)?;
        let mut after = serde_json::to_value(&*txn)?;
        if !balances.is_empty() {
            attach_balances(&mut before, balances, |c| c.before);
            attach_balances(&mut after, balances, |c| c.after);
        }
        self.audit(uow, txn.id, to.event(), Some(before), Some(after), now)
    }

    pub fn get(&self, ctx: &RequestContext, id: TransactionId) -> CoreResult<Transaction> {
        let uow = self.store.read(ctx)?;
        uow.transaction(id)?
            .ok_or_else(|| CoreError::not_found("transaction", id))
    }

    /// pending → cancelled. Any other state is a precondition failure.
    pub fn cancel(&self, ctx: &RequestContext, id: TransactionId) -> CoreResult<Transaction> {
        let uow = self.store.begin(ctx)?;
        let mut txn = uow
            .transaction(id)?
            .ok_or_else(|| CoreError::not_found("transaction", id))?;
        if ctx.principal.role == PrincipalRole::Customer && txn.user_id != ctx.principal.user_id {
            return Err(CoreError::not_found("transaction", id));
        }
        self.transition(&uow, &mut txn, TransactionStatus::Cancelled, Some("cancelled_by_caller".into()), &[])?;
        uow.commit()?;
        log::debug!("[{}] transaction {id} cancelled", ctx.correlation_id);
        Ok(txn)
    }

    /// Manual review of a flagged transaction. Approval applies balances in
    /// the same Unit of Work.
    pub fn review(
        &self,
        ctx: &RequestContext,
        id: TransactionId,
        decision: ReviewDecision,
        notes: Option<String>,
    ) -> CoreResult<Transaction> {
        if ctx.principal.role == PrincipalRole::Customer {
            return Err(CoreError::validation("reviewer", "a reviewer principal is required"));
        }
        let mut uow = self.store.begin(ctx)?;
        let mut txn = uow
            .transaction(id)?
            .ok_or_else(|| CoreError::not_found("transaction", id))?;
        if txn.status != TransactionStatus::Flagged {
            return Err(CoreError::InvalidTransition {
                entity: "transaction",
                id,
                from: txn.status.to_string(),
                to: match decision {
                    ReviewDecision::Approve => TransactionStatus::Approved.to_string(),
                    ReviewDecision::Reject => TransactionStatus::Rejected.to_string(),
                },
            });
        }

        txn.reviewed_by = Some(ctx.principal.user_id);
        txn.review_notes = notes;
        match decision {
            ReviewDecision::Approve => {
                self.transition(&uow, &mut txn, TransactionStatus::Approved, None, &[])?;
                self.settle(&mut uow, &mut txn)?;
            }
            ReviewDecision::Reject => {
                self.transition(&uow, &mut txn, TransactionStatus::Rejected, Some("reviewer_rejected".into()), &[])?;
            }
        }
        let now = self.clock.now();
        self.audit(
            &uow,
            id,
            AuditEvent::TransactionReviewed,
            None,
            Some(serde_json::json!({ "decision": decision, "notes": txn.review_notes, "status": txn.status })),
            now,
        )?;
        uow.commit()?;
        log::debug!("[{}] transaction {id} reviewed: {:?} -> {}", ctx.correlation_id, decision, txn.status);
        Ok(txn)
    }

    pub fn assessment(&self, ctx: &RequestContext, id: TransactionId) -> CoreResult<RiskAssessment> {
        let uow = self.store.read(ctx)?;
        uow.assessment(id)?
            .ok_or_else(|| CoreError::not_found("risk_assessment", id))
    }

    pub fn list_for_user(&self, ctx: &RequestContext, user_id: UserId, query: &TransactionQuery) -> CoreResult<Vec<Transaction>> {
        let uow = self.store.read(ctx)?;
        uow.transactions_for_user(user_id, query)
    }

    pub fn list_for_account(
        &self,
        ctx: &RequestContext,
        account_id: AccountId,
        query: &TransactionQuery,
    ) -> CoreResult<Vec<Transaction>> {
        let uow = self.store.read(ctx)?;
        uow.transactions_for_account(account_id, query)
    }

    pub fn history(&self, ctx: &RequestContext, id: TransactionId) -> CoreResult<Vec<HistoryEntry>> {
        let uow = self.store.read(ctx)?;
        if uow.transaction(id)?.is_none() {
            return Err(CoreError::not_found("transaction", id));
        }
        uow.history(HistoryTable::Transaction, id)
    }

    // ── Unit-of-Work contract (crate-private) ───────────────────────────────

    /// Post a system movement inside the caller's Unit of Work:
    /// pending → approved → completed. Ledger refusals propagate so the
    /// caller's whole unit rolls back.
    pub(crate) fn post_internal(&self, uow: &UnitOfWork, posting: InternalPosting) -> CoreResult<Transaction> {
        let now = self.clock.now();
        let mut txn = Transaction {
            id: new_id(),
            user_id: posting.user_id,
            idempotency_key: None,
            txn_type: posting.txn_type,
            source_account_id: posting.source_account_id,
            destination_account_id: posting.destination_account_id,
            amount: posting.amount,
            currency: posting.currency.clone(),
            status: TransactionStatus::Pending,
            status_reason: None,
            risk_level: None,
            risk_score: None,
            description: Some(posting.description),
            category: Some(posting.category.to_string()),
            metadata: TransactionMetadata::default(),
            reviewed_by: None,
            review_notes: None,
            created_at: now,
            updated_at: now,
            approved_at: None,
            flagged_at: None,
            rejected_at: None,
            completed_at: None,
            failed_at: None,
            cancelled_at: None,
        };
        uow.insert_transaction(&txn, None)?;
        uow.record_history::<Transaction>(HistoryTable::Transaction, txn.id, AuditEvent::TransactionSubmitted, None, now)?;
        self.audit(uow, txn.id, AuditEvent::TransactionSubmitted, None, Some(serde_json::to_value(&txn)?), now)?;
        self.transition(uow, &mut txn, TransactionStatus::Approved, Some("internal".into()), &[])?;

        self.ledger.lock_accounts(uow, &txn.accounts())?;
        let mut changes = Vec::with_capacity(2);
        if let Some(src) = txn.source_account_id {
            changes.push(self.ledger.apply_delta(uow, src, -txn.amount, &txn.currency)?);
        }
        if let Some(dst) = txn.destination_account_id {
            changes.push(self.ledger.apply_delta(uow, dst, txn.amount, &txn.currency)?);
        }
        self.transition(uow, &mut txn, TransactionStatus::Completed, None, &changes)?;
        log::debug!(
            "[{}] internal {} {} {} posted as {}",
            uow.context().correlation_id, txn.txn_type, txn.amount, txn.currency, txn.id
        );
        Ok(txn)
    }
}

enum Recorded {
    Fresh(Transaction),
    Replay(Transaction),
    Rejected(Transaction),
}

fn is_account_refusal(e: &CoreError) -> bool {
    matches!(
        e.kind(),
        ErrorKind::Insufficient | ErrorKind::PreconditionFailed | ErrorKind::Validation | ErrorKind::NotFound
    )
}

fn attach_balances(value: &mut Value, balances: &[BalanceChange], pick: impl Fn(&BalanceChange) -> Money) {
    if let Value::Object(map) = value {
        let entries = balances
            .iter()
            .map(|c| (c.account_id.to_string(), serde_json::json!(pick(c))))
            .collect::<serde_json::Map<_, _>>();
        map.insert("balances".into(), Value::Object(entries));
    }
}
