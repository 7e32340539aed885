//! AML Risk Scorer: weighted factor model over a transaction, the user's
//! profile and recent history, plus external screening flags.
//!
//! RULES:
//!   - `score` is a pure function of its inputs: same inputs, bit-equal score.
//!     It reads no clock, store or global state.
//!   - A factor only contributes when its signal is present on the request.
//!   - Screening lookups are bounded by a per-call timeout and a retry budget.
//!     When the budget is spent the transaction goes to manual review.

use crate::{
    config::{CoreConfig, RiskConfig},
    context::RequestContext,
    error::{CoreError, CoreResult},
    retry::retry_with_backoff,
    transaction_engine::{GeoPoint, Transaction},
    types::{TransactionId, UserId},
};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

const EARTH_RADIUS_KM: f64 = 6371.0;
/// Amount z-score at which the deviation factor saturates.
const Z_SATURATION: f64 = 3.0;

// ── Types ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

impl FromStr for RiskLevel {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(RiskLevel::Low),
            "medium" => Ok(RiskLevel::Medium),
            "high" => Ok(RiskLevel::High),
            "critical" => Ok(RiskLevel::Critical),
            other => Err(CoreError::validation("risk_level", format!("unknown level '{other}'"))),
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Approve,
    Review,
    Reject,
}

impl Recommendation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Recommendation::Approve => "approve",
            Recommendation::Review => "review",
            Recommendation::Reject => "reject",
        }
    }
}

impl FromStr for Recommendation {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approve" => Ok(Recommendation::Approve),
            "review" => Ok(Recommendation::Review),
            "reject" => Ok(Recommendation::Reject),
            other => Err(CoreError::validation("recommendation", format!("unknown recommendation '{other}'"))),
        }
    }
}

/// One contributing factor. `score` is the factor output in [0, 1];
/// for screening penalties it is 1 and `weight` is the penalty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskFactor {
    pub code: String,
    pub weight: f64,
    pub score: f64,
    pub description: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreeningFlags {
    pub sanctions: bool,
    pub pep: bool,
    pub watchlist: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub transaction_id: TransactionId,
    pub risk_score: f64,
    pub risk_level: RiskLevel,
    pub factors: Vec<RiskFactor>,
    pub screening: ScreeningFlags,
    /// False when the screening lookup could not be completed.
    pub screening_complete: bool,
    pub recommendation: Recommendation,
}

/// What the scorer knows about the user beyond the request itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: UserId,
    pub known_devices: BTreeSet<String>,
    pub known_ips: BTreeSet<String>,
    pub usual_locations: Vec<GeoPoint>,
    /// `None` when screening was unavailable.
    pub screening: Option<ScreeningFlags>,
}

impl UserProfile {
    /// Derive the behavioural profile from the user's completed history.
    pub fn from_history(user_id: UserId, history: &[Transaction], screening: Option<ScreeningFlags>) -> Self {
        let mut profile = UserProfile { user_id, screening, ..Default::default() };
        for t in history {
            if let Some(device) = &t.metadata.device_id {
                profile.known_devices.insert(device.clone());
            }
            if let Some(ip) = &t.metadata.ip_address {
                profile.known_ips.insert(ip.clone());
            }
            if let Some(loc) = t.metadata.location {
                if !profile.usual_locations.contains(&loc) {
                    profile.usual_locations.push(loc);
                }
            }
        }
        profile
    }
}

// ── Screening ────────────────────────────────────────────────────────────────

/// External sanctions / PEP / watchlist lookup.
pub trait ScreeningProvider: Send + Sync {
    /// Fails with `Unavailable` when the provider cannot answer.
    fn screen(&self, user_id: UserId) -> CoreResult<ScreeningFlags>;
}

/// Fixed lists, built once at startup.
#[derive(Debug, Clone, Default)]
pub struct StaticScreening {
    sanctioned: HashSet<UserId>,
    pep: HashSet<UserId>,
    watchlist: HashSet<UserId>,
}

impl StaticScreening {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sanctioned(mut self, user_id: UserId) -> Self {
        self.sanctioned.insert(user_id);
        self
    }

    pub fn with_pep(mut self, user_id: UserId) -> Self {
        self.pep.insert(user_id);
        self
    }

    pub fn with_watchlist(mut self, user_id: UserId) -> Self {
        self.watchlist.insert(user_id);
        self
    }
}

impl ScreeningProvider for StaticScreening {
    fn screen(&self, user_id: UserId) -> CoreResult<ScreeningFlags> {
        Ok(ScreeningFlags {
            sanctions: self.sanctioned.contains(&user_id),
            pep: self.pep.contains(&user_id),
            watchlist: self.watchlist.contains(&user_id),
        })
    }
}

// ── Factor math ──────────────────────────────────────────────────────────────

/// Great-circle distance in kilometres.
pub fn haversine_km(a: GeoPoint, b: GeoPoint) -> f64 {
    let (lat1, lat2) = (a.latitude.to_radians(), b.latitude.to_radians());
    let dlat = lat2 - lat1;
    let dlon = (b.longitude - a.longitude).to_radians();
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().min(1.0).asin()
}

fn amount_deviation(amount: f64, history: &[Transaction]) -> Option<f64> {
    if history.len() < 2 {
        return None;
    }
    let amounts: Vec<f64> = history.iter().map(|t| t.amount.to_f64()).collect();
    let n = amounts.len() as f64;
    let mean = amounts.iter().sum::<f64>() / n;
    let variance = amounts.iter().map(|a| (a - mean).powi(2)).sum::<f64>() / n;
    let stddev = variance.sqrt();
    if stddev == 0.0 {
        return Some(if amount > mean { 1.0 } else { 0.0 });
    }
    let z = (amount - mean) / stddev;
    Some((z / Z_SATURATION).clamp(0.0, 1.0))
}

fn location_anomaly(location: Option<GeoPoint>, profile: &UserProfile, radius_km: f64) -> Option<f64> {
    let here = location?;
    let nearest = profile
        .usual_locations
        .iter()
        .map(|usual| haversine_km(here, *usual))
        .fold(None, |best: Option<f64>, d| Some(best.map_or(d, |b| b.min(d))));
    Some(match nearest {
        Some(d) => (d / radius_km).min(1.0),
        None => 1.0,
    })
}

fn device_novelty(txn: &Transaction, profile: &UserProfile) -> Option<f64> {
    let checks: Vec<bool> = [
        txn.metadata.device_id.as_ref().map(|d| profile.known_devices.contains(d)),
        txn.metadata.ip_address.as_ref().map(|ip| profile.known_ips.contains(ip)),
    ]
    .into_iter()
    .flatten()
    .collect();
    if checks.is_empty() {
        return None;
    }
    let known = checks.iter().filter(|k| **k).count();
    Some(if known == checks.len() {
        0.0
    } else if known > 0 {
        0.4
    } else {
        0.8
    })
}

/// History is newest first.
fn frequency_anomaly(txn: &Transaction, history: &[Transaction]) -> Option<f64> {
    if history.len() < 2 {
        return None;
    }
    let newest = history.first()?.created_at;
    let oldest = history.last()?.created_at;
    let mean_gap = (newest - oldest).num_seconds() as f64 / (history.len() - 1) as f64;
    if mean_gap <= 0.0 {
        return None;
    }
    let since_last = (txn.created_at - newest).num_seconds().max(0) as f64;
    let ratio = since_last / mean_gap;
    Some(if ratio < 0.1 { 0.9 } else { 0.0 })
}

fn velocity(txn: &Transaction, history: &[Transaction], window_secs: i64) -> Option<f64> {
    let count = history
        .iter()
        .filter(|t| {
            let age = (txn.created_at - t.created_at).num_seconds();
            (0..=window_secs).contains(&age)
        })
        .count();
    match count {
        c if c > 10 => Some(1.0),
        c if c > 5 => Some(0.7),
        c if c > 3 => Some(0.4),
        _ => None,
    }
}

// ── Component ────────────────────────────────────────────────────────────────

/// One screening request handed to a worker.
struct ScreeningJob {
    user_id: UserId,
    reply: Sender<CoreResult<ScreeningFlags>>,
}

pub struct AmlRiskScorer {
    config: Arc<CoreConfig>,
    jobs: Sender<ScreeningJob>,
}

impl AmlRiskScorer {
    /// Starts `screening.workers` threads that serve lookups from a bounded
    /// queue. A provider that hangs holds at most those threads; callers
    /// behind it time out and retry. Workers exit when the scorer is dropped.
    pub fn new(config: Arc<CoreConfig>, provider: Arc<dyn ScreeningProvider>) -> Self {
        let (jobs, queue) = bounded::<ScreeningJob>(config.screening.queue_depth.max(1));
        for n in 0..config.screening.workers.max(1) {
            let (queue, provider) = (queue.clone(), Arc::clone(&provider));
            let spawned = std::thread::Builder::new()
                .name(format!("screening-{n}"))
                .spawn(move || screening_worker(queue, provider));
            if let Err(e) = spawned {
                log::error!("screening worker {n} failed to start: {e}");
            }
        }
        Self { config, jobs }
    }

    fn risk(&self) -> &RiskConfig {
        &self.config.risk
    }

    pub fn level_for(&self, score: f64) -> RiskLevel {
        let t = &self.risk().thresholds;
        if score < t.medium {
            RiskLevel::Low
        } else if score < t.high {
            RiskLevel::Medium
        } else if score < t.critical {
            RiskLevel::High
        } else {
            RiskLevel::Critical
        }
    }

    /// Score `txn`. `history` is the user's most recent completed
    /// transactions, newest first, not including `txn`.
    pub fn score(&self, txn: &Transaction, profile: &UserProfile, history: &[Transaction]) -> RiskAssessment {
        let cfg = self.risk();
        let w = &cfg.weights;
        let mut factors = Vec::new();
        let mut push = |code: &str, weight: f64, score: Option<f64>, description: String| {
            if let Some(score) = score.filter(|s| *s > 0.0) {
                factors.push(RiskFactor { code: code.to_string(), weight, score, description });
            }
        };

        let amount = txn.amount.to_f64();
        push(
            "amount_deviation",
            w.amount_deviation,
            amount_deviation(amount, history),
            format!("amount {} against {} prior transaction(s)", txn.amount, history.len()),
        );
        push(
            "location_anomaly",
            w.location_anomaly,
            location_anomaly(txn.metadata.location, profile, cfg.location_radius_km),
            format!("{} usual location(s) on record", profile.usual_locations.len()),
        );
        push(
            "device_novelty",
            w.device_novelty,
            device_novelty(txn, profile),
            "device or IP address not seen before".to_string(),
        );
        push(
            "frequency_anomaly",
            w.frequency_anomaly,
            frequency_anomaly(txn, history),
            "unusually short gap since the previous transaction".to_string(),
        );
        push(
            "velocity",
            w.velocity,
            velocity(txn, history, cfg.velocity_window_secs),
            format!("transactions within the last {} s", cfg.velocity_window_secs),
        );

        let flags = profile.screening.unwrap_or_default();
        let p = &cfg.penalties;
        if flags.sanctions {
            push("sanctions_hit", p.sanctions, Some(1.0), "user matches a sanctions list".into());
        }
        if flags.pep {
            push("pep_hit", p.pep, Some(1.0), "user is a politically exposed person".into());
        }
        if flags.watchlist {
            push("watchlist_hit", p.watchlist, Some(1.0), "user is on an internal watchlist".into());
        }

        let raw: f64 = factors.iter().map(|f| f.weight * f.score).sum();
        let risk_score = raw.clamp(0.0, 1.0);
        let screening_complete = profile.screening.is_some();
        if !screening_complete {
            factors.push(RiskFactor {
                code: "screening_unavailable".into(),
                weight: 0.0,
                score: 1.0,
                description: "screening lookup failed; manual review required".into(),
            });
        }

        let recommendation = if flags.sanctions {
            Recommendation::Reject
        } else if !screening_complete || risk_score >= cfg.thresholds.high {
            Recommendation::Review
        } else {
            Recommendation::Approve
        };

        RiskAssessment {
            transaction_id: txn.id,
            risk_score,
            risk_level: self.level_for(risk_score),
            factors,
            screening: flags,
            screening_complete,
            recommendation,
        }
    }

    /// Screen `user_id` with per-call timeout and bounded backoff. `Ok(None)`
    /// means the provider stayed unavailable for the whole budget.
    pub fn screen(&self, ctx: &RequestContext, user_id: UserId) -> CoreResult<Option<ScreeningFlags>> {
        let policy = &self.config.screening.retry;
        match retry_with_backoff(policy, ctx, "screening lookup", |_| self.lookup_once(ctx, user_id)) {
            Ok(flags) => Ok(Some(flags)),
            Err(e) if e.is_retryable() => {
                log::warn!("[{}] screening unavailable for {user_id}: {e}", ctx.correlation_id);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn lookup_once(&self, ctx: &RequestContext, user_id: UserId) -> CoreResult<ScreeningFlags> {
        let (reply, rx) = bounded(1);
        match self.jobs.try_send(ScreeningJob { user_id, reply }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                return Err(CoreError::Unavailable {
                    dependency: "screening".into(),
                    message: "all screening workers busy".into(),
                })
            }
            Err(TrySendError::Disconnected(_)) => {
                return Err(CoreError::Unavailable {
                    dependency: "screening".into(),
                    message: "no screening workers running".into(),
                })
            }
        }
        let wait = ctx.clamp(self.config.screening.lookup_timeout());
        match rx.recv_timeout(wait) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(CoreError::Unavailable {
                dependency: "screening".into(),
                message: format!("no answer within {wait:?}"),
            }),
            Err(RecvTimeoutError::Disconnected) => Err(CoreError::Unavailable {
                dependency: "screening".into(),
                message: "lookup worker exited without answering".into(),
            }),
        }
    }
}

fn screening_worker(queue: Receiver<ScreeningJob>, provider: Arc<dyn ScreeningProvider>) {
    for job in queue {
        // The caller may have timed out and gone; its reply is dropped.
        let _ = job.reply.send(provider.screen(job.user_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::{Currency, Money};
    use crate::transaction_engine::{TransactionMetadata, TransactionStatus, TransactionType};
    use crate::types::ts_from_secs;
    use uuid::Uuid;

    const NYC: GeoPoint = GeoPoint { latitude: 40.7128, longitude: -74.0060 };
    const TOKYO: GeoPoint = GeoPoint { latitude: 35.6762, longitude: 139.6503 };

    fn txn(amount: i64, at: i64, metadata: TransactionMetadata) -> Transaction {
        Transaction {
            id: Uuid::from_u128(at as u128 + 1),
            user_id: Uuid::from_u128(99),
            idempotency_key: None,
            txn_type: TransactionType::Deposit,
            source_account_id: None,
            destination_account_id: Some(Uuid::from_u128(7)),
            amount: Money::from_major(amount),
            currency: Currency::parse("USD").unwrap(),
            status: TransactionStatus::Completed,
            status_reason: None,
            risk_level: None,
            risk_score: None,
            description: None,
            category: None,
            metadata,
            reviewed_by: None,
            review_notes: None,
            created_at: ts_from_secs(at),
            updated_at: ts_from_secs(at),
            approved_at: None,
            flagged_at: None,
            rejected_at: None,
            completed_at: None,
            failed_at: None,
            cancelled_at: None,
        }
    }

    fn home() -> TransactionMetadata {
        TransactionMetadata {
            device_id: Some("laptop".into()),
            ip_address: Some("10.0.0.1".into()),
            location: Some(NYC),
            tags: vec![],
        }
    }

    fn scorer() -> AmlRiskScorer {
        AmlRiskScorer::new(Arc::new(CoreConfig::default_test()), Arc::new(StaticScreening::new()))
    }

    /// Ten daily transactions alternating 80 / 120: mean 100, stddev 20. Newest first.
    fn steady_history() -> Vec<Transaction> {
        (0..10).rev().map(|i| txn(if i % 2 == 0 { 80 } else { 120 }, i * 86_400, home())).collect()
    }

    #[test]
    fn clean_first_transaction_scores_zero() {
        let s = scorer();
        let t = txn(30, 1_000, TransactionMetadata::default());
        let profile = UserProfile::from_history(t.user_id, &[], Some(ScreeningFlags::default()));
        let a = s.score(&t, &profile, &[]);
        assert_eq!(a.risk_score, 0.0);
        assert_eq!(a.risk_level, RiskLevel::Low);
        assert_eq!(a.recommendation, Recommendation::Approve);
        assert!(a.factors.is_empty());
    }

    #[test]
    fn outlier_from_new_device_and_place_is_reviewed() {
        let s = scorer();
        let history = steady_history();
        let metadata = TransactionMetadata {
            device_id: Some("burner".into()),
            ip_address: Some("203.0.113.9".into()),
            location: Some(TOKYO),
            tags: vec![],
        };
        let t = txn(50_000, 10 * 86_400, metadata);
        let profile = UserProfile::from_history(t.user_id, &history, Some(ScreeningFlags::default()));
        let a = s.score(&t, &profile, &history);

        let factor = |code: &str| a.factors.iter().find(|f| f.code == code).map(|f| f.score);
        assert_eq!(factor("amount_deviation"), Some(1.0));
        assert_eq!(factor("device_novelty"), Some(0.8));
        assert_eq!(factor("location_anomaly"), Some(1.0));
        assert!(a.risk_score >= 0.6, "score {}", a.risk_score);
        assert_eq!(a.recommendation, Recommendation::Review);
    }

    #[test]
    fn score_is_bit_reproducible() {
        let s = scorer();
        let history = steady_history();
        let t = txn(131, 10 * 86_400 + 60, home());
        let profile = UserProfile::from_history(t.user_id, &history, Some(ScreeningFlags::default()));
        let first = s.score(&t, &profile, &history);
        for _ in 0..20 {
            let again = s.score(&t, &profile, &history);
            assert_eq!(again.risk_score.to_bits(), first.risk_score.to_bits());
            assert_eq!(again, first);
        }
    }

    #[test]
    fn sanctions_hit_rejects_and_caps_score() {
        let s = scorer();
        let t = txn(30, 1_000, TransactionMetadata { location: Some(TOKYO), ..TransactionMetadata::default() });
        let flags = ScreeningFlags { sanctions: true, pep: true, watchlist: true };
        let profile = UserProfile::from_history(t.user_id, &[], Some(flags));
        let a = s.score(&t, &profile, &[]);
        assert_eq!(a.risk_score, 1.0);
        assert_eq!(a.risk_level, RiskLevel::Critical);
        assert_eq!(a.recommendation, Recommendation::Reject);
    }

    #[test]
    fn missing_screening_forces_review() {
        let s = scorer();
        let t = txn(30, 1_000, TransactionMetadata::default());
        let profile = UserProfile::from_history(t.user_id, &[], None);
        let a = s.score(&t, &profile, &[]);
        assert!(!a.screening_complete);
        assert_eq!(a.recommendation, Recommendation::Review);
        assert!(a.factors.iter().any(|f| f.code == "screening_unavailable"));
    }

    #[test]
    fn velocity_bands() {
        let base = 100_000;
        let t = txn(10, base, TransactionMetadata::default());
        let burst = |n: i64| -> Vec<Transaction> {
            (0..n).map(|i| txn(10, base - 60 * (i + 1), TransactionMetadata::default())).collect()
        };
        assert_eq!(velocity(&t, &burst(3), 3600), None);
        assert_eq!(velocity(&t, &burst(4), 3600), Some(0.4));
        assert_eq!(velocity(&t, &burst(6), 3600), Some(0.7));
        assert_eq!(velocity(&t, &burst(11), 3600), Some(1.0));
    }

    #[test]
    fn frequency_bands() {
        // Daily history: mean gap 86 400 s.
        let history = steady_history();
        let newest = 9 * 86_400;
        let after = |secs: i64| txn(10, newest + secs, TransactionMetadata::default());
        assert_eq!(frequency_anomaly(&after(60), &history), Some(0.9));
        assert_eq!(frequency_anomaly(&after(8_640), &history), Some(0.0));
        assert_eq!(frequency_anomaly(&after(30_000), &history), Some(0.0));
        assert_eq!(frequency_anomaly(&after(86_400), &history), Some(0.0));
        assert_eq!(frequency_anomaly(&after(60), &history[..1]), None);
    }

    #[test]
    fn device_novelty_counts_only_provided_signals() {
        let history = vec![txn(10, 0, home())];
        let profile = UserProfile::from_history(Uuid::nil(), &history, None);
        let mut t = txn(10, 10, home());
        assert_eq!(device_novelty(&t, &profile), Some(0.0));
        t.metadata.ip_address = Some("198.51.100.1".into());
        assert_eq!(device_novelty(&t, &profile), Some(0.4));
        t.metadata.device_id = Some("tablet".into());
        assert_eq!(device_novelty(&t, &profile), Some(0.8));
        t.metadata = TransactionMetadata::default();
        assert_eq!(device_novelty(&t, &profile), None);
    }

    #[test]
    fn haversine_nyc_tokyo() {
        let d = haversine_km(NYC, TOKYO);
        assert!((d - 10_850.0).abs() < 50.0, "distance {d}");
        assert_eq!(haversine_km(NYC, NYC), 0.0);
    }
}
