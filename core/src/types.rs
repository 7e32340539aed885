//! Shared primitive types used across every component.

use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

/// A UTC instant, always truncated to whole seconds by the [`Clock`](crate::clock::Clock).
pub type Timestamp = DateTime<Utc>;

/// Opaque 128-bit identifier for any entity.
pub type EntityId = Uuid;

pub type UserId = Uuid;
pub type AccountId = Uuid;
pub type TransactionId = Uuid;
pub type LoanId = Uuid;
pub type PositionId = Uuid;

/// Generate a fresh entity identifier.
pub fn new_id() -> EntityId {
    Uuid::new_v4()
}

/// Convert a persisted unix-seconds column back into a timestamp.
pub fn ts_from_secs(secs: i64) -> Timestamp {
    Utc.timestamp_opt(secs, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

pub fn ts_to_secs(ts: &Timestamp) -> i64 {
    ts.timestamp()
}
