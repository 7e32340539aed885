//! Wall-clock access. Components never call `Utc::now()` directly so tests
//! can pin and advance time.

use crate::types::Timestamp;
use chrono::{Duration, Timelike, Utc};
use std::sync::Mutex;

pub trait Clock: Send + Sync {
    /// Current instant, truncated to whole seconds.
    fn now(&self) -> Timestamp;
}

fn truncate(ts: Timestamp) -> Timestamp {
    ts.with_nanosecond(0).unwrap_or(ts)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        truncate(Utc::now())
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    current: Mutex<Timestamp>,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            current: Mutex::new(truncate(start)),
        }
    }

    pub fn set(&self, ts: Timestamp) {
        let mut current = self.current.lock().unwrap_or_else(|p| p.into_inner());
        *current = truncate(ts);
    }

    pub fn advance(&self, by: Duration) -> Timestamp {
        let mut current = self.current.lock().unwrap_or_else(|p| p.into_inner());
        *current += by;
        *current
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *self.current.lock().unwrap_or_else(|p| p.into_inner())
    }
}
