//! Time sources for the maintenance job and pool inactivity stamps.
//!
//! The engine never calls `SystemTime::now` directly; everything time-gated
//! goes through [`MicrosecondClock`] so tests can drive eviction and
//! maintenance deterministically with [`ManualClock`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub trait MicrosecondClock: Send + Sync {
    fn now_micros(&self) -> u64;
}

/// Wall-clock time in microseconds since the Unix epoch.
#[derive(Debug, Default)]
pub struct OsClock;

impl MicrosecondClock for OsClock {
    fn now_micros(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0)
    }
}

/// A clock that only moves when told to. Test-friendly.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_micros: u64) -> Self {
        Self {
            now: AtomicU64::new(start_micros),
        }
    }

    pub fn advance(&self, micros: u64) {
        self.now.fetch_add(micros, Ordering::SeqCst);
    }

    pub fn set(&self, micros: u64) {
        self.now.store(micros, Ordering::SeqCst);
    }
}

impl MicrosecondClock for ManualClock {
    fn now_micros(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
