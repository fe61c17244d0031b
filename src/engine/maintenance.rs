//! # Pool Maintenance Job
//!
//! A cooperative unit of work the host scheduler invokes from any worker
//! thread. Each invocation is cheap: it reads the microsecond clock and,
//! once per configured interval, sweeps idle entries out of both pools.
//! The return value tells the scheduler whether the tick did anything, so
//! it can back off when the engine is quiet.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::clock::MicrosecondClock;

use super::EngineInner;

pub struct MaintenanceJob {
    engine: Weak<EngineInner>,
    clock: Arc<dyn MicrosecondClock>,
    /// Configured in milliseconds, stored in microseconds.
    check_interval_micros: u64,
    last_run_micros: AtomicU64,
}

impl MaintenanceJob {
    pub(super) fn new(
        engine: Weak<EngineInner>,
        clock: Arc<dyn MicrosecondClock>,
        check_interval_ms: u64,
    ) -> Self {
        Self {
            engine,
            clock,
            check_interval_micros: check_interval_ms.saturating_mul(1000),
            last_run_micros: AtomicU64::new(0),
        }
    }

    /// Runs one tick. Returns true when the tick released anything, so the
    /// host can choose between yielding and backing off.
    pub fn run(&self) -> bool {
        let now = self.clock.now_micros();
        let last = self.last_run_micros.load(Ordering::Acquire);
        if now < last.saturating_add(self.check_interval_micros) {
            return false;
        }
        // Concurrent ticks race on the stamp; the loser skips this round.
        if self
            .last_run_micros
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        match self.engine.upgrade() {
            Some(engine) => engine.release_inactive(),
            None => false,
        }
    }

    pub fn check_interval_micros(&self) -> u64 {
        self.check_interval_micros
    }
}
