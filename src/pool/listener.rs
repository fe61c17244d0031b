//! Pool observability hooks.
//!
//! Every pool state transition is reported to the installed
//! [`PoolListener`], tagged with the pool kind, table name, and the thread
//! that drove the transition. Listeners run synchronously under the pool's
//! registry lock: they must be non-blocking and must not re-enter the
//! engine.

use std::thread::ThreadId;

use super::PoolKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolEventKind {
    /// A lease was handed out.
    Acquired,
    /// A lease came back and the entry is idle again.
    Returned,
    /// An idle entry aged out of the pool.
    Evicted,
    Locked,
    Unlocked,
    /// An entry's resource was closed (lock over idle, release, shutdown).
    Closed,
    ConstructionFailed,
}

#[derive(Debug, Clone)]
pub struct PoolEvent<'a> {
    pub kind: PoolEventKind,
    pub pool: PoolKind,
    pub table: &'a str,
    pub thread: ThreadId,
}

pub trait PoolListener: Send + Sync {
    fn on_event(&self, event: &PoolEvent<'_>);
}

impl<F> PoolListener for F
where
    F: Fn(&PoolEvent<'_>) + Send + Sync,
{
    fn on_event(&self, event: &PoolEvent<'_>) {
        self(event)
    }
}
