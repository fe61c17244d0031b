//! # Engine Configuration
//!
//! Everything the engine needs from the host in one serializable struct:
//! where the data root lives, how directories are created, and the cadence
//! and thresholds of the idle-resource sweep. The microsecond clock is
//! supplied separately (`Engine::with_clock`) since trait objects do not
//! serialize.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Idle-sweep cadence used by the maintenance job, in milliseconds.
pub const DEFAULT_IDLE_CHECK_INTERVAL_MS: u64 = 500;
/// Idle writers older than this are evicted by `release_inactive`.
pub const DEFAULT_INACTIVE_WRITER_TTL_MS: u64 = 600_000;
/// Idle readers older than this are evicted by `release_inactive`.
pub const DEFAULT_INACTIVE_READER_TTL_MS: u64 = 120_000;
pub const DEFAULT_TELEMETRY_QUEUE_CAPACITY: usize = 512;
pub const DEFAULT_MK_DIR_MODE: u32 = 0o755;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Data directory. Created (with parents) at engine construction.
    pub root: PathBuf,
    /// Permission bits for directories the engine creates (Unix only).
    pub mk_dir_mode: u32,
    pub idle_check_interval_ms: u64,
    pub inactive_writer_ttl_ms: u64,
    pub inactive_reader_ttl_ms: u64,
    pub telemetry_queue_capacity: usize,
}

impl EngineConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            mk_dir_mode: DEFAULT_MK_DIR_MODE,
            idle_check_interval_ms: DEFAULT_IDLE_CHECK_INTERVAL_MS,
            inactive_writer_ttl_ms: DEFAULT_INACTIVE_WRITER_TTL_MS,
            inactive_reader_ttl_ms: DEFAULT_INACTIVE_READER_TTL_MS,
            telemetry_queue_capacity: DEFAULT_TELEMETRY_QUEUE_CAPACITY,
        }
    }
}

impl Default for EngineConfig {
    /// Default tunables with an empty root; set `root` before handing the
    /// config to the engine.
    fn default() -> Self {
        Self::new(PathBuf::new())
    }
}
