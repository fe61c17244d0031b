//! # Engine Error Kinds
//!
//! Fallible operations across the crate return `eyre::Result` so callers get
//! rich context chains, but the coordinator's public surface also needs
//! failure kinds that callers can branch on: a busy pool entry is retryable,
//! a permission failure is not. Those kinds live in [`EngineError`], a typed
//! error that converts into an `eyre::Report` at the return boundary and is
//! recovered with `report.downcast_ref::<EngineError>()`.
//!
//! Filesystem and persistent-state failures are wrapped as
//! [`EngineError::Storage`], which carries the OS errno alongside a message
//! naming the offending path. Errors are surfaced, never retried at this
//! layer.

use std::path::Path;

use thiserror::Error;

use crate::pool::PoolKind;

#[derive(Debug, Error)]
pub enum EngineError {
    /// A pool operation could not proceed because the entry is leased out.
    #[error("{pool} for table '{table}' is busy")]
    EntryUnavailable { pool: PoolKind, table: String },

    /// A `get` found the entry administratively locked.
    #[error("{pool} for table '{table}' is locked")]
    EntryLocked { pool: PoolKind, table: String },

    /// A versioned reader request found a different metadata version.
    #[error("reader for table '{table}' is out of date (requested version {requested}, found {actual})")]
    ReaderOutOfDate {
        table: String,
        requested: u32,
        actual: u32,
    },

    /// A filesystem or persistent-state failure, with the OS errno attached.
    #[error("[{errno}] {message}")]
    Storage { errno: i32, message: String },

    /// Write permission denied by the security context.
    #[error("write permission denied")]
    SecurityViolation,
}

impl EngineError {
    pub fn storage(errno: i32, message: impl Into<String>) -> Self {
        EngineError::Storage {
            errno,
            message: message.into(),
        }
    }

    /// Wraps an I/O failure, preserving its errno and naming the path.
    pub fn storage_io(err: &std::io::Error, action: &str, path: &Path) -> Self {
        EngineError::Storage {
            errno: err.raw_os_error().unwrap_or(0),
            message: format!("{} [path={}]: {}", action, path.display(), err),
        }
    }

    /// OS errno for storage failures, `None` for the other kinds.
    pub fn errno(&self) -> Option<i32> {
        match self {
            EngineError::Storage { errno, .. } => Some(*errno),
            _ => None,
        }
    }
}
