//! Security gate consulted before any mutating table operation.
//!
//! The engine does not know where permissions come from; the host hands it a
//! [`SecurityContext`] per call. Reads are never gated at this layer.

use crate::error::EngineError;

pub trait SecurityContext: Send + Sync {
    /// Returns `Err(EngineError::SecurityViolation)` when the caller may not
    /// mutate tables.
    fn check_write_permission(&self) -> Result<(), EngineError>;
}

/// Grants everything. The default for embedded hosts.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAllSecurityContext;

impl SecurityContext for AllowAllSecurityContext {
    fn check_write_permission(&self) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Denies all writes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReadOnlySecurityContext;

impl SecurityContext for ReadOnlySecurityContext {
    fn check_write_permission(&self) -> Result<(), EngineError> {
        Err(EngineError::SecurityViolation)
    }
}
