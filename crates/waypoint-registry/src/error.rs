//! Registry error types

use std::time::Duration;

use thiserror::Error;
use waypoint_store::StoreError;
use waypoint_types::RecordError;

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Invalid record: {0}")]
    InvalidRecord(#[from] RecordError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Store call {operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("Lock not held")]
    LockNotHeld,

    #[error("Invalid lock key: {0:?}")]
    InvalidLockKey(String),

    #[error("Lock already held on {0}")]
    LockAlreadyHeld(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Registry is shutting down")]
    ShuttingDown,
}

impl RegistryError {
    /// Renewal can never succeed again for this lease.
    pub fn is_lease_expired(&self) -> bool {
        matches!(self, RegistryError::Store(e) if e.is_lease_not_found())
    }
}

/// Result type for registry operations
pub type Result<T> = std::result::Result<T, RegistryError>;
