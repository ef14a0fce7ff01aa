//! Store error types

use thiserror::Error;
use waypoint_types::LeaseId;

/// Errors returned by a coordination store backend
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The lease does not exist, either because it expired or was revoked.
    #[error("{0} not found")]
    LeaseNotFound(LeaseId),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The watch was cancelled by the store.
    #[error("watch closed: {0}")]
    WatchClosed(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether renewing the lease again can never succeed.
    pub fn is_lease_not_found(&self) -> bool {
        matches!(self, StoreError::LeaseNotFound(_))
    }
}

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;
