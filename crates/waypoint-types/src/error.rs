//! Record error types

use thiserror::Error;

/// Errors raised while validating or (de)serializing a service record
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("service name must not be empty")]
    EmptyName,

    #[error("service name {0:?} must not contain '/'")]
    InvalidName(String),

    #[error("service address must not be empty")]
    EmptyAddress,

    #[error("service port must not be zero")]
    ZeroPort,

    #[error("service ttl must be greater than zero")]
    ZeroTtl,

    #[error("service ttl {0:?} exceeds the maximum lease lifetime")]
    TtlTooLarge(std::time::Duration),

    #[error("record codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Result type for record operations
pub type RecordResult<T> = std::result::Result<T, RecordError>;
