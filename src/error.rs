use std::time::Duration;

use thiserror::Error;

/// Unified error type for all lock protocol failures.
///
/// Contention outcomes (`Busy`, `AcquisitionTimedOut`) are kept distinct
/// from infrastructure failure (`StoreUnavailable`) so callers can apply a
/// contention policy to one and a transport retry policy to the other.
#[derive(Error, Debug)]
pub enum LockError {
    #[error("lock is held by another token")]
    Busy,

    #[error("gave up acquiring '{key}' after {waited:?}")]
    AcquisitionTimedOut { key: String, waited: Duration },

    #[error("key-value store unreachable: {0}")]
    StoreUnavailable(#[source] anyhow::Error),

    #[error("lease on '{key}' was lost while held")]
    LeaseLost { key: String },

    #[error("lease on '{key}' was already gone at release")]
    LeaseAlreadyLost { key: String },

    #[error("lock wait was cancelled")]
    Cancelled,
}

impl From<redis::RedisError> for LockError {
    fn from(e: redis::RedisError) -> Self {
        LockError::StoreUnavailable(e.into())
    }
}

pub type Result<T> = std::result::Result<T, LockError>;
