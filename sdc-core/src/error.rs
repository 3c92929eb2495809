//! Crate-wide error aggregate, following the same per-crate `thiserror`
//! enum convention as `DockLockError`/`StorageError`/`CryptoError`,
//! composed into one type the orchestrator and CLI can match on for exit
//! codes: non-zero on any validation or policy failure.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SdcError {
    #[error("policy denied: {0}")]
    PolicyDenied(String),

    #[error("integrity failure: {0}")]
    IntegrityFailure(String),

    #[error("security event: {0}")]
    SecurityEvent(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type SdcResult<T> = Result<T, SdcError>;
