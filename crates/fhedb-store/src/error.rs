//! Store error types for `fhedb-store`.

use fhedb_crypto::CryptoError;
use thiserror::Error;

/// Errors produced by persistence and query operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Cryptographic operation failed (delegated from the crypto core).
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Record id not present in the Records table.
    #[error("record not found: {0}")]
    NotFound(u64),

    /// Underlying persistence failure.
    #[error("database error: {0}")]
    DbError(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::DbError(err.to_string())
    }
}
