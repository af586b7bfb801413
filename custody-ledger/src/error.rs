//! Error types for the custody ledger

use thiserror::Error;
use uuid::Uuid;

use crate::types::RateKey;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Stored hash does not match the record (tampering or key mismatch)
    #[error("Wallet integrity check failed: {0}")]
    Integrity(Uuid),

    /// Wallet row changed since the caller loaded it
    #[error("Wallet version mismatch for {wallet_id}: expected {expected}, found {found}; reload and retry")]
    Concurrency {
        /// Wallet
        wallet_id: Uuid,
        /// Version the caller held
        expected: i64,
        /// Version found in storage
        found: i64,
    },

    /// Unrecognised movement or rate direction
    #[error("Invalid direction: {0}")]
    InvalidDirection(String),

    /// Unrecognised status
    #[error("Invalid status: {0}")]
    InvalidStatus(String),

    /// Movement amount must be positive
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// No applicable rate
    #[error("Exchange rate not found: {0}")]
    RateNotFound(RateKey),

    /// Wallet not found
    #[error("Wallet not found: {0}")]
    WalletNotFound(Uuid),

    /// History entry not found
    #[error("Wallet history not found: {0}")]
    HistoryNotFound(i64),

    /// History entry cannot be signed
    #[error("Invalid wallet history entry: {0}")]
    InvalidHistoryEntry(String),

    /// Caller deadline elapsed before the operation finished
    #[error("Operation cancelled: deadline exceeded")]
    Cancelled,

    /// Storage error (in-memory store)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database error, passed through unchanged
    #[cfg(feature = "postgres")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Only version conflicts are worth a caller-driven retry
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Concurrency { .. })
    }

    /// Whether this error must raise a hard alert
    pub fn is_integrity_failure(&self) -> bool {
        matches!(self, Error::Integrity(_))
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Other(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Other(msg.to_string())
    }
}
