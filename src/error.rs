//! Error types for the nonce relayer

use std::time::Duration;
use thiserror::Error;

/// Main error type for the relayer
#[derive(Error, Debug)]
pub enum RelayerError {
    #[error("No ledger gateway configured")]
    MissingGateway,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("No transactions provided")]
    NoTransactions,

    #[error("Invalid {name}: got {got:?}, minimum is {min:?}")]
    InvalidInterval {
        name: &'static str,
        min: Duration,
        got: Duration,
    },

    #[error("Nonce gap for {address}: chain nonce {chain_nonce}, lowest outstanding nonce {lowest_nonce}")]
    GapNonce {
        address: String,
        chain_nonce: u64,
        lowest_nonce: u64,
    },

    #[error("Transaction already sent for {address} with nonce {nonce}")]
    TxAlreadySent { address: String, nonce: u64 },

    #[error("Gateway error: {0}")]
    Gateway(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Nonce handler is closed")]
    Closed,

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayerError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayerError::Gateway(_) | RelayerError::Timeout { .. }
        )
    }

    /// Check if the caller (or the handler shutting down) aborted the wait
    pub fn is_cancellation(&self) -> bool {
        matches!(self, RelayerError::Cancelled | RelayerError::Closed)
    }

    /// Check if the account needs an explicit drop before it can make progress
    pub fn requires_reset(&self) -> bool {
        matches!(self, RelayerError::GapNonce { .. })
    }
}

/// Result type for relayer operations
pub type RelayerResult<T> = Result<T, RelayerError>;
