//! Chain failure taxonomy.
//!
//! Every failure coming back from the chain is classified as either
//! transient (infrastructure, worth retrying) or permanent (the chain said
//! no, retrying cannot help).

use std::future::Future;
use std::time::Duration;
use thiserror::Error;

pub type ChainResult<T> = Result<T, ChainError>;

/// Whether a failure may succeed on a later attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Transient,
    Permanent,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ChainError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("rate limited by provider: {0}")]
    RateLimited(String),

    /// Nonce or gas-price conflict with another pending transaction.
    #[error("nonce/gas conflict: {0}")]
    NonceConflict(String),

    #[error("gas price {current} wei exceeds cap {cap} wei")]
    GasPriceTooHigh { current: u128, cap: u128 },

    #[error("receipt for {tx_hash} not observed within {timeout:?}")]
    ReceiptTimeout { tx_hash: String, timeout: Duration },

    #[error("malformed node response: {0}")]
    Decode(String),

    /// Contract reverted, typically because the trigger no longer holds.
    #[error("execution reverted: {0}")]
    Reverted(String),

    #[error("transaction {tx_hash} mined with failed status")]
    ReceiptFailed { tx_hash: String },

    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("invalid signature or sender: {0}")]
    InvalidSender(String),

    #[error("{0} not found")]
    NotFound(String),
}

impl ChainError {
    pub fn class(&self) -> FailureClass {
        match self {
            ChainError::Timeout(_)
            | ChainError::Transport(_)
            | ChainError::RateLimited(_)
            | ChainError::NonceConflict(_)
            | ChainError::GasPriceTooHigh { .. }
            | ChainError::ReceiptTimeout { .. }
            | ChainError::Decode(_) => FailureClass::Transient,
            ChainError::Reverted(_)
            | ChainError::ReceiptFailed { .. }
            | ChainError::InsufficientFunds(_)
            | ChainError::InvalidSender(_)
            | ChainError::NotFound(_) => FailureClass::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == FailureClass::Transient
    }

    /// Classify a JSON-RPC error object returned by the node.
    pub fn from_rpc(code: i64, message: &str) -> Self {
        let lower = message.to_lowercase();

        if code == 3 || lower.contains("revert") {
            ChainError::Reverted(message.to_string())
        } else if lower.contains("insufficient funds") || lower.contains("insufficient balance") {
            ChainError::InsufficientFunds(message.to_string())
        } else if lower.contains("invalid signature")
            || lower.contains("invalid sender")
            || lower.contains("unknown account")
        {
            ChainError::InvalidSender(message.to_string())
        } else if lower.contains("nonce too low")
            || lower.contains("underpriced")
            || lower.contains("already known")
        {
            ChainError::NonceConflict(message.to_string())
        } else if code == -32005
            || lower.contains("rate limit")
            || lower.contains("too many requests")
        {
            ChainError::RateLimited(message.to_string())
        } else {
            ChainError::Transport(format!("rpc error {}: {}", code, message))
        }
    }
}

impl From<reqwest::Error> for ChainError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ChainError::Timeout(Duration::ZERO)
        } else if err.status().map(|s| s.as_u16()) == Some(429) {
            ChainError::RateLimited(err.to_string())
        } else if err.is_decode() {
            ChainError::Decode(err.to_string())
        } else {
            ChainError::Transport(err.to_string())
        }
    }
}

/// Bound a chain call; running past `limit` is a transient timeout.
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> ChainResult<T>
where
    F: Future<Output = ChainResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(ChainError::Timeout(limit)),
    }
}
