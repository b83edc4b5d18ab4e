use thiserror::Error;

/// Failure kinds surfaced by the ledger, wallet and peer layers.
///
/// Validation failures are never fatal: the offending transaction, block or
/// frame is dropped and logged by the caller.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("invalid block: {0}")]
    InvalidBlock(String),

    #[error("invalid chain: {0}")]
    InvalidChain(String),

    #[error("insufficient funds: available {available}, required {required}")]
    InsufficientFunds { available: f64, required: f64 },

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
