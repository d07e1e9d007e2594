use crate::crypto::hash::Hash256;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, LedgerError>;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Genesis block already exists for this node")]
    GenesisExists,

    #[error("No blockchain found, create one with `createblockchain` first")]
    ChainNotFound,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: u64, available: u64 },

    #[error("Referenced transaction not found: {0}")]
    MissingTransaction(Hash256),

    #[error("Invalid signature on input {0}")]
    InvalidSignature(usize),

    #[error("Invalid block: {0}")]
    InvalidBlock(String),

    #[error("Double spend detected for output {txid}:{vout}")]
    DoubleSpend { txid: Hash256, vout: u32 },

    #[error("Transaction validation failed: {0}")]
    Validation(String),

    #[error("Mining error: {0}")]
    Mining(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Peer operation timed out: {0}")]
    Timeout(String),

    #[error("Shared chain lock poisoned")]
    LockPoisoned,
}

impl LedgerError {
    /// Validation failures reject a transaction or block without affecting the node.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            LedgerError::MissingTransaction(_)
                | LedgerError::InvalidSignature(_)
                | LedgerError::InvalidBlock(_)
                | LedgerError::DoubleSpend { .. }
                | LedgerError::Validation(_)
        )
    }
}
