//! Ledger data model: blocks, transactions, the UTXO index and the chain store

pub mod block;
pub mod blockchain;
pub mod mempool;
pub mod merkle;
pub mod transaction;
pub mod utxo;

pub use block::{Block, BlockHeader};
pub use blockchain::{AddOutcome, Blockchain};
pub use mempool::Mempool;
pub use merkle::{MerkleProof, MerkleTree};
pub use transaction::{OutPoint, Transaction, TxInput, TxOutput};
pub use utxo::{Utxo, UtxoIndex};

use crate::{LedgerError, Result};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Chain handle shared between connection tasks and the miner.
pub type SharedChain = Arc<RwLock<Blockchain>>;

pub fn shared(chain: Blockchain) -> SharedChain {
    Arc::new(RwLock::new(chain))
}

pub fn read_chain(chain: &SharedChain) -> Result<RwLockReadGuard<'_, Blockchain>> {
    chain.read().map_err(|_| LedgerError::LockPoisoned)
}

pub fn write_chain(chain: &SharedChain) -> Result<RwLockWriteGuard<'_, Blockchain>> {
    chain.write().map_err(|_| LedgerError::LockPoisoned)
}
