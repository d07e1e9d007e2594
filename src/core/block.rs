use crate::core::merkle::{merkle_root, MerkleProof, MerkleTree};
use crate::core::Transaction;
use crate::crypto::hash::{Hash256, Hashable};
use crate::mining::pow::meets_target;
use crate::{LedgerError, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub hash: Hash256,
    pub transactions: Vec<Transaction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub height: u64,
    pub previous_hash: Hash256,
    pub merkle_root: Hash256,
    pub timestamp: i64,
    pub difficulty: u32,
    pub nonce: u64,
}

impl Block {
    /// Unsealed candidate; `hash` reflects nonce 0 until `seal` is called.
    pub fn new(previous_hash: Hash256, transactions: Vec<Transaction>, difficulty: u32, height: u64) -> Self {
        let header = BlockHeader {
            height,
            previous_hash,
            merkle_root: Self::calculate_merkle_root(&transactions),
            timestamp: Utc::now().timestamp(),
            difficulty,
            nonce: 0,
        };

        Self {
            hash: header.hash(),
            header,
            transactions,
        }
    }

    pub fn genesis(coinbase: Transaction, difficulty: u32) -> Self {
        Self::new(Hash256::zero(), vec![coinbase], difficulty, 0)
    }

    /// Root over the transaction ids in block order.
    pub fn calculate_merkle_root(transactions: &[Transaction]) -> Hash256 {
        let ids: Vec<Hash256> = transactions.iter().map(|tx| tx.id).collect();
        merkle_root(&ids)
    }

    pub fn seal(&mut self, nonce: u64) {
        self.header.nonce = nonce;
        self.hash = self.header.hash();
    }

    pub fn is_genesis(&self) -> bool {
        self.header.previous_hash.is_zero()
    }

    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first().filter(|tx| tx.is_coinbase())
    }

    pub fn merkle_proof(&self, txid: &Hash256) -> Option<MerkleProof> {
        let ids: Vec<Hash256> = self.transactions.iter().map(|tx| tx.id).collect();
        let index = ids.iter().position(|id| id == txid)?;
        MerkleTree::new(&ids).proof(index)
    }

    /// Context-free checks: stored hash, proof-of-work, merkle commitment and
    /// coinbase placement. Linkage is the chain's job.
    pub fn validate_header(&self, min_difficulty: u32) -> Result<()> {
        let recomputed = self.header.hash();
        if recomputed != self.hash {
            return Err(LedgerError::InvalidBlock(format!(
                "stored hash {} does not match header hash {}",
                self.hash, recomputed
            )));
        }

        if self.header.difficulty < min_difficulty {
            return Err(LedgerError::InvalidBlock(format!(
                "difficulty {} below minimum {}",
                self.header.difficulty, min_difficulty
            )));
        }

        if !meets_target(&self.hash, self.header.difficulty) {
            return Err(LedgerError::InvalidBlock(format!(
                "{} does not meet difficulty {}",
                self.hash, self.header.difficulty
            )));
        }

        if Self::calculate_merkle_root(&self.transactions) != self.header.merkle_root {
            return Err(LedgerError::InvalidBlock(format!("{} merkle root mismatch", self.hash)));
        }

        if self.coinbase().is_none() {
            return Err(LedgerError::InvalidBlock(format!(
                "{} does not start with a coinbase",
                self.hash
            )));
        }

        if self.transactions.iter().skip(1).any(|tx| tx.is_coinbase()) {
            return Err(LedgerError::InvalidBlock(format!("{} has more than one coinbase", self.hash)));
        }

        if self.is_genesis() != (self.header.height == 0) {
            return Err(LedgerError::InvalidBlock(format!(
                "{} has height {} inconsistent with its parent",
                self.hash, self.header.height
            )));
        }

        Ok(())
    }
}

impl Hashable for Block {
    fn hash(&self) -> Hash256 {
        self.header.hash()
    }
}

impl BlockHeader {
    pub fn hash(&self) -> Hash256 {
        let mut data = Vec::new();
        data.extend_from_slice(&self.height.to_le_bytes());
        data.extend_from_slice(self.previous_hash.as_bytes());
        data.extend_from_slice(self.merkle_root.as_bytes());
        data.extend_from_slice(&self.timestamp.to_le_bytes());
        data.extend_from_slice(&self.difficulty.to_le_bytes());
        data.extend_from_slice(&self.nonce.to_le_bytes());

        Hash256::hash(&data)
    }
}
