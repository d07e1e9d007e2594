use crate::core::Block;
use crate::crypto::hash::Hash256;
use crate::{LedgerError, Result};
use sled::transaction::{ConflictableTransactionError, TransactionResult};
use sled::{Db, Tree};
use std::path::Path;

const TREE_BLOCKS: &str = "blocks";

/// Reserved key in the blocks tree holding the current tip hash. Block keys
/// are always 32 bytes so it cannot collide with one.
const TIP_KEY: &[u8] = b"tip";

/// Hash-keyed block arena. The tip is the only mutable root.
#[derive(Debug, Clone)]
pub struct Database {
    db: Db,
    blocks: Tree,
}

impl Database {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path.as_ref())
            .map_err(|e| LedgerError::Storage(format!("Failed to open database: {}", e)))?;
        let blocks = db
            .open_tree(TREE_BLOCKS)
            .map_err(|e| LedgerError::Storage(format!("Failed to open tree {}: {}", TREE_BLOCKS, e)))?;

        log::debug!("💾 Opened block store at {}", path.as_ref().display());
        Ok(Self { db, blocks })
    }

    pub fn exists<P: AsRef<Path>>(path: P) -> bool {
        path.as_ref().exists()
    }

    pub fn get_block(&self, hash: &Hash256) -> Result<Option<Block>> {
        match self
            .blocks
            .get(&hash.as_bytes()[..])
            .map_err(|e| LedgerError::Storage(format!("Failed to get block: {}", e)))?
        {
            Some(data) => {
                let block: Block = bincode::deserialize(&data)
                    .map_err(|e| LedgerError::Storage(format!("Failed to deserialize block {}: {}", hash, e)))?;
                Ok(Some(block))
            }
            None => Ok(None),
        }
    }

    pub fn contains_block(&self, hash: &Hash256) -> Result<bool> {
        self.blocks
            .contains_key(&hash.as_bytes()[..])
            .map_err(|e| LedgerError::Storage(format!("Failed to look up block: {}", e)))
    }

    pub fn get_tip(&self) -> Result<Option<Hash256>> {
        match self
            .blocks
            .get(TIP_KEY)
            .map_err(|e| LedgerError::Storage(format!("Failed to read tip: {}", e)))?
        {
            Some(bytes) => Hash256::from_slice(&bytes)
                .map(Some)
                .ok_or_else(|| LedgerError::Storage("Invalid tip hash length".to_string())),
            None => Ok(None),
        }
    }

    /// Stores `block` and, when `advance_tip` is set, points the tip at it in
    /// the same transaction.
    pub fn insert_block(&self, block: &Block, advance_tip: bool) -> Result<()> {
        let key = block.hash.as_bytes().to_vec();
        let data = bincode::serialize(block)
            .map_err(|e| LedgerError::Storage(format!("Failed to serialize block: {}", e)))?;

        let outcome: TransactionResult<(), String> = self.blocks.transaction(|tx| {
            tx.insert(key.clone(), data.clone())?;
            if advance_tip {
                tx.insert(TIP_KEY, key.clone())?;
            }
            Ok::<(), ConflictableTransactionError<String>>(())
        });
        outcome.map_err(|e| LedgerError::Storage(format!("Failed to save block {}: {}", block.hash, e)))?;

        self.flush()?;
        log::debug!(
            "💾 Saved block {} at height {}{}",
            block.hash,
            block.header.height,
            if advance_tip { " (tip)" } else { "" }
        );
        Ok(())
    }

    pub fn block_count(&self) -> Result<usize> {
        let has_tip = self
            .blocks
            .contains_key(TIP_KEY)
            .map_err(|e| LedgerError::Storage(format!("Failed to read tip: {}", e)))?;
        Ok(self.blocks.len() - usize::from(has_tip))
    }

    pub fn flush(&self) -> Result<()> {
        self.db
            .flush()
            .map_err(|e| LedgerError::Storage(format!("Failed to flush database: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Transaction;
    use crate::crypto::hash::Hash160;
    use tempfile::TempDir;

    fn block_at(height: u64, previous_hash: Hash256) -> Block {
        let coinbase = Transaction::new_coinbase_to(Hash160::new([1u8; 20]), 10, format!("block {}", height));
        let mut block = Block::new(previous_hash, vec![coinbase], 0, height);
        block.seal(0);
        block
    }

    #[test]
    fn test_empty_store() -> Result<()> {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::open(temp_dir.path().join("chain.db"))?;

        assert_eq!(db.get_tip()?, None);
        assert_eq!(db.block_count()?, 0);
        assert!(db.get_block(&Hash256::zero())?.is_none());

        Ok(())
    }

    #[test]
    fn test_insert_and_tip() -> Result<()> {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::open(temp_dir.path().join("chain.db"))?;

        let genesis = block_at(0, Hash256::zero());
        db.insert_block(&genesis, true)?;
        assert_eq!(db.get_tip()?, Some(genesis.hash));
        assert_eq!(db.get_block(&genesis.hash)?, Some(genesis.clone()));

        // Stored but not promoted.
        let side = block_at(5, Hash256::hash(b"unknown parent"));
        db.insert_block(&side, false)?;
        assert!(db.contains_block(&side.hash)?);
        assert_eq!(db.get_tip()?, Some(genesis.hash));
        assert_eq!(db.block_count()?, 2);

        Ok(())
    }

    #[test]
    fn test_reopen_persists() -> Result<()> {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("chain.db");
        let genesis = block_at(0, Hash256::zero());

        {
            let db = Database::open(&path)?;
            db.insert_block(&genesis, true)?;
        }

        assert!(Database::exists(&path));
        let db = Database::open(&path)?;
        assert_eq!(db.get_tip()?, Some(genesis.hash));

        Ok(())
    }
}
