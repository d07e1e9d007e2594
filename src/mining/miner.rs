use crate::core::{read_chain, write_chain, Block, SharedChain, Transaction};
use crate::crypto::hash::Hash256;
use crate::crypto::keys::is_valid_address;
use crate::mining::pow::ProofOfWork;
use crate::{LedgerError, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Mines blocks on the shared chain without holding its lock during the
/// nonce search.
#[derive(Debug, Clone)]
pub struct Miner {
    chain: SharedChain,
    reward_address: String,
    abandon: Arc<AtomicBool>,
    blocks_mined: Arc<AtomicU64>,
}

impl Miner {
    pub fn new(chain: SharedChain, reward_address: String) -> Result<Self> {
        if !is_valid_address(&reward_address) {
            return Err(LedgerError::InvalidAddress(reward_address));
        }

        Ok(Self {
            chain,
            reward_address,
            abandon: Arc::new(AtomicBool::new(false)),
            blocks_mined: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn blocks_mined(&self) -> u64 {
        self.blocks_mined.load(Ordering::Relaxed)
    }

    /// Stops the current nonce search, if any. Called when another block
    /// moves the tip.
    pub fn abandon(&self) {
        self.abandon.store(true, Ordering::SeqCst);
    }

    /// Mines `transfers` on the current tip. `Ok(None)` means the attempt was
    /// abandoned or the tip moved before the block could be appended.
    pub async fn mine(&self, transfers: Vec<Transaction>) -> Result<Option<Block>> {
        self.abandon.store(false, Ordering::SeqCst);

        let (candidate, difficulty) = {
            let chain = read_chain(&self.chain)?;
            let candidate = chain.prepare_block(&transfers, &self.reward_address)?;
            (candidate, chain.consensus().difficulty)
        };

        log::info!(
            "⛏️  Mining block at height {} with {} transfers",
            candidate.header.height,
            transfers.len()
        );

        let abandon = self.abandon.clone();
        let solved = tokio::task::spawn_blocking(move || ProofOfWork::new(difficulty).run(candidate, &abandon))
            .await
            .map_err(|e| LedgerError::Mining(format!("proof-of-work task failed: {}", e)))?;

        match solved {
            Some(block) => self.submit(block),
            None => {
                log::info!("🛑 Mining abandoned, the tip moved");
                Ok(None)
            }
        }
    }

    /// Appends a solved block if its parent is still the tip.
    pub fn submit(&self, block: Block) -> Result<Option<Block>> {
        let mut chain = write_chain(&self.chain)?;

        if chain.tip() != Some(block.header.previous_hash) {
            log::info!("🔄 Tip moved while mining, discarding block {}", block.hash);
            return Ok(None);
        }

        chain.add_block(block.clone())?;
        self.blocks_mined.fetch_add(1, Ordering::Relaxed);

        log::info!("🎉 Block mined! Hash: {} height: {}", block.hash, block.header.height);
        Ok(Some(block))
    }

    pub fn tip(&self) -> Result<Option<Hash256>> {
        Ok(read_chain(&self.chain)?.tip())
    }
}
