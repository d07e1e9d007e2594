//! Hash-prefix proof-of-work.
//!
//! A block hash meets difficulty `d` when its first `d` bits are zero.

use crate::core::Block;
use crate::crypto::hash::Hash256;
use crate::{LedgerError, Result};
use std::sync::atomic::{AtomicBool, Ordering};

/// How many nonces to try between checks of the abandon flag.
const ABANDON_CHECK_INTERVAL: u64 = 4096;

pub fn meets_target(hash: &Hash256, difficulty: u32) -> bool {
    hash.leading_zero_bits() >= difficulty
}

#[derive(Debug, Clone, Copy)]
pub struct ProofOfWork {
    difficulty: u32,
}

impl ProofOfWork {
    pub fn new(difficulty: u32) -> Self {
        Self { difficulty }
    }

    /// Searches nonces until the header hash meets the target. Returns `None`
    /// if `abandon` is raised first or the nonce space runs out.
    pub fn run(&self, mut block: Block, abandon: &AtomicBool) -> Option<Block> {
        block.header.difficulty = self.difficulty;

        let mut nonce: u64 = 0;
        loop {
            if nonce % ABANDON_CHECK_INTERVAL == 0 && abandon.load(Ordering::Relaxed) {
                log::debug!("🛑 Proof-of-work abandoned at nonce {}", nonce);
                return None;
            }

            block.seal(nonce);
            if meets_target(&block.hash, self.difficulty) {
                log::debug!("⛏️  Found nonce {} for block {}", nonce, block.hash);
                return Some(block);
            }

            nonce = nonce.checked_add(1)?;
        }
    }

    /// Uninterruptible variant for genesis and CLI-driven blocks.
    pub fn solve(&self, block: Block) -> Result<Block> {
        self.run(block, &AtomicBool::new(false))
            .ok_or_else(|| LedgerError::Mining("nonce space exhausted".to_string()))
    }
}
