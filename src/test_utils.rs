use crate::config::ConsensusConfig;
use crate::core::Blockchain;
use crate::crypto::keys::KeyPair;
use crate::storage::Database;
use tempfile::TempDir;

/// Low enough that a block is found in a few hundred hashes.
pub const TEST_DIFFICULTY: u32 = 8;

pub fn test_consensus() -> ConsensusConfig {
    ConsensusConfig {
        coinbase_reward: 10,
        difficulty: TEST_DIFFICULTY,
        genesis_message: "test genesis".to_string(),
    }
}

/// Chain whose genesis pays 10 to `founder`, stored at `<dir>/chain.db`.
pub fn temp_chain(founder: &KeyPair) -> (TempDir, Blockchain) {
    let dir = TempDir::new().unwrap();
    let db = Database::open(dir.path().join("chain.db")).unwrap();
    let chain = Blockchain::create(db, &founder.address(), test_consensus()).unwrap();
    (dir, chain)
}

pub fn empty_chain() -> (TempDir, Blockchain) {
    let dir = TempDir::new().unwrap();
    let db = Database::open(dir.path().join("chain.db")).unwrap();
    let chain = Blockchain::open_or_empty(db, test_consensus()).unwrap();
    (dir, chain)
}
