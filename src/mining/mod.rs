//! Proof-of-work and block production

pub mod miner;
pub mod pow;

pub use miner::Miner;
pub use pow::{meets_target, ProofOfWork};
