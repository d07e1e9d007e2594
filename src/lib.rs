//! Hashchain - a minimal peer-replicated UTXO ledger
//!
//! - Blocks of signed transfers linked by hash and sealed with proof-of-work
//! - A spendable-output index derived from the full transaction history
//! - A small framed TCP protocol for syncing chains and relaying transactions
//! - A clap CLI for wallets, transfers and running a node

pub mod cli;
pub mod config;
pub mod core;
pub mod crypto;
pub mod error;
pub mod mining;
pub mod network;
pub mod storage;
pub mod wallet;

#[cfg(test)]
pub(crate) mod test_utils;

pub use error::{LedgerError, Result};
