//! In-memory pool of verified transactions waiting for a block.

use crate::core::transaction::OutPoint;
use crate::core::{Block, Transaction};
use crate::crypto::hash::Hash256;
use crate::{LedgerError, Result};
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct Mempool {
    /// Arrival order, used when assembling a block.
    order: Vec<Hash256>,
    transactions: HashMap<Hash256, Transaction>,
    spenders: HashMap<OutPoint, Hash256>,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `tx` unless already present. A transaction spending an output some
    /// pooled transaction already spends is refused.
    pub fn insert(&mut self, tx: Transaction) -> Result<bool> {
        if self.contains(&tx.id) {
            return Ok(false);
        }

        if let Some(outpoint) = self.conflicts(&tx) {
            return Err(LedgerError::DoubleSpend {
                txid: outpoint.txid,
                vout: outpoint.vout,
            });
        }

        for input in &tx.inputs {
            self.spenders.insert(input.previous_output, tx.id);
        }
        self.order.push(tx.id);
        self.transactions.insert(tx.id, tx);

        Ok(true)
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.transactions.contains_key(txid)
    }

    pub fn get(&self, txid: &Hash256) -> Option<&Transaction> {
        self.transactions.get(txid)
    }

    /// First input of `tx` already spent by a different pooled transaction.
    pub fn conflicts(&self, tx: &Transaction) -> Option<OutPoint> {
        tx.inputs
            .iter()
            .map(|input| input.previous_output)
            .find(|outpoint| matches!(self.spenders.get(outpoint), Some(id) if *id != tx.id))
    }

    /// Pooled transactions in arrival order.
    pub fn transactions(&self) -> Vec<Transaction> {
        self.order
            .iter()
            .filter_map(|id| self.transactions.get(id))
            .cloned()
            .collect()
    }

    pub fn remove(&mut self, txid: &Hash256) -> Option<Transaction> {
        let tx = self.transactions.remove(txid)?;
        self.order.retain(|id| id != txid);
        for input in &tx.inputs {
            self.spenders.remove(&input.previous_output);
        }
        Some(tx)
    }

    /// Drops everything `block` confirmed, plus pooled transactions that now
    /// conflict with its spends. Returns how many were removed.
    pub fn remove_confirmed(&mut self, block: &Block) -> usize {
        let mut evicted: Vec<Hash256> = Vec::new();

        for tx in &block.transactions {
            if self.contains(&tx.id) {
                evicted.push(tx.id);
            }
            for input in &tx.inputs {
                if let Some(spender) = self.spenders.get(&input.previous_output) {
                    if *spender != tx.id {
                        evicted.push(*spender);
                    }
                }
            }
        }

        evicted
            .iter()
            .filter(|id| self.remove(id).is_some())
            .count()
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}
