use crate::core::transaction::{OutPoint, TxOutput};
use crate::core::Block;
use crate::crypto::hash::{Hash160, Hash256};
use crate::{LedgerError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub txid: Hash256,
    pub index: u32,
    pub output: TxOutput,
}

impl Utxo {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.txid, self.index)
    }

    pub fn value(&self) -> u64 {
        self.output.value
    }
}

/// Unspent outputs grouped by the transaction that created them. Each entry
/// keeps ascending output order, and transactions with nothing unspent have no
/// entry. Derived from the chain and never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UtxoIndex {
    entries: HashMap<Hash256, Vec<Utxo>>,
}

impl UtxoIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the index from blocks given tip first. Transactions within a
    /// block are visited newest first, so every spend is seen before the
    /// output it consumes.
    pub fn rebuild<I>(blocks: I) -> Result<Self>
    where
        I: IntoIterator<Item = Result<Block>>,
    {
        let mut spent: HashSet<OutPoint> = HashSet::new();
        let mut entries = HashMap::new();

        for block in blocks {
            let block = block?;
            for tx in block.transactions.iter().rev() {
                let unspent: Vec<Utxo> = tx
                    .outputs
                    .iter()
                    .enumerate()
                    .filter(|(index, _)| !spent.contains(&OutPoint::new(tx.id, *index as u32)))
                    .map(|(index, output)| Utxo {
                        txid: tx.id,
                        index: index as u32,
                        output: output.clone(),
                    })
                    .collect();

                if !unspent.is_empty() {
                    entries.insert(tx.id, unspent);
                }

                if !tx.is_coinbase() {
                    spent.extend(tx.inputs.iter().map(|input| input.previous_output));
                }
            }
        }

        Ok(Self { entries })
    }

    /// Applies a block that extends the tip the index was built for.
    pub fn apply_block(&mut self, block: &Block) {
        for tx in &block.transactions {
            if !tx.is_coinbase() {
                for input in &tx.inputs {
                    self.spend(&input.previous_output);
                }
            }

            let created: Vec<Utxo> = tx
                .outputs
                .iter()
                .enumerate()
                .map(|(index, output)| Utxo {
                    txid: tx.id,
                    index: index as u32,
                    output: output.clone(),
                })
                .collect();

            if !created.is_empty() {
                self.entries.insert(tx.id, created);
            }
        }
    }

    fn spend(&mut self, outpoint: &OutPoint) {
        if let Some(utxos) = self.entries.get_mut(&outpoint.txid) {
            utxos.retain(|utxo| utxo.index != outpoint.vout);
            if utxos.is_empty() {
                self.entries.remove(&outpoint.txid);
            }
        }
    }

    pub fn contains(&self, outpoint: &OutPoint) -> bool {
        self.get(outpoint).is_some()
    }

    pub fn get(&self, outpoint: &OutPoint) -> Option<&Utxo> {
        self.entries
            .get(&outpoint.txid)?
            .iter()
            .find(|utxo| utxo.index == outpoint.vout)
    }

    pub fn outputs_of(&self, txid: &Hash256) -> Option<&[Utxo]> {
        self.entries.get(txid).map(Vec::as_slice)
    }

    /// Outputs payable to `owner`, ordered by (txid, index).
    pub fn utxos_for(&self, owner: &Hash160) -> Vec<Utxo> {
        let mut utxos: Vec<Utxo> = self
            .entries
            .values()
            .flatten()
            .filter(|utxo| utxo.output.is_payable_to(owner))
            .cloned()
            .collect();
        utxos.sort_by(|a, b| a.txid.cmp(&b.txid).then(a.index.cmp(&b.index)));
        utxos
    }

    pub fn balance(&self, owner: &Hash160) -> u64 {
        self.entries
            .values()
            .flatten()
            .filter(|utxo| utxo.output.is_payable_to(owner))
            .map(Utxo::value)
            .sum()
    }

    /// Accumulates `owner`'s outputs until they cover `amount`.
    pub fn find_spendable(&self, owner: &Hash160, amount: u64) -> Result<(u64, Vec<Utxo>)> {
        let mut total = 0u64;
        let mut selected = Vec::new();

        for utxo in self.utxos_for(owner) {
            if total >= amount {
                break;
            }
            total += utxo.value();
            selected.push(utxo);
        }

        if total < amount {
            return Err(LedgerError::InsufficientFunds {
                required: amount,
                available: total,
            });
        }

        Ok((total, selected))
    }

    /// Number of unspent outputs.
    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn transaction_count(&self) -> usize {
        self.entries.len()
    }

    pub fn total_value(&self) -> u64 {
        self.entries.values().flatten().map(Utxo::value).sum()
    }
}
