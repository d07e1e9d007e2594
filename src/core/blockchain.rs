use crate::config::ConsensusConfig;
use crate::core::transaction::{OutPoint, TxOutput};
use crate::core::utxo::{Utxo, UtxoIndex};
use crate::core::{Block, Transaction};
use crate::crypto::hash::{Hash160, Hash256};
use crate::crypto::keys::{address_to_hash160, KeyPair, PrivateKey};
use crate::mining::pow::ProofOfWork;
use crate::storage::Database;
use crate::{LedgerError, Result};
use std::collections::{HashMap, HashSet};

/// What `add_block` did with a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// Already stored; nothing changed.
    Duplicate,
    /// Stored, but the tip stayed where it was.
    Stored,
    /// Stored and now the tip.
    Extended,
}

/// Chain handle: the block store, the tip, and the UTXO index derived from it.
#[derive(Debug)]
pub struct Blockchain {
    db: Database,
    tip: Option<Hash256>,
    height: Option<u64>,
    consensus: ConsensusConfig,
    utxo: UtxoIndex,
}

/// Walks from a block back to genesis by hash lookup.
pub struct ChainIter<'a> {
    db: &'a Database,
    next: Option<Hash256>,
}

impl<'a> Iterator for ChainIter<'a> {
    type Item = Result<Block>;

    fn next(&mut self) -> Option<Self::Item> {
        let hash = self.next.take()?;

        match self.db.get_block(&hash) {
            Ok(Some(block)) => {
                if !block.is_genesis() {
                    self.next = Some(block.header.previous_hash);
                }
                Some(Ok(block))
            }
            Ok(None) => Some(Err(LedgerError::Storage(format!(
                "block {} missing from store",
                hash
            )))),
            Err(e) => Some(Err(e)),
        }
    }
}

impl Blockchain {
    /// Mines and stores the genesis block paying `founder`.
    pub fn create(db: Database, founder: &str, consensus: ConsensusConfig) -> Result<Self> {
        if db.get_tip()?.is_some() {
            return Err(LedgerError::GenesisExists);
        }

        let coinbase = Transaction::new_coinbase(
            founder,
            consensus.coinbase_reward,
            consensus.genesis_message.clone(),
        )?;
        let genesis = ProofOfWork::new(consensus.difficulty).solve(Block::genesis(coinbase, consensus.difficulty))?;

        db.insert_block(&genesis, true)?;
        log::info!("🌱 Genesis block {} created for {}", genesis.hash, founder);

        Self::load(db, consensus)
    }

    /// Opens an existing chain.
    pub fn open(db: Database, consensus: ConsensusConfig) -> Result<Self> {
        if db.get_tip()?.is_none() {
            return Err(LedgerError::ChainNotFound);
        }
        Self::load(db, consensus)
    }

    /// Opens a chain that may still be empty, as on a node about to sync.
    pub fn open_or_empty(db: Database, consensus: ConsensusConfig) -> Result<Self> {
        Self::load(db, consensus)
    }

    fn load(db: Database, consensus: ConsensusConfig) -> Result<Self> {
        let tip = db.get_tip()?;
        let height = match tip {
            Some(hash) => Some(
                db.get_block(&hash)?
                    .ok_or_else(|| LedgerError::Storage(format!("tip block {} missing from store", hash)))?
                    .header
                    .height,
            ),
            None => None,
        };

        let mut chain = Self {
            db,
            tip,
            height,
            consensus,
            utxo: UtxoIndex::new(),
        };
        chain.reindex()?;

        match chain.height {
            Some(h) => log::info!("📚 Loaded chain at height {} ({} unspent outputs)", h, chain.utxo.len()),
            None => log::info!("📭 Opened empty chain"),
        }
        Ok(chain)
    }

    pub fn tip(&self) -> Option<Hash256> {
        self.tip
    }

    pub fn best_height(&self) -> Option<u64> {
        self.height
    }

    pub fn is_empty(&self) -> bool {
        self.tip.is_none()
    }

    pub fn consensus(&self) -> &ConsensusConfig {
        &self.consensus
    }

    pub fn utxo_index(&self) -> &UtxoIndex {
        &self.utxo
    }

    /// Blocks from the tip back to genesis.
    pub fn iter(&self) -> ChainIter<'_> {
        self.iter_from(self.tip)
    }

    /// Blocks from `from` back to genesis, following stored parent links.
    fn iter_from(&self, from: Option<Hash256>) -> ChainIter<'_> {
        ChainIter { db: &self.db, next: from }
    }

    pub fn get_block(&self, hash: &Hash256) -> Result<Option<Block>> {
        self.db.get_block(hash)
    }

    pub fn contains_block(&self, hash: &Hash256) -> Result<bool> {
        self.db.contains_block(hash)
    }

    /// Block at `height` on the active chain.
    pub fn get_block_by_height(&self, height: u64) -> Result<Option<Block>> {
        match self.height {
            Some(best) if height <= best => {}
            _ => return Ok(None),
        }

        for block in self.iter() {
            let block = block?;
            if block.header.height == height {
                return Ok(Some(block));
            }
        }
        Ok(None)
    }

    /// Active chain hashes, tip first.
    pub fn block_hashes(&self) -> Result<Vec<Hash256>> {
        self.iter().map(|block| block.map(|b| b.hash)).collect()
    }

    /// Every stored block, including ones off the active chain.
    pub fn block_count(&self) -> Result<usize> {
        self.db.block_count()
    }

    /// Idempotent append. The tip moves only to a rooted, fully valid block
    /// taller than it. A stored block that was inert becomes the tip once its
    /// ancestry is complete.
    pub fn add_block(&mut self, block: Block) -> Result<AddOutcome> {
        let taller = self.height.map_or(true, |h| block.header.height > h);
        let advance = taller && self.is_rooted(&block)?;

        if !advance && self.db.contains_block(&block.hash)? {
            log::debug!("🔁 Block {} already stored", block.hash);
            return Ok(AddOutcome::Duplicate);
        }

        block.validate_header(self.consensus.difficulty)?;

        if !advance {
            self.db.insert_block(&block, false)?;
            log::info!(
                "📦 Stored block {} at height {} without moving the tip",
                block.hash,
                block.header.height
            );
            return Ok(AddOutcome::Stored);
        }

        let extends_tip = match self.tip {
            Some(tip) => block.header.previous_hash == tip,
            None => block.is_genesis(),
        };

        // Bodies are checked against the UTXO view of the branch they extend.
        let branch_view = if extends_tip {
            self.validate_body(&block, &self.utxo)?;
            None
        } else {
            Some(self.branch_view(&block)?)
        };

        self.db.insert_block(&block, true)?;
        self.tip = Some(block.hash);
        self.height = Some(block.header.height);

        match branch_view {
            None => self.utxo.apply_block(&block),
            Some(view) => {
                log::info!("🔀 Tip switched to a taller branch");
                self.utxo = view;
            }
        }

        log::info!("✅ Block {} added at height {}", block.hash, block.header.height);
        Ok(AddOutcome::Extended)
    }

    /// True if the block's ancestry reaches genesis through stored blocks
    /// with consecutive heights.
    fn is_rooted(&self, block: &Block) -> Result<bool> {
        if block.is_genesis() {
            return Ok(block.header.height == 0);
        }

        let mut height = block.header.height;
        let mut parent_hash = block.header.previous_hash;

        loop {
            let parent = match self.db.get_block(&parent_hash)? {
                Some(parent) => parent,
                None => return Ok(false),
            };

            if parent.header.height.checked_add(1) != Some(height) {
                return Ok(false);
            }
            // The current tip is rooted by construction.
            if Some(parent.hash) == self.tip || parent.is_genesis() {
                return Ok(true);
            }

            height = parent.header.height;
            parent_hash = parent.header.previous_hash;
        }
    }

    /// Reward cap plus every transfer, checked against `view`, the unspent
    /// outputs as of the block's parent.
    fn validate_body(&self, block: &Block, view: &UtxoIndex) -> Result<()> {
        let minted = block.coinbase().map_or(0, Transaction::total_output_value);
        if minted > self.consensus.coinbase_reward {
            return Err(LedgerError::InvalidBlock(format!(
                "{} mints {}, above the reward of {}",
                block.hash, minted, self.consensus.coinbase_reward
            )));
        }

        let parent = (!block.is_genesis()).then_some(block.header.previous_hash);
        let transfers = block.transactions.get(1..).unwrap_or(&[]);
        self.check_transfers(transfers, view, parent)
    }

    /// UTXO view after `block` on a branch that does not extend the tip. Every
    /// block between the fork point and `block` is validated on the way.
    fn branch_view(&self, block: &Block) -> Result<UtxoIndex> {
        let active: HashSet<Hash256> = self.block_hashes()?.into_iter().collect();

        let mut segment = Vec::new();
        let mut cursor = (!block.is_genesis()).then_some(block.header.previous_hash);
        let fork = loop {
            match cursor {
                Some(hash) if !active.contains(&hash) => {
                    let ancestor = self
                        .db
                        .get_block(&hash)?
                        .ok_or_else(|| LedgerError::Storage(format!("block {} missing from store", hash)))?;
                    cursor = (!ancestor.is_genesis()).then_some(ancestor.header.previous_hash);
                    segment.push(ancestor);
                }
                other => break other,
            }
        };

        let mut view = UtxoIndex::rebuild(self.iter_from(fork))?;
        for ancestor in segment.iter().rev().chain(std::iter::once(block)) {
            self.validate_body(ancestor, &view)?;
            view.apply_block(ancestor);
        }
        Ok(view)
    }

    /// Candidate block on the current tip: the reward first, then the
    /// verified transfers in order.
    pub fn prepare_block(&self, transfers: &[Transaction], reward_address: &str) -> Result<Block> {
        self.build_candidate(transfers, reward_address, "reward")
    }

    /// The reward memo is tagged with the height so reward ids never repeat.
    fn build_candidate(&self, transfers: &[Transaction], reward_address: &str, note: &str) -> Result<Block> {
        let (tip, height) = match (self.tip, self.height) {
            (Some(tip), Some(height)) => (tip, height + 1),
            _ => return Err(LedgerError::ChainNotFound),
        };

        self.validate_batch(transfers)?;

        let reward = Transaction::new_coinbase(
            reward_address,
            self.consensus.coinbase_reward,
            format!("block {} {}", height, note),
        )?;

        let mut transactions = Vec::with_capacity(transfers.len() + 1);
        transactions.push(reward);
        transactions.extend(transfers.iter().cloned());

        Ok(Block::new(tip, transactions, self.consensus.difficulty, height))
    }

    /// Each transfer is verified against the chain plus the transfers before
    /// it. Spending an output twice, or one that is not unspent, is refused.
    pub fn validate_batch(&self, transfers: &[Transaction]) -> Result<()> {
        self.check_transfers(transfers, &self.utxo, self.tip)
    }

    /// Verifies `transfers` in order on top of the chain ending at `ancestry`,
    /// whose unspent outputs are `view`.
    fn check_transfers(&self, transfers: &[Transaction], view: &UtxoIndex, ancestry: Option<Hash256>) -> Result<()> {
        let mut spent: HashSet<OutPoint> = HashSet::new();

        for (position, tx) in transfers.iter().enumerate() {
            if tx.is_coinbase() {
                return Err(LedgerError::Validation(format!(
                    "transfer {} has no inputs",
                    tx.id
                )));
            }

            let prefix = &transfers[..position];
            tx.verify(&self.previous_transactions(tx, prefix, ancestry)?)?;

            for input in &tx.inputs {
                let outpoint = input.previous_output;
                let unspent = view.contains(&outpoint)
                    || prefix.iter().any(|p| p.id == outpoint.txid && (outpoint.vout as usize) < p.outputs.len());

                if !spent.insert(outpoint) || !unspent {
                    return Err(LedgerError::DoubleSpend {
                        txid: outpoint.txid,
                        vout: outpoint.vout,
                    });
                }
            }
        }

        Ok(())
    }

    /// Builds, mines and appends a block of `transfers` plus a reward to
    /// `reward_address`.
    pub fn mine_new_block(&mut self, transfers: &[Transaction], reward_address: &str) -> Result<Block> {
        let candidate = self.prepare_block(transfers, reward_address)?;
        let block = ProofOfWork::new(self.consensus.difficulty).solve(candidate)?;

        match self.add_block(block.clone())? {
            AddOutcome::Extended => Ok(block),
            outcome => Err(LedgerError::InvalidBlock(format!(
                "mined block {} was not appended ({:?})",
                block.hash, outcome
            ))),
        }
    }

    /// Mines a block holding only the reward, with `data` recorded in the
    /// reward memo.
    pub fn add_data_block(&mut self, reward_address: &str, data: &str) -> Result<Block> {
        let candidate = self.build_candidate(&[], reward_address, data)?;
        let block = ProofOfWork::new(self.consensus.difficulty).solve(candidate)?;
        self.add_block(block.clone())?;
        Ok(block)
    }

    /// Looks in `in_flight` first, then walks the active chain.
    pub fn find_transaction(&self, txid: &Hash256, in_flight: &[Transaction]) -> Result<Option<Transaction>> {
        self.find_transaction_from(txid, in_flight, self.tip)
    }

    fn find_transaction_from(
        &self,
        txid: &Hash256,
        in_flight: &[Transaction],
        from: Option<Hash256>,
    ) -> Result<Option<Transaction>> {
        if let Some(tx) = in_flight.iter().find(|tx| &tx.id == txid) {
            return Ok(Some(tx.clone()));
        }

        for block in self.iter_from(from) {
            if let Some(tx) = block?.transactions.into_iter().find(|tx| &tx.id == txid) {
                return Ok(Some(tx));
            }
        }

        Ok(None)
    }

    /// Transactions `tx` spends from, looked up in `in_flight` and then in the
    /// chain ending at `from`.
    fn previous_transactions(
        &self,
        tx: &Transaction,
        in_flight: &[Transaction],
        from: Option<Hash256>,
    ) -> Result<HashMap<Hash256, Transaction>> {
        let mut previous = HashMap::new();

        for input in &tx.inputs {
            let txid = input.previous_output.txid;
            if previous.contains_key(&txid) {
                continue;
            }
            let found = self
                .find_transaction_from(&txid, in_flight, from)?
                .ok_or(LedgerError::MissingTransaction(txid))?;
            previous.insert(txid, found);
        }

        Ok(previous)
    }

    pub fn sign_transaction(
        &self,
        tx: &mut Transaction,
        private_key: &PrivateKey,
        in_flight: &[Transaction],
    ) -> Result<()> {
        if tx.is_coinbase() {
            return Ok(());
        }
        let previous = self.previous_transactions(tx, in_flight, self.tip)?;
        tx.sign(private_key, &previous)
    }

    pub fn verify_transaction(&self, tx: &Transaction, in_flight: &[Transaction]) -> Result<()> {
        if tx.is_coinbase() {
            return Ok(());
        }
        let previous = self.previous_transactions(tx, in_flight, self.tip)?;
        tx.verify(&previous)
    }

    /// Outputs payable to `owner` that nothing on the chain or in `in_flight`
    /// spends. In-flight outputs come first, then the chain from tip to
    /// genesis.
    pub fn unspent_outputs_for(&self, owner: &Hash160, in_flight: &[Transaction]) -> Result<Vec<Utxo>> {
        let mut spent: HashSet<OutPoint> = in_flight
            .iter()
            .filter(|tx| !tx.is_coinbase())
            .flat_map(|tx| tx.inputs.iter())
            .filter(|input| input.unlocks(owner))
            .map(|input| input.previous_output)
            .collect();

        let mut unspent = Vec::new();
        let mut gather = |tx: &Transaction, spent: &HashSet<OutPoint>| {
            for (index, output) in tx.outputs.iter().enumerate() {
                let outpoint = OutPoint::new(tx.id, index as u32);
                if output.is_payable_to(owner) && !spent.contains(&outpoint) {
                    unspent.push(Utxo {
                        txid: tx.id,
                        index: index as u32,
                        output: output.clone(),
                    });
                }
            }
        };

        for tx in in_flight {
            gather(tx, &spent);
        }

        for block in self.iter() {
            let block = block?;
            for tx in block.transactions.iter().rev() {
                gather(tx, &spent);
                if !tx.is_coinbase() {
                    spent.extend(tx.inputs.iter().map(|input| input.previous_output));
                }
            }
        }

        Ok(unspent)
    }

    /// Balance by chain walk; agrees with `utxo_index().balance`.
    pub fn balance(&self, owner: &Hash160) -> Result<u64> {
        Ok(self.unspent_outputs_for(owner, &[])?.iter().map(Utxo::value).sum())
    }

    pub fn find_spendable_outputs(
        &self,
        owner: &Hash160,
        amount: u64,
        in_flight: &[Transaction],
    ) -> Result<(u64, Vec<Utxo>)> {
        let mut total = 0u64;
        let mut selected = Vec::new();

        for utxo in self.unspent_outputs_for(owner, in_flight)? {
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

    /// Signed transfer of `amount` from `from` to `to`, with change back to
    /// the sender. `in_flight` holds earlier transfers of the same batch.
    pub fn new_transfer(
        &self,
        from: &KeyPair,
        to: &str,
        amount: u64,
        in_flight: &[Transaction],
    ) -> Result<Transaction> {
        if amount == 0 {
            return Err(LedgerError::InvalidInput("amount must be greater than zero".to_string()));
        }

        let recipient = address_to_hash160(to)?;
        let sender = from.owner_hash();
        let (total, selected) = self.find_spendable_outputs(&sender, amount, in_flight)?;

        let mut outputs = vec![TxOutput::new(amount, recipient)];
        if total > amount {
            outputs.push(TxOutput::new(total - amount, sender));
        }

        let mut tx = Transaction::new_unsigned(selected.iter().map(Utxo::outpoint).collect(), outputs);
        self.sign_transaction(&mut tx, &from.private_key, in_flight)?;

        log::debug!("📝 Built transfer {} of {} to {}", tx.id, amount, to);
        Ok(tx)
    }

    /// Rebuilds the UTXO index from the active chain. Returns the number of
    /// transactions with unspent outputs.
    pub fn reindex(&mut self) -> Result<usize> {
        self.utxo = UtxoIndex::rebuild(self.iter())?;
        Ok(self.utxo.transaction_count())
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{empty_chain, temp_chain, test_consensus};

    fn keys() -> (KeyPair, KeyPair, KeyPair) {
        (KeyPair::new().unwrap(), KeyPair::new().unwrap(), KeyPair::new().unwrap())
    }

    #[test]
    fn test_genesis_creation() -> Result<()> {
        let (alice, _, _) = keys();
        let (_dir, chain) = temp_chain(&alice);

        assert_eq!(chain.best_height(), Some(0));
        assert_eq!(chain.balance(&alice.owner_hash())?, 10);
        assert_eq!(chain.utxo_index().balance(&alice.owner_hash()), 10);

        let genesis = chain.get_block_by_height(0)?.unwrap();
        assert!(genesis.is_genesis());
        assert_eq!(Some(genesis.hash), chain.tip());

        Ok(())
    }

    #[test]
    fn test_second_genesis_is_refused() -> Result<()> {
        let (alice, _, _) = keys();
        let (dir, chain) = temp_chain(&alice);
        let db_path = dir.path().join("chain.db");
        drop(chain);

        let db = Database::open(&db_path)?;
        let result = Blockchain::create(db, &alice.address(), test_consensus());
        assert!(matches!(result, Err(LedgerError::GenesisExists)));

        Ok(())
    }

    #[test]
    fn test_open_without_chain() -> Result<()> {
        let dir = tempfile::TempDir::new().unwrap();
        let db = Database::open(dir.path().join("empty.db"))?;

        assert!(matches!(
            Blockchain::open(db.clone(), test_consensus()),
            Err(LedgerError::ChainNotFound)
        ));

        let chain = Blockchain::open_or_empty(db, test_consensus())?;
        assert!(chain.is_empty());
        assert_eq!(chain.best_height(), None);
        assert!(chain.block_hashes()?.is_empty());

        Ok(())
    }

    #[test]
    fn test_genesis_then_transfer() -> Result<()> {
        let (alice, bob, miner) = keys();
        let (_dir, mut chain) = temp_chain(&alice);

        let tx = chain.new_transfer(&alice, &bob.address(), 4, &[])?;
        assert_eq!(tx.outputs.len(), 2);
        chain.mine_new_block(&[tx], &miner.address())?;

        assert_eq!(chain.best_height(), Some(1));
        for (key, expected) in [(&alice, 6), (&bob, 4), (&miner, 10)] {
            assert_eq!(chain.balance(&key.owner_hash())?, expected);
            assert_eq!(chain.utxo_index().balance(&key.owner_hash()), expected);
        }

        Ok(())
    }

    #[test]
    fn test_insufficient_funds_leaves_chain_untouched() -> Result<()> {
        let (alice, bob, _) = keys();
        let (_dir, chain) = temp_chain(&alice);
        let tip = chain.tip();

        match chain.new_transfer(&alice, &bob.address(), 11, &[]) {
            Err(LedgerError::InsufficientFunds { required, available }) => {
                assert_eq!(required, 11);
                assert_eq!(available, 10);
            }
            other => panic!("expected insufficient funds, got {:?}", other),
        }

        assert_eq!(chain.tip(), tip);
        assert_eq!(chain.balance(&alice.owner_hash())?, 10);
        assert_eq!(chain.balance(&bob.owner_hash())?, 0);

        Ok(())
    }

    #[test]
    fn test_zero_amount_is_invalid() {
        let (alice, bob, _) = keys();
        let (_dir, chain) = temp_chain(&alice);

        assert!(matches!(
            chain.new_transfer(&alice, &bob.address(), 0, &[]),
            Err(LedgerError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_batch_spends_in_flight_outputs() -> Result<()> {
        let (alice, bob, carol) = keys();
        let (_dir, mut chain) = temp_chain(&alice);

        let first = chain.new_transfer(&alice, &bob.address(), 7, &[])?;
        let second = chain.new_transfer(&bob, &carol.address(), 5, &[first.clone()])?;
        let third = chain.new_transfer(&alice, &carol.address(), 3, &[first.clone(), second.clone()])?;

        chain.mine_new_block(&[first, second, third], &alice.address())?;

        assert_eq!(chain.balance(&alice.owner_hash())?, 10);
        assert_eq!(chain.balance(&bob.owner_hash())?, 2);
        assert_eq!(chain.balance(&carol.owner_hash())?, 8);
        assert_eq!(chain.utxo_index().total_value(), 20);

        Ok(())
    }

    #[test]
    fn test_double_spend_in_batch_is_rejected() -> Result<()> {
        let (alice, bob, carol) = keys();
        let (_dir, mut chain) = temp_chain(&alice);

        let to_bob = chain.new_transfer(&alice, &bob.address(), 10, &[])?;
        let to_carol = chain.new_transfer(&alice, &carol.address(), 10, &[])?;

        let result = chain.mine_new_block(&[to_bob.clone(), to_carol], &alice.address());
        assert!(matches!(result, Err(LedgerError::DoubleSpend { .. })));
        assert_eq!(chain.best_height(), Some(0));

        // Once confirmed, the same spend cannot be mined again.
        chain.mine_new_block(&[to_bob.clone()], &alice.address())?;
        let replay = chain.mine_new_block(&[to_bob], &alice.address());
        assert!(matches!(replay, Err(LedgerError::DoubleSpend { .. })));

        Ok(())
    }

    #[test]
    fn test_forged_transfer_aborts_block() -> Result<()> {
        let (alice, bob, mallory) = keys();
        let (_dir, mut chain) = temp_chain(&alice);

        let mut tx = chain.new_transfer(&alice, &bob.address(), 4, &[])?;
        tx.outputs[0].pubkey_hash = mallory.owner_hash();
        tx.id = tx.compute_id();

        assert!(chain.mine_new_block(&[tx], &mallory.address()).is_err());
        assert_eq!(chain.best_height(), Some(0));

        Ok(())
    }

    #[test]
    fn test_chain_linkage() -> Result<()> {
        let (alice, bob, _) = keys();
        let (_dir, mut chain) = temp_chain(&alice);

        for _ in 0..3 {
            let tx = chain.new_transfer(&alice, &bob.address(), 1, &[])?;
            chain.mine_new_block(&[tx], &alice.address())?;
        }

        let blocks: Vec<Block> = chain.iter().collect::<Result<_>>()?;
        assert_eq!(blocks.len(), 4);
        for pair in blocks.windows(2) {
            assert_eq!(pair[0].header.previous_hash, pair[1].hash);
            assert_eq!(pair[0].header.height, pair[1].header.height + 1);
        }
        assert!(blocks[3].is_genesis());

        Ok(())
    }

    #[test]
    fn test_data_block_records_memo() -> Result<()> {
        let (alice, _, _) = keys();
        let (_dir, mut chain) = temp_chain(&alice);

        let block = chain.add_data_block(&alice.address(), "hello ledger")?;
        assert_eq!(chain.tip(), Some(block.hash));
        assert_eq!(block.transactions.len(), 1);
        assert_eq!(block.transactions[0].memo, b"block 1 hello ledger".to_vec());
        assert_eq!(chain.balance(&alice.owner_hash())?, 20);

        Ok(())
    }

    #[test]
    fn test_add_block_is_idempotent() -> Result<()> {
        let (alice, _, _) = keys();
        let (_dir, mut chain) = temp_chain(&alice);
        let block = chain.mine_new_block(&[], &alice.address())?;

        let count = chain.block_count()?;
        assert_eq!(chain.add_block(block.clone())?, AddOutcome::Duplicate);
        assert_eq!(chain.add_block(block.clone())?, AddOutcome::Duplicate);
        assert_eq!(chain.block_count()?, count);
        assert_eq!(chain.tip(), Some(block.hash));

        Ok(())
    }

    #[test]
    fn test_orphan_never_becomes_tip() -> Result<()> {
        let (alice, _, _) = keys();
        let (_dir, mut chain) = temp_chain(&alice);
        let tip = chain.tip();

        let reward = Transaction::new_coinbase(&alice.address(), 10, "orphan".to_string())?;
        let orphan = Block::new(Hash256::hash(b"unknown parent"), vec![reward], test_consensus().difficulty, 50);
        let orphan = ProofOfWork::new(test_consensus().difficulty).solve(orphan)?;

        assert_eq!(chain.add_block(orphan.clone())?, AddOutcome::Stored);
        assert_eq!(chain.tip(), tip);
        assert_eq!(chain.best_height(), Some(0));
        assert!(chain.contains_block(&orphan.hash)?);

        Ok(())
    }

    #[test]
    fn test_invalid_header_is_rejected() -> Result<()> {
        let (alice, _, _) = keys();
        let (_dir, mut chain) = temp_chain(&alice);

        let mut block = chain.prepare_block(&[], &alice.address())?;
        block.seal(0);
        block.hash = Hash256::hash(b"not the header");

        assert!(matches!(chain.add_block(block), Err(LedgerError::InvalidBlock(_))));
        assert_eq!(chain.best_height(), Some(0));

        Ok(())
    }

    #[test]
    fn test_taller_branch_takes_over() -> Result<()> {
        let (alice, bob, _) = keys();
        let (_dir, mut main) = temp_chain(&alice);
        let (_other_dir, mut branch) = empty_chain();

        let genesis = main.get_block_by_height(0)?.unwrap();
        assert_eq!(branch.add_block(genesis)?, AddOutcome::Extended);

        main.mine_new_block(&[], &alice.address())?;

        let tx = branch.new_transfer(&alice, &bob.address(), 3, &[])?;
        let b1 = branch.mine_new_block(&[tx], &bob.address())?;
        let b2 = branch.mine_new_block(&[], &bob.address())?;

        assert_eq!(main.add_block(b1)?, AddOutcome::Stored);
        assert_eq!(main.add_block(b2.clone())?, AddOutcome::Extended);

        assert_eq!(main.tip(), Some(b2.hash));
        assert_eq!(main.utxo_index(), branch.utxo_index());
        assert_eq!(main.balance(&alice.owner_hash())?, 7);
        assert_eq!(main.balance(&bob.owner_hash())?, 23);

        Ok(())
    }

    /// Solved block that skips the chain's own block building.
    fn solved(previous_hash: Hash256, height: u64, transactions: Vec<Transaction>) -> Block {
        let difficulty = test_consensus().difficulty;
        ProofOfWork::new(difficulty)
            .solve(Block::new(previous_hash, transactions, difficulty, height))
            .unwrap()
    }

    /// Unsigned transfer of the genesis reward to `thief`.
    fn unsigned_theft(chain: &Blockchain, thief: &KeyPair) -> Transaction {
        let genesis = chain.get_block_by_height(0).unwrap().unwrap();
        Transaction::new_unsigned(
            vec![OutPoint::new(genesis.transactions[0].id, 0)],
            vec![TxOutput::new(10, thief.owner_hash())],
        )
    }

    #[test]
    fn test_unsigned_spend_in_block_is_rejected() -> Result<()> {
        let (alice, mallory, _) = keys();
        let (_dir, mut chain) = temp_chain(&alice);
        let tip = chain.tip().unwrap();

        let reward = Transaction::new_coinbase(&mallory.address(), 10, "block 1 reward".to_string())?;
        let block = solved(tip, 1, vec![reward, unsigned_theft(&chain, &mallory)]);

        assert!(matches!(chain.add_block(block.clone()), Err(e) if e.is_validation()));
        assert_eq!(chain.tip(), Some(tip));
        assert!(!chain.contains_block(&block.hash)?);
        assert_eq!(chain.balance(&alice.owner_hash())?, 10);
        assert_eq!(chain.utxo_index().balance(&mallory.owner_hash()), 0);

        Ok(())
    }

    #[test]
    fn test_oversized_reward_is_rejected() -> Result<()> {
        let (alice, mallory, _) = keys();
        let (_dir, mut chain) = temp_chain(&alice);
        let tip = chain.tip().unwrap();

        let reward = Transaction::new_coinbase(&mallory.address(), 1_000_000, "block 1 reward".to_string())?;
        let block = solved(tip, 1, vec![reward]);

        assert!(matches!(chain.add_block(block), Err(LedgerError::InvalidBlock(_))));
        assert_eq!(chain.best_height(), Some(0));
        assert_eq!(chain.utxo_index().total_value(), 10);

        Ok(())
    }

    #[test]
    fn test_branch_with_invalid_ancestor_is_rejected() -> Result<()> {
        let (alice, mallory, _) = keys();
        let (_dir, mut chain) = temp_chain(&alice);
        let genesis = chain.tip().unwrap();
        let honest = chain.mine_new_block(&[], &alice.address())?;

        // Not taller than the tip, so it is stored without its body being checked.
        let reward = Transaction::new_coinbase(&mallory.address(), 10, "block 1 reward".to_string())?;
        let forged = solved(genesis, 1, vec![reward, unsigned_theft(&chain, &mallory)]);
        assert_eq!(chain.add_block(forged.clone())?, AddOutcome::Stored);

        let reward = Transaction::new_coinbase(&mallory.address(), 10, "block 2 reward".to_string())?;
        let child = solved(forged.hash, 2, vec![reward]);

        assert!(matches!(chain.add_block(child), Err(e) if e.is_validation()));
        assert_eq!(chain.tip(), Some(honest.hash));
        assert_eq!(chain.utxo_index().balance(&mallory.owner_hash()), 0);

        Ok(())
    }

    #[test]
    fn test_stored_block_is_promoted_once_parent_arrives() -> Result<()> {
        let (alice, _, _) = keys();
        let (_dir, mut source) = temp_chain(&alice);
        let (_other_dir, mut follower) = empty_chain();
        follower.add_block(source.get_block_by_height(0)?.unwrap())?;

        let b1 = source.mine_new_block(&[], &alice.address())?;
        let b2 = source.mine_new_block(&[], &alice.address())?;

        assert_eq!(follower.add_block(b2.clone())?, AddOutcome::Stored);
        assert_eq!(follower.add_block(b1)?, AddOutcome::Extended);
        assert_eq!(follower.add_block(b2.clone())?, AddOutcome::Extended);
        assert_eq!(follower.add_block(b2.clone())?, AddOutcome::Duplicate);

        assert_eq!(follower.tip(), Some(b2.hash));
        assert_eq!(follower.utxo_index(), source.utxo_index());

        Ok(())
    }

    #[test]
    fn test_unspent_value_is_received_minus_spent() -> Result<()> {
        let (alice, bob, carol) = keys();
        let miner = KeyPair::new()?;
        let (_dir, mut chain) = temp_chain(&alice);

        // Bob forwards part of Alice's payment within the same batch.
        let a = chain.new_transfer(&alice, &bob.address(), 7, &[])?;
        let b = chain.new_transfer(&bob, &carol.address(), 5, &[a.clone()])?;
        chain.mine_new_block(&[a, b], &miner.address())?;

        // Change and reward outputs get spent again, one of them in flight.
        let c = chain.new_transfer(&alice, &carol.address(), 2, &[])?;
        let d = chain.new_transfer(&miner, &alice.address(), 9, &[c.clone()])?;
        let e = chain.new_transfer(&carol, &bob.address(), 6, &[c.clone(), d.clone()])?;
        chain.mine_new_block(&[c, d, e], &bob.address())?;

        chain.add_data_block(&carol.address(), "quiet block")?;

        let mut outputs: HashMap<OutPoint, TxOutput> = HashMap::new();
        let mut spends: Vec<OutPoint> = Vec::new();
        for block in chain.iter() {
            for tx in block?.transactions {
                for (index, output) in tx.outputs.iter().enumerate() {
                    outputs.insert(OutPoint::new(tx.id, index as u32), output.clone());
                }
                spends.extend(tx.inputs.iter().map(|input| input.previous_output));
            }
        }

        for key in [&alice, &bob, &carol, &miner] {
            let owner = key.owner_hash();
            let received: u64 = outputs
                .values()
                .filter(|output| output.is_payable_to(&owner))
                .map(|output| output.value)
                .sum();
            let spent: u64 = spends
                .iter()
                .map(|outpoint| &outputs[outpoint])
                .filter(|output| output.is_payable_to(&owner))
                .map(|output| output.value)
                .sum();

            assert_eq!(chain.balance(&owner)?, received - spent);
            assert_eq!(chain.utxo_index().balance(&owner), received - spent);
        }
        assert_eq!(chain.utxo_index().total_value(), 40);

        Ok(())
    }

    #[test]
    fn test_reopen_rebuilds_index() -> Result<()> {
        let (alice, bob, _) = keys();
        let (dir, mut chain) = temp_chain(&alice);
        let tx = chain.new_transfer(&alice, &bob.address(), 4, &[])?;
        chain.mine_new_block(&[tx], &alice.address())?;
        let index = chain.utxo_index().clone();
        drop(chain);

        let db = Database::open(dir.path().join("chain.db"))?;
        let reopened = Blockchain::open(db, test_consensus())?;
        assert_eq!(reopened.utxo_index(), &index);
        assert_eq!(reopened.best_height(), Some(1));

        Ok(())
    }
}
