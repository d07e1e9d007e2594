use crate::config::{Config, NetworkConfig};
use crate::core::{read_chain, write_chain, AddOutcome, Block, Mempool, SharedChain, Transaction};
use crate::crypto::hash::Hash256;
use crate::mining::Miner;
use crate::network::protocol::{
    AddrPayload, BlockPayload, GetBlocksPayload, GetDataPayload, InvPayload, InventoryKind, Message, TxPayload,
    VersionPayload, PROTOCOL_VERSION,
};
use crate::{LedgerError, Result};
use std::cmp::Ordering;
use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

/// Transaction ids requested but not yet received. Past this many the set is
/// reset, since unanswered requests would otherwise pile up.
const MAX_TXS_IN_TRANSIT: usize = 1024;

/// A reply addressed to a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub to: String,
    pub message: Message,
}

impl Outbound {
    pub fn new(to: impl Into<String>, message: Message) -> Self {
        Self { to: to.into(), message }
    }
}

#[derive(Debug, Default)]
struct SyncState {
    known_peers: Vec<String>,
    blocks_in_transit: VecDeque<Hash256>,
    txs_in_transit: HashSet<Hash256>,
    mempool: Mempool,
}

/// Applies one protocol message to the node and returns what to send back.
/// Knows nothing about sockets; `network::server` delivers the replies.
pub struct ProtocolHandler {
    node_address: String,
    node_id: String,
    is_seed: bool,
    network: NetworkConfig,
    pool_threshold: usize,
    chain: SharedChain,
    state: Mutex<SyncState>,
    miner: Option<Miner>,
}

impl ProtocolHandler {
    pub fn new(config: &Config, chain: SharedChain, miner: Option<Miner>) -> Self {
        let node_address = config.node_address();
        let known_peers = config
            .network
            .seed_nodes
            .iter()
            .filter(|addr| **addr != node_address)
            .cloned()
            .collect();

        Self {
            is_seed: config.is_seed_node(),
            node_id: config.node.node_id.clone(),
            network: config.network.clone(),
            pool_threshold: config.mining.pool_threshold.max(1),
            chain,
            state: Mutex::new(SyncState {
                known_peers,
                ..SyncState::default()
            }),
            miner,
            node_address,
        }
    }

    pub fn node_address(&self) -> &str {
        &self.node_address
    }

    pub fn network(&self) -> &NetworkConfig {
        &self.network
    }

    pub fn chain(&self) -> &SharedChain {
        &self.chain
    }

    fn state(&self) -> Result<MutexGuard<'_, SyncState>> {
        self.state.lock().map_err(|_| LedgerError::LockPoisoned)
    }

    pub fn known_peers(&self) -> Result<Vec<String>> {
        Ok(self.state()?.known_peers.clone())
    }

    pub fn mempool_len(&self) -> Result<usize> {
        Ok(self.state()?.mempool.len())
    }

    pub fn blocks_in_transit(&self) -> Result<usize> {
        Ok(self.state()?.blocks_in_transit.len())
    }

    /// Records `addr` as a known peer. Returns true if it was new.
    fn add_peer(&self, addr: &str) -> Result<bool> {
        if addr == self.node_address || addr.is_empty() {
            return Ok(false);
        }
        let mut state = self.state()?;
        if state.known_peers.iter().any(|p| p == addr) {
            return Ok(false);
        }
        state.known_peers.push(addr.to_string());
        log::info!("🤝 New peer {}", addr);
        Ok(true)
    }

    pub fn forget_peer(&self, addr: &str) -> Result<()> {
        let mut state = self.state()?;
        let before = state.known_peers.len();
        state.known_peers.retain(|p| p != addr);
        if state.known_peers.len() != before {
            // Requests to that peer will never be answered.
            state.txs_in_transit.clear();
            log::warn!("🔌 Forgot unreachable peer {}", addr);
        }
        Ok(())
    }

    /// Known peers other than `except`.
    fn peers_except(&self, except: &str) -> Result<Vec<String>> {
        Ok(self
            .state()?
            .known_peers
            .iter()
            .filter(|p| p.as_str() != except)
            .cloned()
            .collect())
    }

    pub fn version_message(&self) -> Result<Message> {
        let best_height = read_chain(&self.chain)?.best_height();
        Ok(Message::Version(VersionPayload {
            version: PROTOCOL_VERSION,
            best_height,
            addr_from: self.node_address.clone(),
            node_id: self.node_id.clone(),
        }))
    }

    /// Greeting sent at startup by every node except the seed.
    pub fn bootstrap(&self) -> Result<Vec<Outbound>> {
        if self.is_seed {
            return Ok(Vec::new());
        }
        match self.network.seed_node() {
            Some(seed) => Ok(vec![Outbound::new(seed, self.version_message()?)]),
            None => Ok(Vec::new()),
        }
    }

    /// Entry point for every inbound message. Rejected transactions and
    /// blocks are logged and produce no reply.
    pub async fn handle(&self, message: Message) -> Result<Vec<Outbound>> {
        let command = message.command();
        let sender = message.sender().to_string();
        log::debug!("📨 {} from {}", command.name(), sender);

        let result = match message {
            Message::Version(payload) => self.handle_version(payload),
            Message::Addr(payload) => self.handle_addr(payload),
            Message::GetBlocks(payload) => self.handle_getblocks(payload),
            Message::Inv(payload) => self.handle_inv(payload),
            Message::GetData(payload) => self.handle_getdata(payload),
            Message::Block(payload) => self.handle_block(payload),
            Message::Tx(payload) => self.handle_tx(payload).await,
        };

        match result {
            Err(e) if e.is_validation() => {
                log::warn!("❌ Rejected {} from {}: {}", command.name(), sender, e);
                Ok(Vec::new())
            }
            other => other,
        }
    }

    fn handle_version(&self, payload: VersionPayload) -> Result<Vec<Outbound>> {
        let ours = read_chain(&self.chain)?.best_height();
        log::info!(
            "🤝 Version from {} (node {}): height {:?}, ours {:?}",
            payload.addr_from,
            payload.node_id,
            payload.best_height,
            ours
        );

        let is_new = self.add_peer(&payload.addr_from)?;
        let mut out = Vec::new();

        match payload.best_height.cmp(&ours) {
            Ordering::Greater => out.push(Outbound::new(
                payload.addr_from.as_str(),
                Message::GetBlocks(GetBlocksPayload {
                    addr_from: self.node_address.clone(),
                }),
            )),
            Ordering::Less => out.push(Outbound::new(payload.addr_from.as_str(), self.version_message()?)),
            Ordering::Equal => {}
        }

        // Introduce a newcomer to the rest of the network.
        if is_new {
            let others = self.peers_except(&payload.addr_from)?;
            if !others.is_empty() {
                out.push(Outbound::new(
                    payload.addr_from.as_str(),
                    Message::Addr(AddrPayload {
                        addr_from: self.node_address.clone(),
                        addresses: others,
                    }),
                ));
            }
        }

        Ok(out)
    }

    fn handle_addr(&self, payload: AddrPayload) -> Result<Vec<Outbound>> {
        let mut learned = Vec::new();
        for addr in &payload.addresses {
            if self.add_peer(addr)? {
                learned.push(addr.clone());
            }
        }
        log::info!("📍 {} peers learned from {}", learned.len(), payload.addr_from);

        if learned.is_empty() || learned.len() < self.network.addr_relay_threshold {
            return Ok(Vec::new());
        }

        let relay = Message::Addr(AddrPayload {
            addr_from: self.node_address.clone(),
            addresses: learned.clone(),
        });
        Ok(self
            .peers_except(&payload.addr_from)?
            .into_iter()
            .filter(|peer| !learned.contains(peer))
            .map(|peer| Outbound::new(peer, relay.clone()))
            .collect())
    }

    fn handle_getblocks(&self, payload: GetBlocksPayload) -> Result<Vec<Outbound>> {
        let hashes = read_chain(&self.chain)?.block_hashes()?;
        if hashes.is_empty() {
            return Ok(Vec::new());
        }

        Ok(vec![Outbound::new(
            payload.addr_from,
            Message::Inv(InvPayload {
                addr_from: self.node_address.clone(),
                kind: InventoryKind::Block,
                items: hashes,
            }),
        )])
    }

    fn handle_inv(&self, payload: InvPayload) -> Result<Vec<Outbound>> {
        log::info!(
            "📋 Inventory of {} {:?} items from {}",
            payload.items.len(),
            payload.kind,
            payload.addr_from
        );

        match payload.kind {
            InventoryKind::Block => {
                // Items arrive tip first; fetch oldest first. Stored blocks
                // above our height are fetched again so they can become the tip.
                let mut wanted = Vec::new();
                {
                    let chain = read_chain(&self.chain)?;
                    for hash in payload.items.iter().rev() {
                        let needed = match chain.get_block(hash)? {
                            None => true,
                            Some(block) => chain.best_height().map_or(true, |h| block.header.height > h),
                        };
                        if needed {
                            wanted.push(*hash);
                        }
                    }
                }

                // A request is outstanding while the queue is non-empty.
                let first = {
                    let mut state = self.state()?;
                    let idle = state.blocks_in_transit.is_empty();
                    for hash in wanted {
                        if !state.blocks_in_transit.contains(&hash) {
                            state.blocks_in_transit.push_back(hash);
                        }
                    }
                    if idle {
                        state.blocks_in_transit.pop_front()
                    } else {
                        None
                    }
                };

                Ok(first
                    .map(|hash| self.getdata(&payload.addr_from, InventoryKind::Block, hash))
                    .into_iter()
                    .collect())
            }
            InventoryKind::Transaction => {
                let mut state = self.state()?;
                let mut out = Vec::new();
                for id in payload.items {
                    if state.mempool.contains(&id) || state.txs_in_transit.contains(&id) {
                        continue;
                    }
                    if state.txs_in_transit.len() >= MAX_TXS_IN_TRANSIT {
                        log::warn!("🧹 {} transaction requests unanswered, resetting", MAX_TXS_IN_TRANSIT);
                        state.txs_in_transit.clear();
                    }
                    state.txs_in_transit.insert(id);
                    out.push(self.getdata(&payload.addr_from, InventoryKind::Transaction, id));
                }
                Ok(out)
            }
        }
    }

    fn getdata(&self, to: &str, kind: InventoryKind, id: Hash256) -> Outbound {
        Outbound::new(
            to,
            Message::GetData(GetDataPayload {
                addr_from: self.node_address.clone(),
                kind,
                id,
            }),
        )
    }

    fn handle_getdata(&self, payload: GetDataPayload) -> Result<Vec<Outbound>> {
        let reply = match payload.kind {
            InventoryKind::Block => read_chain(&self.chain)?.get_block(&payload.id)?.map(|block| {
                Message::Block(BlockPayload {
                    addr_from: self.node_address.clone(),
                    block,
                })
            }),
            InventoryKind::Transaction => {
                let pooled = self.state()?.mempool.get(&payload.id).cloned();
                let found = match pooled {
                    Some(tx) => Some(tx),
                    None => read_chain(&self.chain)?.find_transaction(&payload.id, &[])?,
                };
                found.map(|transaction| {
                    Message::Tx(TxPayload {
                        addr_from: self.node_address.clone(),
                        transaction,
                    })
                })
            }
        };

        if reply.is_none() {
            log::debug!("📭 {:?} {} not found for {}", payload.kind, payload.id, payload.addr_from);
        }
        Ok(reply.map(|message| Outbound::new(payload.addr_from, message)).into_iter().collect())
    }

    fn handle_block(&self, payload: BlockPayload) -> Result<Vec<Outbound>> {
        let block = payload.block;
        log::info!("📦 Received block {} at height {}", block.hash, block.header.height);

        let mut out = Vec::new();
        let outcome = write_chain(&self.chain)?.add_block(block.clone());
        match outcome {
            Ok(AddOutcome::Extended) => {
                let confirmed = self.state()?.mempool.remove_confirmed(&block);
                if confirmed > 0 {
                    log::debug!("🧹 {} pooled transactions confirmed", confirmed);
                }
                if let Some(miner) = &self.miner {
                    miner.abandon();
                }
                if self.is_seed {
                    out.extend(self.announce_block(&block, &payload.addr_from)?);
                }
            }
            Ok(AddOutcome::Stored) => {
                // Stored but not the tip: its ancestry is missing here.
                let behind = read_chain(&self.chain)?
                    .best_height()
                    .map_or(true, |h| block.header.height > h);
                if behind {
                    log::info!("🧩 Missing ancestors of {}, asking {} for blocks", block.hash, payload.addr_from);
                    out.push(Outbound::new(
                        payload.addr_from.as_str(),
                        Message::GetBlocks(GetBlocksPayload {
                            addr_from: self.node_address.clone(),
                        }),
                    ));
                }
            }
            Ok(AddOutcome::Duplicate) => {}
            Err(e) if e.is_validation() => {
                log::warn!("❌ Rejected block {} from {}: {}", block.hash, payload.addr_from, e);
            }
            Err(e) => return Err(e),
        }

        let next = self.state()?.blocks_in_transit.pop_front();
        match next {
            Some(hash) => out.push(self.getdata(&payload.addr_from, InventoryKind::Block, hash)),
            None => {
                let indexed = write_chain(&self.chain)?.reindex()?;
                log::info!("🔄 Sync caught up, UTXO index rebuilt ({} transactions)", indexed);
            }
        }
        Ok(out)
    }

    async fn handle_tx(&self, payload: TxPayload) -> Result<Vec<Outbound>> {
        let tx = payload.transaction;
        let pooled = {
            let mut state = self.state()?;
            state.txs_in_transit.remove(&tx.id);
            if state.mempool.contains(&tx.id) {
                return Ok(Vec::new());
            }
            state.mempool.transactions()
        };

        {
            let chain = read_chain(&self.chain)?;
            chain.verify_transaction(&tx, &pooled)?;
            for input in &tx.inputs {
                let outpoint = input.previous_output;
                let available = chain.utxo_index().contains(&outpoint)
                    || pooled.iter().any(|p| p.id == outpoint.txid);
                if !available {
                    return Err(LedgerError::DoubleSpend {
                        txid: outpoint.txid,
                        vout: outpoint.vout,
                    });
                }
            }
        }

        let pool_size = {
            let mut state = self.state()?;
            state.mempool.insert(tx.clone())?;
            state.mempool.len()
        };
        log::info!("💰 Transaction {} pooled ({} pending)", tx.id, pool_size);

        let mut out = Vec::new();
        if self.is_seed {
            let announce = Message::Inv(InvPayload {
                addr_from: self.node_address.clone(),
                kind: InventoryKind::Transaction,
                items: vec![tx.id],
            });
            for peer in self.peers_except(&payload.addr_from)? {
                out.push(Outbound::new(peer, announce.clone()));
            }
        }

        if let Some(miner) = &self.miner {
            if pool_size >= self.pool_threshold {
                out.extend(self.mine_pool(miner).await?);
            }
        }

        Ok(out)
    }

    /// Mines the pooled transactions that still verify and announces the block.
    async fn mine_pool(&self, miner: &Miner) -> Result<Vec<Outbound>> {
        let pooled = self.state()?.mempool.transactions();

        let (accepted, stale) = {
            let chain = read_chain(&self.chain)?;
            let mut accepted: Vec<Transaction> = Vec::new();
            let mut stale = Vec::new();
            for tx in pooled {
                accepted.push(tx);
                if let Err(e) = chain.validate_batch(&accepted) {
                    if let Some(tx) = accepted.pop() {
                        log::warn!("🗑️ Dropping pooled transaction {}: {}", tx.id, e);
                        stale.push(tx.id);
                    }
                }
            }
            (accepted, stale)
        };

        {
            let mut state = self.state()?;
            for id in &stale {
                state.mempool.remove(id);
            }
        }

        if accepted.is_empty() {
            return Ok(Vec::new());
        }

        let block = match miner.mine(accepted).await? {
            Some(block) => block,
            None => return Ok(Vec::new()),
        };
        self.state()?.mempool.remove_confirmed(&block);

        self.announce_block(&block, &self.node_address)
    }

    /// `inv(block)` for every known peer other than `except`.
    fn announce_block(&self, block: &Block, except: &str) -> Result<Vec<Outbound>> {
        let announce = Message::Inv(InvPayload {
            addr_from: self.node_address.clone(),
            kind: InventoryKind::Block,
            items: vec![block.hash],
        });
        Ok(self
            .peers_except(except)?
            .into_iter()
            .map(|peer| Outbound::new(peer, announce.clone()))
            .collect())
    }
}
