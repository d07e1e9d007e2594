use crate::config::Config;
use crate::core::{shared, Block, Blockchain, Transaction};
use crate::crypto::hash::Hash256;
use crate::crypto::keys::{address_to_hash160, hash160_to_address, is_valid_address};
use crate::mining::pow::meets_target;
use crate::mining::Miner;
use crate::network::protocol::{Message, TxPayload};
use crate::network::{send_message, ProtocolHandler, Server};
use crate::storage::Database;
use crate::wallet::Wallets;
use crate::{LedgerError, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::signal;

#[derive(Parser, Debug)]
#[command(name = "hashchain")]
#[command(about = "Hashchain node - a peer-replicated UTXO ledger with proof-of-work")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, env = "NODE_ID", global = true, help = "Node identity; also the listening port")]
    pub node_id: Option<String>,

    #[arg(long, global = true, help = "Data directory")]
    pub data_dir: Option<PathBuf>,

    #[arg(long, global = true, help = "Enable debug logging")]
    pub debug: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a chain whose genesis reward pays ADDRESS
    #[command(name = "createblockchain")]
    CreateBlockchain {
        #[arg(long)]
        address: String,
    },

    /// Mine a block holding only a reward, with DATA in its memo
    #[command(name = "addblock")]
    AddBlock {
        #[arg(long)]
        address: String,
        #[arg(long)]
        data: String,
    },

    /// Print every block from the tip back to genesis
    #[command(name = "printchain")]
    PrintChain,

    /// Generate a new key pair and store it in this node's wallet file
    #[command(name = "createwallet")]
    CreateWallet,

    /// List the addresses in this node's wallet file
    #[command(name = "listaddresses")]
    ListAddresses,

    /// Show the unspent balance of ADDRESS
    #[command(name = "getbalance")]
    GetBalance {
        #[arg(long)]
        address: String,
    },

    /// Transfer value; repeat --from/--to/--amount for a batch
    Send {
        #[arg(long, required = true)]
        from: Vec<String>,
        #[arg(long, required = true)]
        to: Vec<String>,
        #[arg(long, required = true)]
        amount: Vec<u64>,
        #[arg(long, help = "Mine the batch locally instead of submitting it to the seed node")]
        mine: bool,
    },

    /// Run the node and sync with the seed
    #[command(name = "startnode")]
    StartNode {
        #[arg(long, value_name = "ADDR", help = "Mine pooled transactions, paying rewards to ADDR")]
        miner: Option<String>,
    },

    /// Rebuild the UTXO index from the chain
    #[command(name = "reindexutxo")]
    ReindexUtxo,
}

pub async fn run_cli(config: Config) -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging once
    let _ = if cli.debug {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).try_init()
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).try_init()
    };

    let mut config = config;
    if let Some(node_id) = cli.node_id {
        config.node.node_id = node_id;
    }
    if let Some(data_dir) = cli.data_dir {
        config.storage.data_dir = data_dir;
    }
    config.validate()?;
    std::fs::create_dir_all(&config.storage.data_dir)?;

    match cli.command {
        Commands::CreateBlockchain { address } => {
            let genesis = create_blockchain(&config, &address)?;
            println!("✅ Blockchain created");
            println!("📦 Genesis block hash: {}", genesis);
            Ok(())
        }

        Commands::AddBlock { address, data } => {
            let block = add_block(&config, &address, &data)?;
            println!("✅ Block {} added at height {}", block.hash, block.header.height);
            Ok(())
        }

        Commands::PrintChain => print_chain(&config),

        Commands::CreateWallet => {
            let mut wallets = Wallets::load(config.wallet_path())?;
            let address = wallets.create_wallet()?;
            wallets.save()?;
            println!("🔑 Your new address: {}", address);
            Ok(())
        }

        Commands::ListAddresses => {
            let wallets = Wallets::load(config.wallet_path())?;
            if wallets.is_empty() {
                println!("No wallets yet. Use 'createwallet' to make one.");
            }
            for address in wallets.addresses() {
                println!("{}", address);
            }
            Ok(())
        }

        Commands::GetBalance { address } => {
            let balance = get_balance(&config, &address)?;
            println!("💰 Balance of '{}': {}", address, balance);
            Ok(())
        }

        Commands::Send { from, to, amount, mine } => {
            let batch = build_transfers(&config, &from, &to, &amount)?;
            if mine {
                let block = mine_transfers(&config, &batch, &from[0])?;
                println!("⛏️  Mined block {} with {} transfers", block.hash, batch.len());
            } else {
                submit_transfers(&config, batch).await?;
            }
            println!("✅ Success!");
            Ok(())
        }

        Commands::StartNode { miner } => start_node(config, miner).await,

        Commands::ReindexUtxo => {
            let count = reindex_utxo(&config)?;
            println!("🔄 Done! There are {} transactions in the UTXO set.", count);
            Ok(())
        }
    }
}

fn open_database(config: &Config) -> Result<Database> {
    Database::open(config.db_path())
}

fn open_chain(config: &Config) -> Result<Blockchain> {
    Blockchain::open(open_database(config)?, config.consensus.clone())
}

fn ensure_address(address: &str) -> Result<()> {
    if !is_valid_address(address) {
        return Err(LedgerError::InvalidAddress(address.to_string()));
    }
    Ok(())
}

pub fn create_blockchain(config: &Config, address: &str) -> Result<Hash256> {
    ensure_address(address)?;
    let chain = Blockchain::create(open_database(config)?, address, config.consensus.clone())?;
    chain.tip().ok_or(LedgerError::ChainNotFound)
}

pub fn add_block(config: &Config, address: &str, data: &str) -> Result<Block> {
    ensure_address(address)?;
    open_chain(config)?.add_data_block(address, data)
}

pub fn get_balance(config: &Config, address: &str) -> Result<u64> {
    let owner = address_to_hash160(address)?;
    Ok(open_chain(config)?.utxo_index().balance(&owner))
}

pub fn reindex_utxo(config: &Config) -> Result<usize> {
    open_chain(config)?.reindex()
}

/// Builds and signs one transfer per (from, to, amount) triple. Later
/// transfers may spend outputs of earlier ones.
pub fn build_transfers(config: &Config, from: &[String], to: &[String], amount: &[u64]) -> Result<Vec<Transaction>> {
    if from.len() != to.len() || to.len() != amount.len() {
        return Err(LedgerError::InvalidInput(
            "--from, --to and --amount must be given the same number of times".to_string(),
        ));
    }
    for address in from.iter().chain(to) {
        ensure_address(address)?;
    }

    let wallets = Wallets::load(config.wallet_path())?;
    let chain = open_chain(config)?;

    let mut batch: Vec<Transaction> = Vec::with_capacity(from.len());
    for ((sender, recipient), value) in from.iter().zip(to).zip(amount) {
        let keypair = wallets.get_keypair(sender)?;
        let tx = chain.new_transfer(&keypair, recipient, *value, &batch)?;
        batch.push(tx);
    }

    Ok(batch)
}

/// Mines the batch into a block. The reward goes to the configured mining
/// address, or to `fallback_reward` when none is set.
pub fn mine_transfers(config: &Config, batch: &[Transaction], fallback_reward: &str) -> Result<Block> {
    let reward = config.mining.mining_address.as_deref().unwrap_or(fallback_reward);
    ensure_address(reward)?;
    open_chain(config)?.mine_new_block(batch, reward)
}

async fn submit_transfers(config: &Config, batch: Vec<Transaction>) -> Result<()> {
    let seed = config
        .network
        .seed_node()
        .ok_or_else(|| LedgerError::Config("no seed node configured".to_string()))?
        .to_string();

    for transaction in batch {
        let txid = transaction.id;
        let message = Message::Tx(TxPayload {
            addr_from: config.node_address(),
            transaction,
        });
        send_message(&seed, &message, &config.network).await?;
        println!("📤 Submitted {} to {}", txid, seed);
    }
    Ok(())
}

fn print_chain(config: &Config) -> Result<()> {
    let chain = open_chain(config)?;

    for block in chain.iter() {
        let block = block?;
        let time = chrono::DateTime::from_timestamp(block.header.timestamp, 0)
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| block.header.timestamp.to_string());

        println!("============ Block {} ============", block.hash);
        println!("Height: {}", block.header.height);
        println!("Prev. block: {}", block.header.previous_hash);
        println!("Merkle root: {}", block.header.merkle_root);
        println!("Created at: {}", time);
        println!("Difficulty: {} Nonce: {}", block.header.difficulty, block.header.nonce);
        println!("PoW: {}", meets_target(&block.hash, block.header.difficulty));

        for tx in &block.transactions {
            println!("--- Transaction {}", tx.id);
            if tx.is_coinbase() {
                println!("     Coinbase: {}", String::from_utf8_lossy(&tx.memo));
            }
            for input in &tx.inputs {
                println!(
                    "     Input:  {}:{}",
                    input.previous_output.txid, input.previous_output.vout
                );
            }
            for (index, output) in tx.outputs.iter().enumerate() {
                println!(
                    "     Output {}: {} -> {}",
                    index,
                    output.value,
                    hash160_to_address(&output.pubkey_hash)
                );
            }
        }
        println!();
    }

    Ok(())
}

async fn start_node(mut config: Config, miner_address: Option<String>) -> Result<()> {
    if let Some(address) = miner_address {
        ensure_address(&address)?;
        config.mining.mining_address = Some(address);
    }

    println!("🚀 Starting node {} at {}", config.node.node_id, config.node_address());

    let chain = shared(Blockchain::open_or_empty(open_database(&config)?, config.consensus.clone())?);
    let miner = match &config.mining.mining_address {
        Some(address) => {
            println!("⛏️  Mining is on. Rewards go to {}", address);
            Some(Miner::new(chain.clone(), address.clone())?)
        }
        None => None,
    };

    let server = Server::new(ProtocolHandler::new(&config, chain.clone(), miner));

    tokio::select! {
        result = server.run() => result?,
        _ = signal::ctrl_c() => {
            println!("\n🛑 Shutting down node...");
        }
    }

    crate::core::read_chain(&chain)?.flush()?;
    println!("✅ Node stopped gracefully.");
    Ok(())
}
