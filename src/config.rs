use crate::{LedgerError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    pub network: NetworkConfig,
    pub mining: MiningConfig,
    pub storage: StorageConfig,
    pub consensus: ConsensusConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node identity; doubles as the listening port and names the local database.
    pub node_id: String,
    pub host: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// The first entry is the seed node every other node bootstraps from.
    pub seed_nodes: Vec<String>,
    pub read_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub write_timeout_secs: u64,
    pub max_message_size: u32,
    pub addr_relay_threshold: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiningConfig {
    pub mining_address: Option<String>,
    pub pool_threshold: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsensusConfig {
    pub coinbase_reward: u64,
    /// Required count of leading zero bits in a block hash.
    pub difficulty: u32,
    pub genesis_message: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeConfig {
                node_id: "3000".to_string(),
                host: "localhost".to_string(),
            },
            network: NetworkConfig::default(),
            mining: MiningConfig {
                mining_address: None,
                pool_threshold: 2,
            },
            storage: StorageConfig {
                data_dir: Self::home_dir().join(".hashchain"),
            },
            consensus: ConsensusConfig::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            seed_nodes: vec!["localhost:3000".to_string()],
            read_timeout_secs: 30,
            connect_timeout_secs: 5,
            write_timeout_secs: 10,
            max_message_size: 32 * 1024 * 1024, // 32 MiB
            addr_relay_threshold: 1,
        }
    }
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            coinbase_reward: 10,
            difficulty: 16,
            genesis_message: "Hashchain genesis - the tip is the only thing that moves".to_string(),
        }
    }
}

impl NetworkConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn seed_node(&self) -> Option<&str> {
        self.seed_nodes.first().map(String::as_str)
    }
}

impl Config {
    pub fn node_address(&self) -> String {
        format!("{}:{}", self.node.host, self.node.node_id)
    }

    pub fn is_seed_node(&self) -> bool {
        self.network.seed_node() == Some(self.node_address().as_str())
    }

    pub fn db_path(&self) -> PathBuf {
        self.storage
            .data_dir
            .join(format!("blockchain_{}.db", self.node.node_id))
    }

    pub fn wallet_path(&self) -> PathBuf {
        self.storage
            .data_dir
            .join(format!("wallets_{}.json", self.node.node_id))
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Reads and validates the config at `path`, writing the defaults there
    /// if the file does not exist yet.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Self::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.node.node_id.is_empty() {
            return Err(LedgerError::Config("node_id must not be empty".to_string()));
        }
        if self.consensus.difficulty > 255 {
            return Err(LedgerError::Config(format!(
                "difficulty {} exceeds the 256-bit hash width",
                self.consensus.difficulty
            )));
        }
        if self.mining.pool_threshold == 0 {
            return Err(LedgerError::Config("pool_threshold must be at least 1".to_string()));
        }
        if self.network.max_message_size == 0 {
            return Err(LedgerError::Config("max_message_size must be positive".to_string()));
        }
        Ok(())
    }

    fn config_path() -> PathBuf {
        Self::home_dir().join(".hashchain").join("config.json")
    }

    fn home_dir() -> PathBuf {
        PathBuf::from(env::var("HOME").unwrap_or_else(|_| ".".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_paths_follow_identity() {
        let mut config = Config::default();
        config.node.node_id = "3001".to_string();
        config.storage.data_dir = PathBuf::from("/tmp/hc");

        assert_eq!(config.node_address(), "localhost:3001");
        assert_eq!(config.db_path(), PathBuf::from("/tmp/hc/blockchain_3001.db"));
        assert_eq!(config.wallet_path(), PathBuf::from("/tmp/hc/wallets_3001.json"));
        assert!(!config.is_seed_node());
    }

    #[test]
    fn test_default_is_seed() {
        let config = Config::default();
        assert!(config.is_seed_node());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_oversized_difficulty() {
        let mut config = Config::default();
        config.consensus.difficulty = 300;
        assert!(matches!(config.validate(), Err(LedgerError::Config(_))));
    }

    #[test]
    fn test_load_writes_defaults_then_reads_them_back() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("config.json");

        let created = Config::load_from(&path)?;
        assert!(path.exists());
        assert_eq!(Config::load_from(&path)?.node_address(), created.node_address());

        Ok(())
    }

    #[test]
    fn test_broken_config_file_is_an_error() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("config.json");

        std::fs::write(&path, "{ \"node\": ")?;
        assert!(matches!(Config::load_from(&path), Err(LedgerError::Serialization(_))));

        let mut invalid = Config::default();
        invalid.mining.pool_threshold = 0;
        std::fs::write(&path, serde_json::to_string(&invalid)?)?;
        assert!(matches!(Config::load_from(&path), Err(LedgerError::Config(_))));

        Ok(())
    }

    #[test]
    fn test_rejects_empty_pool_threshold() {
        let mut config = Config::default();
        config.mining.pool_threshold = 0;
        assert!(matches!(config.validate(), Err(LedgerError::Config(_))));
    }
}
