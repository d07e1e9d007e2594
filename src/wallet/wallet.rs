use crate::crypto::keys::{KeyPair, PrivateKey};
use crate::{LedgerError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletEntry {
    pub address: String,
    pub private_key: String,
    pub public_key: String,
    pub created_at: i64,
}

/// Per-node wallet file: address -> key material, stored as JSON.
#[derive(Debug)]
pub struct Wallets {
    path: PathBuf,
    entries: BTreeMap<String, WalletEntry>,
}

impl Wallets {
    /// Loads the wallet file, or starts empty if it does not exist yet.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let entries = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str(&content)?
        } else {
            BTreeMap::new()
        };

        Ok(Self { path, entries })
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(&self.entries)?;
        std::fs::write(&self.path, content)?;
        Ok(())
    }

    /// Generates a key pair and returns its address. Call `save` to persist.
    pub fn create_wallet(&mut self) -> Result<String> {
        let keypair = KeyPair::new()?;
        let address = keypair.address();

        self.entries.insert(
            address.clone(),
            WalletEntry {
                address: address.clone(),
                private_key: keypair.private_key.to_hex(),
                public_key: keypair.public_key.to_string(),
                created_at: chrono::Utc::now().timestamp(),
            },
        );

        log::info!("🔑 Created wallet {}", address);
        Ok(address)
    }

    pub fn get_keypair(&self, address: &str) -> Result<KeyPair> {
        let entry = self
            .entries
            .get(address)
            .ok_or_else(|| LedgerError::InvalidInput(format!("no wallet for address {}", address)))?;

        KeyPair::from_private_key(PrivateKey::from_hex(&entry.private_key)?)
    }

    pub fn addresses(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
