use crate::crypto::hash::{Hash160, Hash256};
use crate::crypto::signatures::Signature;
use crate::{LedgerError, Result};
use rand::{rngs::OsRng, RngCore};
use secp256k1::{Message, PublicKey as Secp256k1PublicKey, Secp256k1, SecretKey};
use std::fmt;

pub const ADDRESS_VERSION: u8 = 0x00;
const CHECKSUM_LEN: usize = 4;
const ADDRESS_PAYLOAD_LEN: usize = 1 + 20 + CHECKSUM_LEN;

#[derive(Debug, Clone)]
pub struct PrivateKey {
    key: SecretKey,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    key: Vec<u8>, // Compressed SEC1 encoding
}

#[derive(Debug, Clone)]
pub struct KeyPair {
    pub private_key: PrivateKey,
    pub public_key: PublicKey,
}

impl PrivateKey {
    pub fn new() -> Result<Self> {
        let mut rng = OsRng;
        loop {
            let mut secret_bytes = [0u8; 32];
            rng.fill_bytes(&mut secret_bytes);

            // Out-of-range scalars are astronomically rare; draw again.
            if let Ok(key) = SecretKey::from_slice(&secret_bytes) {
                return Ok(Self { key });
            }
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 32 {
            return Err(LedgerError::Crypto("Private key must be 32 bytes".to_string()));
        }

        let key = SecretKey::from_slice(bytes)
            .map_err(|e| LedgerError::Crypto(format!("Invalid private key: {}", e)))?;

        Ok(Self { key })
    }

    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let bytes = hex::decode(hex_str)
            .map_err(|e| LedgerError::Crypto(format!("Invalid private key hex: {}", e)))?;
        Self::from_bytes(&bytes)
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.key.secret_bytes()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.key.secret_bytes())
    }

    pub fn public_key(&self) -> PublicKey {
        let secp = Secp256k1::new();
        let public_key = Secp256k1PublicKey::from_secret_key(&secp, &self.key);

        PublicKey {
            key: public_key.serialize().to_vec(),
        }
    }

    pub fn sign(&self, message: &Hash256) -> Result<Signature> {
        let secp = Secp256k1::signing_only();
        let message = digest_message(message)?;

        let signature = secp.sign_ecdsa(&message, &self.key);
        Ok(Signature::from_secp256k1(signature))
    }
}

impl PublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 33 && bytes.len() != 65 {
            return Err(LedgerError::Crypto("Invalid public key length".to_string()));
        }

        Secp256k1PublicKey::from_slice(bytes)
            .map_err(|e| LedgerError::Crypto(format!("Invalid public key: {}", e)))?;

        Ok(Self {
            key: bytes.to_vec(),
        })
    }

    pub fn to_bytes(&self) -> &[u8] {
        &self.key
    }

    pub fn hash160(&self) -> Hash160 {
        Hash160::hash_sha256(&self.key)
    }

    pub fn to_address(&self) -> String {
        hash160_to_address(&self.hash160())
    }

    pub fn verify(&self, message: &Hash256, signature: &Signature) -> Result<bool> {
        let secp = Secp256k1::verification_only();

        let public_key = Secp256k1PublicKey::from_slice(&self.key)
            .map_err(|e| LedgerError::Crypto(format!("Invalid public key: {}", e)))?;
        let message = digest_message(message)?;

        Ok(secp
            .verify_ecdsa(&message, signature.as_secp256k1(), &public_key)
            .is_ok())
    }
}

impl KeyPair {
    pub fn new() -> Result<Self> {
        Self::from_private_key(PrivateKey::new()?)
    }

    pub fn from_private_key(private_key: PrivateKey) -> Result<Self> {
        let public_key = private_key.public_key();

        Ok(Self {
            private_key,
            public_key,
        })
    }

    pub fn address(&self) -> String {
        self.public_key.to_address()
    }

    pub fn owner_hash(&self) -> Hash160 {
        self.public_key.hash160()
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.key))
    }
}

#[allow(deprecated)]
fn digest_message(message: &Hash256) -> Result<Message> {
    Message::from_slice(message.as_bytes())
        .map_err(|e| LedgerError::Crypto(format!("Invalid message: {}", e)))
}

fn checksum(payload: &[u8]) -> [u8; CHECKSUM_LEN] {
    let hash = Hash256::double_hash(payload);
    let mut out = [0u8; CHECKSUM_LEN];
    out.copy_from_slice(&hash.as_bytes()[..CHECKSUM_LEN]);
    out
}

// Address utilities

pub fn hash160_to_address(hash160: &Hash160) -> String {
    let mut data = Vec::with_capacity(ADDRESS_PAYLOAD_LEN);
    data.push(ADDRESS_VERSION);
    data.extend_from_slice(hash160.as_bytes());
    let check = checksum(&data);
    data.extend_from_slice(&check);

    bs58::encode(data).into_string()
}

/// Decodes `[version | owner hash | checksum]` and returns the owner hash.
pub fn address_to_hash160(address: &str) -> Result<Hash160> {
    let decoded = bs58::decode(address)
        .into_vec()
        .map_err(|e| LedgerError::InvalidAddress(format!("{}: {}", address, e)))?;

    if decoded.len() != ADDRESS_PAYLOAD_LEN || decoded[0] != ADDRESS_VERSION {
        return Err(LedgerError::InvalidAddress(format!(
            "{}: unexpected length or version",
            address
        )));
    }

    let (payload, check) = decoded.split_at(decoded.len() - CHECKSUM_LEN);
    if checksum(payload) != check {
        return Err(LedgerError::InvalidAddress(format!("{}: bad checksum", address)));
    }

    Hash160::from_slice(&payload[1..])
        .ok_or_else(|| LedgerError::InvalidAddress(address.to_string()))
}

pub fn is_valid_address(address: &str) -> bool {
    address_to_hash160(address).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_generation() -> Result<()> {
        let keypair = KeyPair::new()?;
        let address = keypair.address();

        assert!(is_valid_address(&address));
        assert_eq!(address_to_hash160(&address)?, keypair.owner_hash());

        Ok(())
    }

    #[test]
    fn test_hex_roundtrip() -> Result<()> {
        let private_key = PrivateKey::new()?;
        let restored_key = PrivateKey::from_hex(&private_key.to_hex())?;

        assert_eq!(private_key.to_bytes(), restored_key.to_bytes());
        assert_eq!(private_key.public_key(), restored_key.public_key());

        Ok(())
    }

    #[test]
    fn test_address_validation() -> Result<()> {
        let keypair = KeyPair::new()?;
        let mut address = keypair.address();

        assert!(is_valid_address(&address));
        assert!(!is_valid_address("invalid"));
        assert!(!is_valid_address(""));

        // Flip the last character to break the checksum.
        let last = address.pop().unwrap();
        address.push(if last == '1' { '2' } else { '1' });
        assert!(!is_valid_address(&address));

        Ok(())
    }
}
