use crate::{LedgerError, Result};
use secp256k1::ecdsa::Signature as Secp256k1Signature;

/// Compact 64-byte ECDSA signature (r || s) as stored in transaction inputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    inner: Secp256k1Signature,
}

impl Signature {
    pub fn from_secp256k1(signature: Secp256k1Signature) -> Self {
        Self { inner: signature }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 64 {
            return Err(LedgerError::Crypto(format!(
                "Invalid signature length: {}",
                bytes.len()
            )));
        }

        let inner = Secp256k1Signature::from_compact(bytes)
            .map_err(|e| LedgerError::Crypto(format!("Invalid signature: {}", e)))?;

        Ok(Self { inner })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.inner.serialize_compact().to_vec()
    }

    pub fn as_secp256k1(&self) -> &Secp256k1Signature {
        &self.inner
    }
}
