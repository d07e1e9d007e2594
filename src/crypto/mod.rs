//! Cryptographic primitives: digests, secp256k1 keys and base-58 addresses

pub mod hash;
pub mod keys;
pub mod signatures;

pub use hash::{Hash160, Hash256, Hashable};
pub use keys::{address_to_hash160, is_valid_address, KeyPair, PrivateKey, PublicKey};
pub use signatures::Signature;
