use crate::crypto::hash::{Hash160, Hash256, Hashable};
use crate::crypto::keys::{address_to_hash160, PrivateKey, PublicKey};
use crate::crypto::signatures::Signature;
use crate::{LedgerError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Hash256,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub memo: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    pub previous_output: OutPoint,
    pub signature: Vec<u8>,
    pub public_key: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub value: u64,
    pub pubkey_hash: Hash160,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: Hash256,
    pub vout: u32,
}

impl Transaction {
    /// Reward transaction: no inputs, one output minting `value` to `address`.
    pub fn new_coinbase(address: &str, value: u64, message: String) -> Result<Self> {
        let owner = address_to_hash160(address)?;
        Ok(Self::new_coinbase_to(owner, value, message))
    }

    pub fn new_coinbase_to(owner: Hash160, value: u64, message: String) -> Self {
        let mut tx = Self {
            id: Hash256::zero(),
            inputs: Vec::new(),
            outputs: vec![TxOutput::new(value, owner)],
            memo: message.into_bytes(),
        };
        tx.id = tx.compute_id();
        tx
    }

    /// Transfer with blank signatures and public keys; `sign` fills them in.
    pub fn new_unsigned(previous_outputs: Vec<OutPoint>, outputs: Vec<TxOutput>) -> Self {
        let inputs = previous_outputs
            .into_iter()
            .map(|previous_output| TxInput {
                previous_output,
                signature: Vec::new(),
                public_key: Vec::new(),
            })
            .collect();

        let mut tx = Self {
            id: Hash256::zero(),
            inputs,
            outputs,
            memo: Vec::new(),
        };
        tx.id = tx.compute_id();
        tx
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Saturates instead of overflowing.
    pub fn total_output_value(&self) -> u64 {
        self.outputs.iter().fold(0u64, |total, output| total.saturating_add(output.value))
    }

    /// Identity digest, taken with every signature and public key blank so that
    /// signing never changes it.
    pub fn compute_id(&self) -> Hash256 {
        let mut redacted = self.clone();
        for input in &mut redacted.inputs {
            input.signature.clear();
            input.public_key.clear();
        }
        redacted.digest()
    }

    /// Digest of every field except `id`.
    fn digest(&self) -> Hash256 {
        let mut data = Vec::new();

        data.extend_from_slice(&(self.memo.len() as u32).to_le_bytes());
        data.extend_from_slice(&self.memo);

        data.extend_from_slice(&(self.inputs.len() as u32).to_le_bytes());
        for input in &self.inputs {
            data.extend_from_slice(input.previous_output.txid.as_bytes());
            data.extend_from_slice(&input.previous_output.vout.to_le_bytes());
            data.extend_from_slice(&(input.signature.len() as u32).to_le_bytes());
            data.extend_from_slice(&input.signature);
            data.extend_from_slice(&(input.public_key.len() as u32).to_le_bytes());
            data.extend_from_slice(&input.public_key);
        }

        data.extend_from_slice(&(self.outputs.len() as u32).to_le_bytes());
        for output in &self.outputs {
            data.extend_from_slice(&output.value.to_le_bytes());
            data.extend_from_slice(output.pubkey_hash.as_bytes());
        }

        Hash256::hash(&data)
    }

    /// Redacted copy used for signing: signatures cleared, each input's public
    /// key replaced by the owner hash of the output it spends.
    fn signing_copy(&self, previous: &HashMap<Hash256, Transaction>) -> Result<Transaction> {
        let mut copy = self.clone();
        for input in &mut copy.inputs {
            let spent = referenced_output(previous, &input.previous_output)?;
            input.signature.clear();
            input.public_key = spent.pubkey_hash.as_bytes().to_vec();
        }
        Ok(copy)
    }

    pub fn signature_hash(&self, previous: &HashMap<Hash256, Transaction>) -> Result<Hash256> {
        Ok(self.signing_copy(previous)?.digest())
    }

    pub fn sign(&mut self, private_key: &PrivateKey, previous: &HashMap<Hash256, Transaction>) -> Result<()> {
        if self.is_coinbase() {
            return Ok(());
        }

        let sighash = self.signature_hash(previous)?;
        let signature = private_key.sign(&sighash)?.to_bytes();
        let public_key = private_key.public_key();

        for input in &mut self.inputs {
            input.signature = signature.clone();
            input.public_key = public_key.to_bytes().to_vec();
        }

        Ok(())
    }

    /// Checks ownership, signatures and value conservation against the
    /// transactions this one spends from.
    pub fn verify(&self, previous: &HashMap<Hash256, Transaction>) -> Result<()> {
        if self.is_coinbase() {
            return Ok(());
        }

        if self.id != self.compute_id() {
            return Err(LedgerError::Validation(format!(
                "transaction id {} does not match its contents",
                self.id
            )));
        }

        let mut input_total = 0u64;
        for (index, input) in self.inputs.iter().enumerate() {
            let spent = referenced_output(previous, &input.previous_output)?;
            if !input.unlocks(&spent.pubkey_hash) {
                return Err(LedgerError::Validation(format!(
                    "input {} of {} is not owned by its public key",
                    index, self.id
                )));
            }
            input_total = input_total
                .checked_add(spent.value)
                .ok_or_else(|| LedgerError::Validation("input value overflow".to_string()))?;
        }

        let sighash = self.signature_hash(previous)?;
        for (index, input) in self.inputs.iter().enumerate() {
            let public_key =
                PublicKey::from_bytes(&input.public_key).map_err(|_| LedgerError::InvalidSignature(index))?;
            let signature =
                Signature::from_bytes(&input.signature).map_err(|_| LedgerError::InvalidSignature(index))?;

            if !public_key.verify(&sighash, &signature)? {
                return Err(LedgerError::InvalidSignature(index));
            }
        }

        let output_total = self
            .outputs
            .iter()
            .try_fold(0u64, |acc, o| acc.checked_add(o.value))
            .ok_or_else(|| LedgerError::Validation("output value overflow".to_string()))?;
        if output_total > input_total {
            return Err(LedgerError::Validation(format!(
                "outputs {} exceed inputs {} in {}",
                output_total, input_total, self.id
            )));
        }

        Ok(())
    }
}

impl Hashable for Transaction {
    fn hash(&self) -> Hash256 {
        self.compute_id()
    }
}

impl TxInput {
    /// True if this input's public key hashes to `owner`.
    pub fn unlocks(&self, owner: &Hash160) -> bool {
        !self.public_key.is_empty() && Hash160::hash_sha256(&self.public_key) == *owner
    }
}

impl TxOutput {
    pub fn new(value: u64, pubkey_hash: Hash160) -> Self {
        Self { value, pubkey_hash }
    }

    pub fn to_address(value: u64, address: &str) -> Result<Self> {
        Ok(Self::new(value, address_to_hash160(address)?))
    }

    pub fn is_payable_to(&self, owner: &Hash160) -> bool {
        self.pubkey_hash == *owner
    }
}

impl OutPoint {
    pub fn new(txid: Hash256, vout: u32) -> Self {
        Self { txid, vout }
    }
}

fn referenced_output<'a>(
    previous: &'a HashMap<Hash256, Transaction>,
    outpoint: &OutPoint,
) -> Result<&'a TxOutput> {
    let tx = previous
        .get(&outpoint.txid)
        .ok_or(LedgerError::MissingTransaction(outpoint.txid))?;

    tx.outputs.get(outpoint.vout as usize).ok_or_else(|| {
        LedgerError::Validation(format!(
            "output {}:{} does not exist",
            outpoint.txid, outpoint.vout
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::KeyPair;

    fn funded(owner: &KeyPair, value: u64) -> (Transaction, HashMap<Hash256, Transaction>) {
        let coinbase = Transaction::new_coinbase_to(owner.owner_hash(), value, "fund".to_string());
        let mut previous = HashMap::new();
        previous.insert(coinbase.id, coinbase.clone());
        (coinbase, previous)
    }

    fn spend(from: &Transaction, to: &KeyPair, value: u64) -> Transaction {
        Transaction::new_unsigned(
            vec![OutPoint::new(from.id, 0)],
            vec![TxOutput::new(value, to.owner_hash())],
        )
    }

    #[test]
    fn test_coinbase_transaction() -> Result<()> {
        let owner = KeyPair::new()?;
        let tx = Transaction::new_coinbase(&owner.address(), 10, "Genesis block".to_string())?;

        assert!(tx.is_coinbase());
        assert_eq!(tx.outputs.len(), 1);
        assert_eq!(tx.outputs[0].value, 10);
        assert!(tx.outputs[0].is_payable_to(&owner.owner_hash()));
        assert!(tx.verify(&HashMap::new()).is_ok());

        Ok(())
    }

    #[test]
    fn test_coinbase_ids_differ_by_message() -> Result<()> {
        let owner = KeyPair::new()?;
        let a = Transaction::new_coinbase_to(owner.owner_hash(), 10, "block 1".to_string());
        let b = Transaction::new_coinbase_to(owner.owner_hash(), 10, "block 2".to_string());

        assert_ne!(a.id, b.id);
        Ok(())
    }

    #[test]
    fn test_sign_and_verify_roundtrip() -> Result<()> {
        let alice = KeyPair::new()?;
        let bob = KeyPair::new()?;
        let (coinbase, previous) = funded(&alice, 10);

        let mut tx = spend(&coinbase, &bob, 10);
        let id_before = tx.id;
        tx.sign(&alice.private_key, &previous)?;

        assert_eq!(tx.id, id_before);
        assert_eq!(tx.inputs[0].public_key, alice.public_key.to_bytes());
        assert!(tx.inputs[0].unlocks(&alice.owner_hash()));
        tx.verify(&previous)?;

        Ok(())
    }

    #[test]
    fn test_signing_with_other_key_fails() -> Result<()> {
        let alice = KeyPair::new()?;
        let mallory = KeyPair::new()?;
        let (coinbase, previous) = funded(&alice, 10);

        let mut tx = spend(&coinbase, &mallory, 10);
        tx.sign(&mallory.private_key, &previous)?;
        assert!(tx.verify(&previous).is_err());

        // Alice's public key with Mallory's signature must not verify either.
        tx.inputs[0].public_key = alice.public_key.to_bytes().to_vec();
        assert!(matches!(tx.verify(&previous), Err(LedgerError::InvalidSignature(0))));

        Ok(())
    }

    #[test]
    fn test_tampered_output_fails() -> Result<()> {
        let alice = KeyPair::new()?;
        let bob = KeyPair::new()?;
        let (coinbase, previous) = funded(&alice, 10);

        let mut tx = spend(&coinbase, &bob, 4);
        tx.sign(&alice.private_key, &previous)?;
        tx.outputs[0].value = 5;
        tx.id = tx.compute_id();

        assert!(matches!(tx.verify(&previous), Err(LedgerError::InvalidSignature(0))));
        Ok(())
    }

    #[test]
    fn test_missing_reference_is_reported() -> Result<()> {
        let alice = KeyPair::new()?;
        let bob = KeyPair::new()?;
        let (coinbase, _) = funded(&alice, 10);

        let tx = spend(&coinbase, &bob, 10);
        let result = tx.verify(&HashMap::new());

        assert!(matches!(result, Err(LedgerError::MissingTransaction(id)) if id == coinbase.id));
        Ok(())
    }

    #[test]
    fn test_overspend_is_rejected() -> Result<()> {
        let alice = KeyPair::new()?;
        let bob = KeyPair::new()?;
        let (coinbase, previous) = funded(&alice, 10);

        let mut tx = spend(&coinbase, &bob, 11);
        tx.sign(&alice.private_key, &previous)?;

        assert!(matches!(tx.verify(&previous), Err(LedgerError::Validation(_))));
        Ok(())
    }

    #[test]
    fn test_out_of_range_vout_is_rejected() -> Result<()> {
        let alice = KeyPair::new()?;
        let (coinbase, previous) = funded(&alice, 10);

        let mut tx = Transaction::new_unsigned(
            vec![OutPoint::new(coinbase.id, 3)],
            vec![TxOutput::new(1, alice.owner_hash())],
        );
        assert!(tx.sign(&alice.private_key, &previous).is_err());
        assert!(tx.verify(&previous).is_err());

        Ok(())
    }
}
