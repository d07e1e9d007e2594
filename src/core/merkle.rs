//! Merkle commitment over the ordered transactions of a block.
//!
//! Leaves are `H(data)`. Odd levels (above a single node) duplicate their last
//! element before pairing, and parents are `H(left || right)`.

use crate::crypto::hash::Hash256;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct MerkleTree {
    /// levels[0] holds the leaf digests, the last level holds the root.
    levels: Vec<Vec<Hash256>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Left,
    Right,
}

/// Sibling path from a leaf up to the root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub leaf_index: usize,
    pub path: Vec<(Side, Hash256)>,
}

impl MerkleTree {
    pub fn new<T: AsRef<[u8]>>(data: &[T]) -> Self {
        let leaves: Vec<Hash256> = data.iter().map(|d| Hash256::hash(d.as_ref())).collect();
        let mut levels = vec![leaves];

        while levels[levels.len() - 1].len() > 1 {
            let current = &levels[levels.len() - 1];
            let next_level = current
                .chunks(2)
                .map(|pair| {
                    let right = pair.get(1).unwrap_or(&pair[0]);
                    hash_pair(&pair[0], right)
                })
                .collect();
            levels.push(next_level);
        }

        Self { levels }
    }

    /// Root digest; all-zero for an empty input.
    pub fn root(&self) -> Hash256 {
        self.levels
            .last()
            .and_then(|level| level.first())
            .copied()
            .unwrap_or_else(Hash256::zero)
    }

    pub fn leaf_count(&self) -> usize {
        self.levels[0].len()
    }

    pub fn proof(&self, leaf_index: usize) -> Option<MerkleProof> {
        if leaf_index >= self.leaf_count() {
            return None;
        }

        let mut path = Vec::new();
        let mut index = leaf_index;

        for level in &self.levels[..self.levels.len() - 1] {
            let sibling = if index % 2 == 0 {
                (Side::Right, *level.get(index + 1).unwrap_or(&level[index]))
            } else {
                (Side::Left, level[index - 1])
            };
            path.push(sibling);
            index /= 2;
        }

        Some(MerkleProof { leaf_index, path })
    }
}

impl MerkleProof {
    pub fn verify(&self, leaf_data: &[u8], root: &Hash256) -> bool {
        let computed = self
            .path
            .iter()
            .fold(Hash256::hash(leaf_data), |acc, (side, sibling)| match side {
                Side::Left => hash_pair(sibling, &acc),
                Side::Right => hash_pair(&acc, sibling),
            });
        &computed == root
    }
}

fn hash_pair(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut bytes = Vec::with_capacity(64);
    bytes.extend_from_slice(left.as_bytes());
    bytes.extend_from_slice(right.as_bytes());
    Hash256::hash(&bytes)
}

/// Convenience wrapper used by block headers.
pub fn merkle_root<T: AsRef<[u8]>>(data: &[T]) -> Hash256 {
    MerkleTree::new(data).root()
}
