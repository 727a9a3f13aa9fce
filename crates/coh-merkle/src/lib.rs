//! Binary Merkle tree over domain-separated leaf/internal hashes, used by
//! the consensus profile for external attestation of candidate or receipt
//! batches. Odd levels duplicate their last node, matching the usual
//! Merkle-over-unbalanced-input convention.

use coh_hash::{Hash, HashKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MerkleError {
    #[error("cannot compute a root for an empty tree")]
    EmptyTree,
    #[error("leaf index {index} out of bounds for {len} leaves")]
    IndexOutOfBounds { index: usize, len: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MerkleNode {
    Leaf { data: Vec<u8>, hash: Hash },
    Internal { left: Hash, right: Hash, hash: Hash },
}

impl MerkleNode {
    pub fn leaf(data: Vec<u8>) -> Self {
        let hash = coh_hash::typed_hash_bytes(&HashKind::MerkleLeaf, &data);
        Self::Leaf { data, hash }
    }

    pub fn internal(left: Hash, right: Hash) -> Self {
        let hash = hash_pair(&left, &right);
        Self::Internal { left, right, hash }
    }

    pub fn hash(&self) -> Hash {
        match self {
            Self::Leaf { hash, .. } => *hash,
            Self::Internal { hash, .. } => *hash,
        }
    }
}

fn hash_pair(left: &Hash, right: &Hash) -> Hash {
    let mut combined = Vec::with_capacity(64);
    combined.extend_from_slice(left.as_raw());
    combined.extend_from_slice(right.as_raw());
    coh_hash::typed_hash_bytes(&HashKind::MerkleInternal, &combined)
}

/// An inclusion proof: the sibling at each level on the path from a leaf to
/// the root, tagged with which side the sibling sits on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub leaf_index: usize,
    pub leaf_hash: Hash,
    pub siblings: Vec<(Hash, Side)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Left,
    Right,
}

impl MerkleProof {
    pub fn verify(&self, root: Hash) -> bool {
        let mut current = self.leaf_hash;
        for (sibling, side) in &self.siblings {
            current = match side {
                Side::Right => hash_pair(&current, sibling),
                Side::Left => hash_pair(sibling, &current),
            };
        }
        current == root
    }
}

/// A binary Merkle tree built over an ordered list of leaf byte strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MerkleTree {
    leaves: Vec<Hash>,
    levels: Vec<Vec<Hash>>,
}

impl MerkleTree {
    pub fn new(leaf_data: Vec<Vec<u8>>) -> Result<Self, MerkleError> {
        if leaf_data.is_empty() {
            return Err(MerkleError::EmptyTree);
        }

        let mut leaves: Vec<Hash> = leaf_data
            .into_iter()
            .map(|data| coh_hash::typed_hash_bytes(&HashKind::MerkleLeaf, &data))
            .collect();
        if leaves.len() % 2 == 1 {
            leaves.push(*leaves.last().unwrap());
        }

        let mut levels = vec![leaves.clone()];
        let mut current = leaves.clone();
        while current.len() > 1 {
            let mut next = Vec::with_capacity(current.len().div_ceil(2));
            for pair in current.chunks(2) {
                let left = pair[0];
                let right = pair.get(1).copied().unwrap_or(left);
                next.push(hash_pair(&left, &right));
            }
            if next.len() % 2 == 1 && next.len() > 1 {
                next.push(*next.last().unwrap());
            }
            levels.push(next.clone());
            current = next;
        }

        Ok(Self { leaves, levels })
    }

    pub fn root(&self) -> Result<Hash, MerkleError> {
        self.levels
            .last()
            .and_then(|level| level.first())
            .copied()
            .ok_or(MerkleError::EmptyTree)
    }

    pub fn proof(&self, leaf_index: usize) -> Result<MerkleProof, MerkleError> {
        if leaf_index >= self.leaves.len() {
            return Err(MerkleError::IndexOutOfBounds {
                index: leaf_index,
                len: self.leaves.len(),
            });
        }

        let leaf_hash = self.leaves[leaf_index];
        let mut siblings = Vec::new();
        let mut index = leaf_index;

        for level in &self.levels[..self.levels.len() - 1] {
            let is_left = index % 2 == 0;
            let sibling_index = if is_left { index + 1 } else { index - 1 };
            if sibling_index < level.len() {
                let side = if is_left { Side::Right } else { Side::Left };
                siblings.push((level[sibling_index], side));
            }
            index /= 2;
        }

        Ok(MerkleProof {
            leaf_index,
            leaf_hash,
            siblings,
        })
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }
}
