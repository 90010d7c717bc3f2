//! Fixed-depth incremental Merkle tree over identity commitments.
//!
//! Leaves are appended left to right; unused positions hold the zero leaf,
//! so the root is defined for any depth without materialising 2^depth nodes.

use ark_bn254::Fr;
use ark_ff::Zero;
use serde::{Deserialize, Serialize};

use super::hash::PoseidonHasher;
use crate::field::serde_fr;

/// Maximum supported tree depth.
pub const MAX_DEPTH: usize = 32;

/// A Merkle inclusion proof for an identity commitment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InclusionProof {
    /// Root at the time of inclusion, `None` while the registry has not
    /// committed the leaf yet.
    #[serde(with = "serde_fr::option")]
    pub root: Option<Fr>,
    /// Sibling hashes from leaf to root.
    #[serde(with = "serde_fr::vec")]
    pub siblings: Vec<Fr>,
    /// Path indices: false = current node is the left child, true = right.
    pub path_indices: Vec<bool>,
}

impl InclusionProof {
    /// All-zero path of the given depth with no root, for exercising the
    /// failure path of proof generation.
    pub fn empty(depth: usize) -> Self {
        Self {
            root: None,
            siblings: vec![Fr::zero(); depth],
            path_indices: vec![false; depth],
        }
    }

    /// Get the depth of this path.
    pub fn depth(&self) -> usize {
        self.siblings.len()
    }

    /// Whether siblings and indices describe the same number of levels.
    pub fn is_well_formed(&self) -> bool {
        self.siblings.len() == self.path_indices.len()
    }

    /// Whether the registry has committed this proof to a root.
    pub fn is_included(&self) -> bool {
        self.root.is_some()
    }

    /// Compute the root reached from `leaf` along this path.
    pub fn compute_root(&self, leaf: &Fr, hasher: &PoseidonHasher) -> Fr {
        let mut current = *leaf;

        for (sibling, is_right) in self.siblings.iter().zip(self.path_indices.iter()) {
            current = if *is_right {
                hasher.hash_two(sibling, &current)
            } else {
                hasher.hash_two(&current, sibling)
            };
        }

        current
    }

    /// Verify this path for `leaf` against the recorded root.
    pub fn verify(&self, leaf: &Fr, hasher: &PoseidonHasher) -> bool {
        match self.root {
            Some(root) => self.is_well_formed() && self.compute_root(leaf, hasher) == root,
            None => false,
        }
    }
}

/// Errors that can occur with Merkle tree operations.
#[derive(Debug, thiserror::Error)]
pub enum TreeError {
    #[error("tree depth {0} is outside 1..={MAX_DEPTH}")]
    InvalidDepth(usize),

    #[error("tree of depth {0} is full")]
    Full(usize),
}

/// Binary Merkle tree with Poseidon hash and zero-leaf padding.
#[derive(Clone)]
pub struct MerkleTree {
    depth: usize,
    /// `levels[0]` holds the leaves, `levels[depth]` the root once non-empty.
    levels: Vec<Vec<Fr>>,
    /// Root of an all-zero subtree at each height.
    zeros: Vec<Fr>,
    hasher: PoseidonHasher,
}

impl MerkleTree {
    /// Create an empty tree of the given depth.
    pub fn new(depth: usize) -> Result<Self, TreeError> {
        if depth == 0 || depth > MAX_DEPTH {
            return Err(TreeError::InvalidDepth(depth));
        }

        let hasher = PoseidonHasher::new();
        let mut zeros = Vec::with_capacity(depth + 1);
        zeros.push(Fr::zero());
        for level in 0..depth {
            let below = zeros[level];
            zeros.push(hasher.hash_two(&below, &below));
        }

        Ok(Self {
            depth,
            levels: vec![Vec::new(); depth + 1],
            zeros,
            hasher,
        })
    }

    /// Build a tree from a list of leaves.
    pub fn from_leaves(depth: usize, leaves: &[Fr]) -> Result<Self, TreeError> {
        let mut tree = Self::new(depth)?;
        for leaf in leaves {
            tree.insert(*leaf)?;
        }
        Ok(tree)
    }

    /// Append a leaf and return its index.
    pub fn insert(&mut self, leaf: Fr) -> Result<usize, TreeError> {
        let index = self.levels[0].len();
        if self.depth < usize::BITS as usize && index >= 1usize << self.depth {
            return Err(TreeError::Full(self.depth));
        }
        self.levels[0].push(leaf);

        let mut node = index;
        for level in 0..self.depth {
            let parent = node / 2;
            let left = self.levels[level][parent * 2];
            let right = self.levels[level]
                .get(parent * 2 + 1)
                .copied()
                .unwrap_or(self.zeros[level]);
            let hash = self.hasher.hash_two(&left, &right);

            let above = &mut self.levels[level + 1];
            if parent < above.len() {
                above[parent] = hash;
            } else {
                above.push(hash);
            }
            node = parent;
        }

        Ok(index)
    }

    /// Get the Merkle root.
    pub fn root(&self) -> Fr {
        self.levels[self.depth]
            .first()
            .copied()
            .unwrap_or(self.zeros[self.depth])
    }

    /// Get tree depth.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Number of inserted leaves.
    pub fn len(&self) -> usize {
        self.levels[0].len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels[0].is_empty()
    }

    /// Get a reference to the hasher.
    pub fn hasher(&self) -> &PoseidonHasher {
        &self.hasher
    }

    /// Index of the first occurrence of `leaf`.
    pub fn find_leaf(&self, leaf: &Fr) -> Option<usize> {
        self.levels[0].iter().position(|l| l == leaf)
    }

    /// Inclusion proof for the leaf at `index`, committed to the current root.
    pub fn inclusion_proof(&self, index: usize) -> Option<InclusionProof> {
        if index >= self.len() {
            return None;
        }

        let mut siblings = Vec::with_capacity(self.depth);
        let mut path_indices = Vec::with_capacity(self.depth);
        let mut node = index;

        for level in 0..self.depth {
            let sibling = self.levels[level]
                .get(node ^ 1)
                .copied()
                .unwrap_or(self.zeros[level]);
            siblings.push(sibling);
            path_indices.push(node & 1 == 1);
            node /= 2;
        }

        Some(InclusionProof {
            root: Some(self.root()),
            siblings,
            path_indices,
        })
    }

    /// Inclusion proof for a specific leaf value.
    pub fn proof_for_leaf(&self, leaf: &Fr) -> Option<InclusionProof> {
        self.inclusion_proof(self.find_leaf(leaf)?)
    }
}
