pub mod hash;
pub mod tree;

pub use hash::PoseidonHasher;
pub use tree::{InclusionProof, MerkleTree, TreeError};
