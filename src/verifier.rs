//! Groth16 verification of Semaphore proofs.

use ark_bn254::{Bn254, Fr};
use ark_groth16::{Groth16, PreparedVerifyingKey, VerifyingKey};
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};
use ark_snark::SNARK;
use std::path::Path;

use crate::engine::Proof;

/// Result type for verifier operations.
pub type VerifierResult<T> = Result<T, VerifierError>;

/// Errors that can occur during verification.
#[derive(Debug, thiserror::Error)]
pub enum VerifierError {
    #[error("Invalid verifying key: {0}")]
    InvalidKey(String),

    #[error("Invalid proof format: {0}")]
    InvalidProof(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Root mismatch: proof is for a different tree")]
    RootMismatch,
}

/// Verifier for one tree depth.
pub struct Verifier {
    prepared_vk: PreparedVerifyingKey<Bn254>,
    verifying_key: VerifyingKey<Bn254>,
}

impl Verifier {
    pub fn new(vk: VerifyingKey<Bn254>) -> VerifierResult<Self> {
        let prepared_vk =
            Groth16::<Bn254>::process_vk(&vk).map_err(|e| VerifierError::InvalidKey(e.to_string()))?;
        Ok(Self {
            prepared_vk,
            verifying_key: vk,
        })
    }

    /// Check a proof against its own public inputs.
    ///
    /// Any pairing-level failure counts as an invalid proof.
    pub fn verify(&self, proof: &Proof) -> bool {
        Groth16::<Bn254>::verify_with_processed_vk(&self.prepared_vk, &proof.public_inputs(), &proof.zk_proof)
            .unwrap_or(false)
    }

    /// Verify a proof against a specific Merkle root.
    pub fn verify_with_root(&self, proof: &Proof, expected_root: &Fr) -> VerifierResult<bool> {
        if &proof.merkle_root != expected_root {
            return Err(VerifierError::RootMismatch);
        }
        Ok(self.verify(proof))
    }

    /// Verify a proof from its serialized form.
    pub fn verify_bytes(&self, proof_bytes: &[u8]) -> VerifierResult<bool> {
        let proof = Proof::from_bytes(proof_bytes).map_err(|e| VerifierError::InvalidProof(e.to_string()))?;
        Ok(self.verify(&proof))
    }

    pub fn verifying_key(&self) -> &VerifyingKey<Bn254> {
        &self.verifying_key
    }

    /// Save verifying key to file.
    pub fn save(&self, path: &Path) -> VerifierResult<()> {
        let mut bytes = Vec::new();
        self.verifying_key
            .serialize_compressed(&mut bytes)
            .map_err(|e| VerifierError::SerializationError(e.to_string()))?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    /// Load verifier from file.
    pub fn load(path: &Path) -> VerifierResult<Self> {
        let bytes = std::fs::read(path)?;
        let vk = VerifyingKey::deserialize_compressed(&bytes[..])
            .map_err(|e| VerifierError::SerializationError(e.to_string()))?;
        Self::new(vk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::external_nullifier;
    use crate::identity::Identity;
    use crate::merkle::MerkleTree;
    use crate::prover::{build_witness, Prover};

    fn proven(depth: usize) -> (Verifier, Proof) {
        let identity = Identity::from_seed(b"verifier");
        let tree = MerkleTree::from_leaves(depth, &[Fr::from(1u64), identity.commitment()]).unwrap();
        let witness = build_witness(
            &identity,
            &tree.inclusion_proof(1).unwrap(),
            external_nullifier("app_test", "vote"),
            Fr::from(8u64),
            depth,
        )
        .unwrap();

        let (prover, vk) = Prover::setup(depth).unwrap();
        let zk_proof = prover.prove(&witness).unwrap();
        (Verifier::new(vk).unwrap(), Proof::from_witness(&witness, zk_proof))
    }

    #[test]
    fn test_verify_valid_proof() {
        let (verifier, proof) = proven(2);
        assert!(verifier.verify(&proof));
    }

    #[test]
    fn test_tampered_public_input_fails() {
        let (verifier, mut proof) = proven(2);
        proof.signal_hash += Fr::from(1u64);
        assert!(!verifier.verify(&proof));
    }

    #[test]
    fn test_verify_with_wrong_root() {
        let (verifier, proof) = proven(2);
        let result = verifier.verify_with_root(&proof, &Fr::from(999u64));
        assert!(matches!(result, Err(VerifierError::RootMismatch)));

        let root = proof.merkle_root;
        assert!(verifier.verify_with_root(&proof, &root).unwrap());
    }

    #[test]
    fn test_verify_bytes_and_key_file() {
        let (verifier, proof) = proven(1);
        assert!(verifier.verify_bytes(&proof.to_bytes().unwrap()).unwrap());
        assert!(matches!(verifier.verify_bytes(&[1, 2, 3]), Err(VerifierError::InvalidProof(_))));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vk.bin");
        verifier.save(&path).unwrap();
        let loaded = Verifier::load(&path).unwrap();
        assert!(loaded.verify(&proof));
    }
}
