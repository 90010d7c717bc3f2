//! Witness construction and Groth16 proof generation.

use ark_bn254::{Bn254, Fr};
use ark_groth16::{Groth16, ProvingKey, VerifyingKey};
use ark_relations::r1cs::{ConstraintSynthesizer, ConstraintSystem};
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};
use ark_snark::SNARK;
use rand::{rngs::StdRng, SeedableRng};
use std::path::Path;

use crate::circuit::SemaphoreCircuit;
use crate::identity::Identity;
use crate::merkle::{InclusionProof, PoseidonHasher};

/// Fixed seed of the simulator's trusted setup. Keys are reproducible per
/// depth, which is what a simulator needs and nothing production should use.
const SETUP_SEED: u64 = 0x574F_524C_445F_4944;

/// Result type for prover operations.
pub type ProverResult<T> = Result<T, ProofGenerationError>;

/// Errors that can occur during witness construction and proving.
#[derive(Debug, thiserror::Error)]
pub enum ProofGenerationError {
    #[error("Trusted setup failed: {0}")]
    SetupFailed(String),

    #[error("Proof generation failed: {0}")]
    ProofGenerationFailed(String),

    #[error("Malformed inclusion proof: {siblings} siblings but {path_indices} path indices")]
    MalformedWitness { siblings: usize, path_indices: usize },

    #[error("Path depth {actual} doesn't match tree depth {expected}")]
    DepthMismatch { expected: usize, actual: usize },

    #[error("Witness does not satisfy the circuit")]
    UnsatisfiedWitness,

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Corrupt proving key: {0}")]
    CorruptProvingKey(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Everything the circuit needs, private and public.
#[derive(Clone, Debug)]
pub struct Witness {
    pub identity_nullifier: Fr,
    pub identity_trapdoor: Fr,
    pub siblings: Vec<Fr>,
    pub path_indices: Vec<bool>,
    pub root: Fr,
    pub nullifier_hash: Fr,
    pub signal_hash: Fr,
    pub external_nullifier: Fr,
}

impl Witness {
    pub fn depth(&self) -> usize {
        self.siblings.len()
    }

    /// Public inputs in circuit order.
    pub fn public_inputs(&self) -> [Fr; 4] {
        [self.root, self.nullifier_hash, self.signal_hash, self.external_nullifier]
    }
}

/// Package an identity, its Merkle path and the request scope for the prover.
///
/// A proof without a recorded root (not yet included, or a caller-supplied
/// dummy) is given the root its path computes to. Such a witness proves, but
/// against a root no registry knows.
pub fn build_witness(
    identity: &Identity,
    inclusion_proof: &InclusionProof,
    external_nullifier: Fr,
    signal_hash: Fr,
    tree_depth: usize,
) -> ProverResult<Witness> {
    if !inclusion_proof.is_well_formed() {
        return Err(ProofGenerationError::MalformedWitness {
            siblings: inclusion_proof.siblings.len(),
            path_indices: inclusion_proof.path_indices.len(),
        });
    }
    if inclusion_proof.depth() != tree_depth {
        return Err(ProofGenerationError::DepthMismatch {
            expected: tree_depth,
            actual: inclusion_proof.depth(),
        });
    }

    let root = inclusion_proof.root.unwrap_or_else(|| {
        inclusion_proof.compute_root(&identity.commitment(), &PoseidonHasher::new())
    });

    Ok(Witness {
        identity_nullifier: identity.nullifier(),
        identity_trapdoor: identity.trapdoor(),
        siblings: inclusion_proof.siblings.clone(),
        path_indices: inclusion_proof.path_indices.clone(),
        root,
        nullifier_hash: identity.nullifier_hash(&external_nullifier),
        signal_hash,
        external_nullifier,
    })
}

/// Groth16 prover for one tree depth.
pub struct Prover {
    proving_key: ProvingKey<Bn254>,
    depth: usize,
}

impl Prover {
    /// Perform the (deterministic) trusted setup for a given tree depth.
    pub fn setup(depth: usize) -> ProverResult<(Self, VerifyingKey<Bn254>)> {
        let circuit = SemaphoreCircuit::new_empty(depth);
        let mut rng = StdRng::seed_from_u64(SETUP_SEED ^ depth as u64);

        let (pk, vk) = Groth16::<Bn254>::circuit_specific_setup(circuit, &mut rng)
            .map_err(|e| ProofGenerationError::SetupFailed(e.to_string()))?;

        Ok((Self { proving_key: pk, depth }, vk))
    }

    /// Generate a proof for `witness` with fresh randomness.
    ///
    /// The witness is checked against the constraint system first, so an
    /// inconsistent witness is reported instead of producing a proof that
    /// can never verify.
    pub fn prove(&self, witness: &Witness) -> ProverResult<ark_groth16::Proof<Bn254>> {
        if witness.depth() != self.depth {
            return Err(ProofGenerationError::DepthMismatch {
                expected: self.depth,
                actual: witness.depth(),
            });
        }

        let circuit = SemaphoreCircuit::from_witness(witness);

        let cs = ConstraintSystem::<Fr>::new_ref();
        circuit
            .clone()
            .generate_constraints(cs.clone())
            .map_err(|e| ProofGenerationError::ProofGenerationFailed(e.to_string()))?;
        let satisfied = cs
            .is_satisfied()
            .map_err(|e| ProofGenerationError::ProofGenerationFailed(e.to_string()))?;
        if !satisfied {
            return Err(ProofGenerationError::UnsatisfiedWitness);
        }

        let mut rng = StdRng::from_entropy();
        Groth16::<Bn254>::prove(&self.proving_key, circuit, &mut rng)
            .map_err(|e| ProofGenerationError::ProofGenerationFailed(e.to_string()))
    }

    /// Get the tree depth this prover was set up for.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn proving_key(&self) -> &ProvingKey<Bn254> {
        &self.proving_key
    }

    /// Save proving key to file, prefixed with the depth.
    pub fn save_proving_key(&self, path: &Path) -> ProverResult<()> {
        let mut bytes = Vec::new();
        self.proving_key
            .serialize_compressed(&mut bytes)
            .map_err(|e| ProofGenerationError::SerializationError(e.to_string()))?;

        let mut file_bytes = (self.depth as u32).to_le_bytes().to_vec();
        file_bytes.extend(bytes);

        std::fs::write(path, file_bytes)?;
        Ok(())
    }

    /// Load proving key from file.
    pub fn load_proving_key(path: &Path) -> ProverResult<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_key_bytes(&bytes)
    }

    fn from_key_bytes(bytes: &[u8]) -> ProverResult<Self> {
        if bytes.len() < 4 {
            return Err(ProofGenerationError::CorruptProvingKey("missing depth header".into()));
        }
        let (header, key) = bytes.split_at(4);
        let depth = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;

        let proving_key = ProvingKey::deserialize_compressed(key)
            .map_err(|e| ProofGenerationError::CorruptProvingKey(e.to_string()))?;

        Ok(Self { proving_key, depth })
    }
}
