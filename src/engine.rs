//! Proof engine: per-depth key cache, witness construction, proving and
//! verification, plus the packed eight-scalar wire form of a Groth16 proof.

use ark_bn254::{Bn254, Fq, Fq2, Fr, G1Affine, G2Affine};
use ark_ff::Zero;
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

use crate::field::{self, EncodingError, SCALAR_BYTES};
use crate::identity::Identity;
use crate::merkle::InclusionProof;
use crate::prover::{self, ProofGenerationError, Prover, ProverResult, Witness};
use crate::verifier::Verifier;

/// A generated proof together with the public signals it was proven for.
#[derive(Clone, Debug, PartialEq)]
pub struct Proof {
    pub merkle_root: Fr,
    pub nullifier_hash: Fr,
    pub signal_hash: Fr,
    pub external_nullifier: Fr,
    pub zk_proof: ark_groth16::Proof<Bn254>,
}

impl Proof {
    pub fn from_witness(witness: &Witness, zk_proof: ark_groth16::Proof<Bn254>) -> Self {
        Self {
            merkle_root: witness.root,
            nullifier_hash: witness.nullifier_hash,
            signal_hash: witness.signal_hash,
            external_nullifier: witness.external_nullifier,
            zk_proof,
        }
    }

    /// Public inputs in circuit order.
    pub fn public_inputs(&self) -> [Fr; 4] {
        [self.merkle_root, self.nullifier_hash, self.signal_hash, self.external_nullifier]
    }

    pub fn packed(&self) -> PackedProof {
        PackedProof::from_groth16(&self.zk_proof)
    }

    /// Serialize proof and public signals (compressed points).
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProofGenerationError> {
        let mut bytes = Vec::new();
        self.zk_proof
            .serialize_compressed(&mut bytes)
            .map_err(|e| ProofGenerationError::SerializationError(e.to_string()))?;
        for input in self.public_inputs() {
            input
                .serialize_compressed(&mut bytes)
                .map_err(|e| ProofGenerationError::SerializationError(e.to_string()))?;
        }
        Ok(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProofGenerationError> {
        let mut reader = bytes;
        let zk_proof = ark_groth16::Proof::<Bn254>::deserialize_compressed(&mut reader)
            .map_err(|e| ProofGenerationError::SerializationError(e.to_string()))?;

        let mut inputs = [Fr::zero(); 4];
        for input in inputs.iter_mut() {
            *input = Fr::deserialize_compressed(&mut reader)
                .map_err(|e| ProofGenerationError::SerializationError(e.to_string()))?;
        }
        if !reader.is_empty() {
            return Err(ProofGenerationError::SerializationError(format!(
                "{} trailing bytes",
                reader.len()
            )));
        }

        let [merkle_root, nullifier_hash, signal_hash, external_nullifier] = inputs;
        Ok(Self {
            merkle_root,
            nullifier_hash,
            signal_hash,
            external_nullifier,
            zk_proof,
        })
    }
}

/// Groth16 proof as eight big-endian scalars:
/// `[A.x, A.y, B.x.c1, B.x.c0, B.y.c1, B.y.c0, C.x, C.y]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PackedProof(pub [[u8; SCALAR_BYTES]; 8]);

impl PackedProof {
    pub fn from_groth16(proof: &ark_groth16::Proof<Bn254>) -> Self {
        let (ax, ay) = g1_coords(&proof.a);
        let (bx, by) = g2_coords(&proof.b);
        let (cx, cy) = g1_coords(&proof.c);

        Self([
            field::field_to_bytes(&ax),
            field::field_to_bytes(&ay),
            field::field_to_bytes(&bx.c1),
            field::field_to_bytes(&bx.c0),
            field::field_to_bytes(&by.c1),
            field::field_to_bytes(&by.c0),
            field::field_to_bytes(&cx),
            field::field_to_bytes(&cy),
        ])
    }

    /// Rebuild the Groth16 proof, rejecting points off the curve or outside
    /// the prime-order subgroup.
    pub fn to_groth16(&self) -> Result<ark_groth16::Proof<Bn254>, EncodingError> {
        let s = &self.0;
        let a = g1_from(&s[0], &s[1])?;
        let b = g2_from(
            Fq2::new(field::field_from_bytes(&s[3])?, field::field_from_bytes(&s[2])?),
            Fq2::new(field::field_from_bytes(&s[5])?, field::field_from_bytes(&s[4])?),
        )?;
        let c = g1_from(&s[6], &s[7])?;
        Ok(ark_groth16::Proof { a, b, c })
    }

    /// Single `0x` hex string of the 256 packed bytes.
    pub fn to_hex(&self) -> String {
        let flat: Vec<u8> = self.0.iter().flatten().copied().collect();
        format!("0x{}", hex::encode(flat))
    }

    pub fn from_hex(value: &str) -> Result<Self, EncodingError> {
        let digits = value.strip_prefix("0x").unwrap_or(value);
        let bytes = hex::decode(digits).map_err(|e| EncodingError::InvalidHex(e.to_string()))?;
        if bytes.len() != SCALAR_BYTES * 8 {
            return Err(EncodingError::Length {
                expected: SCALAR_BYTES * 8,
                actual: bytes.len(),
            });
        }

        let mut out = [[0u8; SCALAR_BYTES]; 8];
        for (slot, chunk) in out.iter_mut().zip(bytes.chunks_exact(SCALAR_BYTES)) {
            slot.copy_from_slice(chunk);
        }
        Ok(Self(out))
    }
}

fn g1_coords(point: &G1Affine) -> (Fq, Fq) {
    if point.infinity {
        (Fq::zero(), Fq::zero())
    } else {
        (point.x, point.y)
    }
}

fn g2_coords(point: &G2Affine) -> (Fq2, Fq2) {
    if point.infinity {
        (Fq2::zero(), Fq2::zero())
    } else {
        (point.x, point.y)
    }
}

fn g1_from(x: &[u8; SCALAR_BYTES], y: &[u8; SCALAR_BYTES]) -> Result<G1Affine, EncodingError> {
    let x: Fq = field::field_from_bytes(x)?;
    let y: Fq = field::field_from_bytes(y)?;
    if x.is_zero() && y.is_zero() {
        return Ok(G1Affine::identity());
    }

    let point = G1Affine::new_unchecked(x, y);
    if !point.is_on_curve() {
        return Err(EncodingError::InvalidPoint("G1 point not on curve"));
    }
    if !point.is_in_correct_subgroup_assuming_on_curve() {
        return Err(EncodingError::InvalidPoint("G1 point not in subgroup"));
    }
    Ok(point)
}

fn g2_from(x: Fq2, y: Fq2) -> Result<G2Affine, EncodingError> {
    if x.is_zero() && y.is_zero() {
        return Ok(G2Affine::identity());
    }

    let point = G2Affine::new_unchecked(x, y);
    if !point.is_on_curve() {
        return Err(EncodingError::InvalidPoint("G2 point not on curve"));
    }
    if !point.is_in_correct_subgroup_assuming_on_curve() {
        return Err(EncodingError::InvalidPoint("G2 point not in subgroup"));
    }
    Ok(point)
}

/// Proving and verifying keys for one depth.
pub struct CircuitKeys {
    pub prover: Prover,
    pub verifier: Verifier,
}

/// Shared, stateless-from-the-caller's-view proof service.
///
/// Keys are created lazily per tree depth and cached for the lifetime of the
/// engine. Proving is CPU-bound and blocking; async callers should run it on
/// a blocking thread.
pub struct ProofEngine {
    tree_depth: usize,
    keys: RwLock<HashMap<usize, Arc<CircuitKeys>>>,
}

impl ProofEngine {
    pub fn new(tree_depth: usize) -> Self {
        Self {
            tree_depth,
            keys: RwLock::new(HashMap::new()),
        }
    }

    /// Depth of the registry this engine proves against.
    pub fn tree_depth(&self) -> usize {
        self.tree_depth
    }

    /// Keys for `depth`, running the setup on first use.
    pub fn keys(&self, depth: usize) -> ProverResult<Arc<CircuitKeys>> {
        if let Some(keys) = self.keys.read().unwrap_or_else(|e| e.into_inner()).get(&depth) {
            return Ok(Arc::clone(keys));
        }

        info!(depth, "Running circuit setup");
        let (prover, vk) = Prover::setup(depth)?;
        let verifier = Verifier::new(vk).map_err(|e| ProofGenerationError::SetupFailed(e.to_string()))?;

        let mut cache = self.keys.write().unwrap_or_else(|e| e.into_inner());
        let keys = cache
            .entry(depth)
            .or_insert_with(|| Arc::new(CircuitKeys { prover, verifier }));
        Ok(Arc::clone(keys))
    }

    /// Replace the keys for `depth`, e.g. with ones loaded from disk.
    pub fn import_keys(&self, prover: Prover, verifier: Verifier) {
        let depth = prover.depth();
        self.keys
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(depth, Arc::new(CircuitKeys { prover, verifier }));
    }

    /// Write the keys for `depth` to `dir` as `semaphore_{depth}.pk` / `.vk`.
    pub fn save_keys(&self, dir: &Path, depth: usize) -> ProverResult<()> {
        let keys = self.keys(depth)?;
        std::fs::create_dir_all(dir)?;
        keys.prover.save_proving_key(&dir.join(format!("semaphore_{depth}.pk")))?;
        keys.verifier
            .save(&dir.join(format!("semaphore_{depth}.vk")))
            .map_err(|e| ProofGenerationError::SerializationError(e.to_string()))?;
        Ok(())
    }

    /// Load keys written by [`ProofEngine::save_keys`].
    pub fn load_keys(&self, dir: &Path, depth: usize) -> ProverResult<()> {
        let prover = Prover::load_proving_key(&dir.join(format!("semaphore_{depth}.pk")))?;
        if prover.depth() != depth {
            return Err(ProofGenerationError::DepthMismatch {
                expected: depth,
                actual: prover.depth(),
            });
        }
        let verifier = Verifier::load(&dir.join(format!("semaphore_{depth}.vk")))
            .map_err(|e| ProofGenerationError::CorruptProvingKey(e.to_string()))?;
        self.import_keys(prover, verifier);
        Ok(())
    }

    /// Build a witness for a request scope. The signal is hashed here.
    pub fn build_witness(
        &self,
        identity: &Identity,
        inclusion_proof: &InclusionProof,
        external_nullifier: Fr,
        signal: &str,
    ) -> ProverResult<Witness> {
        prover::build_witness(
            identity,
            inclusion_proof,
            external_nullifier,
            field::signal_hash(signal),
            self.tree_depth,
        )
    }

    /// Generate a proof. Blocking, and not retried on failure.
    pub fn generate_proof(&self, witness: &Witness) -> ProverResult<Proof> {
        let keys = self.keys(witness.depth())?;
        debug!(depth = witness.depth(), "Generating proof");
        let zk_proof = keys.prover.prove(witness)?;
        Ok(Proof::from_witness(witness, zk_proof))
    }

    /// Check a proof against its public signals at `tree_depth`.
    pub fn verify_proof(&self, proof: &Proof, tree_depth: usize) -> bool {
        match self.keys(tree_depth) {
            Ok(keys) => keys.verifier.verify(proof),
            Err(_) => false,
        }
    }
}

impl Default for ProofEngine {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_TREE_DEPTH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::external_nullifier;
    use crate::merkle::MerkleTree;
    use std::sync::OnceLock;

    const DEPTH: usize = 3;

    fn engine() -> &'static ProofEngine {
        static ENGINE: OnceLock<ProofEngine> = OnceLock::new();
        ENGINE.get_or_init(|| ProofEngine::new(DEPTH))
    }

    fn included(identity: &Identity, others: &[u64]) -> InclusionProof {
        let mut leaves: Vec<Fr> = others.iter().map(|v| Fr::from(*v)).collect();
        leaves.push(identity.commitment());
        let tree = MerkleTree::from_leaves(DEPTH, &leaves).unwrap();
        tree.inclusion_proof(leaves.len() - 1).unwrap()
    }

    #[test]
    fn test_generate_and_verify() {
        let identity = Identity::from_seed(b"engine");
        let ext = external_nullifier("app_staging_x", "test");
        let witness = engine()
            .build_witness(&identity, &included(&identity, &[1, 2]), ext, "0x00")
            .unwrap();

        let proof = engine().generate_proof(&witness).unwrap();
        assert!(engine().verify_proof(&proof, DEPTH));
        assert!(engine().verify_proof(&proof, DEPTH));
    }

    #[test]
    fn test_tampered_nullifier_hash_fails() {
        let identity = Identity::from_seed(b"engine");
        let ext = external_nullifier("app", "act");
        let witness = engine().build_witness(&identity, &included(&identity, &[]), ext, "hi").unwrap();

        let mut proof = engine().generate_proof(&witness).unwrap();
        proof.nullifier_hash += Fr::from(1u64);
        assert!(!engine().verify_proof(&proof, DEPTH));
    }

    #[test]
    fn test_same_scope_different_roots_share_nullifier() {
        let identity = Identity::from_seed(b"scope");
        let ext = external_nullifier("app", "vote");

        let early = engine().build_witness(&identity, &included(&identity, &[]), ext, "s").unwrap();
        let late = engine()
            .build_witness(&identity, &included(&identity, &[7, 8, 9]), ext, "s")
            .unwrap();
        assert_ne!(early.root, late.root);

        let a = engine().generate_proof(&early).unwrap();
        let b = engine().generate_proof(&late).unwrap();
        assert_ne!(a.packed(), b.packed());
        assert_eq!(a.nullifier_hash, b.nullifier_hash);
        assert!(engine().verify_proof(&a, DEPTH));
        assert!(engine().verify_proof(&b, DEPTH));
    }

    #[test]
    fn test_dummy_proof_fails_downstream() {
        let identity = Identity::from_seed(b"never included");
        let ext = external_nullifier("app", "act");
        let witness = engine()
            .build_witness(&identity, &InclusionProof::empty(DEPTH), ext, "s")
            .unwrap();

        // Proves against the path's own root, which no registry vouches for.
        let proof = engine().generate_proof(&witness).unwrap();
        let registry = MerkleTree::from_leaves(DEPTH, &[Fr::from(1u64)]).unwrap();
        let keys = engine().keys(DEPTH).unwrap();
        assert!(matches!(
            keys.verifier.verify_with_root(&proof, &registry.root()),
            Err(crate::verifier::VerifierError::RootMismatch)
        ));
    }

    #[test]
    fn test_packed_proof_roundtrip() {
        let identity = Identity::from_seed(b"packed");
        let ext = external_nullifier("app", "act");
        let witness = engine().build_witness(&identity, &included(&identity, &[3]), ext, "s").unwrap();
        let proof = engine().generate_proof(&witness).unwrap();

        let hex = proof.packed().to_hex();
        assert_eq!(hex.len(), 2 + 512);
        let unpacked = PackedProof::from_hex(&hex).unwrap().to_groth16().unwrap();
        assert_eq!(unpacked, proof.zk_proof);

        let restored = Proof::from_bytes(&proof.to_bytes().unwrap()).unwrap();
        assert_eq!(restored, proof);
    }

    #[test]
    fn test_packed_proof_rejects_bad_points() {
        let mut raw = [[0u8; SCALAR_BYTES]; 8];
        raw[0][31] = 1;
        raw[1][31] = 1;
        assert!(matches!(
            PackedProof(raw).to_groth16(),
            Err(EncodingError::InvalidPoint(_))
        ));

        assert!(matches!(PackedProof::from_hex("0x1234"), Err(EncodingError::Length { .. })));
    }

    #[test]
    fn test_key_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let source = ProofEngine::new(1);
        source.save_keys(dir.path(), 1).unwrap();

        let target = ProofEngine::new(1);
        target.load_keys(dir.path(), 1).unwrap();

        let identity = Identity::from_seed(b"keys");
        let tree = MerkleTree::from_leaves(1, &[identity.commitment()]).unwrap();
        let witness = target
            .build_witness(&identity, &tree.inclusion_proof(0).unwrap(), Fr::from(1u64), "s")
            .unwrap();
        let proof = target.generate_proof(&witness).unwrap();
        assert!(source.verify_proof(&proof, 1));
    }
}
