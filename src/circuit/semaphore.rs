//! Semaphore membership circuit.
//!
//! Proves knowledge of an identity `(nullifier, trapdoor)` whose commitment
//! sits in a Merkle tree with a given root, and binds the proof to one
//! action scope and one signal.
//!
//! Public inputs (in allocation order):
//! - `root`: Merkle root of the identity group
//! - `nullifier_hash`: `Poseidon(external_nullifier, nullifier)`
//! - `signal_hash`: field representation of the signal
//! - `external_nullifier`: action scope
//!
//! Private witnesses:
//! - `identity_nullifier`, `identity_trapdoor`
//! - `siblings`, `path_indices`: Merkle path from the commitment to `root`

use ark_bn254::Fr;
use ark_crypto_primitives::sponge::{
    constraints::CryptographicSpongeVar,
    poseidon::{constraints::PoseidonSpongeVar, PoseidonConfig},
};
use ark_ff::Zero;
use ark_r1cs_std::{
    alloc::AllocVar, boolean::Boolean, eq::EqGadget, fields::fp::FpVar, fields::FieldVar,
    select::CondSelectGadget,
};
use ark_relations::r1cs::{ConstraintSynthesizer, ConstraintSystemRef, SynthesisError};
use ark_std::vec::Vec;

use crate::merkle::hash::PoseidonHasher;
use crate::prover::Witness;

/// Number of public inputs the circuit exposes.
pub const PUBLIC_INPUTS: usize = 4;

#[derive(Clone)]
pub struct SemaphoreCircuit {
    poseidon_config: PoseidonConfig<Fr>,

    pub identity_nullifier: Option<Fr>,
    pub identity_trapdoor: Option<Fr>,
    pub siblings: Vec<Option<Fr>>,
    pub path_indices: Vec<Option<bool>>,

    pub root: Option<Fr>,
    pub nullifier_hash: Option<Fr>,
    pub signal_hash: Option<Fr>,
    pub external_nullifier: Option<Fr>,
}

impl SemaphoreCircuit {
    /// Circuit with consistent dummy values for trusted setup.
    /// Setup only needs the structure, which depends on the depth alone.
    pub fn new_empty(depth: usize) -> Self {
        let hasher = PoseidonHasher::new();

        let nullifier = Fr::zero();
        let trapdoor = Fr::zero();
        let external_nullifier = Fr::zero();
        let commitment = hasher.hash_one(&hasher.hash_two(&nullifier, &trapdoor));

        let mut root = commitment;
        for _ in 0..depth {
            root = hasher.hash_two(&root, &Fr::zero());
        }

        Self {
            poseidon_config: hasher.config().clone(),
            identity_nullifier: Some(nullifier),
            identity_trapdoor: Some(trapdoor),
            siblings: vec![Some(Fr::zero()); depth],
            path_indices: vec![Some(false); depth],
            root: Some(root),
            nullifier_hash: Some(hasher.hash_two(&external_nullifier, &nullifier)),
            signal_hash: Some(Fr::zero()),
            external_nullifier: Some(external_nullifier),
        }
    }

    /// Circuit carrying a full witness for proving.
    pub fn from_witness(witness: &Witness) -> Self {
        Self {
            poseidon_config: PoseidonHasher::new().config().clone(),
            identity_nullifier: Some(witness.identity_nullifier),
            identity_trapdoor: Some(witness.identity_trapdoor),
            siblings: witness.siblings.iter().map(|s| Some(*s)).collect(),
            path_indices: witness.path_indices.iter().map(|i| Some(*i)).collect(),
            root: Some(witness.root),
            nullifier_hash: Some(witness.nullifier_hash),
            signal_hash: Some(witness.signal_hash),
            external_nullifier: Some(witness.external_nullifier),
        }
    }

    /// Get the depth of this circuit.
    pub fn depth(&self) -> usize {
        self.siblings.len()
    }
}

impl ConstraintSynthesizer<Fr> for SemaphoreCircuit {
    fn generate_constraints(self, cs: ConstraintSystemRef<Fr>) -> Result<(), SynthesisError> {
        let root_var = FpVar::new_input(cs.clone(), || self.root.ok_or(SynthesisError::AssignmentMissing))?;
        let nullifier_hash_var = FpVar::new_input(cs.clone(), || {
            self.nullifier_hash.ok_or(SynthesisError::AssignmentMissing)
        })?;
        let signal_hash_var = FpVar::new_input(cs.clone(), || {
            self.signal_hash.ok_or(SynthesisError::AssignmentMissing)
        })?;
        let external_nullifier_var = FpVar::new_input(cs.clone(), || {
            self.external_nullifier.ok_or(SynthesisError::AssignmentMissing)
        })?;

        let nullifier_var = FpVar::new_witness(cs.clone(), || {
            self.identity_nullifier.ok_or(SynthesisError::AssignmentMissing)
        })?;
        let trapdoor_var = FpVar::new_witness(cs.clone(), || {
            self.identity_trapdoor.ok_or(SynthesisError::AssignmentMissing)
        })?;

        let sibling_vars: Vec<FpVar<Fr>> = self
            .siblings
            .iter()
            .map(|sibling| {
                FpVar::new_witness(cs.clone(), || sibling.ok_or(SynthesisError::AssignmentMissing))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let index_vars: Vec<Boolean<Fr>> = self
            .path_indices
            .iter()
            .map(|idx| {
                Boolean::new_witness(cs.clone(), || idx.ok_or(SynthesisError::AssignmentMissing))
            })
            .collect::<Result<Vec<_>, _>>()?;

        // commitment = H(H(nullifier, trapdoor))
        let secret = poseidon_hash(cs.clone(), &self.poseidon_config, &[nullifier_var.clone(), trapdoor_var])?;
        let commitment = poseidon_hash(cs.clone(), &self.poseidon_config, &[secret])?;

        let mut current = commitment;
        for (sibling, is_right) in sibling_vars.iter().zip(index_vars.iter()) {
            let left = FpVar::conditionally_select(is_right, sibling, &current)?;
            let right = FpVar::conditionally_select(is_right, &current, sibling)?;
            current = poseidon_hash(cs.clone(), &self.poseidon_config, &[left, right])?;
        }
        current.enforce_equal(&root_var)?;

        let computed_nullifier_hash = poseidon_hash(
            cs.clone(),
            &self.poseidon_config,
            &[external_nullifier_var, nullifier_var],
        )?;
        computed_nullifier_hash.enforce_equal(&nullifier_hash_var)?;

        // Ties the signal into the constraint system so it cannot be swapped.
        let signal_square = signal_hash_var.square()?;
        let expected_square = FpVar::new_witness(cs, || {
            self.signal_hash
                .map(|s| s * s)
                .ok_or(SynthesisError::AssignmentMissing)
        })?;
        signal_square.enforce_equal(&expected_square)?;

        Ok(())
    }
}

/// Poseidon hash of field variables in-circuit.
fn poseidon_hash(
    cs: ConstraintSystemRef<Fr>,
    config: &PoseidonConfig<Fr>,
    inputs: &[FpVar<Fr>],
) -> Result<FpVar<Fr>, SynthesisError> {
    let mut sponge = PoseidonSpongeVar::new(cs, config);
    for input in inputs {
        sponge.absorb(input)?;
    }
    let output = sponge.squeeze_field_elements(1)?;
    Ok(output[0].clone())
}
