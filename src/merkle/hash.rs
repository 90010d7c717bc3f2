//! Poseidon hash over the BN254 scalar field.
//!
//! Width 3 (rate 2, capacity 1), 8 full rounds, 57 partial rounds, x^5
//! S-box, Grain LFSR round constants. The same configuration is fed to the
//! in-circuit sponge so native and constrained hashes agree.

use ark_bn254::Fr;
use ark_crypto_primitives::sponge::{
    poseidon::{find_poseidon_ark_and_mds, PoseidonConfig, PoseidonSponge},
    CryptographicSponge,
};
use std::sync::OnceLock;

static POSEIDON_CONFIG: OnceLock<PoseidonConfig<Fr>> = OnceLock::new();

fn poseidon_config() -> &'static PoseidonConfig<Fr> {
    POSEIDON_CONFIG.get_or_init(|| {
        let rate = 2;
        let full_rounds = 8;
        let partial_rounds = 57;
        let (ark, mds) = find_poseidon_ark_and_mds::<Fr>(254, rate, full_rounds, partial_rounds, 0);

        PoseidonConfig {
            full_rounds: full_rounds as usize,
            partial_rounds: partial_rounds as usize,
            alpha: 5,
            ark,
            mds,
            rate,
            capacity: 1,
        }
    })
}

/// Poseidon hasher configured for BN254.
#[derive(Clone, Copy)]
pub struct PoseidonHasher {
    config: &'static PoseidonConfig<Fr>,
}

impl PoseidonHasher {
    pub fn new() -> Self {
        Self {
            config: poseidon_config(),
        }
    }

    /// Hash a single field element (identity commitment from its secret).
    pub fn hash_one(&self, value: &Fr) -> Fr {
        self.hash_many(std::slice::from_ref(value))
    }

    /// Hash two field elements into one.
    pub fn hash_two(&self, left: &Fr, right: &Fr) -> Fr {
        let mut sponge = PoseidonSponge::new(self.config);
        sponge.absorb(left);
        sponge.absorb(right);
        sponge.squeeze_field_elements(1)[0]
    }

    /// Hash multiple field elements into one.
    pub fn hash_many(&self, elements: &[Fr]) -> Fr {
        let mut sponge = PoseidonSponge::new(self.config);
        for elem in elements {
            sponge.absorb(elem);
        }
        sponge.squeeze_field_elements(1)[0]
    }

    /// Get the underlying Poseidon configuration.
    pub fn config(&self) -> &'static PoseidonConfig<Fr> {
        self.config
    }
}

impl Default for PoseidonHasher {
    fn default() -> Self {
        Self::new()
    }
}
