//! Semaphore identity and its storage.
//!
//! An identity is two secret scalars (trapdoor, nullifier) plus the public
//! commitment `Poseidon(Poseidon(nullifier, trapdoor))`. The store hands out
//! `Arc` snapshots and bumps a generation counter whenever the active
//! identity is replaced or wiped, so in-flight sessions can tell that the
//! identity they started with is gone.

use ark_bn254::Fr;
use ark_ff::PrimeField;
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::credential::CredentialType;
use crate::field::{encode_field, field_to_bytes, serde_fr};
use crate::merkle::{InclusionProof, PoseidonHasher};

const STORAGE_VERSION: u8 = 1;

/// Errors from identity storage.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Unsupported identity storage version {0}")]
    UnsupportedVersion(u8),
}

/// A zero-knowledge identity.
#[derive(Clone)]
pub struct Identity {
    trapdoor: Fr,
    nullifier: Fr,
    commitment: Fr,
    persisted: bool,
    inclusion_proofs: BTreeMap<CredentialType, InclusionProof>,
}

impl Identity {
    /// Generate secrets from the operating system RNG.
    pub fn random() -> Self {
        let mut trapdoor = Zeroizing::new([0u8; 31]);
        let mut nullifier = Zeroizing::new([0u8; 31]);
        OsRng.fill_bytes(&mut trapdoor[..]);
        OsRng.fill_bytes(&mut nullifier[..]);

        Self::from_secrets(
            Fr::from_be_bytes_mod_order(&trapdoor[..]),
            Fr::from_be_bytes_mod_order(&nullifier[..]),
        )
    }

    /// Derive secrets deterministically from an external seed such as a
    /// wallet signature. The same seed always yields the same commitment.
    pub fn from_seed(seed: &[u8]) -> Self {
        let message = Zeroizing::new(Sha256::digest(seed).to_vec());
        let expand = |label: &[u8]| {
            let mut hasher = Sha256::new();
            hasher.update(message.as_slice());
            hasher.update(label);
            Zeroizing::new(hasher.finalize().to_vec())
        };

        let trapdoor = expand(b"identity_trapdoor");
        let nullifier = expand(b"identity_nullifier");
        Self::from_secrets(
            Fr::from_be_bytes_mod_order(trapdoor.as_slice()),
            Fr::from_be_bytes_mod_order(nullifier.as_slice()),
        )
    }

    pub fn from_secrets(trapdoor: Fr, nullifier: Fr) -> Self {
        let hasher = PoseidonHasher::new();
        let secret = hasher.hash_two(&nullifier, &trapdoor);
        let commitment = hasher.hash_one(&secret);

        Self {
            trapdoor,
            nullifier,
            commitment,
            persisted: false,
            inclusion_proofs: BTreeMap::new(),
        }
    }

    pub fn trapdoor(&self) -> Fr {
        self.trapdoor
    }

    pub fn nullifier(&self) -> Fr {
        self.nullifier
    }

    /// Public identifier of this identity in the membership group.
    pub fn commitment(&self) -> Fr {
        self.commitment
    }

    /// Whether this identity has been written to persistent storage.
    pub fn is_persisted(&self) -> bool {
        self.persisted
    }

    /// `Poseidon(external_nullifier, nullifier)`, stable per action scope.
    pub fn nullifier_hash(&self, external_nullifier: &Fr) -> Fr {
        PoseidonHasher::new().hash_two(external_nullifier, &self.nullifier)
    }

    /// Verification state for every credential level.
    pub fn verified_levels(&self) -> BTreeMap<CredentialType, bool> {
        CredentialType::ALL
            .iter()
            .map(|level| (*level, self.is_verified(*level)))
            .collect()
    }

    pub fn is_verified(&self, level: CredentialType) -> bool {
        self.inclusion_proofs
            .get(&level)
            .map(InclusionProof::is_included)
            .unwrap_or(false)
    }

    pub fn inclusion_proof(&self, level: CredentialType) -> Option<&InclusionProof> {
        self.inclusion_proofs.get(&level)
    }

    pub fn attach_inclusion_proof(&mut self, level: CredentialType, proof: InclusionProof) {
        self.inclusion_proofs.insert(level, proof);
    }

    pub fn clear_inclusion_proof(&mut self, level: CredentialType) {
        self.inclusion_proofs.remove(&level);
    }

    fn to_stored(&self) -> StoredIdentity {
        StoredIdentity {
            version: STORAGE_VERSION,
            trapdoor: self.trapdoor,
            nullifier: self.nullifier,
            inclusion_proofs: self.inclusion_proofs.clone().into_iter().collect(),
        }
    }

    fn from_stored(stored: StoredIdentity) -> Result<Self, IdentityError> {
        if stored.version != STORAGE_VERSION {
            return Err(IdentityError::UnsupportedVersion(stored.version));
        }
        let mut identity = Self::from_secrets(stored.trapdoor, stored.nullifier);
        identity.inclusion_proofs = stored.inclusion_proofs.into_iter().collect();
        Ok(identity)
    }

    /// Serialize secret material (bincode) for storage.
    pub fn to_bytes(&self) -> Result<Zeroizing<Vec<u8>>, IdentityError> {
        bincode::serialize(&self.to_stored())
            .map(Zeroizing::new)
            .map_err(|e| IdentityError::SerializationError(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdentityError> {
        let stored: StoredIdentity = bincode::deserialize(bytes)
            .map_err(|e| IdentityError::SerializationError(e.to_string()))?;
        Self::from_stored(stored)
    }

    /// Human-readable export with hex secrets.
    pub fn to_json(&self) -> Result<Zeroizing<String>, IdentityError> {
        serde_json::to_string_pretty(&self.to_stored())
            .map(Zeroizing::new)
            .map_err(|e| IdentityError::SerializationError(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, IdentityError> {
        let stored: StoredIdentity = serde_json::from_str(json)
            .map_err(|e| IdentityError::SerializationError(e.to_string()))?;
        Self::from_stored(stored)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("commitment", &encode_field(&self.commitment))
            .field("trapdoor", &"[REDACTED]")
            .field("nullifier", &"[REDACTED]")
            .field("persisted", &self.persisted)
            .field("verified_levels", &self.verified_levels())
            .finish()
    }
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        field_to_bytes(&self.trapdoor) == field_to_bytes(&other.trapdoor)
            && field_to_bytes(&self.nullifier) == field_to_bytes(&other.nullifier)
    }
}

#[derive(Serialize, Deserialize)]
struct StoredIdentity {
    version: u8,
    #[serde(with = "serde_fr")]
    trapdoor: Fr,
    #[serde(with = "serde_fr")]
    nullifier: Fr,
    inclusion_proofs: Vec<(CredentialType, InclusionProof)>,
}

/// Where identity secrets live between sessions.
pub trait IdentityStorage: Send + Sync {
    fn save(&self, bytes: &[u8]) -> Result<(), IdentityError>;

    /// `Ok(None)` when nothing has been stored.
    fn load(&self) -> Result<Option<Zeroizing<Vec<u8>>>, IdentityError>;

    fn wipe(&self) -> Result<(), IdentityError>;

    /// Whether stored material survives the process.
    fn is_persistent(&self) -> bool;
}

/// Process-lifetime storage; nothing survives a restart.
#[derive(Default)]
pub struct MemoryStorage {
    slot: Mutex<Option<Zeroizing<Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdentityStorage for MemoryStorage {
    fn save(&self, bytes: &[u8]) -> Result<(), IdentityError> {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(Zeroizing::new(bytes.to_vec()));
        Ok(())
    }

    fn load(&self) -> Result<Option<Zeroizing<Vec<u8>>>, IdentityError> {
        let slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        Ok(slot.clone())
    }

    fn wipe(&self) -> Result<(), IdentityError> {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        *slot = None;
        Ok(())
    }

    fn is_persistent(&self) -> bool {
        false
    }
}

/// Single-file storage.
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl IdentityStorage for FileStorage {
    fn save(&self, bytes: &[u8]) -> Result<(), IdentityError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, bytes)?;
        Ok(())
    }

    fn load(&self) -> Result<Option<Zeroizing<Vec<u8>>>, IdentityError> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(Some(Zeroizing::new(bytes))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn wipe(&self) -> Result<(), IdentityError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn is_persistent(&self) -> bool {
        true
    }
}

/// A stable reference to the identity a session started with.
#[derive(Clone, Debug)]
pub struct IdentitySnapshot {
    pub identity: Arc<Identity>,
    pub generation: u64,
}

/// Owns the active identity and its storage.
pub struct IdentityStore {
    storage: Box<dyn IdentityStorage>,
    active: RwLock<Option<Arc<Identity>>>,
    generation: AtomicU64,
}

impl IdentityStore {
    pub fn new(storage: Box<dyn IdentityStorage>) -> Self {
        Self {
            storage,
            active: RwLock::new(None),
            generation: AtomicU64::new(0),
        }
    }

    /// Store backed by process memory only.
    pub fn ephemeral() -> Self {
        Self::new(Box::new(MemoryStorage::new()))
    }

    /// Generate a fresh random identity and make it active.
    pub fn create_random(&self) -> Arc<Identity> {
        let identity = self.set_active(Identity::random());
        info!(commitment = %encode_field(&identity.commitment()), "created random identity");
        identity
    }

    /// Derive an identity from `seed` and make it active.
    pub fn derive_from_seed(&self, seed: &[u8]) -> Arc<Identity> {
        let identity = self.set_active(Identity::from_seed(seed));
        info!(commitment = %encode_field(&identity.commitment()), "derived identity from seed");
        identity
    }

    /// Replace the active identity. In-flight sessions holding a snapshot of
    /// the previous one become stale.
    pub fn set_active(&self, identity: Identity) -> Arc<Identity> {
        let identity = Arc::new(identity);
        let mut active = self.active.write().unwrap_or_else(|e| e.into_inner());
        *active = Some(identity.clone());
        self.generation.fetch_add(1, Ordering::SeqCst);
        identity
    }

    /// Write `identity` to storage; it becomes the active identity with its
    /// `persisted` flag reflecting the storage medium.
    pub fn persist(&self, identity: &Identity) -> Result<Arc<Identity>, IdentityError> {
        let bytes = identity.to_bytes()?;
        self.storage.save(&bytes)?;

        let mut stored = identity.clone();
        stored.persisted = self.storage.is_persistent();
        debug!(persistent = stored.persisted, "identity written to storage");

        let current = self.active();
        let same = current.as_deref().map(|a| a == &stored).unwrap_or(false);
        let stored = Arc::new(stored);
        let mut active = self.active.write().unwrap_or_else(|e| e.into_inner());
        *active = Some(stored.clone());
        if !same {
            self.generation.fetch_add(1, Ordering::SeqCst);
        }
        Ok(stored)
    }

    /// Load a previously persisted identity and make it active.
    ///
    /// Returns `None` when nothing was stored or the stored bytes are
    /// unreadable; this never fails.
    pub fn load(&self) -> Option<Arc<Identity>> {
        let bytes = match self.storage.load() {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "identity storage unreadable");
                return None;
            }
        };

        match Identity::from_bytes(&bytes) {
            Ok(mut identity) => {
                identity.persisted = self.storage.is_persistent();
                Some(self.set_active(identity))
            }
            Err(e) => {
                warn!(error = %e, "stored identity is corrupt, ignoring");
                None
            }
        }
    }

    /// Irreversibly erase stored material and drop the active identity.
    pub fn reset(&self) -> Result<(), IdentityError> {
        self.storage.wipe()?;
        let mut active = self.active.write().unwrap_or_else(|e| e.into_inner());
        *active = None;
        self.generation.fetch_add(1, Ordering::SeqCst);
        info!("identity reset");
        Ok(())
    }

    pub fn active(&self) -> Option<Arc<Identity>> {
        self.active.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> Option<IdentitySnapshot> {
        let active = self.active.read().unwrap_or_else(|e| e.into_inner());
        active.clone().map(|identity| IdentitySnapshot {
            identity,
            generation: self.generation(),
        })
    }

    /// Whether `snapshot` still refers to the active identity.
    pub fn is_current(&self, snapshot: &IdentitySnapshot) -> bool {
        self.generation() == snapshot.generation
    }

    /// Attach (or clear) a refreshed inclusion proof on the active identity.
    ///
    /// This does not change which identity is active, so sessions keep
    /// their snapshot valid. Persistent storage is updated in place.
    pub fn update_inclusion_proof(
        &self,
        level: CredentialType,
        proof: Option<InclusionProof>,
    ) -> Result<Option<Arc<Identity>>, IdentityError> {
        let mut active = self.active.write().unwrap_or_else(|e| e.into_inner());
        let Some(current) = active.as_ref() else {
            return Ok(None);
        };

        let mut updated = (**current).clone();
        match proof {
            Some(proof) => updated.attach_inclusion_proof(level, proof),
            None => updated.clear_inclusion_proof(level),
        }
        if updated.persisted {
            self.storage.save(&updated.to_bytes()?)?;
        }

        let updated = Arc::new(updated);
        *active = Some(updated.clone());
        Ok(Some(updated))
    }
}

impl Default for IdentityStore {
    fn default() -> Self {
        Self::ephemeral()
    }
}
