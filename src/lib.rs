//! World ID simulator - hold an identity, prove membership without revealing it
//!
//! The simulator plays the identity holder's side of World ID:
//! - a Semaphore identity (trapdoor, nullifier, commitment)
//! - Merkle inclusion proofs fetched from per-credential sequencers
//! - Groth16 membership proofs over BN254
//! - the encrypted relay bridge and the peer-to-peer session protocol
//!
//! # Architecture
//!
//! 1. A requester publishes a code (relay URL + key) or a pairing URI
//! 2. The simulator fetches and decrypts the request
//! 3. A proof is generated locally and verified before it leaves
//! 4. The user approves, and the encrypted answer goes back to the requester

pub mod bridge;
pub mod circuit;
pub mod config;
pub mod credential;
pub mod engine;
pub mod error;
pub mod field;
pub mod identity;
pub mod inclusion;
pub mod merkle;
pub mod metadata;
pub mod orchestrator;
pub mod prover;
pub mod session;
pub mod verifier;

// Re-export main types
pub use bridge::{parse_scanned_code, BridgeCode, BridgeProtocol, BridgeResponse, ProofRequest, ScanResult};
pub use config::SimulatorConfig;
pub use credential::CredentialType;
pub use engine::{PackedProof, Proof, ProofEngine};
pub use error::{Categorized, ErrorCategory, SimulatorError};
pub use identity::{Identity, IdentityStore};
pub use inclusion::InclusionProofClient;
pub use orchestrator::{Orchestrator, VerificationFlow, VerificationStatus};
pub use prover::Prover;
pub use session::SessionProtocol;
pub use verifier::Verifier;
