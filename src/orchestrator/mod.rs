//! Verification orchestration.
//!
//! The [`Orchestrator`] owns the clients and the proof engine and turns
//! typed results from them into the caller-visible [`VerificationStatus`].
//! Relay requests run through a [`VerificationFlow`]; session requests run
//! through [`Orchestrator::serve_next_request`]. Both share one pipeline:
//! refresh inclusion, select the credential, prove, verify, check the
//! requester.

mod cancellation;
mod flow;
mod status;

pub use cancellation::{CancellationSource, CancellationToken};
pub use flow::VerificationFlow;
pub use status::{StatusBoard, VerificationStatus};

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::bridge::{
    parse_scanned_code, BridgeCode, BridgeError, BridgeProtocol, BridgeResponse, ErrorCode, InvalidCode,
    ProofRequest, ProofResponse, RelayClient, ScanResult,
};
use crate::config::{ConfigError, SimulatorConfig};
use crate::credential::{select_credential, CredentialType};
use crate::engine::{Proof, ProofEngine};
use crate::error::{Categorized, ErrorCategory};
use crate::field::{encode_field, EncodingError};
use crate::identity::{IdentityError, IdentitySnapshot, IdentityStore};
use crate::inclusion::{InclusionError, InclusionLookup, InclusionProofClient};
use crate::merkle::InclusionProof;
use crate::metadata::{AppMetadata, MetadataClient};
use crate::prover::ProofGenerationError;
use crate::session::{PairingStatus, PairingUri, SessionError, SessionProtocol, SessionRequest, SessionTransport};

#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    #[error("invalid code: {0}")]
    InvalidCode(InvalidCode),

    #[error("no active identity")]
    NoIdentity,

    #[error("active identity changed while the request was open")]
    IdentityChanged,

    #[error("identity is not verified for any requested credential")]
    NoCredential,

    #[error("cannot verify production app {0}")]
    ProductionApp(String),

    #[error("generated proof failed verification")]
    ProofRejected,

    #[error("verification cancelled")]
    Cancelled,

    #[error("a submission is already pending")]
    AlreadyPending,

    #[error("session protocol is not enabled")]
    SessionsDisabled,

    #[error("proving task failed: {0}")]
    Task(String),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error(transparent)]
    Proof(#[from] ProofGenerationError),

    #[error(transparent)]
    Inclusion(#[from] InclusionError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Encoding(#[from] EncodingError),

    #[error(transparent)]
    Identity(#[from] IdentityError),
}

impl FlowError {
    /// Code to send the requester, `None` when nobody should be told.
    pub fn response_code(&self) -> Option<ErrorCode> {
        match self {
            FlowError::Cancelled | FlowError::InvalidCode(_) | FlowError::AlreadyPending => None,
            FlowError::Bridge(BridgeError::Relay(_)) => None,
            FlowError::Bridge(BridgeError::Crypto(_)) => Some(ErrorCode::MalformedRequest),
            FlowError::Bridge(BridgeError::Payload(e)) | FlowError::Session(SessionError::InvalidRequest(e)) => {
                Some(e.response_code())
            }
            FlowError::Session(SessionError::UnsupportedMethod(_)) => Some(ErrorCode::MalformedRequest),
            FlowError::Session(_) => None,
            _ => Some(ErrorCode::GenericError),
        }
    }
}

impl Categorized for FlowError {
    fn category(&self) -> ErrorCategory {
        match self {
            FlowError::InvalidCode(_) | FlowError::Cancelled | FlowError::AlreadyPending => ErrorCategory::Input,
            FlowError::NoIdentity | FlowError::SessionsDisabled => ErrorCategory::Config,
            FlowError::IdentityChanged | FlowError::NoCredential | FlowError::ProductionApp(_) => {
                ErrorCategory::Policy
            }
            FlowError::ProofRejected | FlowError::Task(_) => ErrorCategory::Crypto,
            FlowError::Bridge(e) => e.category(),
            FlowError::Proof(e) => e.category(),
            FlowError::Inclusion(e) => e.category(),
            FlowError::Session(e) => e.category(),
            FlowError::Encoding(e) => e.category(),
            FlowError::Identity(e) => e.category(),
        }
    }
}

/// A verified proof waiting for the user's decision.
#[derive(Debug, Clone)]
pub struct Prepared {
    pub request: ProofRequest,
    pub credential: CredentialType,
    pub proof: Proof,
    pub metadata: AppMetadata,
    /// The portal reports this nullifier as already used for the action.
    pub already_verified: bool,
}

impl Prepared {
    pub fn response(&self) -> BridgeResponse {
        BridgeResponse::Success(ProofResponse::new(&self.proof, self.credential))
    }

    pub fn decline_code(&self) -> ErrorCode {
        if self.already_verified {
            ErrorCode::MaxVerificationsReached
        } else {
            ErrorCode::VerificationRejected
        }
    }

    /// Status to show while the user decides.
    pub fn status(&self) -> VerificationStatus {
        if self.already_verified {
            VerificationStatus::Warning {
                description: self.request.description(),
            }
        } else {
            VerificationStatus::Waiting
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approve,
    Decline,
}

/// Asks the user whether to answer a prepared request.
#[async_trait]
pub trait Approver: Send + Sync {
    async fn decide(&self, prepared: &Prepared) -> Decision;
}

#[async_trait]
impl Approver for Decision {
    async fn decide(&self, _prepared: &Prepared) -> Decision {
        *self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowOutcome {
    Verified {
        credential: CredentialType,
        description: String,
    },
    Declined(ErrorCode),
}

/// What a scanned code turned into.
pub enum Scanned<'o> {
    Bridge(VerificationFlow<'o>),
    Pairing(PairingUri),
}

pub struct Orchestrator {
    config: SimulatorConfig,
    identities: Arc<IdentityStore>,
    engine: Arc<ProofEngine>,
    inclusion: InclusionProofClient,
    bridge: BridgeProtocol,
    metadata: MetadataClient,
    sessions: Option<Sessions>,
}

/// Session protocol state. Inbound events are awaited on `transport`
/// without holding `protocol`, so reset, pairing and teardown never wait
/// behind an idle server. `serving` keeps requests one at a time.
struct Sessions {
    protocol: Mutex<SessionProtocol>,
    transport: Arc<dyn SessionTransport>,
    serving: Mutex<()>,
    status: StatusBoard,
}

impl Orchestrator {
    pub fn new(
        config: SimulatorConfig,
        identities: Arc<IdentityStore>,
        engine: Arc<ProofEngine>,
    ) -> Result<Self, ConfigError> {
        if engine.tree_depth() != config.tree_depth {
            return Err(ConfigError::InvalidDepth(engine.tree_depth()));
        }
        let http = config.http_client()?;
        Ok(Self {
            inclusion: InclusionProofClient::from_config(http.clone(), &config),
            bridge: BridgeProtocol::new(RelayClient::new(http.clone())),
            metadata: MetadataClient::new(http, config.dev_portal_url.clone()),
            config,
            identities,
            engine,
            sessions: None,
        })
    }

    /// Attach a session protocol. It lives as long as the orchestrator.
    pub fn with_sessions(mut self, protocol: SessionProtocol) -> Self {
        self.sessions = Some(Sessions {
            transport: protocol.transport(),
            protocol: Mutex::new(protocol),
            serving: Mutex::new(()),
            status: StatusBoard::new(self.config.error_reset),
        });
        self
    }

    /// Status of the session request being served, if sessions are enabled.
    pub fn session_status(&self) -> Option<watch::Receiver<VerificationStatus>> {
        self.sessions.as_ref().map(|sessions| sessions.status.subscribe())
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    pub fn identities(&self) -> &Arc<IdentityStore> {
        &self.identities
    }

    pub fn engine(&self) -> &Arc<ProofEngine> {
        &self.engine
    }

    /// Parse a scanned code. Invalid text fails here, before any network call.
    pub fn scan(&self, text: &str) -> Result<Scanned<'_>, FlowError> {
        match parse_scanned_code(text, &self.config.relay_url) {
            ScanResult::Bridge(code) => self.open(code).map(Scanned::Bridge),
            ScanResult::Pairing(uri) => Ok(Scanned::Pairing(uri)),
            ScanResult::Invalid(reason) => {
                warn!(%reason, "rejected scanned code");
                Err(FlowError::InvalidCode(reason))
            }
        }
    }

    /// Start a relay flow bound to the currently active identity.
    pub fn open(&self, code: BridgeCode) -> Result<VerificationFlow<'_>, FlowError> {
        let snapshot = self.identities.snapshot().ok_or(FlowError::NoIdentity)?;
        let session = self.bridge.open(code);
        Ok(VerificationFlow::new(self, session, snapshot))
    }

    /// Wipe the identity. Open pairings belong to the old identity and are
    /// torn down; relay flows notice through the generation counter.
    pub async fn reset_identity(&self) -> Result<(), FlowError> {
        self.identities.reset()?;
        if let Some(sessions) = &self.sessions {
            sessions.protocol.lock().await.teardown().await?;
        }
        Ok(())
    }

    /// Queue the active identity for insertion at `level`.
    pub async fn register(&self, level: CredentialType) -> Result<(), FlowError> {
        let identity = self.identities.active().ok_or(FlowError::NoIdentity)?;
        self.inclusion
            .submit_for_inclusion(&identity.commitment(), level)
            .await?;
        Ok(())
    }

    /// Poll the `level` sequencer until the active identity is included or
    /// `cancel` fires. Network failures are logged and polling continues.
    pub async fn wait_for_inclusion(
        &self,
        level: CredentialType,
        mut cancel: CancellationToken,
    ) -> Result<Option<InclusionProof>, FlowError> {
        loop {
            let snapshot = self.identities.snapshot().ok_or(FlowError::NoIdentity)?;
            let commitment = snapshot.identity.commitment();

            let lookup = cancel
                .run_until_cancelled(self.inclusion.fetch_inclusion_proof(&commitment, level))
                .await;
            let Some(lookup) = lookup else {
                debug!(%level, "inclusion polling cancelled");
                return Ok(None);
            };

            match lookup {
                Ok(InclusionLookup::Found(proof)) if proof.is_included() => {
                    self.store_inclusion(&snapshot, level, Some(proof.clone()));
                    info!(%level, commitment = %encode_field(&commitment), "identity included");
                    return Ok(Some(proof));
                }
                Ok(InclusionLookup::Found(_)) => debug!(%level, "inclusion pending"),
                Ok(InclusionLookup::NotFound) => debug!(%level, "identity not included yet"),
                Err(e) if e.is_config() => return Err(e.into()),
                Err(e) => warn!(%level, error = %e, "inclusion poll failed"),
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(%level, "inclusion polling cancelled");
                    return Ok(None);
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    /// Requester-side check of a success response.
    pub fn verify_response(&self, request: &ProofRequest, response: &ProofResponse) -> Result<bool, FlowError> {
        let proof = response.to_proof(request)?;
        Ok(self.engine.verify_proof(&proof, self.engine.tree_depth()))
    }

    pub async fn connect_sessions(&self) -> Result<(), FlowError> {
        let sessions = self.sessions.as_ref().ok_or(FlowError::SessionsDisabled)?;
        sessions.protocol.lock().await.setup().await?;
        Ok(())
    }

    pub async fn disconnect_sessions(&self) -> Result<(), FlowError> {
        let sessions = self.sessions.as_ref().ok_or(FlowError::SessionsDisabled)?;
        sessions.protocol.lock().await.teardown().await?;
        Ok(())
    }

    pub async fn pair(&self, uri: PairingUri) -> Result<PairingStatus, FlowError> {
        let sessions = self.sessions.as_ref().ok_or(FlowError::SessionsDisabled)?;
        Ok(sessions.protocol.lock().await.pair(uri).await?)
    }

    /// Wait for the next session request and answer it. Proposals and
    /// deletes arriving meanwhile are handled on the way. Returns `None`
    /// once the transport closes.
    ///
    /// Progress is published on [`Orchestrator::session_status`].
    pub async fn serve_next_request(
        &self,
        approver: &dyn Approver,
        mut cancel: CancellationToken,
    ) -> Option<Result<FlowOutcome, FlowError>> {
        let Some(sessions) = &self.sessions else {
            return Some(Err(FlowError::SessionsDisabled));
        };
        let _serving = sessions.serving.lock().await;

        let request = loop {
            let event = sessions.transport.next_event().await?;
            if let Some(request) = sessions.protocol.lock().await.dispatch(event).await {
                break request;
            }
        };

        let result = self.serve_request(sessions, &request, approver, &mut cancel).await;
        if let Err(e) = &result {
            warn!(id = request.id, topic = %request.topic, error = %e, "session request failed");
            match e {
                FlowError::Cancelled => sessions.status.set(VerificationStatus::Waiting),
                FlowError::AlreadyPending => {}
                _ => sessions.status.fail(e.to_string(), e.category()),
            }
            if let Some(code) = e.response_code() {
                let protocol = sessions.protocol.lock().await;
                if let Err(send) = protocol.respond(&request, &BridgeResponse::error(code)).await {
                    warn!(id = request.id, error = %send, %code, "could not notify requester");
                }
            }
        }
        Some(result)
    }

    async fn serve_request(
        &self,
        sessions: &Sessions,
        request: &SessionRequest,
        approver: &dyn Approver,
        cancel: &mut CancellationToken,
    ) -> Result<FlowOutcome, FlowError> {
        let proof_request = sessions.protocol.lock().await.parse_request(request)?;
        let snapshot = self.identities.snapshot().ok_or(FlowError::NoIdentity)?;

        let (credential, proof) = self.build_proof(&snapshot, &proof_request, cancel).await?;
        let (metadata, already_verified) = self.check_requester(&proof_request, &proof, cancel).await?;
        let prepared = Prepared {
            request: proof_request,
            credential,
            proof,
            metadata,
            already_verified,
        };
        sessions.status.set(prepared.status());

        let decision = approver.decide(&prepared).await;
        if !sessions.status.begin() {
            return Err(FlowError::AlreadyPending);
        }
        match decision {
            Decision::Approve => {
                self.ensure_current(&snapshot)?;
                sessions.protocol.lock().await.respond(request, &prepared.response()).await?;
                let description = prepared.request.description();
                sessions.status.set(VerificationStatus::Success {
                    description: description.clone(),
                });
                Ok(FlowOutcome::Verified {
                    credential,
                    description,
                })
            }
            Decision::Decline => {
                let code = prepared.decline_code();
                sessions
                    .protocol
                    .lock()
                    .await
                    .respond(request, &BridgeResponse::error(code))
                    .await?;
                sessions.status.set(VerificationStatus::Waiting);
                Ok(FlowOutcome::Declined(code))
            }
        }
    }

    /// Refresh inclusion, pick the credential, prove and verify.
    async fn build_proof(
        &self,
        snapshot: &IdentitySnapshot,
        request: &ProofRequest,
        cancel: &mut CancellationToken,
    ) -> Result<(CredentialType, Proof), FlowError> {
        self.ensure_current(snapshot)?;
        let proofs = cancel
            .run_until_cancelled(self.refresh_inclusion(snapshot, &request.credential_types))
            .await
            .ok_or(FlowError::Cancelled)?;

        let credential = select_credential(&request.credential_types, |level| {
            proofs.get(&level).map(InclusionProof::is_included).unwrap_or(false)
        })
        .ok_or(FlowError::NoCredential)?;
        let inclusion = proofs.get(&credential).ok_or(FlowError::NoCredential)?;
        debug!(%credential, app_id = %request.app_id, "credential selected");

        let witness = self.engine.build_witness(
            &snapshot.identity,
            inclusion,
            request.external_nullifier,
            &request.signal,
        )?;

        let engine = Arc::clone(&self.engine);
        let task = tokio::task::spawn_blocking(move || engine.generate_proof(&witness));
        let Some(joined) = cancel.run_until_cancelled(task).await else {
            info!(app_id = %request.app_id, "proof generation cancelled");
            return Err(FlowError::Cancelled);
        };
        let proof = joined.map_err(|e| FlowError::Task(e.to_string()))??;

        self.ensure_current(snapshot)?;
        if !self.engine.verify_proof(&proof, self.engine.tree_depth()) {
            error!(app_id = %request.app_id, %credential, "generated proof does not verify");
            return Err(FlowError::ProofRejected);
        }
        info!(
            app_id = %request.app_id,
            %credential,
            nullifier_hash = %encode_field(&proof.nullifier_hash),
            "proof generated and verified"
        );
        Ok((credential, proof))
    }

    /// Ask the developer portal about the requester. Only a registered
    /// production app stops the flow.
    async fn check_requester(
        &self,
        request: &ProofRequest,
        proof: &Proof,
        cancel: &mut CancellationToken,
    ) -> Result<(AppMetadata, bool), FlowError> {
        let lookup = cancel
            .run_until_cancelled(self.metadata.fetch(
                &request.app_id,
                &request.action,
                &proof.nullifier_hash,
                &request.external_nullifier,
            ))
            .await
            .ok_or(FlowError::Cancelled)?;
        if lookup.is_production() {
            return Err(FlowError::ProductionApp(request.app_id.clone()));
        }
        Ok((lookup.metadata(&request.app_id), lookup.already_verified()))
    }

    /// Latest inclusion proofs for `levels`. Levels with a sequencer are
    /// refetched; a failed fetch falls back to the cached proof.
    async fn refresh_inclusion(
        &self,
        snapshot: &IdentitySnapshot,
        levels: &[CredentialType],
    ) -> BTreeMap<CredentialType, InclusionProof> {
        let commitment = snapshot.identity.commitment();
        let mut proofs = BTreeMap::new();

        for &level in levels {
            let cached = snapshot.identity.inclusion_proof(level).cloned();
            if !self.inclusion.levels().any(|l| l == level) {
                if let Some(proof) = cached {
                    proofs.insert(level, proof);
                }
                continue;
            }

            match self.inclusion.fetch_inclusion_proof(&commitment, level).await {
                Ok(InclusionLookup::Found(proof)) => {
                    self.store_inclusion(snapshot, level, Some(proof.clone()));
                    proofs.insert(level, proof);
                }
                Ok(InclusionLookup::NotFound) => {
                    self.store_inclusion(snapshot, level, None);
                }
                Err(e) => {
                    warn!(%level, error = %e, "inclusion refresh failed, using cached proof");
                    if let Some(proof) = cached {
                        proofs.insert(level, proof);
                    }
                }
            }
        }
        proofs
    }

    fn store_inclusion(&self, snapshot: &IdentitySnapshot, level: CredentialType, proof: Option<InclusionProof>) {
        if !self.identities.is_current(snapshot) {
            return;
        }
        if let Err(e) = self.identities.update_inclusion_proof(level, proof) {
            warn!(%level, error = %e, "could not store inclusion proof");
        }
    }

    fn ensure_current(&self, snapshot: &IdentitySnapshot) -> Result<(), FlowError> {
        if self.identities.is_current(snapshot) {
            Ok(())
        } else {
            Err(FlowError::IdentityChanged)
        }
    }
}
