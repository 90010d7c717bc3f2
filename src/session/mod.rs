//! Peer-to-peer session protocol.
//!
//! A requester shares a pairing URI, proposes a session over the pairing and
//! then sends `world_id_v1` requests on the session topic. Requests carry the
//! same payload as relay requests and are validated into the same
//! [`ProofRequest`]; responses mirror [`BridgeResponse`].

pub mod pairing;
pub mod transport;

pub use pairing::{PairingUri, PAIRING_VERSION};
pub use transport::{ChannelPeer, ChannelTransport, Outbound, SessionTransport};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

use crate::bridge::{BridgeInitialData, BridgeResponse, ErrorCode, PayloadError, ProofRequest};

pub const NAMESPACE: &str = "eip155";
pub const CHAIN_ID: &str = "eip155:480";
pub const METHOD: &str = "world_id_v1";
pub const ACCOUNT: &str = "eip155:480:0x0000000000000000000000000000000000000000";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SessionError {
    #[error("invalid pairing URI: {0}")]
    InvalidUri(String),

    #[error("unsupported pairing version {0}")]
    UnsupportedVersion(u8),

    #[error("pairing has expired")]
    Expired,

    #[error("session protocol is not set up")]
    NotConnected,

    #[error("unknown pairing {0}")]
    UnknownPairing(String),

    #[error("unknown session {0}")]
    UnknownSession(String),

    #[error("unsupported method {0}")]
    UnsupportedMethod(String),

    #[error("invalid session request: {0}")]
    InvalidRequest(#[from] PayloadError),

    #[error("failed to encode response: {0}")]
    Serialization(String),

    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    pub chains: Vec<String>,
    pub methods: Vec<String>,
    pub events: Vec<String>,
    pub accounts: Vec<String>,
}

impl Namespace {
    /// The only namespace this simulator will ever approve.
    pub fn supported() -> Self {
        Self {
            chains: vec![CHAIN_ID.into()],
            methods: vec![METHOD.into()],
            events: Vec::new(),
            accounts: vec![ACCOUNT.into()],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceRequirement {
    #[serde(default)]
    pub chains: Vec<String>,
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub events: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerMetadata {
    pub name: String,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionProposal {
    pub id: u64,
    pub pairing_topic: String,
    pub proposer: PeerMetadata,
    #[serde(default)]
    pub required_namespaces: BTreeMap<String, NamespaceRequirement>,
    #[serde(default)]
    pub optional_namespaces: BTreeMap<String, NamespaceRequirement>,
}

impl SessionProposal {
    /// Every required namespace fits inside [`Namespace::supported`].
    /// Optional namespaces never block approval.
    pub fn is_supported(&self) -> bool {
        self.required_namespaces.iter().all(|(key, req)| {
            let chains_ok = match key.as_str() {
                NAMESPACE => req.chains.iter().all(|c| c == CHAIN_ID),
                CHAIN_ID => req.chains.is_empty() || req.chains.iter().all(|c| c == CHAIN_ID),
                _ => false,
            };
            chains_ok && req.methods.iter().all(|m| m == METHOD) && req.events.is_empty()
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRequest {
    pub id: u64,
    pub topic: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Proposal(SessionProposal),
    Request(SessionRequest),
    Delete { topic: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectReason {
    pub code: i64,
    pub message: String,
}

impl RejectReason {
    pub fn unsupported_methods() -> Self {
        Self {
            code: 5002,
            message: "User rejected methods.".into(),
        }
    }

    /// The proposal names a pairing this side never created.
    pub fn unknown_pairing() -> Self {
        Self {
            code: 5000,
            message: "User rejected.".into(),
        }
    }

    pub fn user_disconnected() -> Self {
        Self {
            code: 6000,
            message: "User disconnected.".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RpcOutcome {
    Result(serde_json::Value),
    Error(JsonRpcError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: u64,
    pub jsonrpc: String,
    #[serde(flatten)]
    pub outcome: RpcOutcome,
}

impl RpcResponse {
    pub fn from_bridge(id: u64, response: &BridgeResponse) -> Result<Self, SessionError> {
        let outcome = match response {
            BridgeResponse::Success(proof) => RpcOutcome::Result(
                serde_json::to_value(proof).map_err(|e| SessionError::Serialization(e.to_string()))?,
            ),
            BridgeResponse::Error(e) => RpcOutcome::Error(JsonRpcError {
                code: match e.error_code {
                    ErrorCode::VerificationRejected => 5000,
                    _ => -32000,
                },
                message: e.error_code.as_str().to_string(),
            }),
        };
        Ok(Self {
            id,
            jsonrpc: "2.0".into(),
            outcome,
        })
    }

    /// Error code carried by an error response, if it is one we know.
    pub fn error_code(&self) -> Option<ErrorCode> {
        match &self.outcome {
            RpcOutcome::Error(e) => serde_json::from_value(serde_json::Value::String(e.message.clone())).ok(),
            RpcOutcome::Result(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Pairing {
    pub uri: PairingUri,
    pub active: bool,
    pub sessions: BTreeSet<String>,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub topic: String,
    pub pairing_topic: String,
    pub peer: PeerMetadata,
    pub namespaces: BTreeMap<String, Namespace>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingStatus {
    Created,
    Activated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProposalOutcome {
    Approved { topic: String },
    Rejected(RejectReason),
}

/// Pairings and sessions of one orchestrator, over one transport.
pub struct SessionProtocol {
    transport: Arc<dyn SessionTransport>,
    pairings: HashMap<String, Pairing>,
    sessions: HashMap<String, Session>,
    connected: bool,
}

impl SessionProtocol {
    pub fn new(transport: Box<dyn SessionTransport>) -> Self {
        Self {
            transport: Arc::from(transport),
            pairings: HashMap::new(),
            sessions: HashMap::new(),
            connected: false,
        }
    }

    /// Shared handle on the transport. Waiting for inbound events through
    /// it does not need the protocol itself.
    pub fn transport(&self) -> Arc<dyn SessionTransport> {
        Arc::clone(&self.transport)
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn pairing(&self, topic: &str) -> Option<&Pairing> {
        self.pairings.get(topic)
    }

    pub fn session(&self, topic: &str) -> Option<&Session> {
        self.sessions.get(topic)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub async fn setup(&mut self) -> Result<(), SessionError> {
        if self.connected {
            return Ok(());
        }
        self.transport.connect().await?;
        self.connected = true;
        info!("session protocol ready");
        Ok(())
    }

    /// Disconnect every session, forget every pairing and close the transport.
    pub async fn teardown(&mut self) -> Result<(), SessionError> {
        if !self.connected {
            return Ok(());
        }
        let reason = RejectReason::user_disconnected();
        for topic in self.sessions.keys() {
            if let Err(e) = self.transport.disconnect_session(topic, &reason).await {
                warn!(topic = %topic, error = %e, "session disconnect failed");
            }
        }
        for topic in self.pairings.keys() {
            if let Err(e) = self.transport.delete_pairing(topic).await {
                warn!(topic = %topic, error = %e, "pairing delete failed");
            }
        }
        self.sessions.clear();
        self.pairings.clear();
        self.transport.disconnect().await?;
        self.connected = false;
        info!("session protocol torn down");
        Ok(())
    }

    pub async fn pair(&mut self, uri: PairingUri) -> Result<PairingStatus, SessionError> {
        self.pair_at(uri, unix_now()).await
    }

    /// Activate a known pairing or create a new one. An expired pairing is
    /// dropped instead.
    pub async fn pair_at(&mut self, uri: PairingUri, now: u64) -> Result<PairingStatus, SessionError> {
        self.ensure_connected()?;
        let topic = uri.topic.clone();

        if uri.is_expired(now) {
            if self.pairings.remove(&topic).is_some() {
                if let Err(e) = self.transport.delete_pairing(&topic).await {
                    warn!(topic = %topic, error = %e, "pairing delete failed");
                }
            }
            warn!(topic = %topic, "pairing expired");
            return Err(SessionError::Expired);
        }

        if let Some(existing) = self.pairings.get_mut(&topic) {
            self.transport.activate_pairing(&topic).await?;
            existing.active = true;
            existing.uri = uri;
            info!(topic = %topic, "pairing activated");
            return Ok(PairingStatus::Activated);
        }

        self.transport.pair(&uri).await?;
        self.pairings.insert(
            topic.clone(),
            Pairing {
                uri,
                active: true,
                sessions: BTreeSet::new(),
            },
        );
        info!(topic = %topic, "pairing created");
        Ok(PairingStatus::Created)
    }

    /// Approve a proposal with the supported namespace. Unsupported
    /// proposals are rejected with "user rejected methods", proposals over
    /// an unknown pairing with "user rejected".
    pub async fn handle_proposal(&mut self, proposal: &SessionProposal) -> Result<ProposalOutcome, SessionError> {
        self.ensure_connected()?;

        if !proposal.is_supported() {
            let reason = RejectReason::unsupported_methods();
            self.transport.reject_session(proposal.id, &reason).await?;
            warn!(
                proposal_id = proposal.id,
                proposer = %proposal.proposer.name,
                "session proposal rejected"
            );
            return Ok(ProposalOutcome::Rejected(reason));
        }
        if !self.pairings.contains_key(&proposal.pairing_topic) {
            let reason = RejectReason::unknown_pairing();
            self.transport.reject_session(proposal.id, &reason).await?;
            warn!(
                proposal_id = proposal.id,
                pairing = %proposal.pairing_topic,
                "session proposal for unknown pairing rejected"
            );
            return Ok(ProposalOutcome::Rejected(reason));
        }

        let namespaces = BTreeMap::from([(NAMESPACE.to_string(), Namespace::supported())]);
        let topic = self.transport.approve_session(proposal.id, &namespaces).await?;

        if let Some(pairing) = self.pairings.get_mut(&proposal.pairing_topic) {
            pairing.sessions.insert(topic.clone());
        }
        self.sessions.insert(
            topic.clone(),
            Session {
                topic: topic.clone(),
                pairing_topic: proposal.pairing_topic.clone(),
                peer: proposal.proposer.clone(),
                namespaces,
            },
        );
        info!(
            proposal_id = proposal.id,
            proposer = %proposal.proposer.name,
            session = %topic,
            "session approved"
        );
        Ok(ProposalOutcome::Approved { topic })
    }

    /// Validate a session request into a [`ProofRequest`].
    pub fn parse_request(&self, request: &SessionRequest) -> Result<ProofRequest, SessionError> {
        if !self.sessions.contains_key(&request.topic) {
            return Err(SessionError::UnknownSession(request.topic.clone()));
        }
        if request.method != METHOD {
            return Err(SessionError::UnsupportedMethod(request.method.clone()));
        }

        let raw = match &request.params {
            serde_json::Value::Array(items) => items.first().cloned().ok_or(PayloadError::MissingField("params"))?,
            other => other.clone(),
        };
        let data: BridgeInitialData =
            serde_json::from_value(raw).map_err(|e| PayloadError::InvalidJson(e.to_string()))?;
        let parsed = ProofRequest::from_initial_data(data)?;
        debug!(id = request.id, topic = %request.topic, app_id = %parsed.app_id, "session request parsed");
        Ok(parsed)
    }

    pub async fn respond(&self, request: &SessionRequest, response: &BridgeResponse) -> Result<(), SessionError> {
        self.ensure_connected()?;
        if !self.sessions.contains_key(&request.topic) {
            return Err(SessionError::UnknownSession(request.topic.clone()));
        }
        let rpc = RpcResponse::from_bridge(request.id, response)?;
        self.transport.respond(&request.topic, &rpc).await?;
        info!(
            id = request.id,
            topic = %request.topic,
            error_code = ?response.error_code(),
            "session response sent"
        );
        Ok(())
    }

    /// Remote-initiated delete. Removes the session and every pairing
    /// linked to it. Returns whether anything was known under `topic`.
    pub async fn handle_delete(&mut self, topic: &str) -> bool {
        let mut pairing_topics = Vec::new();
        let mut found = false;

        if let Some(session) = self.sessions.remove(topic) {
            found = true;
            pairing_topics.push(session.pairing_topic);
        }
        if self.pairings.contains_key(topic) {
            pairing_topics.push(topic.to_string());
        }

        for pairing_topic in pairing_topics {
            if let Some(pairing) = self.pairings.remove(&pairing_topic) {
                found = true;
                for session in &pairing.sessions {
                    self.sessions.remove(session);
                }
                if let Err(e) = self.transport.delete_pairing(&pairing_topic).await {
                    warn!(topic = %pairing_topic, error = %e, "pairing delete failed");
                }
            }
        }

        if found {
            info!(topic, "session deleted");
        } else {
            debug!(topic, "delete for unknown topic");
        }
        found
    }

    /// Local disconnect of one session, with the same cascade as a remote one.
    pub async fn disconnect(&mut self, topic: &str) -> Result<(), SessionError> {
        self.ensure_connected()?;
        if !self.sessions.contains_key(topic) {
            return Err(SessionError::UnknownSession(topic.to_string()));
        }
        self.transport
            .disconnect_session(topic, &RejectReason::user_disconnected())
            .await?;
        self.handle_delete(topic).await;
        Ok(())
    }

    pub async fn next_event(&self) -> Option<SessionEvent> {
        self.transport.next_event().await
    }

    /// Handle proposals and deletes until a request arrives.
    pub async fn next_request(&mut self) -> Option<SessionRequest> {
        loop {
            let event = self.next_event().await?;
            if let Some(request) = self.dispatch(event).await {
                return Some(request);
            }
        }
    }

    /// Apply a lifecycle event. Requests are handed back to the caller.
    pub async fn dispatch(&mut self, event: SessionEvent) -> Option<SessionRequest> {
        match event {
            SessionEvent::Proposal(proposal) => {
                if let Err(e) = self.handle_proposal(&proposal).await {
                    warn!(proposal_id = proposal.id, error = %e, "proposal handling failed");
                }
                None
            }
            SessionEvent::Delete { topic } => {
                self.handle_delete(&topic).await;
                None
            }
            SessionEvent::Request(request) => Some(request),
        }
    }

    fn ensure_connected(&self) -> Result<(), SessionError> {
        if self.connected {
            Ok(())
        } else {
            Err(SessionError::NotConnected)
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
