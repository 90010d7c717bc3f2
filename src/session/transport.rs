//! Session transport seam and an in-memory implementation.

use async_trait::async_trait;
use rand::{rngs::OsRng, RngCore};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, Mutex};

use super::pairing::PairingUri;
use super::{Namespace, RejectReason, RpcResponse, SessionError, SessionEvent};

const CHANNEL_CAPACITY: usize = 256;

/// Operations the session protocol needs from the network layer.
#[async_trait]
pub trait SessionTransport: Send + Sync {
    async fn connect(&self) -> Result<(), SessionError>;

    async fn disconnect(&self) -> Result<(), SessionError>;

    async fn pair(&self, uri: &PairingUri) -> Result<(), SessionError>;

    async fn activate_pairing(&self, topic: &str) -> Result<(), SessionError>;

    async fn delete_pairing(&self, topic: &str) -> Result<(), SessionError>;

    /// Approve a proposal. Returns the new session topic.
    async fn approve_session(
        &self,
        proposal_id: u64,
        namespaces: &BTreeMap<String, Namespace>,
    ) -> Result<String, SessionError>;

    async fn reject_session(&self, proposal_id: u64, reason: &RejectReason) -> Result<(), SessionError>;

    async fn respond(&self, topic: &str, response: &RpcResponse) -> Result<(), SessionError>;

    async fn disconnect_session(&self, topic: &str, reason: &RejectReason) -> Result<(), SessionError>;

    /// Next inbound event, `None` once the transport is closed.
    async fn next_event(&self) -> Option<SessionEvent>;
}

/// What the simulator sent to its peer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Paired { topic: String },
    PairingActivated { topic: String },
    PairingDeleted { topic: String },
    Approved {
        proposal_id: u64,
        session_topic: String,
        namespaces: BTreeMap<String, Namespace>,
    },
    Rejected { proposal_id: u64, reason: RejectReason },
    Response { topic: String, response: RpcResponse },
    SessionDeleted { topic: String, reason: RejectReason },
}

/// Transport backed by in-process channels. The paired [`ChannelPeer`]
/// plays the requester.
pub struct ChannelTransport {
    connected: AtomicBool,
    events: Mutex<mpsc::Receiver<SessionEvent>>,
    outbound: mpsc::Sender<Outbound>,
}

/// Requester side of a [`ChannelTransport`].
pub struct ChannelPeer {
    events: mpsc::Sender<SessionEvent>,
    outbound: Mutex<mpsc::Receiver<Outbound>>,
}

impl ChannelTransport {
    pub fn pair() -> (Self, ChannelPeer) {
        let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        (
            Self {
                connected: AtomicBool::new(false),
                events: Mutex::new(event_rx),
                outbound: outbound_tx,
            },
            ChannelPeer {
                events: event_tx,
                outbound: Mutex::new(outbound_rx),
            },
        )
    }

    async fn send(&self, message: Outbound) -> Result<(), SessionError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SessionError::NotConnected);
        }
        self.outbound
            .send(message)
            .await
            .map_err(|_| SessionError::Transport("peer went away".into()))
    }
}

#[async_trait]
impl SessionTransport for ChannelTransport {
    async fn connect(&self) -> Result<(), SessionError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), SessionError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn pair(&self, uri: &PairingUri) -> Result<(), SessionError> {
        self.send(Outbound::Paired {
            topic: uri.topic.clone(),
        })
        .await
    }

    async fn activate_pairing(&self, topic: &str) -> Result<(), SessionError> {
        self.send(Outbound::PairingActivated { topic: topic.into() }).await
    }

    async fn delete_pairing(&self, topic: &str) -> Result<(), SessionError> {
        self.send(Outbound::PairingDeleted { topic: topic.into() }).await
    }

    async fn approve_session(
        &self,
        proposal_id: u64,
        namespaces: &BTreeMap<String, Namespace>,
    ) -> Result<String, SessionError> {
        let mut raw = [0u8; 32];
        OsRng.fill_bytes(&mut raw);
        let session_topic = hex::encode(raw);

        self.send(Outbound::Approved {
            proposal_id,
            session_topic: session_topic.clone(),
            namespaces: namespaces.clone(),
        })
        .await?;
        Ok(session_topic)
    }

    async fn reject_session(&self, proposal_id: u64, reason: &RejectReason) -> Result<(), SessionError> {
        self.send(Outbound::Rejected {
            proposal_id,
            reason: reason.clone(),
        })
        .await
    }

    async fn respond(&self, topic: &str, response: &RpcResponse) -> Result<(), SessionError> {
        self.send(Outbound::Response {
            topic: topic.into(),
            response: response.clone(),
        })
        .await
    }

    async fn disconnect_session(&self, topic: &str, reason: &RejectReason) -> Result<(), SessionError> {
        self.send(Outbound::SessionDeleted {
            topic: topic.into(),
            reason: reason.clone(),
        })
        .await
    }

    async fn next_event(&self) -> Option<SessionEvent> {
        self.events.lock().await.recv().await
    }
}

impl ChannelPeer {
    /// Deliver an event to the simulator.
    pub async fn emit(&self, event: SessionEvent) -> Result<(), SessionError> {
        self.events
            .send(event)
            .await
            .map_err(|_| SessionError::Transport("simulator went away".into()))
    }

    /// Next message the simulator sent, `None` once it is gone.
    pub async fn next_outbound(&self) -> Option<Outbound> {
        self.outbound.lock().await.recv().await
    }
}
