//! Encrypted request/response exchange through the relay.

pub mod code;
pub mod crypto;
pub mod payload;
pub mod relay;
pub mod state;

pub use code::{parse_scanned_code, BridgeCode, InvalidCode, ScanResult};
pub use crypto::{BridgeKey, CryptoError, EncryptedPayload};
pub use payload::{BridgeInitialData, BridgeResponse, ErrorCode, PayloadError, ProofRequest, ProofResponse};
pub use relay::{RelayClient, RelayError};
pub use state::{BridgeSession, BridgeState, Failure};

use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("illegal bridge transition {from} -> {to}")]
    IllegalTransition { from: BridgeState, to: BridgeState },

    #[error("cannot dismiss a request in state {0}")]
    NotDismissable(BridgeState),

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Payload(#[from] PayloadError),

    #[error("failed to serialize response: {0}")]
    Serialization(String),
}

/// Drives [`BridgeSession`]s against a relay.
#[derive(Debug, Clone)]
pub struct BridgeProtocol {
    relay: RelayClient,
}

impl BridgeProtocol {
    pub fn new(relay: RelayClient) -> Self {
        Self { relay }
    }

    pub fn open(&self, code: BridgeCode) -> BridgeSession {
        info!(request_id = %code.request_id, relay = %code.relay_url, "bridge session opened");
        BridgeSession::new(code.request_id, code.relay_url, code.key)
    }

    /// Fetch, decrypt and validate the request. Leaves the session in
    /// `ProofReady` on success and `Failed` otherwise.
    ///
    /// A relay failure is not reported back (there is nobody to tell). A
    /// decrypt or parse failure is answered with `malformed_request` first,
    /// a request naming no usable credential with `generic_error`.
    pub async fn fetch_request(&self, session: &mut BridgeSession) -> Result<ProofRequest, BridgeError> {
        let message = match self.relay.get_request(session.relay_url(), session.request_id()).await {
            Ok(message) => message,
            Err(e) => {
                warn!(request_id = %session.request_id(), error = %e, "relay fetch failed");
                session.fail(e.to_string(), None)?;
                return Err(e.into());
            }
        };
        session.advance(BridgeState::RequestReceived)?;

        let request = crypto::decrypt(session.key(), &message)
            .map_err(BridgeError::from)
            .and_then(|plaintext| ProofRequest::from_json(&plaintext).map_err(BridgeError::from));

        match request {
            Ok(request) => {
                session.advance(BridgeState::ProofReady)?;
                info!(
                    request_id = %session.request_id(),
                    app_id = %request.app_id,
                    action = %request.action,
                    "bridge request received"
                );
                Ok(request)
            }
            Err(e) => {
                let code = match &e {
                    BridgeError::Payload(payload) => payload.response_code(),
                    _ => ErrorCode::MalformedRequest,
                };
                warn!(request_id = %session.request_id(), error = %e, %code, "bridge request refused");
                self.fail(session, code, e.to_string()).await?;
                Err(e)
            }
        }
    }

    /// Answer an approved or declined request. Only legal from
    /// `AwaitingApproval`; once started it runs to `Completed` or `Failed`.
    pub async fn respond(&self, session: &mut BridgeSession, response: &BridgeResponse) -> Result<(), BridgeError> {
        session.advance(BridgeState::Responding)?;

        match self.send(session, response).await {
            Ok(()) => {
                session.advance(BridgeState::Completed)?;
                info!(
                    request_id = %session.request_id(),
                    error_code = ?response.error_code(),
                    "bridge response delivered"
                );
                Ok(())
            }
            Err(e) => {
                warn!(request_id = %session.request_id(), error = %e, "bridge response failed");
                session.fail(e.to_string(), None)?;
                Err(e)
            }
        }
    }

    /// Tell the requester why the flow stopped, then mark the session
    /// `Failed`. Delivery is best effort.
    pub async fn fail(
        &self,
        session: &mut BridgeSession,
        code: ErrorCode,
        reason: impl Into<String>,
    ) -> Result<(), BridgeError> {
        let reason = reason.into();
        let notified = match self.send(session, &BridgeResponse::error(code)).await {
            Ok(()) => Some(code),
            Err(e) => {
                warn!(request_id = %session.request_id(), error = %e, %code, "could not notify requester");
                None
            }
        };
        warn!(request_id = %session.request_id(), %code, reason = %reason, "bridge session failed");
        session.fail(reason, notified)
    }

    /// Abandon the request without answering it.
    pub fn dismiss(&self, session: &mut BridgeSession) -> Result<(), BridgeError> {
        if !session.state().is_dismissable() {
            return Err(BridgeError::NotDismissable(session.state()));
        }
        info!(request_id = %session.request_id(), state = %session.state(), "bridge session dismissed");
        session.fail("dismissed", None)
    }

    async fn send(&self, session: &BridgeSession, response: &BridgeResponse) -> Result<(), BridgeError> {
        let json = zeroize::Zeroizing::new(
            serde_json::to_vec(response).map_err(|e| BridgeError::Serialization(e.to_string()))?,
        );
        let message = crypto::encrypt(session.key(), &json)?;
        self.relay
            .put_response(session.relay_url(), session.request_id(), &message)
            .await?;
        Ok(())
    }
}
