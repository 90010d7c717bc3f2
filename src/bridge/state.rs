//! Per-request bridge state machine.

use serde::Serialize;
use std::fmt;
use tracing::debug;
use url::Url;

use super::crypto::BridgeKey;
use super::payload::ErrorCode;
use super::BridgeError;

/// Lifecycle of one relay request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BridgeState {
    AwaitingRequest,
    RequestReceived,
    ProofReady,
    MetadataReady,
    AwaitingApproval,
    Responding,
    Completed,
    Failed,
}

impl BridgeState {
    pub fn is_terminal(self) -> bool {
        matches!(self, BridgeState::Completed | BridgeState::Failed)
    }

    /// Whether the flow may still be abandoned without answering the relay.
    pub fn is_dismissable(self) -> bool {
        !self.is_terminal() && self != BridgeState::Responding
    }

    /// Legal successor states.
    pub fn successors(self) -> &'static [BridgeState] {
        use BridgeState::*;
        match self {
            AwaitingRequest => &[RequestReceived, Failed],
            RequestReceived => &[ProofReady, Failed],
            ProofReady => &[MetadataReady, Failed],
            MetadataReady => &[AwaitingApproval, Failed],
            AwaitingApproval => &[Responding, Failed],
            Responding => &[Completed, Failed],
            Completed | Failed => &[],
        }
    }

    pub fn can_transition_to(self, next: BridgeState) -> bool {
        self.successors().contains(&next)
    }
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Why a session ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    /// State the session was in when it failed.
    pub at: BridgeState,
    pub reason: String,
    /// Error code delivered to the requester, if any was sent.
    pub notified: Option<ErrorCode>,
}

/// One relay request: where to reach it, how to read it, where it stands.
#[derive(Debug)]
pub struct BridgeSession {
    request_id: String,
    relay_url: Url,
    key: BridgeKey,
    state: BridgeState,
    failure: Option<Failure>,
}

impl BridgeSession {
    pub fn new(request_id: String, relay_url: Url, key: BridgeKey) -> Self {
        Self {
            request_id,
            relay_url,
            key,
            state: BridgeState::AwaitingRequest,
            failure: None,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn relay_url(&self) -> &Url {
        &self.relay_url
    }

    pub fn key(&self) -> &BridgeKey {
        &self.key
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    pub fn failure(&self) -> Option<&Failure> {
        self.failure.as_ref()
    }

    /// Move to `next`, rejecting anything outside the transition table.
    pub fn advance(&mut self, next: BridgeState) -> Result<(), BridgeError> {
        if !self.state.can_transition_to(next) {
            return Err(BridgeError::IllegalTransition {
                from: self.state,
                to: next,
            });
        }
        debug!(request_id = %self.request_id, from = %self.state, to = %next, "bridge transition");
        self.state = next;
        Ok(())
    }

    /// Move to `Failed`, recording why.
    pub fn fail(&mut self, reason: impl Into<String>, notified: Option<ErrorCode>) -> Result<(), BridgeError> {
        let at = self.state;
        self.advance(BridgeState::Failed)?;
        self.failure = Some(Failure {
            at,
            reason: reason.into(),
            notified,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> BridgeSession {
        BridgeSession::new(
            "req-1".into(),
            "https://bridge.example".parse().unwrap(),
            BridgeKey::generate(),
        )
    }

    #[test]
    fn test_awaiting_request_successors() {
        assert_eq!(
            BridgeState::AwaitingRequest.successors(),
            &[BridgeState::RequestReceived, BridgeState::Failed]
        );
    }

    #[test]
    fn test_skipping_to_responding_is_rejected() {
        let mut s = session();
        let err = s.advance(BridgeState::Responding).unwrap_err();
        assert!(matches!(
            err,
            BridgeError::IllegalTransition {
                from: BridgeState::AwaitingRequest,
                to: BridgeState::Responding
            }
        ));
        assert_eq!(s.state(), BridgeState::AwaitingRequest);
    }

    #[test]
    fn test_full_happy_path() {
        let mut s = session();
        for next in [
            BridgeState::RequestReceived,
            BridgeState::ProofReady,
            BridgeState::MetadataReady,
            BridgeState::AwaitingApproval,
            BridgeState::Responding,
            BridgeState::Completed,
        ] {
            s.advance(next).unwrap();
        }
        assert!(s.state().is_terminal());
        assert!(s.advance(BridgeState::Failed).is_err());
    }

    #[test]
    fn test_fail_records_origin() {
        let mut s = session();
        s.advance(BridgeState::RequestReceived).unwrap();
        s.fail("bad tag", Some(ErrorCode::MalformedRequest)).unwrap();

        let failure = s.failure().unwrap();
        assert_eq!(failure.at, BridgeState::RequestReceived);
        assert_eq!(failure.notified, Some(ErrorCode::MalformedRequest));
        assert!(s.fail("again", None).is_err());
    }

    #[test]
    fn test_dismissable_states() {
        assert!(BridgeState::AwaitingApproval.is_dismissable());
        assert!(BridgeState::ProofReady.is_dismissable());
        assert!(!BridgeState::Responding.is_dismissable());
        assert!(!BridgeState::Completed.is_dismissable());
    }
}
