//! One relay request from scanned code to answer.

use tokio::sync::watch;
use tracing::{info, warn};

use super::{Approver, CancellationToken, Decision, FlowError, FlowOutcome, Orchestrator, Prepared};
use super::{StatusBoard, VerificationStatus};
use crate::bridge::{BridgeError, BridgeResponse, BridgeSession, BridgeState};
use crate::error::Categorized;
use crate::identity::IdentitySnapshot;

/// Drives one [`BridgeSession`] and publishes its [`VerificationStatus`].
///
/// The flow is bound to the identity that was active when it was opened.
/// If that identity is replaced or wiped before the answer goes out, the
/// requester gets `generic_error` instead of a proof.
pub struct VerificationFlow<'o> {
    orchestrator: &'o Orchestrator,
    session: BridgeSession,
    snapshot: IdentitySnapshot,
    status: StatusBoard,
    prepared: Option<Prepared>,
}

impl<'o> VerificationFlow<'o> {
    pub(super) fn new(orchestrator: &'o Orchestrator, session: BridgeSession, snapshot: IdentitySnapshot) -> Self {
        Self {
            status: StatusBoard::new(orchestrator.config.error_reset),
            orchestrator,
            session,
            snapshot,
            prepared: None,
        }
    }

    pub fn session(&self) -> &BridgeSession {
        &self.session
    }

    pub fn state(&self) -> BridgeState {
        self.session.state()
    }

    pub fn status(&self) -> watch::Receiver<VerificationStatus> {
        self.status.subscribe()
    }

    pub fn current_status(&self) -> VerificationStatus {
        self.status.current()
    }

    pub fn prepared(&self) -> Option<&Prepared> {
        self.prepared.as_ref()
    }

    /// Fetch the request, build and verify the proof and look up the
    /// requester, ending in `AwaitingApproval`. Any failure leaves the
    /// session `Failed`; the requester is told why unless the relay itself
    /// failed or the flow was cancelled.
    pub async fn prepare(&mut self, mut cancel: CancellationToken) -> Result<&Prepared, FlowError> {
        let orchestrator = self.orchestrator;

        let fetched = cancel
            .run_until_cancelled(orchestrator.bridge.fetch_request(&mut self.session))
            .await;
        let request = match fetched {
            None => {
                info!(request_id = %self.session.request_id(), "request fetch cancelled");
                return Err(self.abort(FlowError::Cancelled).await);
            }
            Some(Ok(request)) => request,
            Some(Err(e)) => {
                let e = FlowError::from(e);
                self.status.fail(e.to_string(), e.category());
                return Err(e);
            }
        };

        let (credential, proof) = match orchestrator.build_proof(&self.snapshot, &request, &mut cancel).await {
            Ok(built) => built,
            Err(e) => return Err(self.abort(e).await),
        };
        self.session.advance(BridgeState::MetadataReady)?;

        let (metadata, already_verified) = match orchestrator.check_requester(&request, &proof, &mut cancel).await {
            Ok(requester) => requester,
            Err(e) => return Err(self.abort(e).await),
        };
        self.session.advance(BridgeState::AwaitingApproval)?;

        let prepared = Prepared {
            request,
            credential,
            proof,
            metadata,
            already_verified,
        };
        if already_verified {
            warn!(request_id = %self.session.request_id(), "nullifier already used for this action");
        }
        self.status.set(prepared.status());
        info!(
            request_id = %self.session.request_id(),
            app = %prepared.metadata.name,
            %credential,
            "awaiting approval"
        );
        Ok(&*self.prepared.insert(prepared))
    }

    /// Send the proof.
    pub async fn approve(&mut self) -> Result<FlowOutcome, FlowError> {
        let (response, credential, description) = match &self.prepared {
            Some(prepared) => (prepared.response(), prepared.credential, prepared.request.description()),
            None => return Err(self.not_prepared()),
        };
        if !self.status.begin() {
            return Err(FlowError::AlreadyPending);
        }
        if !self.orchestrator.identities.is_current(&self.snapshot) {
            return Err(self.abort(FlowError::IdentityChanged).await);
        }

        match self.orchestrator.bridge.respond(&mut self.session, &response).await {
            Ok(()) => {
                self.status.set(VerificationStatus::Success {
                    description: description.clone(),
                });
                Ok(FlowOutcome::Verified {
                    credential,
                    description,
                })
            }
            Err(e) => {
                let e = FlowError::from(e);
                self.status.fail(e.to_string(), e.category());
                Err(e)
            }
        }
    }

    /// Refuse the request. Declining past an already-verified warning
    /// reports `max_verifications_reached`.
    pub async fn decline(&mut self) -> Result<FlowOutcome, FlowError> {
        let code = match &self.prepared {
            Some(prepared) => prepared.decline_code(),
            None => return Err(self.not_prepared()),
        };
        if !self.status.begin() {
            return Err(FlowError::AlreadyPending);
        }
        if let Err(e) = self
            .orchestrator
            .bridge
            .respond(&mut self.session, &BridgeResponse::error(code))
            .await
        {
            let e = FlowError::from(e);
            self.status.fail(e.to_string(), e.category());
            return Err(e);
        }
        self.status.set(VerificationStatus::Waiting);
        Ok(FlowOutcome::Declined(code))
    }

    /// Abandon the request without answering.
    pub fn dismiss(&mut self) -> Result<(), FlowError> {
        self.orchestrator.bridge.dismiss(&mut self.session)?;
        self.status.set(VerificationStatus::Waiting);
        Ok(())
    }

    /// Prepare, ask `approver`, then answer.
    pub async fn run(&mut self, approver: &dyn Approver, cancel: CancellationToken) -> Result<FlowOutcome, FlowError> {
        let decision = {
            let prepared = self.prepare(cancel).await?;
            approver.decide(prepared).await
        };
        match decision {
            Decision::Approve => self.approve().await,
            Decision::Decline => self.decline().await,
        }
    }

    async fn abort(&mut self, e: FlowError) -> FlowError {
        let orchestrator = self.orchestrator;
        let bridge = &orchestrator.bridge;
        match e.response_code() {
            Some(code) => {
                if let Err(fail) = bridge.fail(&mut self.session, code, e.to_string()).await {
                    warn!(request_id = %self.session.request_id(), error = %fail, "could not close session");
                }
            }
            None if self.session.state().is_dismissable() => {
                if let Err(fail) = bridge.dismiss(&mut self.session) {
                    warn!(request_id = %self.session.request_id(), error = %fail, "could not close session");
                }
            }
            None => {}
        }

        if matches!(e, FlowError::Cancelled) {
            self.status.set(VerificationStatus::Waiting);
        } else {
            self.status.fail(e.to_string(), e.category());
        }
        e
    }

    fn not_prepared(&self) -> FlowError {
        FlowError::Bridge(BridgeError::IllegalTransition {
            from: self.session.state(),
            to: BridgeState::Responding,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{config, engine, mount_metadata, verified_store, DEPTH};
    use super::super::{CancellationSource, Scanned};
    use super::*;
    use crate::bridge::{crypto, BridgeKey, EncryptedPayload, ErrorCode, InvalidCode, PayloadError, ProofRequest};
    use crate::credential::CredentialType;
    use crate::error::ErrorCategory;
    use crate::identity::IdentityStore;
    use std::sync::Arc;
    use std::time::Duration;
    use url::form_urlencoded::byte_serialize;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    fn request_body() -> serde_json::Value {
        serde_json::json!({
            "app_id": "app_staging_x",
            "credential_types": ["orb", "phone"],
            "action": "test",
            "signal": "0x00"
        })
    }

    async fn mount_relay(server: &MockServer, key: &BridgeKey, body: serde_json::Value) {
        let message = crypto::encrypt(key, &serde_json::to_vec(&body).unwrap()).unwrap();
        Mock::given(method("GET"))
            .and(path("/request/req-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(message))
            .mount(server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/response/req-1"))
            .respond_with(ResponseTemplate::new(200))
            .mount(server)
            .await;
    }

    fn code(key: &BridgeKey) -> String {
        let k: String = byte_serialize(key.to_base64().as_bytes()).collect();
        format!("https://worldcoin.org/verify?t=wld&i=req-1&k={k}")
    }

    async fn relay_response(server: &MockServer, key: &BridgeKey) -> Option<BridgeResponse> {
        let requests = server.received_requests().await.unwrap();
        let put: &Request = requests.iter().find(|r| r.method.as_str() == "PUT")?;
        let message: EncryptedPayload = serde_json::from_slice(&put.body).unwrap();
        let plaintext = crypto::decrypt(key, &message).unwrap();
        Some(serde_json::from_slice(&plaintext).unwrap())
    }

    fn orchestrator(server: &MockServer, store: Arc<IdentityStore>) -> Orchestrator {
        Orchestrator::new(config(server), store, engine()).unwrap()
    }

    fn bridge_flow<'o>(orchestrator: &'o Orchestrator, text: &str) -> VerificationFlow<'o> {
        match orchestrator.scan(text) {
            Ok(Scanned::Bridge(flow)) => flow,
            _ => panic!("expected a bridge flow"),
        }
    }

    #[tokio::test]
    async fn happy_path_reaches_success() {
        let server = MockServer::start().await;
        let key = BridgeKey::generate();
        mount_relay(&server, &key, request_body()).await;
        mount_metadata(
            &server,
            "app_staging_x",
            serde_json::json!({ "name": "Staging App", "is_staging": true, "can_user_verify": "yes" }),
        )
        .await;

        let orchestrator = orchestrator(&server, verified_store(b"happy"));
        let mut flow = bridge_flow(&orchestrator, &code(&key));

        let prepared = flow.prepare(CancellationToken::default()).await.unwrap();
        assert_eq!(prepared.credential, CredentialType::Orb);
        assert_eq!(prepared.metadata.name, "Staging App");
        assert_eq!(flow.state(), BridgeState::AwaitingApproval);
        assert_eq!(flow.current_status(), VerificationStatus::Waiting);

        let outcome = flow.approve().await.unwrap();
        assert!(matches!(outcome, FlowOutcome::Verified { credential: CredentialType::Orb, .. }));
        assert!(matches!(flow.current_status(), VerificationStatus::Success { .. }));
        assert_eq!(flow.state(), BridgeState::Completed);

        let Some(BridgeResponse::Success(response)) = relay_response(&server, &key).await else {
            panic!("expected a success response");
        };
        assert_eq!(response.credential_type, CredentialType::Orb);
        let request = ProofRequest::from_initial_data(serde_json::from_value(request_body()).unwrap()).unwrap();
        assert!(orchestrator.verify_response(&request, &response).unwrap());
    }

    #[tokio::test]
    async fn tampered_code_never_touches_the_network() {
        let server = MockServer::start().await;
        let orchestrator = orchestrator(&server, verified_store(b"tampered"));

        let Err(e) = orchestrator.scan("not-a-valid-uri") else {
            panic!("expected an invalid code");
        };
        assert!(matches!(e, FlowError::InvalidCode(InvalidCode::NotAUrl)));
        assert_eq!(e.category(), ErrorCategory::Input);
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn production_app_is_refused_before_approval() {
        let server = MockServer::start().await;
        let key = BridgeKey::generate();
        mount_relay(&server, &key, request_body()).await;
        mount_metadata(&server, "app_staging_x", serde_json::json!({ "name": "Prod", "is_staging": false })).await;

        let orchestrator = orchestrator(&server, verified_store(b"production"));
        let mut flow = bridge_flow(&orchestrator, &code(&key));

        let err = flow.prepare(CancellationToken::default()).await.unwrap_err();
        assert!(matches!(err, FlowError::ProductionApp(_)));
        let VerificationStatus::Error { reason, category } = flow.current_status() else {
            panic!("expected an error status");
        };
        assert!(reason.contains("cannot verify production app"));
        assert_eq!(category, ErrorCategory::Policy);

        assert_eq!(flow.state(), BridgeState::Failed);
        let failure = flow.session().failure().unwrap();
        assert_eq!(failure.at, BridgeState::MetadataReady);
        assert_eq!(failure.notified, Some(ErrorCode::GenericError));
        assert_eq!(
            relay_response(&server, &key).await.and_then(|r| r.error_code()),
            Some(ErrorCode::GenericError)
        );
    }

    #[tokio::test]
    async fn already_verified_warns_and_decline_reports_it() {
        let server = MockServer::start().await;
        let key = BridgeKey::generate();
        mount_relay(&server, &key, request_body()).await;
        mount_metadata(
            &server,
            "app_staging_x",
            serde_json::json!({ "name": "Staging", "is_staging": true, "can_user_verify": "no" }),
        )
        .await;

        let orchestrator = orchestrator(&server, verified_store(b"warning"));
        let mut flow = bridge_flow(&orchestrator, &code(&key));
        flow.prepare(CancellationToken::default()).await.unwrap();
        assert_eq!(
            flow.current_status(),
            VerificationStatus::Warning {
                description: "test (app_staging_x)".into()
            }
        );

        let outcome = flow.decline().await.unwrap();
        assert_eq!(outcome, FlowOutcome::Declined(ErrorCode::MaxVerificationsReached));
        assert_eq!(flow.state(), BridgeState::Completed);
        assert_eq!(
            relay_response(&server, &key).await.and_then(|r| r.error_code()),
            Some(ErrorCode::MaxVerificationsReached)
        );
    }

    #[tokio::test]
    async fn unavailable_metadata_still_reaches_approval() {
        let server = MockServer::start().await;
        let key = BridgeKey::generate();
        mount_relay(&server, &key, request_body()).await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let orchestrator = orchestrator(&server, verified_store(b"degraded"));
        let mut flow = bridge_flow(&orchestrator, &code(&key));
        let prepared = flow.prepare(CancellationToken::default()).await.unwrap();
        assert_eq!(prepared.metadata.name, "app_staging_x");
        assert_eq!(flow.state(), BridgeState::AwaitingApproval);
    }

    #[tokio::test]
    async fn unverified_identity_gets_generic_error() {
        let server = MockServer::start().await;
        let key = BridgeKey::generate();
        mount_relay(&server, &key, request_body()).await;

        let store = Arc::new(IdentityStore::ephemeral());
        store.derive_from_seed(b"unverified");
        let orchestrator = orchestrator(&server, store);
        let mut flow = bridge_flow(&orchestrator, &code(&key));

        let err = flow.prepare(CancellationToken::default()).await.unwrap_err();
        assert!(matches!(err, FlowError::NoCredential));
        assert_eq!(flow.session().failure().unwrap().at, BridgeState::ProofReady);
        assert_eq!(
            relay_response(&server, &key).await.and_then(|r| r.error_code()),
            Some(ErrorCode::GenericError)
        );
    }

    #[tokio::test]
    async fn cancelled_flow_sends_nothing() {
        let server = MockServer::start().await;
        let key = BridgeKey::generate();
        mount_relay(&server, &key, request_body()).await;

        let orchestrator = orchestrator(&server, verified_store(b"cancel"));
        let mut flow = bridge_flow(&orchestrator, &code(&key));

        let source = CancellationSource::new();
        source.cancel();
        let err = flow.prepare(source.token()).await.unwrap_err();
        assert!(matches!(err, FlowError::Cancelled));
        assert_eq!(flow.state(), BridgeState::Failed);
        assert_eq!(flow.current_status(), VerificationStatus::Waiting);
        assert!(relay_response(&server, &key).await.is_none());
    }

    #[tokio::test]
    async fn cancel_during_relay_fetch_sends_nothing() {
        let server = MockServer::start().await;
        let key = BridgeKey::generate();
        let message = crypto::encrypt(&key, &serde_json::to_vec(&request_body()).unwrap()).unwrap();
        Mock::given(method("GET"))
            .and(path("/request/req-1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(message)
                    .set_delay(Duration::from_secs(30)),
            )
            .mount(&server)
            .await;

        let orchestrator = orchestrator(&server, verified_store(b"slow relay"));
        let mut flow = bridge_flow(&orchestrator, &code(&key));

        let source = CancellationSource::new();
        let prepare = flow.prepare(source.token());
        let cancel = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            source.cancel();
        };
        let (result, ()) = tokio::time::timeout(Duration::from_secs(5), async { tokio::join!(prepare, cancel) })
            .await
            .expect("fetch was not cancelled");
        assert!(matches!(result, Err(FlowError::Cancelled)));

        assert_eq!(flow.state(), BridgeState::Failed);
        assert_eq!(flow.current_status(), VerificationStatus::Waiting);
        assert!(relay_response(&server, &key).await.is_none());
    }

    #[tokio::test]
    async fn cancel_during_metadata_lookup_sends_nothing() {
        let server = MockServer::start().await;
        let key = BridgeKey::generate();
        mount_relay(&server, &key, request_body()).await;
        Mock::given(method("POST"))
            .and(path("/precheck/app_staging_x"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "name": "Staging", "is_staging": true }))
                    .set_delay(Duration::from_secs(30)),
            )
            .mount(&server)
            .await;

        let orchestrator = orchestrator(&server, verified_store(b"slow portal"));
        let mut flow = bridge_flow(&orchestrator, &code(&key));

        let source = CancellationSource::new();
        let prepare = flow.prepare(source.token());
        let cancel = async {
            loop {
                let requests = server.received_requests().await.unwrap();
                if requests.iter().any(|r| r.url.path().starts_with("/precheck")) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            source.cancel();
        };
        let (result, ()) = tokio::time::timeout(Duration::from_secs(20), async { tokio::join!(prepare, cancel) })
            .await
            .expect("metadata lookup was not cancelled");
        assert!(matches!(result, Err(FlowError::Cancelled)));

        assert_eq!(flow.state(), BridgeState::Failed);
        assert_eq!(flow.current_status(), VerificationStatus::Waiting);
        assert!(relay_response(&server, &key).await.is_none());
    }

    #[tokio::test]
    async fn empty_credential_selection_fails_with_policy_error() {
        let server = MockServer::start().await;
        let key = BridgeKey::generate();
        let mut body = request_body();
        body["credential_types"] = serde_json::json!([]);
        mount_relay(&server, &key, body).await;

        let orchestrator = orchestrator(&server, verified_store(b"no levels"));
        let mut flow = bridge_flow(&orchestrator, &code(&key));

        let err = flow.prepare(CancellationToken::default()).await.unwrap_err();
        assert!(matches!(
            err,
            FlowError::Bridge(BridgeError::Payload(PayloadError::NoCredentialTypes))
        ));
        assert_eq!(err.response_code(), Some(ErrorCode::GenericError));
        let VerificationStatus::Error { category, .. } = flow.current_status() else {
            panic!("expected an error status");
        };
        assert_eq!(category, ErrorCategory::Policy);
        assert_eq!(
            relay_response(&server, &key).await.and_then(|r| r.error_code()),
            Some(ErrorCode::GenericError)
        );
    }

    #[tokio::test]
    async fn decline_is_refused_while_a_submission_is_pending() {
        let server = MockServer::start().await;
        let key = BridgeKey::generate();
        mount_relay(&server, &key, request_body()).await;
        mount_metadata(&server, "app_staging_x", serde_json::json!({ "name": "Staging", "is_staging": true })).await;

        let orchestrator = orchestrator(&server, verified_store(b"pending"));
        let mut flow = bridge_flow(&orchestrator, &code(&key));
        flow.prepare(CancellationToken::default()).await.unwrap();

        assert!(flow.status.begin());
        assert!(matches!(flow.decline().await, Err(FlowError::AlreadyPending)));
        assert_eq!(flow.state(), BridgeState::AwaitingApproval);
        assert_eq!(flow.current_status(), VerificationStatus::Pending);
        assert!(relay_response(&server, &key).await.is_none());
    }

    #[tokio::test]
    async fn identity_change_invalidates_open_flow() {
        let server = MockServer::start().await;
        let key = BridgeKey::generate();
        mount_relay(&server, &key, request_body()).await;
        mount_metadata(&server, "app_staging_x", serde_json::json!({ "name": "Staging", "is_staging": true })).await;

        let store = verified_store(b"switch");
        let orchestrator = orchestrator(&server, Arc::clone(&store));
        let mut flow = bridge_flow(&orchestrator, &code(&key));
        flow.prepare(CancellationToken::default()).await.unwrap();

        store.create_random();
        let err = flow.approve().await.unwrap_err();
        assert!(matches!(err, FlowError::IdentityChanged));
        assert_eq!(flow.state(), BridgeState::Failed);
        assert_eq!(
            relay_response(&server, &key).await.and_then(|r| r.error_code()),
            Some(ErrorCode::GenericError)
        );
    }

    #[tokio::test]
    async fn approve_requires_a_prepared_request() {
        let server = MockServer::start().await;
        let orchestrator = orchestrator(&server, verified_store(b"early"));
        let mut flow = bridge_flow(&orchestrator, &code(&BridgeKey::generate()));

        assert!(matches!(
            flow.approve().await,
            Err(FlowError::Bridge(BridgeError::IllegalTransition { .. }))
        ));
        flow.dismiss().unwrap();
        assert_eq!(flow.state(), BridgeState::Failed);
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn run_with_fixed_decision() {
        let server = MockServer::start().await;
        let key = BridgeKey::generate();
        mount_relay(&server, &key, request_body()).await;
        mount_metadata(&server, "app_staging_x", serde_json::json!({ "name": "Staging", "is_staging": true })).await;

        let orchestrator = orchestrator(&server, verified_store(b"run"));
        let mut flow = bridge_flow(&orchestrator, &code(&key));
        let outcome = flow.run(&Decision::Decline, CancellationToken::default()).await.unwrap();
        assert_eq!(outcome, FlowOutcome::Declined(ErrorCode::VerificationRejected));
        assert_eq!(engine().tree_depth(), DEPTH);
    }
}
