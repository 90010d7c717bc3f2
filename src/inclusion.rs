//! Typed client for the identity sequencers.
//!
//! | Method | Path | Operation |
//! |--------|------|-----------|
//! | POST | `/inclusionProof` | Merkle path of a commitment (400/404 if unknown) |
//! | POST | `/insertIdentity` | Queue a commitment for insertion (Basic auth) |
//!
//! One attempt per call. Polling is the orchestrator's job.

use ark_bn254::Fr;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{SequencerAuth, SimulatorConfig};
use crate::credential::CredentialType;
use crate::field::{decode_field, encode_field};
use crate::merkle::InclusionProof;

/// Errors from sequencer calls.
#[derive(Debug, thiserror::Error)]
pub enum InclusionError {
    /// Insertion needs a service credential and none is configured.
    #[error("sequencer credentials are not configured")]
    MissingCredential,

    #[error("no sequencer configured for {0}")]
    UnknownSequencer(CredentialType),

    #[error("HTTP error calling {endpoint}: {source}")]
    Http {
        endpoint: String,
        source: reqwest::Error,
    },

    #[error("sequencer {endpoint} returned {status}: {body}")]
    Api {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("malformed response from {endpoint}: {reason}")]
    Malformed { endpoint: String, reason: String },
}

impl InclusionError {
    /// Whether the failure is a configuration problem rather than I/O.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::MissingCredential | Self::UnknownSequencer(_))
    }
}

/// Result of an inclusion-proof lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InclusionLookup {
    Found(InclusionProof),
    /// The commitment has not been included yet. Not an error.
    NotFound,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CommitmentRequest {
    identity_commitment: String,
}

#[derive(Debug, Deserialize)]
struct SequencerProof {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    root: Option<String>,
    #[serde(default)]
    proof: Option<Vec<ProofNode>>,
}

#[derive(Debug, Deserialize)]
enum ProofNode {
    Left(String),
    Right(String),
}

/// Client for the per-level sequencers.
#[derive(Debug, Clone)]
pub struct InclusionProofClient {
    http: reqwest::Client,
    sequencers: BTreeMap<CredentialType, Url>,
    auth: Option<SequencerAuth>,
    tree_depth: usize,
}

impl InclusionProofClient {
    pub fn new(
        http: reqwest::Client,
        sequencers: BTreeMap<CredentialType, Url>,
        auth: Option<SequencerAuth>,
        tree_depth: usize,
    ) -> Self {
        Self {
            http,
            sequencers,
            auth,
            tree_depth,
        }
    }

    pub fn from_config(http: reqwest::Client, config: &SimulatorConfig) -> Self {
        Self::new(
            http,
            config.sequencers.clone(),
            config.sequencer_auth.clone(),
            config.tree_depth,
        )
    }

    /// Levels that have a sequencer configured.
    pub fn levels(&self) -> impl Iterator<Item = CredentialType> + '_ {
        self.sequencers.keys().copied()
    }

    fn endpoint(&self, level: CredentialType, op: &str) -> Result<Url, InclusionError> {
        let base = self
            .sequencers
            .get(&level)
            .ok_or(InclusionError::UnknownSequencer(level))?;
        base.join(op).map_err(|e| InclusionError::Malformed {
            endpoint: base.to_string(),
            reason: e.to_string(),
        })
    }

    /// Fetch the Merkle path of `commitment` from the `level` sequencer.
    ///
    /// Calls `POST {sequencer}/inclusionProof`.
    pub async fn fetch_inclusion_proof(
        &self,
        commitment: &Fr,
        level: CredentialType,
    ) -> Result<InclusionLookup, InclusionError> {
        let url = self.endpoint(level, "inclusionProof")?;
        let endpoint = format!("POST {url}");
        let body = CommitmentRequest {
            identity_commitment: encode_field(commitment),
        };

        debug!(%level, "fetching inclusion proof");
        let resp = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| InclusionError::Http {
                endpoint: endpoint.clone(),
                source: e,
            })?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::BAD_REQUEST {
            debug!(%level, "identity not included");
            return Ok(InclusionLookup::NotFound);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(InclusionError::Api {
                endpoint,
                status: status.as_u16(),
                body,
            });
        }

        let parsed: SequencerProof = resp.json().await.map_err(|e| InclusionError::Malformed {
            endpoint: endpoint.clone(),
            reason: e.to_string(),
        })?;
        self.convert(parsed, &endpoint)
    }

    fn convert(&self, response: SequencerProof, endpoint: &str) -> Result<InclusionLookup, InclusionError> {
        let malformed = |reason: String| InclusionError::Malformed {
            endpoint: endpoint.to_string(),
            reason,
        };

        let Some(nodes) = response.proof else {
            debug!(status = ?response.status, "sequencer has no proof yet");
            return Ok(InclusionLookup::NotFound);
        };
        if nodes.len() != self.tree_depth {
            return Err(malformed(format!(
                "proof has {} levels, expected {}",
                nodes.len(),
                self.tree_depth
            )));
        }

        let mut siblings = Vec::with_capacity(nodes.len());
        let mut path_indices = Vec::with_capacity(nodes.len());
        for node in nodes {
            let (sibling, is_right) = match node {
                ProofNode::Left(s) => (s, false),
                ProofNode::Right(s) => (s, true),
            };
            siblings.push(decode_field::<Fr>(&sibling).map_err(|e| malformed(e.to_string()))?);
            path_indices.push(is_right);
        }

        let root = response
            .root
            .as_deref()
            .map(decode_field::<Fr>)
            .transpose()
            .map_err(|e| malformed(e.to_string()))?;

        Ok(InclusionLookup::Found(InclusionProof {
            root,
            siblings,
            path_indices,
        }))
    }

    /// Queue `commitment` for insertion at `level`.
    ///
    /// Calls `POST {sequencer}/insertIdentity` with Basic auth. Fails before
    /// any network call when no credential is configured.
    pub async fn submit_for_inclusion(&self, commitment: &Fr, level: CredentialType) -> Result<(), InclusionError> {
        let auth = self.auth.as_ref().ok_or(InclusionError::MissingCredential)?;
        let url = self.endpoint(level, "insertIdentity")?;
        let endpoint = format!("POST {url}");
        let body = CommitmentRequest {
            identity_commitment: encode_field(commitment),
        };

        let resp = self
            .http
            .post(url)
            .basic_auth(&auth.username, Some(auth.password.as_str()))
            .json(&body)
            .send()
            .await
            .map_err(|e| InclusionError::Http {
                endpoint: endpoint.clone(),
                source: e,
            })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            warn!(%level, status, "identity insertion rejected");
            return Err(InclusionError::Api { endpoint, status, body });
        }

        info!(%level, commitment = %body.identity_commitment, "identity submitted for inclusion");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merkle::MerkleTree;
    use wiremock::matchers::{body_json, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};
    use zeroize::Zeroizing;

    const DEPTH: usize = 3;

    fn client(server: &MockServer, auth: bool) -> InclusionProofClient {
        let mut sequencers = BTreeMap::new();
        sequencers.insert(CredentialType::Orb, server.uri().parse().unwrap());
        let auth = auth.then(|| SequencerAuth {
            username: "sim".into(),
            password: Zeroizing::new("pw".into()),
        });
        InclusionProofClient::new(reqwest::Client::new(), sequencers, auth, DEPTH)
    }

    fn sequencer_body(tree: &MerkleTree, index: usize) -> serde_json::Value {
        let proof = tree.inclusion_proof(index).unwrap();
        let nodes: Vec<serde_json::Value> = proof
            .siblings
            .iter()
            .zip(&proof.path_indices)
            .map(|(s, right)| {
                if *right {
                    serde_json::json!({ "Right": encode_field(s) })
                } else {
                    serde_json::json!({ "Left": encode_field(s) })
                }
            })
            .collect();
        serde_json::json!({ "status": "mined", "root": encode_field(&tree.root()), "proof": nodes })
    }

    #[tokio::test]
    async fn fetch_parses_left_right_path() {
        let server = MockServer::start().await;
        let commitment = Fr::from(42u64);
        let tree = MerkleTree::from_leaves(DEPTH, &[Fr::from(1u64), commitment]).unwrap();

        Mock::given(method("POST"))
            .and(path("/inclusionProof"))
            .and(body_json(serde_json::json!({ "identityCommitment": encode_field(&commitment) })))
            .respond_with(ResponseTemplate::new(200).set_body_json(sequencer_body(&tree, 1)))
            .expect(1)
            .mount(&server)
            .await;

        let lookup = client(&server, false)
            .fetch_inclusion_proof(&commitment, CredentialType::Orb)
            .await
            .unwrap();

        let InclusionLookup::Found(proof) = lookup else {
            panic!("expected proof");
        };
        assert_eq!(proof, tree.inclusion_proof(1).unwrap());
        assert!(proof.verify(&commitment, tree.hasher()));
    }

    #[tokio::test]
    async fn fetch_maps_4xx_to_not_found() {
        for status in [400u16, 404] {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/inclusionProof"))
                .respond_with(ResponseTemplate::new(status))
                .mount(&server)
                .await;

            let lookup = client(&server, false)
                .fetch_inclusion_proof(&Fr::from(1u64), CredentialType::Orb)
                .await
                .unwrap();
            assert_eq!(lookup, InclusionLookup::NotFound);
        }
    }

    #[tokio::test]
    async fn fetch_surfaces_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/inclusionProof"))
            .respond_with(ResponseTemplate::new(503).set_body_string("down"))
            .mount(&server)
            .await;

        let err = client(&server, false)
            .fetch_inclusion_proof(&Fr::from(1u64), CredentialType::Orb)
            .await
            .unwrap_err();
        assert!(matches!(err, InclusionError::Api { status: 503, .. }));
    }

    #[tokio::test]
    async fn fetch_rejects_wrong_depth() {
        let server = MockServer::start().await;
        let tree = MerkleTree::from_leaves(DEPTH + 1, &[Fr::from(1u64)]).unwrap();
        Mock::given(method("POST"))
            .and(path("/inclusionProof"))
            .respond_with(ResponseTemplate::new(200).set_body_json(sequencer_body(&tree, 0)))
            .mount(&server)
            .await;

        let err = client(&server, false)
            .fetch_inclusion_proof(&Fr::from(1u64), CredentialType::Orb)
            .await
            .unwrap_err();
        assert!(matches!(err, InclusionError::Malformed { .. }));
    }

    #[tokio::test]
    async fn fetch_pending_without_root() {
        let server = MockServer::start().await;
        let tree = MerkleTree::from_leaves(DEPTH, &[Fr::from(1u64)]).unwrap();
        let mut body = sequencer_body(&tree, 0);
        body["root"] = serde_json::Value::Null;
        body["status"] = "pending".into();
        Mock::given(method("POST"))
            .and(path("/inclusionProof"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;

        let lookup = client(&server, false)
            .fetch_inclusion_proof(&Fr::from(1u64), CredentialType::Orb)
            .await
            .unwrap();
        let InclusionLookup::Found(proof) = lookup else {
            panic!("expected proof");
        };
        assert!(!proof.is_included());
    }

    #[tokio::test]
    async fn unknown_level_is_config_error() {
        let server = MockServer::start().await;
        let err = client(&server, true)
            .fetch_inclusion_proof(&Fr::from(1u64), CredentialType::Phone)
            .await
            .unwrap_err();
        assert!(err.is_config());
    }

    #[tokio::test]
    async fn submit_without_credentials_fails_fast() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let err = client(&server, false)
            .submit_for_inclusion(&Fr::from(1u64), CredentialType::Orb)
            .await
            .unwrap_err();
        assert!(matches!(err, InclusionError::MissingCredential));
    }

    #[tokio::test]
    async fn submit_sends_basic_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/insertIdentity"))
            .and(header_exists("authorization"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        client(&server, true)
            .submit_for_inclusion(&Fr::from(1u64), CredentialType::Orb)
            .await
            .unwrap();
    }
}
