//! Request and response bodies exchanged with requesters.
//!
//! The same shapes travel over the relay (encrypted) and over session
//! requests (as JSON-RPC params/results).

use ark_bn254::Fr;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use crate::credential::CredentialType;
use crate::engine::{PackedProof, Proof};
use crate::field::{self, decode_field, encode_field, EncodingError};

/// Errors turning a requester payload into a [`ProofRequest`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    #[error("invalid request JSON: {0}")]
    InvalidJson(String),

    #[error("request is missing {0}")]
    MissingField(&'static str),

    #[error("request names no supported credential type")]
    NoCredentialTypes,
}

impl PayloadError {
    /// Code sent back for a request refused with this error. An empty
    /// credential selection is a business rule, not a corrupt payload.
    pub fn response_code(&self) -> ErrorCode {
        match self {
            PayloadError::NoCredentialTypes => ErrorCode::GenericError,
            PayloadError::InvalidJson(_) | PayloadError::MissingField(_) => ErrorCode::MalformedRequest,
        }
    }
}

/// Decrypted body of a relay request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeInitialData {
    pub app_id: String,
    #[serde(default)]
    pub credential_types: Vec<String>,
    #[serde(default)]
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_description: Option<String>,
    #[serde(default)]
    pub signal: String,
}

/// A validated request. Built once at the receiving boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofRequest {
    pub app_id: String,
    pub action: String,
    pub action_description: Option<String>,
    pub signal: String,
    /// Requested levels, deduplicated, in requester order.
    pub credential_types: Vec<CredentialType>,
    pub external_nullifier: Fr,
    pub signal_hash: Fr,
}

impl ProofRequest {
    pub fn from_json(bytes: &[u8]) -> Result<Self, PayloadError> {
        let data: BridgeInitialData =
            serde_json::from_slice(bytes).map_err(|e| PayloadError::InvalidJson(e.to_string()))?;
        Self::from_initial_data(data)
    }

    pub fn from_initial_data(data: BridgeInitialData) -> Result<Self, PayloadError> {
        if data.app_id.trim().is_empty() {
            return Err(PayloadError::MissingField("app_id"));
        }

        let mut credential_types = Vec::new();
        for raw in &data.credential_types {
            match raw.parse::<CredentialType>() {
                Ok(level) if !credential_types.contains(&level) => credential_types.push(level),
                Ok(_) => {}
                Err(e) => debug!(error = %e, "ignoring credential type"),
            }
        }
        if credential_types.is_empty() {
            return Err(PayloadError::NoCredentialTypes);
        }

        Ok(Self {
            external_nullifier: field::external_nullifier(&data.app_id, &data.action),
            signal_hash: field::signal_hash(&data.signal),
            app_id: data.app_id,
            action: data.action,
            action_description: data.action_description,
            signal: data.signal,
            credential_types,
        })
    }

    /// Text shown to the user when the flow succeeds (or warns).
    pub fn description(&self) -> String {
        match &self.action_description {
            Some(desc) if !desc.is_empty() => desc.clone(),
            _ if self.action.is_empty() => format!("Verified with {}", self.app_id),
            _ => format!("{} ({})", self.action, self.app_id),
        }
    }
}

/// Error codes understood by requesters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    VerificationRejected,
    GenericError,
    MalformedRequest,
    MaxVerificationsReached,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::VerificationRejected => "verification_rejected",
            ErrorCode::GenericError => "generic_error",
            ErrorCode::MalformedRequest => "malformed_request",
            ErrorCode::MaxVerificationsReached => "max_verifications_reached",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Successful proof as sent to the requester. Scalars are fixed-width hex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofResponse {
    pub proof: String,
    pub merkle_root: String,
    pub nullifier_hash: String,
    pub credential_type: CredentialType,
}

impl ProofResponse {
    pub fn new(proof: &Proof, credential_type: CredentialType) -> Self {
        Self {
            proof: proof.packed().to_hex(),
            merkle_root: encode_field(&proof.merkle_root),
            nullifier_hash: encode_field(&proof.nullifier_hash),
            credential_type,
        }
    }

    /// Rebuild a verifiable proof using the requester's own scope.
    pub fn to_proof(&self, request: &ProofRequest) -> Result<Proof, EncodingError> {
        Ok(Proof {
            merkle_root: decode_field(&self.merkle_root)?,
            nullifier_hash: decode_field(&self.nullifier_hash)?,
            signal_hash: request.signal_hash,
            external_nullifier: request.external_nullifier,
            zk_proof: PackedProof::from_hex(&self.proof)?.to_groth16()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error_code: ErrorCode,
}

/// Exactly one of a proof or an error code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BridgeResponse {
    Success(ProofResponse),
    Error(ErrorResponse),
}

impl BridgeResponse {
    pub fn error(code: ErrorCode) -> Self {
        BridgeResponse::Error(ErrorResponse { error_code: code })
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            BridgeResponse::Error(e) => Some(e.error_code),
            BridgeResponse::Success(_) => None,
        }
    }
}
