//! Requester metadata from the developer portal precheck.
//!
//! Calls `POST {dev_portal}/{app_id}` with `{action, nullifier_hash,
//! external_nullifier}`. A lookup never fails: 404 means an unregistered app
//! and any other problem degrades to minimal metadata.

use ark_bn254::Fr;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::field::encode_field;

/// Whether the portal thinks this user may still verify for the action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CanUserVerify {
    Yes,
    /// The nullifier has already been used up for this action.
    No,
    OnChain,
    #[serde(other)]
    Undetermined,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub is_staging: bool,
    #[serde(default)]
    pub is_verified: bool,
    #[serde(default, alias = "verified_app_logo")]
    pub logo_url: Option<String>,
    #[serde(default)]
    pub can_user_verify: Option<CanUserVerify>,
}

impl AppMetadata {
    /// What the flow shows for a requester it knows nothing about.
    pub fn unknown(app_id: &str) -> Self {
        Self {
            name: app_id.to_string(),
            is_staging: false,
            is_verified: false,
            logo_url: None,
            can_user_verify: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataLookup {
    Registered(AppMetadata),
    Unregistered,
    /// Lookup failed; the flow continues with [`AppMetadata::unknown`].
    Unavailable(String),
}

impl MetadataLookup {
    pub fn metadata(&self, app_id: &str) -> AppMetadata {
        match self {
            MetadataLookup::Registered(meta) => meta.clone(),
            _ => AppMetadata::unknown(app_id),
        }
    }

    /// A registered production app, which this simulator must refuse.
    pub fn is_production(&self) -> bool {
        matches!(self, MetadataLookup::Registered(meta) if !meta.is_staging)
    }

    /// The portal says this nullifier was already used for the action.
    pub fn already_verified(&self) -> bool {
        matches!(
            self,
            MetadataLookup::Registered(AppMetadata {
                can_user_verify: Some(CanUserVerify::No),
                ..
            })
        )
    }
}

#[derive(Serialize)]
struct PrecheckRequest<'a> {
    action: &'a str,
    nullifier_hash: String,
    external_nullifier: String,
}

#[derive(Debug, Clone)]
pub struct MetadataClient {
    http: reqwest::Client,
    base_url: Url,
}

impl MetadataClient {
    pub fn new(http: reqwest::Client, base_url: Url) -> Self {
        Self { http, base_url }
    }

    pub async fn fetch(
        &self,
        app_id: &str,
        action: &str,
        nullifier_hash: &Fr,
        external_nullifier: &Fr,
    ) -> MetadataLookup {
        let mut url = self.base_url.clone();
        match url.path_segments_mut() {
            Ok(mut segments) => {
                segments.pop_if_empty().push(app_id);
            }
            Err(()) => return MetadataLookup::Unavailable(format!("cannot extend {}", self.base_url)),
        }

        let body = PrecheckRequest {
            action,
            nullifier_hash: encode_field(nullifier_hash),
            external_nullifier: encode_field(external_nullifier),
        };

        let resp = match self.http.post(url).json(&body).send().await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(app_id, error = %e, "metadata fetch failed");
                return MetadataLookup::Unavailable(e.to_string());
            }
        };

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            debug!(app_id, "app not registered");
            return MetadataLookup::Unregistered;
        }
        if !status.is_success() {
            warn!(app_id, status = status.as_u16(), "metadata lookup rejected");
            return MetadataLookup::Unavailable(format!("HTTP {status}"));
        }

        match resp.json::<AppMetadata>().await {
            Ok(meta) => {
                debug!(app_id, name = %meta.name, staging = meta.is_staging, "metadata received");
                MetadataLookup::Registered(meta)
            }
            Err(e) => {
                warn!(app_id, error = %e, "metadata response unreadable");
                MetadataLookup::Unavailable(e.to_string())
            }
        }
    }
}
