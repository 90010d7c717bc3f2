//! Simulator configuration.
//!
//! Every endpoint and timing knob comes from a `WORLD_ID_*` environment
//! variable with a production default where one exists. Sequencers have no
//! default; a level without a sequencer simply cannot refresh its inclusion
//! proof.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;
use zeroize::Zeroizing;

use crate::credential::CredentialType;

pub const DEFAULT_RELAY_URL: &str = "https://bridge.worldcoin.org";
pub const DEFAULT_DEV_PORTAL_URL: &str = "https://developer.worldcoin.org/api/v1/precheck";
pub const DEFAULT_TREE_DEPTH: usize = 30;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_ERROR_RESET_SECS: u64 = 5;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid URL for {0}: {1}")]
    InvalidUrl(String, String),

    #[error("invalid number for {0}: {1:?}")]
    InvalidNumber(String, String),

    #[error("{0} must be formatted as user:password")]
    InvalidAuth(String),

    #[error("tree depth {0} is out of range")]
    InvalidDepth(usize),

    #[error("{0} is not configured")]
    Missing(String),

    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),
}

/// Basic-auth credential for sequencer writes.
#[derive(Clone)]
pub struct SequencerAuth {
    pub username: String,
    pub password: Zeroizing<String>,
}

impl SequencerAuth {
    /// Parse `user:password`.
    pub fn parse(var: &str, raw: &str) -> Result<Self, ConfigError> {
        match raw.split_once(':') {
            Some((user, pass)) if !user.is_empty() => Ok(Self {
                username: user.to_string(),
                password: Zeroizing::new(pass.to_string()),
            }),
            _ => Err(ConfigError::InvalidAuth(var.to_string())),
        }
    }
}

impl fmt::Debug for SequencerAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SequencerAuth")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Runtime configuration of the simulator.
#[derive(Clone, Debug)]
pub struct SimulatorConfig {
    /// Default relay when a scanned code carries none.
    pub relay_url: Url,
    /// Inclusion-proof registry per credential level.
    pub sequencers: BTreeMap<CredentialType, Url>,
    pub sequencer_auth: Option<SequencerAuth>,
    /// Developer portal precheck endpoint.
    pub dev_portal_url: Url,
    pub tree_depth: usize,
    pub poll_interval: Duration,
    /// How long an Error status lingers before returning to Waiting.
    pub error_reset: Duration,
    pub http_timeout: Duration,
    /// File-backed identity storage; memory only when absent.
    pub identity_path: Option<PathBuf>,
}

impl SimulatorConfig {
    /// Load configuration from environment variables.
    ///
    /// Variables:
    /// - `WORLD_ID_RELAY_URL` (default: `https://bridge.worldcoin.org`)
    /// - `WORLD_ID_{ORB,DOCUMENT,PHONE,DEVICE}_SEQUENCER_URL` (optional)
    /// - `WORLD_ID_SEQUENCER_AUTH` (`user:password`, optional)
    /// - `WORLD_ID_DEV_PORTAL_URL` (default: `https://developer.worldcoin.org/api/v1/precheck`)
    /// - `WORLD_ID_TREE_DEPTH` (default: 30)
    /// - `WORLD_ID_POLL_INTERVAL_SECS` (default: 10)
    /// - `WORLD_ID_ERROR_RESET_SECS` (default: 5)
    /// - `WORLD_ID_HTTP_TIMEOUT_SECS` (default: 30)
    /// - `WORLD_ID_IDENTITY_PATH` (optional)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let url = |var: &str, default: &str| -> Result<Url, ConfigError> {
            let raw = lookup(var).unwrap_or_else(|| default.to_string());
            Url::parse(&raw).map_err(|e| ConfigError::InvalidUrl(var.to_string(), e.to_string()))
        };
        let number = |var: &str, default: u64| -> Result<u64, ConfigError> {
            match lookup(var) {
                Some(raw) => raw
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidNumber(var.to_string(), raw)),
                None => Ok(default),
            }
        };

        let mut sequencers = BTreeMap::new();
        for level in CredentialType::ALL {
            let var = format!("WORLD_ID_{}_SEQUENCER_URL", level.as_str().to_ascii_uppercase());
            if let Some(raw) = lookup(&var) {
                let parsed = Url::parse(&raw).map_err(|e| ConfigError::InvalidUrl(var.clone(), e.to_string()))?;
                sequencers.insert(level, parsed);
            }
        }

        let sequencer_auth = lookup("WORLD_ID_SEQUENCER_AUTH")
            .map(|raw| SequencerAuth::parse("WORLD_ID_SEQUENCER_AUTH", &raw))
            .transpose()?;

        let tree_depth = number("WORLD_ID_TREE_DEPTH", DEFAULT_TREE_DEPTH as u64)? as usize;
        if tree_depth == 0 || tree_depth > crate::merkle::tree::MAX_DEPTH {
            return Err(ConfigError::InvalidDepth(tree_depth));
        }

        Ok(Self {
            relay_url: url("WORLD_ID_RELAY_URL", DEFAULT_RELAY_URL)?,
            sequencers,
            sequencer_auth,
            dev_portal_url: url("WORLD_ID_DEV_PORTAL_URL", DEFAULT_DEV_PORTAL_URL)?,
            tree_depth,
            poll_interval: Duration::from_secs(number("WORLD_ID_POLL_INTERVAL_SECS", DEFAULT_POLL_INTERVAL_SECS)?),
            error_reset: Duration::from_secs(number("WORLD_ID_ERROR_RESET_SECS", DEFAULT_ERROR_RESET_SECS)?),
            http_timeout: Duration::from_secs(number("WORLD_ID_HTTP_TIMEOUT_SECS", DEFAULT_HTTP_TIMEOUT_SECS)?),
            identity_path: lookup("WORLD_ID_IDENTITY_PATH").map(PathBuf::from),
        })
    }

    /// Shared HTTP client honouring the configured timeout.
    pub fn http_client(&self) -> Result<reqwest::Client, ConfigError> {
        reqwest::Client::builder()
            .timeout(self.http_timeout)
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))
    }
}
