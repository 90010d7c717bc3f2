//! Pairing URIs: `wc:{topic}@{version}?relay-protocol=…&symKey=…[&expiryTimestamp=…]`.

use regex::Regex;
use std::sync::OnceLock;

use super::SessionError;
use crate::bridge::BridgeKey;

pub const PAIRING_VERSION: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingUri {
    pub topic: String,
    pub version: u8,
    pub relay_protocol: String,
    pub sym_key: BridgeKey,
    /// Unix seconds after which the pairing may no longer be activated.
    pub expiry: Option<u64>,
}

fn pattern() -> Result<&'static Regex, SessionError> {
    static PATTERN: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^wc:(?P<topic>[0-9a-fA-F]{64})@(?P<version>\d{1,3})\?(?P<params>.+)$"))
        .as_ref()
        .map_err(|e| SessionError::InvalidUri(e.to_string()))
}

impl PairingUri {
    pub fn parse(uri: &str) -> Result<Self, SessionError> {
        let caps = pattern()?
            .captures(uri.trim())
            .ok_or_else(|| SessionError::InvalidUri("not a pairing URI".into()))?;

        let version: u8 = caps["version"]
            .parse()
            .map_err(|_| SessionError::InvalidUri("bad version".into()))?;
        if version != PAIRING_VERSION {
            return Err(SessionError::UnsupportedVersion(version));
        }

        let mut relay_protocol = None;
        let mut sym_key = None;
        let mut expiry = None;
        for (name, value) in url::form_urlencoded::parse(caps["params"].as_bytes()) {
            match name.as_ref() {
                "relay-protocol" => relay_protocol = Some(value.into_owned()),
                "symKey" => {
                    let bytes = zeroize::Zeroizing::new(
                        hex::decode(value.as_bytes()).map_err(|_| SessionError::InvalidUri("symKey is not hex".into()))?,
                    );
                    sym_key = Some(
                        BridgeKey::from_bytes(&bytes)
                            .map_err(|_| SessionError::InvalidUri("symKey must be 32 bytes".into()))?,
                    );
                }
                "expiryTimestamp" => {
                    expiry = Some(
                        value
                            .parse()
                            .map_err(|_| SessionError::InvalidUri("bad expiryTimestamp".into()))?,
                    );
                }
                _ => {}
            }
        }

        Ok(Self {
            topic: caps["topic"].to_ascii_lowercase(),
            version,
            relay_protocol: relay_protocol.ok_or_else(|| SessionError::InvalidUri("missing relay-protocol".into()))?,
            sym_key: sym_key.ok_or_else(|| SessionError::InvalidUri("missing symKey".into()))?,
            expiry,
        })
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.expiry.map(|expiry| expiry <= now).unwrap_or(false)
    }
}
