//! Credential levels and the precedence rule shared by both transports.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// A credential level an identity can be verified at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialType {
    /// Biometric verification at an Orb.
    Orb,
    /// Verified identity document.
    Document,
    /// Verified phone number.
    Phone,
    /// Device-level uniqueness.
    Device,
}

impl CredentialType {
    pub const ALL: [CredentialType; 4] = [
        CredentialType::Orb,
        CredentialType::Document,
        CredentialType::Phone,
        CredentialType::Device,
    ];

    /// Higher wins when several requested levels are available.
    pub fn precedence(self) -> u8 {
        match self {
            CredentialType::Orb => 3,
            CredentialType::Document => 2,
            CredentialType::Phone => 1,
            CredentialType::Device => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CredentialType::Orb => "orb",
            CredentialType::Document => "document",
            CredentialType::Phone => "phone",
            CredentialType::Device => "device",
        }
    }
}

impl Ord for CredentialType {
    fn cmp(&self, other: &Self) -> Ordering {
        self.precedence().cmp(&other.precedence())
    }
}

impl PartialOrd for CredentialType {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for CredentialType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown credential type: {0}")]
pub struct UnknownCredential(pub String);

impl FromStr for CredentialType {
    type Err = UnknownCredential;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "orb" => Ok(CredentialType::Orb),
            "document" => Ok(CredentialType::Document),
            "phone" => Ok(CredentialType::Phone),
            "device" => Ok(CredentialType::Device),
            other => Err(UnknownCredential(other.to_string())),
        }
    }
}

/// Pick the credential a proof is generated for: the highest-precedence
/// requested level the identity is verified at.
pub fn select_credential<F>(requested: &[CredentialType], is_verified: F) -> Option<CredentialType>
where
    F: Fn(CredentialType) -> bool,
{
    requested.iter().copied().filter(|c| is_verified(*c)).max()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_orb_wins_regardless_of_order() {
        let requested = [CredentialType::Phone, CredentialType::Orb];
        assert_eq!(select_credential(&requested, |_| true), Some(CredentialType::Orb));

        let requested = [CredentialType::Orb, CredentialType::Phone];
        assert_eq!(select_credential(&requested, |_| true), Some(CredentialType::Orb));
    }

    #[test]
    fn test_falls_back_to_verified_level() {
        let requested = [CredentialType::Phone, CredentialType::Orb];
        let selected = select_credential(&requested, |c| c == CredentialType::Phone);
        assert_eq!(selected, Some(CredentialType::Phone));
    }

    #[test]
    fn test_nothing_selected_without_overlap() {
        assert_eq!(select_credential(&[], |_| true), None);
        let requested = [CredentialType::Device];
        assert_eq!(select_credential(&requested, |c| c == CredentialType::Orb), None);
    }

    #[test]
    fn test_total_order() {
        let mut all = CredentialType::ALL.to_vec();
        all.sort();
        assert_eq!(
            all,
            vec![
                CredentialType::Device,
                CredentialType::Phone,
                CredentialType::Document,
                CredentialType::Orb
            ]
        );
    }

    #[test]
    fn test_parse_and_serde_names() {
        assert_eq!("ORB".parse::<CredentialType>().unwrap(), CredentialType::Orb);
        assert!("passport".parse::<CredentialType>().is_err());
        assert_eq!(serde_json::to_string(&CredentialType::Phone).unwrap(), "\"phone\"");
    }
}
