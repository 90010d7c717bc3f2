//! Scanned-code parsing.
//!
//! A code is either a bridge URL
//! `https://…?t=wld&i={request_id}&k={base64 key}[&b={relay url}]` or a
//! session pairing URI `wc:{topic}@2?…`. Anything else is reported as an
//! [`InvalidCode`], never as an error.

use std::fmt;
use url::Url;

use super::crypto::BridgeKey;
use crate::session::PairingUri;

const CODE_TYPE: &str = "wld";

/// Everything needed to reach one relay request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeCode {
    pub request_id: String,
    pub relay_url: Url,
    pub key: BridgeKey,
}

/// Why a scanned text was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidCode {
    Empty,
    NotAUrl,
    UnsupportedScheme(String),
    WrongType(String),
    MissingRequestId,
    InvalidRequestId,
    MissingKey,
    InvalidKey,
    InvalidRelay,
    InvalidPairing(String),
}

impl fmt::Display for InvalidCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidCode::Empty => write!(f, "code is empty"),
            InvalidCode::NotAUrl => write!(f, "code is not a URL"),
            InvalidCode::UnsupportedScheme(s) => write!(f, "unsupported scheme {s:?}"),
            InvalidCode::WrongType(t) => write!(f, "unexpected code type {t:?}"),
            InvalidCode::MissingRequestId => write!(f, "code has no request id"),
            InvalidCode::InvalidRequestId => write!(f, "request id contains invalid characters"),
            InvalidCode::MissingKey => write!(f, "code has no key"),
            InvalidCode::InvalidKey => write!(f, "key is not 32 bytes of base64"),
            InvalidCode::InvalidRelay => write!(f, "relay URL is invalid"),
            InvalidCode::InvalidPairing(reason) => write!(f, "invalid pairing URI: {reason}"),
        }
    }
}

/// Outcome of parsing a scanned or pasted code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanResult {
    Bridge(BridgeCode),
    Pairing(PairingUri),
    Invalid(InvalidCode),
}

impl ScanResult {
    pub fn is_valid(&self) -> bool {
        !matches!(self, ScanResult::Invalid(_))
    }
}

/// Parse scanned text. `default_relay` is used when the code names none.
pub fn parse_scanned_code(text: &str, default_relay: &Url) -> ScanResult {
    let text = text.trim();
    if text.is_empty() {
        return ScanResult::Invalid(InvalidCode::Empty);
    }

    if text.starts_with("wc:") {
        return match PairingUri::parse(text) {
            Ok(uri) => ScanResult::Pairing(uri),
            Err(e) => ScanResult::Invalid(InvalidCode::InvalidPairing(e.to_string())),
        };
    }

    match parse_bridge_url(text, default_relay) {
        Ok(code) => ScanResult::Bridge(code),
        Err(invalid) => ScanResult::Invalid(invalid),
    }
}

fn parse_bridge_url(text: &str, default_relay: &Url) -> Result<BridgeCode, InvalidCode> {
    let url = Url::parse(text).map_err(|_| InvalidCode::NotAUrl)?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(InvalidCode::UnsupportedScheme(url.scheme().to_string()));
    }

    let mut code_type = None;
    let mut request_id = None;
    let mut key = None;
    let mut relay = None;
    for (name, value) in url.query_pairs() {
        match name.as_ref() {
            "t" => code_type = Some(value.into_owned()),
            "i" => request_id = Some(value.into_owned()),
            "k" => key = Some(value.into_owned()),
            "b" => relay = Some(value.into_owned()),
            _ => {}
        }
    }

    if let Some(t) = code_type {
        if t != CODE_TYPE {
            return Err(InvalidCode::WrongType(t));
        }
    }

    let request_id = request_id
        .filter(|id| !id.is_empty())
        .ok_or(InvalidCode::MissingRequestId)?;
    if !request_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(InvalidCode::InvalidRequestId);
    }

    let key = key.filter(|k| !k.is_empty()).ok_or(InvalidCode::MissingKey)?;
    let key = BridgeKey::from_base64(&key).map_err(|_| InvalidCode::InvalidKey)?;

    let relay_url = match relay {
        Some(raw) => {
            let parsed = Url::parse(&raw).map_err(|_| InvalidCode::InvalidRelay)?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(InvalidCode::InvalidRelay);
            }
            parsed
        }
        None => default_relay.clone(),
    };

    Ok(BridgeCode {
        request_id,
        relay_url,
        key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::form_urlencoded::byte_serialize;

    fn relay() -> Url {
        "https://bridge.worldcoin.org".parse().unwrap()
    }

    fn code_with(key: &BridgeKey, extra: &str) -> String {
        let k: String = byte_serialize(key.to_base64().as_bytes()).collect();
        format!("https://worldcoin.org/verify?t=wld&i=4a9b6c1e-0d2f&k={k}{extra}")
    }

    #[test]
    fn test_bridge_code() {
        let key = BridgeKey::generate();
        let ScanResult::Bridge(code) = parse_scanned_code(&code_with(&key, ""), &relay()) else {
            panic!("expected bridge code");
        };
        assert_eq!(code.request_id, "4a9b6c1e-0d2f");
        assert_eq!(code.key, key);
        assert_eq!(code.relay_url, relay());
    }

    #[test]
    fn test_bridge_code_with_relay_override() {
        let key = BridgeKey::generate();
        let text = code_with(&key, "&b=http%3A%2F%2F127.0.0.1%3A8080");
        let ScanResult::Bridge(code) = parse_scanned_code(&text, &relay()) else {
            panic!("expected bridge code");
        };
        assert_eq!(code.relay_url.as_str(), "http://127.0.0.1:8080/");
    }

    #[test]
    fn test_key_with_unescaped_plus() {
        // A raw `+` in the query decodes to a space.
        let key = loop {
            let key = BridgeKey::generate();
            if key.to_base64().contains('+') {
                break key;
            }
        };
        let text = format!("https://worldcoin.org/verify?t=wld&i=abc&k={}", key.to_base64());
        let ScanResult::Bridge(code) = parse_scanned_code(&text, &relay()) else {
            panic!("expected bridge code");
        };
        assert_eq!(code.key, key);
    }

    #[test]
    fn test_invalid_codes() {
        let key = BridgeKey::generate();
        let cases = [
            ("not-a-valid-uri", InvalidCode::NotAUrl),
            ("", InvalidCode::Empty),
            ("ftp://x/?i=a&k=b", InvalidCode::UnsupportedScheme("ftp".into())),
            ("https://x/?t=other&i=a&k=b", InvalidCode::WrongType("other".into())),
            ("https://x/?t=wld&k=b", InvalidCode::MissingRequestId),
            ("https://x/?t=wld&i=a%2Fb&k=b", InvalidCode::InvalidRequestId),
            ("https://x/?t=wld&i=abc", InvalidCode::MissingKey),
            ("https://x/?t=wld&i=abc&k=AAAA", InvalidCode::InvalidKey),
        ];
        for (text, expected) in cases {
            assert_eq!(parse_scanned_code(text, &relay()), ScanResult::Invalid(expected), "{text}");
        }

        let bad_relay = code_with(&key, "&b=mailto%3Ax");
        assert_eq!(
            parse_scanned_code(&bad_relay, &relay()),
            ScanResult::Invalid(InvalidCode::InvalidRelay)
        );
        assert!(!parse_scanned_code("not-a-valid-uri", &relay()).is_valid());
    }

    #[test]
    fn test_pairing_uri_is_recognised() {
        let text = format!(
            "wc:{}@2?relay-protocol=irn&symKey={}",
            "a".repeat(64),
            "b".repeat(64)
        );
        assert!(matches!(parse_scanned_code(&text, &relay()), ScanResult::Pairing(_)));

        let bad = format!("wc:{}@1?relay-protocol=irn&symKey={}", "a".repeat(64), "b".repeat(64));
        assert!(matches!(
            parse_scanned_code(&bad, &relay()),
            ScanResult::Invalid(InvalidCode::InvalidPairing(_))
        ));
    }
}
