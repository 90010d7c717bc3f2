//! AES-256-GCM for relay payloads.
//!
//! Relay bodies are `{iv, payload}`, both standard base64. Every encryption
//! draws a fresh 12-byte IV from the OS RNG.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::engine::general_purpose::{STANDARD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::Zeroizing;

pub const KEY_SIZE: usize = 32;
pub const IV_SIZE: usize = 12;
const TAG_SIZE: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("key must be {KEY_SIZE} bytes, got {0}")]
    InvalidKey(usize),

    #[error("IV must be {IV_SIZE} bytes, got {0}")]
    InvalidIv(usize),

    #[error("invalid base64 in {0}")]
    Base64(&'static str),

    #[error("encryption failed")]
    Encryption,

    /// Tag mismatch: wrong key, wrong IV or tampered ciphertext.
    #[error("authentication tag mismatch")]
    Authentication,
}

/// Raw AES-256 key shared between requester and simulator.
#[derive(Clone, PartialEq, Eq)]
pub struct BridgeKey(Zeroizing<[u8; KEY_SIZE]>);

impl BridgeKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let raw: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| CryptoError::InvalidKey(bytes.len()))?;
        Ok(Self(Zeroizing::new(raw)))
    }

    /// Decode a key from a scanned code. Query strings often turn `+` into a
    /// space, and some requesters use the URL-safe alphabet.
    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let normalized = encoded.trim().replace(' ', "+");
        let bytes = Zeroizing::new(
            STANDARD
                .decode(&normalized)
                .or_else(|_| URL_SAFE.decode(&normalized))
                .or_else(|_| URL_SAFE_NO_PAD.decode(&normalized))
                .map_err(|_| CryptoError::Base64("key"))?,
        );
        Self::from_bytes(&bytes)
    }

    pub fn generate() -> Self {
        let mut raw = Zeroizing::new([0u8; KEY_SIZE]);
        OsRng.fill_bytes(&mut raw[..]);
        Self(raw)
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.0[..])
    }

    fn cipher(&self) -> Result<Aes256Gcm, CryptoError> {
        Aes256Gcm::new_from_slice(&self.0[..]).map_err(|_| CryptoError::InvalidKey(self.0.len()))
    }
}

impl fmt::Debug for BridgeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BridgeKey([REDACTED])")
    }
}

/// Wire form of an encrypted relay message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    pub iv: String,
    pub payload: String,
}

impl EncryptedPayload {
    pub fn iv_bytes(&self) -> Result<[u8; IV_SIZE], CryptoError> {
        let bytes = STANDARD.decode(&self.iv).map_err(|_| CryptoError::Base64("iv"))?;
        bytes.as_slice().try_into().map_err(|_| CryptoError::InvalidIv(bytes.len()))
    }
}

/// Encrypt with a fresh random IV.
pub fn encrypt(key: &BridgeKey, plaintext: &[u8]) -> Result<EncryptedPayload, CryptoError> {
    let mut iv = [0u8; IV_SIZE];
    OsRng.fill_bytes(&mut iv);
    encrypt_with_iv(key, &iv, plaintext)
}

/// Encrypt under a caller-chosen IV. The caller owns IV uniqueness.
pub fn encrypt_with_iv(
    key: &BridgeKey,
    iv: &[u8; IV_SIZE],
    plaintext: &[u8],
) -> Result<EncryptedPayload, CryptoError> {
    let ciphertext = key
        .cipher()?
        .encrypt(Nonce::from_slice(iv), plaintext)
        .map_err(|_| CryptoError::Encryption)?;

    Ok(EncryptedPayload {
        iv: STANDARD.encode(iv),
        payload: STANDARD.encode(ciphertext),
    })
}

/// Decrypt a relay message. Any tag failure is final for this ciphertext.
pub fn decrypt(key: &BridgeKey, message: &EncryptedPayload) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let iv = message.iv_bytes()?;
    let ciphertext = STANDARD
        .decode(&message.payload)
        .map_err(|_| CryptoError::Base64("payload"))?;
    if ciphertext.len() < TAG_SIZE {
        return Err(CryptoError::Authentication);
    }

    key.cipher()?
        .decrypt(Nonce::from_slice(&iv), ciphertext.as_slice())
        .map(Zeroizing::new)
        .map_err(|_| CryptoError::Authentication)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let key = BridgeKey::generate();
        let plaintext = b"{\"app_id\":\"app_staging_x\"}";

        let message = encrypt(&key, plaintext).unwrap();
        let decrypted = decrypt(&key, &message).unwrap();
        assert_eq!(decrypted.as_slice(), plaintext);
    }

    #[test]
    fn test_wrong_iv_fails_authentication() {
        let key = BridgeKey::generate();
        let mut message = encrypt_with_iv(&key, &[1u8; IV_SIZE], b"secret").unwrap();
        message.iv = STANDARD.encode([2u8; IV_SIZE]);

        assert_eq!(decrypt(&key, &message), Err(CryptoError::Authentication));
    }

    #[test]
    fn test_wrong_key_fails() {
        let message = encrypt(&BridgeKey::generate(), b"secret").unwrap();
        assert_eq!(decrypt(&BridgeKey::generate(), &message), Err(CryptoError::Authentication));
    }

    #[test]
    fn test_tampering_detected() {
        let key = BridgeKey::generate();
        let message = encrypt(&key, b"secret data").unwrap();

        let mut raw = STANDARD.decode(&message.payload).unwrap();
        raw[0] ^= 0xff;
        let tampered = EncryptedPayload {
            iv: message.iv.clone(),
            payload: STANDARD.encode(raw),
        };
        assert_eq!(decrypt(&key, &tampered), Err(CryptoError::Authentication));
    }

    #[test]
    fn test_fresh_iv_per_encryption() {
        let key = BridgeKey::generate();
        let a = encrypt(&key, b"same").unwrap();
        let b = encrypt(&key, b"same").unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.payload, b.payload);
    }

    #[test]
    fn test_key_parsing() {
        let key = BridgeKey::generate();
        let encoded = key.to_base64();
        assert_eq!(BridgeKey::from_base64(&encoded).unwrap(), key);
        assert_eq!(BridgeKey::from_base64(&encoded.replace('+', " ")).unwrap(), key);

        assert_eq!(BridgeKey::from_base64("AAAA"), Err(CryptoError::InvalidKey(3)));
        assert_eq!(BridgeKey::from_base64("***"), Err(CryptoError::Base64("key")));
        assert!(!format!("{key:?}").contains(&encoded));
    }

    #[test]
    fn test_bad_iv_length() {
        let key = BridgeKey::generate();
        let message = EncryptedPayload {
            iv: STANDARD.encode([0u8; 8]),
            payload: STANDARD.encode([0u8; 32]),
        };
        assert_eq!(decrypt(&key, &message), Err(CryptoError::InvalidIv(8)));
    }
}
