//! Scalar encoding and hashing helpers.
//!
//! Every scalar that crosses a wire boundary (relay, sequencer, developer
//! portal, session peer) is a 32-byte big-endian unsigned integer written as
//! `0x`-prefixed, left-zero-padded hex.

use ark_bn254::Fr;
use ark_ff::{BigInteger, PrimeField};
use sha3::{Digest, Keccak256};

/// Width of an encoded scalar in bytes.
pub const SCALAR_BYTES: usize = 32;

/// Errors raised while encoding or decoding scalars.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodingError {
    #[error("value needs {0} bytes and does not fit in 32")]
    Overflow(usize),

    #[error("invalid hex: {0}")]
    InvalidHex(String),

    #[error("value is not a canonical field element")]
    NotCanonical,

    #[error("invalid curve point: {0}")]
    InvalidPoint(&'static str),

    #[error("expected {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },
}

/// Encode an arbitrary big-endian unsigned integer as fixed-width hex.
///
/// Leading zero bytes are ignored; anything left that is wider than
/// 32 bytes is rejected rather than truncated.
pub fn encode_u256(bytes_be: &[u8]) -> Result<String, EncodingError> {
    let significant = strip_leading_zeros(bytes_be);
    if significant.len() > SCALAR_BYTES {
        return Err(EncodingError::Overflow(significant.len()));
    }
    let mut padded = [0u8; SCALAR_BYTES];
    padded[SCALAR_BYTES - significant.len()..].copy_from_slice(significant);
    Ok(format!("0x{}", hex::encode(padded)))
}

/// Decode a hex string (with or without `0x`) into 32 big-endian bytes.
pub fn decode_u256(value: &str) -> Result<[u8; SCALAR_BYTES], EncodingError> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    if digits.is_empty() {
        return Err(EncodingError::InvalidHex("empty value".into()));
    }

    let bytes = if digits.len() % 2 == 1 {
        hex::decode(format!("0{digits}"))
    } else {
        hex::decode(digits)
    }
    .map_err(|e| EncodingError::InvalidHex(e.to_string()))?;

    let significant = strip_leading_zeros(&bytes);
    if significant.len() > SCALAR_BYTES {
        return Err(EncodingError::Overflow(significant.len()));
    }
    let mut out = [0u8; SCALAR_BYTES];
    out[SCALAR_BYTES - significant.len()..].copy_from_slice(significant);
    Ok(out)
}

fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    &bytes[first..]
}

/// Big-endian bytes of a field element, left-padded to 32 bytes.
pub fn field_to_bytes<F: PrimeField>(value: &F) -> [u8; SCALAR_BYTES] {
    let bytes = value.into_bigint().to_bytes_be();
    let significant = strip_leading_zeros(&bytes);
    let mut out = [0u8; SCALAR_BYTES];
    out[SCALAR_BYTES - significant.len()..].copy_from_slice(significant);
    out
}

/// Parse 32 big-endian bytes into a field element, rejecting values at or
/// above the modulus.
pub fn field_from_bytes<F: PrimeField>(bytes: &[u8; SCALAR_BYTES]) -> Result<F, EncodingError> {
    let value = F::from_be_bytes_mod_order(bytes);
    if &field_to_bytes(&value) != bytes {
        return Err(EncodingError::NotCanonical);
    }
    Ok(value)
}

/// Fixed-width hex encoding of a field element.
pub fn encode_field<F: PrimeField>(value: &F) -> String {
    format!("0x{}", hex::encode(field_to_bytes(value)))
}

/// Decode fixed-width hex into a canonical field element.
pub fn decode_field<F: PrimeField>(value: &str) -> Result<F, EncodingError> {
    field_from_bytes(&decode_u256(value)?)
}

/// `keccak256(bytes) >> 8`, which always lands inside the BN254 scalar field.
pub fn hash_to_field(bytes: &[u8]) -> Fr {
    let digest = Keccak256::digest(bytes);
    let mut shifted = [0u8; SCALAR_BYTES];
    shifted[1..].copy_from_slice(&digest[..SCALAR_BYTES - 1]);
    Fr::from_be_bytes_mod_order(&shifted)
}

/// Scope of a proof: one nullifier per (identity, app, action).
pub fn external_nullifier(app_id: &str, action: &str) -> Fr {
    let mut packed = field_to_bytes(&hash_to_field(app_id.as_bytes())).to_vec();
    packed.extend_from_slice(action.as_bytes());
    hash_to_field(&packed)
}

/// Field representation of a signal.
///
/// Requesting SDKs put an already-hashed signal on the wire as hex; that is
/// used as-is when it is a canonical scalar. Anything else is hashed.
pub fn signal_hash(signal: &str) -> Fr {
    if signal.starts_with("0x") {
        if let Ok(value) = decode_field::<Fr>(signal) {
            return value;
        }
    }
    hash_to_field(signal.as_bytes())
}

/// Serde adapters writing `Fr` values as fixed-width hex.
pub mod serde_fr {
    use super::{decode_field, encode_field};
    use ark_bn254::Fr;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Fr, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&encode_field(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Fr, D::Error> {
        let raw = String::deserialize(deserializer)?;
        decode_field(&raw).map_err(D::Error::custom)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(value: &Option<Fr>, serializer: S) -> Result<S::Ok, S::Error> {
            match value {
                Some(v) => serializer.serialize_some(&encode_field(v)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Fr>, D::Error> {
            let raw: Option<String> = Option::deserialize(deserializer)?;
            raw.map(|s| decode_field(&s).map_err(D::Error::custom)).transpose()
        }
    }

    pub mod vec {
        use super::*;
        use serde::ser::SerializeSeq;

        pub fn serialize<S: Serializer>(values: &[Fr], serializer: S) -> Result<S::Ok, S::Error> {
            let mut seq = serializer.serialize_seq(Some(values.len()))?;
            for value in values {
                seq.serialize_element(&encode_field(value))?;
            }
            seq.end()
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Fr>, D::Error> {
            let raw: Vec<String> = Vec::deserialize(deserializer)?;
            raw.iter()
                .map(|s| decode_field(s).map_err(D::Error::custom))
                .collect()
        }
    }
}
