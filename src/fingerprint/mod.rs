mod canonical;

pub use canonical::to_canonical_json;

use crate::error::EngineError;
use anyhow::anyhow;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256, Sha384, Sha512};
use std::str::FromStr;

/// Hash function used to derive payload fingerprints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FingerprintAlgorithm {
    #[default]
    Sha256,
    Sha384,
    Sha512,
}

impl FingerprintAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            FingerprintAlgorithm::Sha256 => "sha256",
            FingerprintAlgorithm::Sha384 => "sha384",
            FingerprintAlgorithm::Sha512 => "sha512",
        }
    }

    fn digest_hex(&self, input: &[u8]) -> String {
        match self {
            FingerprintAlgorithm::Sha256 => hex::encode(Sha256::digest(input)),
            FingerprintAlgorithm::Sha384 => hex::encode(Sha384::digest(input)),
            FingerprintAlgorithm::Sha512 => hex::encode(Sha512::digest(input)),
        }
    }
}

impl FromStr for FingerprintAlgorithm {
    type Err = EngineError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name.to_lowercase().replace('-', "").as_str() {
            "sha256" => Ok(FingerprintAlgorithm::Sha256),
            "sha384" => Ok(FingerprintAlgorithm::Sha384),
            "sha512" => Ok(FingerprintAlgorithm::Sha512),
            _ => Err(EngineError::Validation(format!(
                "unsupported fingerprint algorithm '{name}'"
            ))),
        }
    }
}

/// Computes the fingerprint of a structured payload with the default
/// algorithm (SHA-256).
///
/// Payloads that differ only in mapping-key insertion order produce identical
/// fingerprints; array element order is significant. Volatile fields such as
/// wall-clock timestamps must be excluded by the caller.
pub fn fingerprint(payload: &Value) -> String {
    fingerprint_with(payload, FingerprintAlgorithm::Sha256)
}

/// Computes the fingerprint of a structured payload with an explicit
/// algorithm. Returns the lowercase hex digest of the canonical text form.
pub fn fingerprint_with(payload: &Value, algorithm: FingerprintAlgorithm) -> String {
    algorithm.digest_hex(to_canonical_json(payload).as_bytes())
}

/// Convenience wrapper for any serializable payload.
pub fn fingerprint_of<T: Serialize>(payload: &T) -> crate::error::Result<String> {
    let value = serde_json::to_value(payload)
        .map_err(|e| EngineError::Internal(anyhow!("failed to serialize payload: {e}")))?;
    Ok(fingerprint(&value))
}
