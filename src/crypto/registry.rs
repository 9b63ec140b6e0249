//! Crypto registry: selects the active keyed hasher at startup.
//!
//! Two families are supported:
//! - `hmac`: HMAC-SHA-256 keyed hashing, plain SHA-256 leaves;
//! - `poseidon`: Poseidon over the BN254 scalar field for both, with the
//!   secret absorbed as the first sponge input.
//!
//! The registry is built once from configuration, immutable afterwards,
//! and shared behind an `Arc`. The active variant name is stamped into
//! every audit payload.

use std::sync::Arc;

use hkdf::Hkdf;
use ring::constant_time::verify_slices_are_equal;
use ring::hmac;
use sha2::Sha256;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::poseidon::{self, Fr};
use super::{sha256, Hash256};

/// Domain separation salt for key derivation (versioned for rotation).
const HASHER_SALT: &[u8] = b"agora-hasher-v1";

/// HKDF info strings per hasher family.
mod purposes {
    pub const HMAC_KEY: &[u8] = b"nullifier-hmac";
    pub const POSEIDON_KEY: &[u8] = b"nullifier-poseidon";
}

/// Errors raised while building the registry.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The configured hasher name is not a known variant.
    #[error("Unknown hasher variant: {0}")]
    UnknownHasher(String),

    /// The nullifier secret is required but absent.
    #[error("Nullifier secret is not configured")]
    MissingSecret,

    /// HKDF expansion failed (wrong output length; should not happen).
    #[error("Key derivation failed: {0}")]
    DerivationFailed(String),
}

/// Hasher families selectable via configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HasherKind {
    Hmac,
    Poseidon,
}

impl HasherKind {
    pub fn parse(s: &str) -> Result<Self, CryptoError> {
        match s {
            "hmac" => Ok(HasherKind::Hmac),
            "poseidon" => Ok(HasherKind::Poseidon),
            other => Err(CryptoError::UnknownHasher(other.to_string())),
        }
    }
}

/// Canonical multi-input framing: each input is prefixed with its UTF-8
/// byte length as a 4-byte big-endian integer. Two distinct input tuples
/// can never frame to the same byte stream.
pub fn frame_inputs(inputs: &[&[u8]]) -> Vec<u8> {
    let total: usize = inputs.iter().map(|i| 4 + i.len()).sum();
    let mut framed = Vec::with_capacity(total);
    for input in inputs {
        framed.extend_from_slice(&(input.len() as u32).to_be_bytes());
        framed.extend_from_slice(input);
    }
    framed
}

/// Capability set shared by both hasher families.
pub trait KeyedHasher: Send + Sync {
    /// Stable variant name surfaced in audit entries.
    fn name(&self) -> &'static str;

    /// Keyed hash over length-prefixed inputs; 64 lowercase hex chars.
    fn keyed_hash(&self, inputs: &[&[u8]]) -> String;

    /// Unkeyed hash used for Merkle leaves.
    fn leaf_hash(&self, bytes: &[u8]) -> Hash256;

    /// Constant-time comparison of a claimed hex digest against the
    /// freshly derived value.
    fn verify(&self, expected_hex: &str, inputs: &[&[u8]]) -> bool {
        let computed = self.keyed_hash(inputs);
        let expected = expected_hex.to_ascii_lowercase();
        verify_slices_are_equal(computed.as_bytes(), expected.as_bytes()).is_ok()
    }
}

/// 32-byte derived key material, cleared on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
struct DerivedKey([u8; 32]);

fn derive_key(secret: &str, info: &[u8]) -> Result<DerivedKey, CryptoError> {
    let hkdf = Hkdf::<Sha256>::new(Some(HASHER_SALT), secret.as_bytes());
    let mut key = [0u8; 32];
    hkdf.expand(info, &mut key)
        .map_err(|e| CryptoError::DerivationFailed(format!("{:?}", e)))?;
    Ok(DerivedKey(key))
}

/// HMAC-SHA-256 keyed hasher with plain SHA-256 leaves.
pub struct HmacHasher {
    key: hmac::Key,
}

impl HmacHasher {
    pub fn new(secret: &str) -> Result<Self, CryptoError> {
        let derived = derive_key(secret, purposes::HMAC_KEY)?;
        let key = hmac::Key::new(hmac::HMAC_SHA256, &derived.0);
        Ok(Self { key })
    }
}

impl KeyedHasher for HmacHasher {
    fn name(&self) -> &'static str {
        "hmac"
    }

    fn keyed_hash(&self, inputs: &[&[u8]]) -> String {
        let tag = hmac::sign(&self.key, &frame_inputs(inputs));
        hex::encode(tag.as_ref())
    }

    fn leaf_hash(&self, bytes: &[u8]) -> Hash256 {
        sha256(bytes)
    }
}

/// Poseidon keyed hasher; the derived secret element is absorbed first.
pub struct PoseidonHasher {
    secret: Fr,
}

impl PoseidonHasher {
    pub fn new(secret: &str) -> Result<Self, CryptoError> {
        let derived = derive_key(secret, purposes::POSEIDON_KEY)?;
        let secret = Fr::from_be_bytes(&derived.0);
        Ok(Self { secret })
    }
}

impl KeyedHasher for PoseidonHasher {
    fn name(&self) -> &'static str {
        "poseidon"
    }

    fn keyed_hash(&self, inputs: &[&[u8]]) -> String {
        let framed = frame_inputs(inputs);
        let mut elements = vec![self.secret];
        elements.extend(poseidon::bytes_to_elements(&framed));
        let digest = poseidon::hash_elements(&elements);
        hex::encode(digest.to_be_bytes())
    }

    fn leaf_hash(&self, bytes: &[u8]) -> Hash256 {
        poseidon::hash_bytes(bytes).to_be_bytes()
    }
}

/// Process-wide hasher selection. Cheap to clone; immutable after init.
#[derive(Clone)]
pub struct CryptoRegistry {
    hasher: Arc<dyn KeyedHasher>,
}

impl CryptoRegistry {
    /// Build the registry from configuration. Both variants consume the
    /// secret; starting without one is a configuration error.
    pub fn new(kind: HasherKind, secret: Option<&str>) -> Result<Self, CryptoError> {
        let secret = secret.filter(|s| !s.is_empty()).ok_or(CryptoError::MissingSecret)?;
        let hasher: Arc<dyn KeyedHasher> = match kind {
            HasherKind::Hmac => Arc::new(HmacHasher::new(secret)?),
            HasherKind::Poseidon => Arc::new(PoseidonHasher::new(secret)?),
        };
        Ok(Self { hasher })
    }

    pub fn hasher(&self) -> &dyn KeyedHasher {
        self.hasher.as_ref()
    }

    /// Active variant name, stamped into audit payloads.
    pub fn active_hasher_name(&self) -> &'static str {
        self.hasher.name()
    }
}
