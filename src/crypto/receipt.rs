//! Ed25519 vote receipts.
//!
//! A receipt is a detached signature over the canonical JSON of a compact
//! payload (sorted keys, no insignificant whitespace). Voters verify it
//! with nothing but the published public key; verification performs no
//! state change and is idempotent.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use ring::rand::SystemRandom;
use ring::signature::{Ed25519KeyPair, KeyPair, UnparsedPublicKey, ED25519};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::canonical_json;

/// The only algorithm receipts are issued under.
pub const RECEIPT_ALGORITHM: &str = "Ed25519";

/// Current receipt payload version.
pub const RECEIPT_VERSION: u8 = 1;

/// DER prefix of an Ed25519 SubjectPublicKeyInfo; the raw 32-byte key
/// follows immediately.
const SPKI_PREFIX: [u8; 12] = [
    0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x03, 0x21, 0x00,
];

#[derive(Debug, Error)]
pub enum ReceiptError {
    #[error("Invalid receipt signing key: {0}")]
    InvalidKey(String),

    #[error("Receipt serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Receipt payload, version 1. All fields are strings; `ts` is RFC 3339
/// UTC. Field names are fixed by the wire format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ReceiptPayload {
    pub vote_id: String,
    pub poll_id: String,
    pub leaf_hash: String,
    pub merkle_root: String,
    pub ts: String,
}

/// A signed receipt as returned to the voter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SignedReceipt {
    pub payload: ReceiptPayload,
    /// base64url (unpadded) Ed25519 signature over the canonical payload.
    pub signature: String,
    pub algorithm: String,
    pub version: u8,
}

/// Holds the active signing key; loaded once at startup.
pub struct ReceiptSigner {
    keypair: Ed25519KeyPair,
}

impl ReceiptSigner {
    /// Load the signing key from a base64-encoded PKCS#8 document.
    pub fn from_pkcs8_base64(encoded: &str) -> Result<Self, ReceiptError> {
        let der = STANDARD
            .decode(encoded.trim())
            .map_err(|e| ReceiptError::InvalidKey(e.to_string()))?;
        let keypair = Ed25519KeyPair::from_pkcs8(&der)
            .map_err(|e| ReceiptError::InvalidKey(e.to_string()))?;
        Ok(Self { keypair })
    }

    /// Generate an ephemeral keypair. Returns the signer and the PKCS#8
    /// document (base64) so an operator can persist it.
    pub fn generate() -> Result<(Self, String), ReceiptError> {
        let rng = SystemRandom::new();
        let document = Ed25519KeyPair::generate_pkcs8(&rng)
            .map_err(|e| ReceiptError::InvalidKey(e.to_string()))?;
        let keypair = Ed25519KeyPair::from_pkcs8(document.as_ref())
            .map_err(|e| ReceiptError::InvalidKey(e.to_string()))?;
        Ok((Self { keypair }, STANDARD.encode(document.as_ref())))
    }

    /// Sign a payload. Ed25519 is deterministic: the same payload under
    /// the same key always yields the same receipt.
    pub fn sign_receipt(&self, payload: ReceiptPayload) -> Result<SignedReceipt, ReceiptError> {
        let message = canonical_json(&payload)?;
        let signature = self.keypair.sign(message.as_bytes());
        Ok(SignedReceipt {
            payload,
            signature: URL_SAFE_NO_PAD.encode(signature.as_ref()),
            algorithm: RECEIPT_ALGORITHM.to_string(),
            version: RECEIPT_VERSION,
        })
    }

    /// Raw 32-byte public key.
    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.keypair.public_key().as_ref().to_vec()
    }

    /// Public key as an SPKI PEM block, the shape served at the
    /// well-known endpoint.
    pub fn public_key_pem(&self) -> String {
        let mut der = Vec::with_capacity(SPKI_PREFIX.len() + 32);
        der.extend_from_slice(&SPKI_PREFIX);
        der.extend_from_slice(self.keypair.public_key().as_ref());
        format!(
            "-----BEGIN PUBLIC KEY-----\n{}\n-----END PUBLIC KEY-----\n",
            STANDARD.encode(&der)
        )
    }
}

/// Extract the raw Ed25519 key from an SPKI PEM block.
pub fn public_key_from_pem(pem: &str) -> Result<Vec<u8>, ReceiptError> {
    let body: String = pem
        .lines()
        .filter(|line| !line.starts_with("-----"))
        .collect();
    let der = STANDARD
        .decode(body.trim())
        .map_err(|e| ReceiptError::InvalidKey(e.to_string()))?;
    if der.len() != SPKI_PREFIX.len() + 32 || der[..SPKI_PREFIX.len()] != SPKI_PREFIX {
        return Err(ReceiptError::InvalidKey(
            "not an Ed25519 SubjectPublicKeyInfo".to_string(),
        ));
    }
    Ok(der[SPKI_PREFIX.len()..].to_vec())
}

/// Verify a signed receipt against the published public key. Rejects
/// wrong versions, wrong algorithms, tampered payloads, and corrupt
/// signatures; never errors.
pub fn verify_receipt(receipt: &SignedReceipt, public_key: &[u8]) -> bool {
    if receipt.version != RECEIPT_VERSION || receipt.algorithm != RECEIPT_ALGORITHM {
        return false;
    }
    let message = match canonical_json(&receipt.payload) {
        Ok(message) => message,
        Err(_) => return false,
    };
    let signature = match URL_SAFE_NO_PAD.decode(&receipt.signature) {
        Ok(signature) => signature,
        Err(_) => return false,
    };
    UnparsedPublicKey::new(&ED25519, public_key)
        .verify(message.as_bytes(), &signature)
        .is_ok()
}
