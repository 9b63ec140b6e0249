//! Voter credential verification.
//!
//! The enrollment plane issues short-lived Ed25519-signed claims carrying
//! an opaque subject and a demographic bucket. The core validates the
//! signature against an issuer allow-list and the expiry, then consumes
//! the claims for a single request. Credentials are never persisted.

use std::collections::HashMap;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use ring::signature::{UnparsedPublicKey, ED25519};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::canonical_json;
use crate::model::DemographicsSnapshot;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Credential claims are malformed: {0}")]
    Malformed(String),

    #[error("Credential issuer is not trusted")]
    UnknownIssuer,

    #[error("Credential has expired")]
    Expired,

    #[error("Credential signature is invalid")]
    BadSignature,
}

/// Claims carried by a voter credential. Unknown keys are rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CredentialClaims {
    /// Issuer identifier, checked against the allow-list.
    pub iss: String,
    /// Opaque voter subject; not PII, never stored by the core.
    pub sub: String,
    /// Demographic bucket attested at enrollment.
    pub data: DemographicsSnapshot,
    /// Expiry as Unix seconds.
    pub exp: i64,
}

/// A credential as received on a request: serialized claims plus a
/// detached base64url Ed25519 signature over their canonical JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SignedCredential {
    pub claims: CredentialClaims,
    pub signature: String,
}

/// Verifies credentials against a fixed set of issuer public keys.
pub struct CredentialVerifier {
    issuers: HashMap<String, Vec<u8>>,
}

impl CredentialVerifier {
    pub fn new(issuers: HashMap<String, Vec<u8>>) -> Self {
        Self { issuers }
    }

    /// Validate signature, issuer, and expiry; return the claims for this
    /// request only.
    pub fn verify(
        &self,
        credential: &SignedCredential,
        now: DateTime<Utc>,
    ) -> Result<CredentialClaims, CredentialError> {
        let key = self
            .issuers
            .get(&credential.claims.iss)
            .ok_or(CredentialError::UnknownIssuer)?;

        let message = canonical_json(&credential.claims)
            .map_err(|e| CredentialError::Malformed(e.to_string()))?;
        let signature = URL_SAFE_NO_PAD
            .decode(&credential.signature)
            .map_err(|_| CredentialError::BadSignature)?;
        UnparsedPublicKey::new(&ED25519, key)
            .verify(message.as_bytes(), &signature)
            .map_err(|_| CredentialError::BadSignature)?;

        if credential.claims.exp <= now.timestamp() {
            return Err(CredentialError::Expired);
        }

        Ok(credential.claims.clone())
    }
}

/// Sign claims the way the enrollment plane does. Used by integration
/// tests and local tooling; production credentials arrive pre-signed.
pub fn sign_claims(
    claims: CredentialClaims,
    keypair: &ring::signature::Ed25519KeyPair,
) -> Result<SignedCredential, CredentialError> {
    let message =
        canonical_json(&claims).map_err(|e| CredentialError::Malformed(e.to_string()))?;
    let signature = keypair.sign(message.as_bytes());
    Ok(SignedCredential {
        claims,
        signature: URL_SAFE_NO_PAD.encode(signature.as_ref()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AgeBucket, Gender};
    use ring::rand::SystemRandom;
    use ring::signature::{Ed25519KeyPair, KeyPair};

    fn keypair() -> Ed25519KeyPair {
        let document = Ed25519KeyPair::generate_pkcs8(&SystemRandom::new()).unwrap();
        Ed25519KeyPair::from_pkcs8(document.as_ref()).unwrap()
    }

    fn claims(exp: i64) -> CredentialClaims {
        CredentialClaims {
            iss: "enrollment.example".to_string(),
            sub: "subject-1".to_string(),
            data: DemographicsSnapshot {
                age_bucket: AgeBucket::From25To34,
                gender: Gender::Male,
                region: "reg_tbilisi".to_string(),
                citizenship: "GE".to_string(),
            },
            exp,
        }
    }

    fn verifier_for(keypair: &Ed25519KeyPair) -> CredentialVerifier {
        let mut issuers = HashMap::new();
        issuers.insert(
            "enrollment.example".to_string(),
            keypair.public_key().as_ref().to_vec(),
        );
        CredentialVerifier::new(issuers)
    }

    #[test]
    fn test_valid_credential_accepted() {
        let keypair = keypair();
        let now = Utc::now();
        let credential = sign_claims(claims(now.timestamp() + 300), &keypair).unwrap();

        let verified = verifier_for(&keypair).verify(&credential, now).unwrap();
        assert_eq!(verified.sub, "subject-1");
    }

    #[test]
    fn test_unknown_issuer_rejected() {
        let keypair = keypair();
        let now = Utc::now();
        let mut c = claims(now.timestamp() + 300);
        c.iss = "rogue.example".to_string();
        let credential = sign_claims(c, &keypair).unwrap();

        assert!(matches!(
            verifier_for(&keypair).verify(&credential, now),
            Err(CredentialError::UnknownIssuer)
        ));
    }

    #[test]
    fn test_expired_credential_rejected() {
        let keypair = keypair();
        let now = Utc::now();
        let credential = sign_claims(claims(now.timestamp() - 1), &keypair).unwrap();

        assert!(matches!(
            verifier_for(&keypair).verify(&credential, now),
            Err(CredentialError::Expired)
        ));
    }

    #[test]
    fn test_expiry_boundary_is_expired() {
        let keypair = keypair();
        let now = Utc::now();
        let credential = sign_claims(claims(now.timestamp()), &keypair).unwrap();

        assert!(matches!(
            verifier_for(&keypair).verify(&credential, now),
            Err(CredentialError::Expired)
        ));
    }

    #[test]
    fn test_tampered_claims_rejected() {
        let keypair = keypair();
        let now = Utc::now();
        let mut credential = sign_claims(claims(now.timestamp() + 300), &keypair).unwrap();
        credential.claims.sub = "subject-2".to_string();

        assert!(matches!(
            verifier_for(&keypair).verify(&credential, now),
            Err(CredentialError::BadSignature)
        ));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let signing = keypair();
        let trusted = keypair();
        let now = Utc::now();
        let credential = sign_claims(claims(now.timestamp() + 300), &signing).unwrap();

        assert!(matches!(
            verifier_for(&trusted).verify(&credential, now),
            Err(CredentialError::BadSignature)
        ));
    }
}
