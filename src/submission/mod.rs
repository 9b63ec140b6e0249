//! Vote submission engine.
//!
//! Takes a vote request plus a verified credential and decides atomically
//! whether to accept. Steps 1-5 (nonce, poll, option, eligibility,
//! nullifier) run before any write; the transaction then inserts the
//! nullifier (the serialization point for double votes), the vote row,
//! the root advance, and the audit entry as one unit. Either the whole
//! tuple commits or none of it does.
//!
//! Concurrent votes on one poll are serialized by a per-poll mutex held
//! across the transaction; polls do not contend with each other.

pub mod eligibility;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::aggregation::ResultCache;
use crate::audit::{self, AuditChain, EventKind};
use crate::credential::CredentialClaims;
use crate::crypto::nullifier::{compute_nullifier, verify_nullifier};
use crate::crypto::receipt::{ReceiptPayload, ReceiptSigner, SignedReceipt};
use crate::crypto::registry::CryptoRegistry;
use crate::error::{SubmitError, SubmitResult};
use crate::merkle::MerkleService;
use crate::model::{bucket_timestamp, Poll, PollOption, VoteRow};
use crate::store::nonce::{NonceError, NoncePurpose, NonceStore};
use crate::store::{self, is_unique_violation, Database};

/// Tunables for the vote path.
#[derive(Debug, Clone)]
pub struct SubmissionConfig {
    /// Timestamp bucket window in seconds.
    pub bucket_seconds: u64,
    /// Reject requests without a device attestation token.
    pub require_attestation: bool,
    /// Hard bound on the vote transaction.
    pub db_timeout: Duration,
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            bucket_seconds: 60,
            require_attestation: false,
            db_timeout: Duration::from_secs(5),
        }
    }
}

/// A vote request as received from the transport layer.
#[derive(Debug, Clone)]
pub struct VoteRequest {
    pub poll_id: String,
    pub option_id: String,
    /// Client-derived nullifier for self-service verification; optional.
    pub nullifier: Option<String>,
    pub nonce: String,
    /// Client-side binding signature; opaque here, forwarded to audit.
    pub signature: Option<String>,
    /// Device attestation token; gated by configuration.
    pub attestation: Option<String>,
}

/// What an accepted vote returns to the caller.
#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub receipt: SignedReceipt,
    /// Opaque transaction reference.
    pub tx_ref: String,
}

/// Public verify-receipt response. Performs no state change.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptVerification {
    pub valid: bool,
    pub signature_valid: bool,
    pub payload: ReceiptPayload,
    /// External transaction id when the receipt's root was anchored.
    pub on_chain_anchor: Option<String>,
}

/// The vote submission engine. One instance per process.
pub struct SubmissionEngine {
    db: Database,
    registry: Arc<CryptoRegistry>,
    nonces: Arc<dyn NonceStore>,
    merkle: Arc<MerkleService>,
    signer: Arc<ReceiptSigner>,
    audit: AuditChain,
    cache: Arc<ResultCache>,
    config: SubmissionConfig,
    poll_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SubmissionEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Database,
        registry: Arc<CryptoRegistry>,
        nonces: Arc<dyn NonceStore>,
        merkle: Arc<MerkleService>,
        signer: Arc<ReceiptSigner>,
        audit: AuditChain,
        cache: Arc<ResultCache>,
        config: SubmissionConfig,
    ) -> Self {
        Self {
            db,
            registry,
            nonces,
            merkle,
            signer,
            audit,
            cache,
            config,
            poll_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Submit a vote. The credential must already be verified.
    pub async fn submit(
        &self,
        request: &VoteRequest,
        claims: &CredentialClaims,
    ) -> SubmitResult<SubmitOutcome> {
        if self.config.require_attestation && request.attestation.is_none() {
            warn!(poll_id = %request.poll_id, "vote rejected: attestation missing");
            return Err(SubmitError::AttestationRequired);
        }

        // 1. Nonce redemption. Nothing is written before this point.
        self.consume_nonce(request).await?;

        // 2. Poll lookup: active status within its window.
        let poll = self
            .db
            .get_poll(&request.poll_id)
            .await
            .map_err(unavailable)?
            .ok_or(SubmitError::NotFound)?;
        let now = Utc::now();
        if !poll.accepts_ballots_at(now) {
            return Err(SubmitError::PollInactive);
        }

        // 3. Option must belong to this poll.
        let option = self
            .db
            .get_option(&request.option_id)
            .await
            .map_err(unavailable)?
            .filter(|option| option.poll_id == poll.id)
            .ok_or(SubmitError::OptionInvalid)?;

        // 4. Eligibility against the credential's demographic bucket.
        if let Err(reason) = eligibility::evaluate(&poll.audience, &claims.data) {
            self.audit_event(
                EventKind::VoteRejectedIneligible,
                json!({
                    "poll_id": poll.id,
                    "rule": reason.as_str(),
                    "hasher": self.registry.active_hasher_name(),
                }),
            )
            .await?;
            return Err(SubmitError::Ineligible);
        }

        // 5. Server-side nullifier derivation is authoritative; a claimed
        // value that disagrees flags a possibly compromised client.
        let nullifier = compute_nullifier(&self.registry, &claims.sub, &poll.id);
        if let Some(claimed) = &request.nullifier {
            if !verify_nullifier(&self.registry, &claims.sub, &poll.id, claimed) {
                self.audit_event(
                    EventKind::NullifierMismatch,
                    json!({
                        "poll_id": poll.id,
                        "hasher": self.registry.active_hasher_name(),
                    }),
                )
                .await?;
                return Err(SubmitError::NullifierMismatch);
            }
        }

        // 6. Per-poll serialization around one transaction.
        let lock = self.poll_lock(&poll.id).await;
        let _guard = lock.lock().await;

        self.merkle
            .ensure_hydrated(&poll.id)
            .await
            .map_err(unavailable)?;

        let outcome = match tokio::time::timeout(
            self.config.db_timeout,
            self.run_transaction(&poll, &option, &nullifier, claims, request.signature.as_deref()),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(SubmitError::BackingStoreUnavailable(
                "vote transaction timed out".to_string(),
            )),
        };

        match outcome {
            Ok(outcome) => {
                self.cache.invalidate(&poll.id).await;
                info!(poll_id = %poll.id, tx_ref = %outcome.tx_ref, "vote accepted");
                Ok(outcome)
            }
            Err(err) => {
                // The cached tree may hold a tentative append from the
                // aborted transaction; drop it so the next vote
                // re-hydrates from the committed log.
                self.merkle.evict(&poll.id).await;
                if matches!(err, SubmitError::AlreadyVoted) {
                    self.audit_event(
                        EventKind::VoteRejectedDuplicate,
                        json!({
                            "poll_id": poll.id,
                            "hasher": self.registry.active_hasher_name(),
                        }),
                    )
                    .await?;
                }
                Err(err)
            }
        }
    }

    async fn consume_nonce(&self, request: &VoteRequest) -> SubmitResult<()> {
        match self
            .nonces
            .verify_and_consume(&request.nonce, NoncePurpose::Vote)
            .await
        {
            Ok(()) => Ok(()),
            Err(NonceError::BackingStoreUnavailable(msg)) => {
                // Fail closed: the vote path never opens without the
                // nonce store.
                Err(SubmitError::BackingStoreUnavailable(msg))
            }
            Err(err) => {
                let class = match err {
                    NonceError::Consumed => "consumed",
                    _ => "missing-or-expired",
                };
                self.audit_event(
                    EventKind::NonceReplayAttempt,
                    json!({
                        "poll_id": request.poll_id,
                        "class": class,
                        "hasher": self.registry.active_hasher_name(),
                    }),
                )
                .await?;
                Err(SubmitError::NonceInvalid)
            }
        }
    }

    /// Steps 6.a-6.h under the per-poll lock. Any error aborts the whole
    /// tuple: nullifier row, vote row, root advance, and audit entry.
    async fn run_transaction(
        &self,
        poll: &Poll,
        option: &PollOption,
        nullifier: &str,
        claims: &CredentialClaims,
        client_signature: Option<&str>,
    ) -> SubmitResult<SubmitOutcome> {
        let now = Utc::now();
        let bucket = bucket_timestamp(now, self.config.bucket_seconds);

        let mut tx = self.db.begin().await.map_err(unavailable)?;

        // 6.a Nullifier insert: only a unique violation becomes
        // AlreadyVoted; every other failure stays a backend error.
        if let Err(err) = store::insert_nullifier(&mut tx, &poll.id, nullifier, bucket).await {
            if is_unique_violation(&err) {
                return Err(SubmitError::AlreadyVoted);
            }
            return Err(unavailable(err));
        }

        // 6.b-6.d Vote row at the next sequence position.
        let leaf = self.merkle.leaf_hash(&poll.id, &option.id, nullifier, bucket);
        let (root_hex, index) = self.merkle.append(&poll.id, leaf).await.map_err(unavailable)?;

        let vote = VoteRow {
            id: Uuid::new_v4().to_string(),
            poll_id: poll.id.clone(),
            option_id: option.id.clone(),
            poll_seq: index,
            nullifier: nullifier.to_string(),
            bucket_ts: bucket,
            demographics: claims.data.clone(),
        };
        store::insert_vote(&mut tx, &vote).await.map_err(unavailable)?;

        // 6.e Root advance in the same transaction.
        store::upsert_poll_root(&mut tx, &poll.id, &root_hex, index + 1, now)
            .await
            .map_err(unavailable)?;

        // 6.f Receipt over the just-computed leaf and root.
        let payload = ReceiptPayload {
            vote_id: vote.id.clone(),
            poll_id: poll.id.clone(),
            leaf_hash: hex::encode(leaf),
            merkle_root: root_hex,
            ts: now.to_rfc3339_opts(SecondsFormat::Millis, true),
        };
        let receipt = self.signer.sign_receipt(payload).map_err(unavailable)?;

        // 6.g Audit entry chained inside the same transaction.
        audit::append_in(
            &mut tx,
            EventKind::VoteAccepted,
            json!({
                "poll_id": poll.id,
                "leaf_index": index,
                "merkle_root": receipt.payload.merkle_root,
                "client_signature": client_signature,
                "hasher": self.registry.active_hasher_name(),
            }),
        )
        .await
        .map_err(unavailable)?;

        // 6.h
        tx.commit().await.map_err(unavailable)?;

        Ok(SubmitOutcome {
            receipt,
            tx_ref: Uuid::new_v4().to_string(),
        })
    }

    /// Verify a receipt against the active public key and report any
    /// anchor covering its root. Idempotent; double submission is
    /// side-effect-free.
    pub async fn verify_receipt(
        &self,
        receipt: &SignedReceipt,
    ) -> SubmitResult<ReceiptVerification> {
        let signature_valid =
            crate::crypto::receipt::verify_receipt(receipt, &self.signer.public_key_bytes());
        let on_chain_anchor = self
            .db
            .find_anchor(&receipt.payload.poll_id, &receipt.payload.merkle_root)
            .await
            .map_err(unavailable)?;
        Ok(ReceiptVerification {
            valid: signature_valid,
            signature_valid,
            payload: receipt.payload.clone(),
            on_chain_anchor,
        })
    }

    async fn audit_event(&self, kind: EventKind, payload: serde_json::Value) -> SubmitResult<()> {
        self.audit.append(kind, payload).await.map_err(unavailable)?;
        Ok(())
    }

    async fn poll_lock(&self, poll_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.poll_locks.lock().await;
        locks
            .entry(poll_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

fn unavailable<E: std::fmt::Display>(err: E) -> SubmitError {
    SubmitError::BackingStoreUnavailable(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::receipt::verify_receipt;
    use crate::crypto::registry::HasherKind;
    use crate::model::{
        AgeBucket, AudienceRules, DemographicsSnapshot, Gender, GenderRule, Poll, PollKind,
        PollStatus,
    };
    use crate::store::nonce::MemoryNonceStore;

    struct Harness {
        engine: SubmissionEngine,
        db: Database,
        nonces: Arc<MemoryNonceStore>,
        audit: AuditChain,
        signer_key: Vec<u8>,
    }

    async fn harness() -> Harness {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let registry =
            Arc::new(CryptoRegistry::new(HasherKind::Hmac, Some("test-secret")).unwrap());
        let nonces = Arc::new(MemoryNonceStore::default());
        let merkle = Arc::new(MerkleService::new(db.clone(), registry.clone()));
        let (signer, _) = ReceiptSigner::generate().unwrap();
        let signer_key = signer.public_key_bytes();
        let audit = AuditChain::new(db.clone());
        let engine = SubmissionEngine::new(
            db.clone(),
            registry,
            nonces.clone(),
            merkle,
            Arc::new(signer),
            audit.clone(),
            Arc::new(ResultCache::default()),
            SubmissionConfig::default(),
        );
        Harness {
            engine,
            db,
            nonces,
            audit,
            signer_key,
        }
    }

    async fn seed_poll(db: &Database, audience: AudienceRules) {
        let poll = Poll {
            id: "poll1".to_string(),
            title: "Referendum".to_string(),
            kind: PollKind::Referendum,
            status: PollStatus::Active,
            audience,
            min_k_anonymity: 30,
            starts_at: None,
            ends_at: None,
            created_at: Utc::now(),
        };
        let options = vec![
            PollOption {
                id: "optA".to_string(),
                poll_id: "poll1".to_string(),
                label: "Yes".to_string(),
                display_order: 0,
            },
            PollOption {
                id: "optB".to_string(),
                poll_id: "poll1".to_string(),
                label: "No".to_string(),
                display_order: 1,
            },
        ];
        db.insert_poll(&poll, &options).await.unwrap();
    }

    fn claims(subject: &str) -> CredentialClaims {
        CredentialClaims {
            iss: "enrollment.example".to_string(),
            sub: subject.to_string(),
            data: DemographicsSnapshot {
                age_bucket: AgeBucket::From25To34,
                gender: Gender::Male,
                region: "reg_tbilisi".to_string(),
                citizenship: "GE".to_string(),
            },
            exp: Utc::now().timestamp() + 300,
        }
    }

    async fn request(h: &Harness, option_id: &str) -> VoteRequest {
        VoteRequest {
            poll_id: "poll1".to_string(),
            option_id: option_id.to_string(),
            nullifier: None,
            nonce: h.nonces.generate(NoncePurpose::Vote).await.unwrap(),
            signature: None,
            attestation: None,
        }
    }

    #[tokio::test]
    async fn test_happy_path_issues_verifiable_receipt() {
        let h = harness().await;
        seed_poll(&h.db, AudienceRules::default()).await;

        let outcome = h
            .engine
            .submit(&request(&h, "optA").await, &claims("v1"))
            .await
            .unwrap();

        assert_eq!(outcome.receipt.algorithm, "Ed25519");
        assert_eq!(outcome.receipt.version, 1);
        assert!(verify_receipt(&outcome.receipt, &h.signer_key));

        let votes = h.db.list_votes("poll1").await.unwrap();
        assert_eq!(votes.len(), 1);
        assert_eq!(votes[0].poll_seq, 0);

        let (root, count) = h.db.get_poll_root("poll1").await.unwrap().unwrap();
        assert_eq!(root, outcome.receipt.payload.merkle_root);
        assert_eq!(count, 1);

        assert_eq!(h.audit.verify().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_double_vote_rejected_without_new_rows() {
        let h = harness().await;
        seed_poll(&h.db, AudienceRules::default()).await;

        h.engine
            .submit(&request(&h, "optA").await, &claims("v1"))
            .await
            .unwrap();
        let err = h
            .engine
            .submit(&request(&h, "optB").await, &claims("v1"))
            .await
            .unwrap_err();

        assert!(matches!(err, SubmitError::AlreadyVoted));
        assert_eq!(h.db.list_votes("poll1").await.unwrap().len(), 1);

        let entries = h.audit.entries().await.unwrap();
        assert!(entries
            .iter()
            .any(|e| e.kind == "vote-rejected-duplicate"));
    }

    #[tokio::test]
    async fn test_nonce_replay_rejected_and_audited() {
        let h = harness().await;
        seed_poll(&h.db, AudienceRules::default()).await;

        let req = request(&h, "optA").await;
        h.engine.submit(&req, &claims("v1")).await.unwrap();

        // Same nonce again, different voter.
        let replay = VoteRequest {
            nonce: req.nonce.clone(),
            ..request(&h, "optA").await
        };
        let err = h.engine.submit(&replay, &claims("v2")).await.unwrap_err();
        assert!(matches!(err, SubmitError::NonceInvalid));

        let entries = h.audit.entries().await.unwrap();
        assert!(entries.iter().any(|e| e.kind == "nonce-replay-attempt"));
    }

    #[tokio::test]
    async fn test_ineligible_consumes_nonce_and_writes_nothing() {
        let h = harness().await;
        seed_poll(
            &h.db,
            AudienceRules {
                gender: GenderRule::Female,
                ..AudienceRules::default()
            },
        )
        .await;

        let req = request(&h, "optA").await;
        let err = h.engine.submit(&req, &claims("v1")).await.unwrap_err();
        assert!(matches!(err, SubmitError::Ineligible));
        assert!(h.db.list_votes("poll1").await.unwrap().is_empty());

        // The nonce is gone: retrying with it is a replay.
        let err = h.engine.submit(&req, &claims("v1")).await.unwrap_err();
        assert!(matches!(err, SubmitError::NonceInvalid));

        let entries = h.audit.entries().await.unwrap();
        assert!(entries
            .iter()
            .any(|e| e.kind == "vote-rejected-ineligible"));
    }

    #[tokio::test]
    async fn test_inactive_poll_rejected() {
        let h = harness().await;
        let poll = Poll {
            id: "poll1".to_string(),
            title: "Draft".to_string(),
            kind: PollKind::Referendum,
            status: PollStatus::Draft,
            audience: AudienceRules::default(),
            min_k_anonymity: 30,
            starts_at: None,
            ends_at: None,
            created_at: Utc::now(),
        };
        h.db.insert_poll(&poll, &[]).await.unwrap();

        let err = h
            .engine
            .submit(&request(&h, "optA").await, &claims("v1"))
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::PollInactive));
    }

    #[tokio::test]
    async fn test_foreign_option_rejected() {
        let h = harness().await;
        seed_poll(&h.db, AudienceRules::default()).await;

        let mut req = request(&h, "optA").await;
        req.option_id = "unknown-option".to_string();
        let err = h.engine.submit(&req, &claims("v1")).await.unwrap_err();
        assert!(matches!(err, SubmitError::OptionInvalid));
    }

    #[tokio::test]
    async fn test_nullifier_mismatch_audited() {
        let h = harness().await;
        seed_poll(&h.db, AudienceRules::default()).await;

        let mut req = request(&h, "optA").await;
        req.nullifier = Some("00".repeat(32));
        let err = h.engine.submit(&req, &claims("v1")).await.unwrap_err();
        assert!(matches!(err, SubmitError::NullifierMismatch));

        let entries = h.audit.entries().await.unwrap();
        assert!(entries.iter().any(|e| e.kind == "nullifier-mismatch"));
        assert!(h.db.list_votes("poll1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_client_supplied_nullifier_accepted_when_correct() {
        let h = harness().await;
        seed_poll(&h.db, AudienceRules::default()).await;

        let registry =
            CryptoRegistry::new(HasherKind::Hmac, Some("test-secret")).unwrap();
        let mut req = request(&h, "optA").await;
        req.nullifier = Some(compute_nullifier(&registry, "v1", "poll1"));
        h.engine.submit(&req, &claims("v1")).await.unwrap();
    }

    #[tokio::test]
    async fn test_nonce_store_outage_fails_closed() {
        let h = harness().await;
        seed_poll(&h.db, AudienceRules::default()).await;

        let req = request(&h, "optA").await;
        h.nonces.set_unavailable(true);
        let err = h.engine.submit(&req, &claims("v1")).await.unwrap_err();
        assert!(matches!(err, SubmitError::BackingStoreUnavailable(_)));
        assert!(h.db.list_votes("poll1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_attestation_gate() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let registry =
            Arc::new(CryptoRegistry::new(HasherKind::Hmac, Some("test-secret")).unwrap());
        let nonces = Arc::new(MemoryNonceStore::default());
        let merkle = Arc::new(MerkleService::new(db.clone(), registry.clone()));
        let (signer, _) = ReceiptSigner::generate().unwrap();
        let engine = SubmissionEngine::new(
            db.clone(),
            registry,
            nonces.clone(),
            merkle,
            Arc::new(signer),
            AuditChain::new(db.clone()),
            Arc::new(ResultCache::default()),
            SubmissionConfig {
                require_attestation: true,
                ..SubmissionConfig::default()
            },
        );
        seed_poll(&db, AudienceRules::default()).await;

        let req = VoteRequest {
            poll_id: "poll1".to_string(),
            option_id: "optA".to_string(),
            nullifier: None,
            nonce: nonces.generate(NoncePurpose::Vote).await.unwrap(),
            signature: None,
            attestation: None,
        };
        let err = engine.submit(&req, &claims("v1")).await.unwrap_err();
        assert!(matches!(err, SubmitError::AttestationRequired));
    }

    #[tokio::test]
    async fn test_sequential_votes_advance_root() {
        let h = harness().await;
        seed_poll(&h.db, AudienceRules::default()).await;

        let first = h
            .engine
            .submit(&request(&h, "optA").await, &claims("v1"))
            .await
            .unwrap();
        let second = h
            .engine
            .submit(&request(&h, "optB").await, &claims("v2"))
            .await
            .unwrap();

        assert_ne!(
            first.receipt.payload.merkle_root,
            second.receipt.payload.merkle_root
        );
        let (_, count) = h.db.get_poll_root("poll1").await.unwrap().unwrap();
        assert_eq!(count, 2);

        let votes = h.db.list_votes("poll1").await.unwrap();
        assert_eq!(votes[0].poll_seq, 0);
        assert_eq!(votes[1].poll_seq, 1);
    }
}
