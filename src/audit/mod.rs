//! Append-only, hash-chained audit log.
//!
//! Each row commits to the previous one:
//! `content_hash = SHA-256(prev_hash || canonical_json({kind, payload, ts}))`
//! with the previous hash in its 64-char hex form. The first row chains
//! from a fixed genesis constant. `verify` walks the chain offline and
//! names the earliest tampered row.
//!
//! Payloads never carry a voter subject, device key, IP, or personal
//! number; rows referring to polls carry only the poll id. Appends made
//! inside a vote transaction commit or roll back with it, so an aborted
//! ballot leaves no phantom entry.

use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use sqlx::{Row, SqliteConnection};
use thiserror::Error;

use crate::crypto::{canonical_json, sha256};
use crate::store::Database;

/// prev_hash of the first row.
pub const GENESIS_PREV_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Payload keys that must never appear in an audit entry, at any depth.
const FORBIDDEN_KEYS: &[&str] = &[
    "sub",
    "subject",
    "voter_subject",
    "device_id",
    "device_key",
    "ip",
    "ip_address",
    "personal_number",
    "pn",
];

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("Audit store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("Audit payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Audit payload carries forbidden key: {0}")]
    ForbiddenField(String),

    #[error("Audit chain broken at row {id}")]
    ChainBroken { id: i64 },
}

/// Security-relevant event kinds witnessed by the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    VoteAccepted,
    VoteRejectedDuplicate,
    VoteRejectedIneligible,
    NullifierMismatch,
    NonceReplayAttempt,
    PollPublished,
    AnchorCommitted,
    AnchorFailed,
    SuppressionTriggered,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::VoteAccepted => "vote-accepted",
            EventKind::VoteRejectedDuplicate => "vote-rejected-duplicate",
            EventKind::VoteRejectedIneligible => "vote-rejected-ineligible",
            EventKind::NullifierMismatch => "nullifier-mismatch",
            EventKind::NonceReplayAttempt => "nonce-replay-attempt",
            EventKind::PollPublished => "poll-published",
            EventKind::AnchorCommitted => "anchor-committed",
            EventKind::AnchorFailed => "anchor-failed",
            EventKind::SuppressionTriggered => "suppression-triggered",
        }
    }
}

/// A decoded audit row.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub id: i64,
    pub ts: String,
    pub kind: String,
    pub payload: Value,
    pub prev_hash: String,
    pub content_hash: String,
}

/// Compute the chained content hash for one entry.
fn chain_hash(prev_hash: &str, kind: &str, payload: &Value, ts: &str) -> Result<String, AuditError> {
    let body = canonical_json(&serde_json::json!({
        "kind": kind,
        "payload": payload,
        "ts": ts,
    }))?;
    let mut preimage = Vec::with_capacity(prev_hash.len() + body.len());
    preimage.extend_from_slice(prev_hash.as_bytes());
    preimage.extend_from_slice(body.as_bytes());
    Ok(hex::encode(sha256(&preimage)))
}

fn check_payload(payload: &Value) -> Result<(), AuditError> {
    match payload {
        Value::Object(map) => {
            for (key, value) in map {
                if FORBIDDEN_KEYS.contains(&key.as_str()) {
                    return Err(AuditError::ForbiddenField(key.clone()));
                }
                check_payload(value)?;
            }
            Ok(())
        }
        Value::Array(items) => {
            for item in items {
                check_payload(item)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Handle over the audit table. Cheap to clone.
#[derive(Clone)]
pub struct AuditChain {
    db: Database,
}

impl AuditChain {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append an entry on its own connection (events outside the vote
    /// transaction: rejections, anchors, suppression).
    pub async fn append(&self, kind: EventKind, payload: Value) -> Result<i64, AuditError> {
        let mut conn = self.db.pool().acquire().await?;
        append_in(&mut conn, kind, payload).await
    }

    /// Verify the whole chain from genesis. Returns the number of rows on
    /// success; a break names the earliest tampered row.
    pub async fn verify(&self) -> Result<u64, AuditError> {
        let rows = sqlx::query(
            "SELECT id, ts, event_kind, event_payload, prev_hash, content_hash
             FROM audit_log ORDER BY id",
        )
        .fetch_all(self.db.pool())
        .await?;

        let mut expected_prev = GENESIS_PREV_HASH.to_string();
        let mut count = 0u64;
        for row in rows {
            let id: i64 = row.try_get("id")?;
            let ts: String = row.try_get("ts")?;
            let kind: String = row.try_get("event_kind")?;
            let payload_raw: String = row.try_get("event_payload")?;
            let prev_hash: String = row.try_get("prev_hash")?;
            let content_hash: String = row.try_get("content_hash")?;

            let payload: Value = serde_json::from_str(&payload_raw)
                .map_err(|_| AuditError::ChainBroken { id })?;
            if prev_hash != expected_prev {
                return Err(AuditError::ChainBroken { id });
            }
            let recomputed = chain_hash(&prev_hash, &kind, &payload, &ts)?;
            if recomputed != content_hash {
                return Err(AuditError::ChainBroken { id });
            }
            expected_prev = content_hash;
            count += 1;
        }
        Ok(count)
    }

    /// All entries in chain order.
    pub async fn entries(&self) -> Result<Vec<AuditEntry>, AuditError> {
        let rows = sqlx::query(
            "SELECT id, ts, event_kind, event_payload, prev_hash, content_hash
             FROM audit_log ORDER BY id",
        )
        .fetch_all(self.db.pool())
        .await?;
        rows.into_iter()
            .map(|row| {
                let payload_raw: String = row.try_get("event_payload")?;
                Ok(AuditEntry {
                    id: row.try_get("id")?,
                    ts: row.try_get("ts")?,
                    kind: row.try_get("event_kind")?,
                    payload: serde_json::from_str(&payload_raw)?,
                    prev_hash: row.try_get("prev_hash")?,
                    content_hash: row.try_get("content_hash")?,
                })
            })
            .collect()
    }

    /// Event counts by kind, for the k-anonymous security summary.
    pub async fn counts_by_kind(&self) -> Result<Vec<(String, i64)>, AuditError> {
        let rows = sqlx::query(
            "SELECT event_kind, COUNT(*) AS n FROM audit_log
             GROUP BY event_kind ORDER BY event_kind",
        )
        .fetch_all(self.db.pool())
        .await?;
        rows.into_iter()
            .map(|row| Ok((row.try_get("event_kind")?, row.try_get("n")?)))
            .collect()
    }
}

/// Append an entry on an existing connection. When the connection belongs
/// to an open transaction, the entry commits or rolls back with it.
pub async fn append_in(
    conn: &mut SqliteConnection,
    kind: EventKind,
    payload: Value,
) -> Result<i64, AuditError> {
    check_payload(&payload)?;

    let prev_hash: String = sqlx::query(
        "SELECT content_hash FROM audit_log ORDER BY id DESC LIMIT 1",
    )
    .fetch_optional(&mut *conn)
    .await?
    .map(|row| row.get("content_hash"))
    .unwrap_or_else(|| GENESIS_PREV_HASH.to_string());

    let ts = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    let content_hash = chain_hash(&prev_hash, kind.as_str(), &payload, &ts)?;

    let result = sqlx::query(
        "INSERT INTO audit_log (ts, event_kind, event_payload, prev_hash, content_hash)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&ts)
    .bind(kind.as_str())
    .bind(serde_json::to_string(&payload)?)
    .bind(&prev_hash)
    .bind(&content_hash)
    .execute(&mut *conn)
    .await?;

    Ok(result.last_insert_rowid())
}
