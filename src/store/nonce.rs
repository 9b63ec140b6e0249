//! Single-use, TTL-bound, purpose-scoped nonces.
//!
//! A nonce binds a request to a short-lived server-issued value.
//! Consumption is a single atomic statement against the backing store
//! (no get-then-delete TOCTOU window). Consumed nonces leave a tombstone
//! until their TTL elapses so a replay can be told apart from a nonce
//! that never existed; the vote path audits replays.
//!
//! Every store operation runs under a hard timeout. On timeout or store
//! failure callers MUST fail closed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::rngs::OsRng;
use rand::RngCore;
use sqlx::Row;
use thiserror::Error;
use tokio::sync::Mutex;

use super::Database;

/// Result type for nonce operations.
pub type NonceResult<T> = Result<T, NonceError>;

#[derive(Debug, Error)]
pub enum NonceError {
    /// The nonce expired or never existed.
    #[error("Nonce not found or expired")]
    NotFound,

    /// The nonce was already consumed (single-use is absolute).
    #[error("Nonce was already consumed")]
    Consumed,

    /// The purpose string is not one of the enumerated purposes.
    #[error("Unknown nonce purpose: {0}")]
    UnknownPurpose(String),

    /// The backing store failed or timed out; callers fail closed.
    #[error("Nonce store unavailable: {0}")]
    BackingStoreUnavailable(String),
}

/// Enumerated nonce purposes. Unknown purposes are rejected at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NoncePurpose {
    Challenge,
    Vote,
    EnrollLiveness,
    AdminMfa,
}

impl NoncePurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoncePurpose::Challenge => "challenge",
            NoncePurpose::Vote => "vote",
            NoncePurpose::EnrollLiveness => "enroll-liveness",
            NoncePurpose::AdminMfa => "admin-mfa",
        }
    }

    pub fn parse(s: &str) -> NonceResult<Self> {
        match s {
            "challenge" => Ok(NoncePurpose::Challenge),
            "vote" => Ok(NoncePurpose::Vote),
            "enroll-liveness" => Ok(NoncePurpose::EnrollLiveness),
            "admin-mfa" => Ok(NoncePurpose::AdminMfa),
            other => Err(NonceError::UnknownPurpose(other.to_string())),
        }
    }
}

/// Per-purpose TTLs.
#[derive(Debug, Clone)]
pub struct NonceTtls {
    pub challenge: Duration,
    pub vote: Duration,
    pub enroll_liveness: Duration,
    pub admin_mfa: Duration,
}

impl Default for NonceTtls {
    fn default() -> Self {
        Self {
            challenge: Duration::from_secs(60),
            vote: Duration::from_secs(60),
            enroll_liveness: Duration::from_secs(300),
            admin_mfa: Duration::from_secs(120),
        }
    }
}

impl NonceTtls {
    pub fn ttl_for(&self, purpose: NoncePurpose) -> Duration {
        match purpose {
            NoncePurpose::Challenge => self.challenge,
            NoncePurpose::Vote => self.vote,
            NoncePurpose::EnrollLiveness => self.enroll_liveness,
            NoncePurpose::AdminMfa => self.admin_mfa,
        }
    }
}

/// Nonce store capability.
#[async_trait]
pub trait NonceStore: Send + Sync {
    /// Mint a 256-bit nonce (64 hex chars) under the purpose's TTL.
    async fn generate(&self, purpose: NoncePurpose) -> NonceResult<String>;

    /// Atomically redeem the nonce; a second redemption fails.
    async fn verify_and_consume(&self, nonce: &str, purpose: NoncePurpose) -> NonceResult<()>;

    /// Remaining lifetime of an unconsumed nonce.
    async fn ttl(&self, nonce: &str, purpose: NoncePurpose) -> NonceResult<Duration>;
}

fn random_nonce() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn storage_key(purpose: NoncePurpose, value: &str) -> String {
    format!("nonce:{}:{}", purpose.as_str(), value)
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// SQLite-backed nonce store.
pub struct SqliteNonceStore {
    db: Database,
    ttls: NonceTtls,
    op_timeout: Duration,
}

impl SqliteNonceStore {
    pub fn new(db: Database, ttls: NonceTtls, op_timeout: Duration) -> Self {
        Self {
            db,
            ttls,
            op_timeout,
        }
    }

    async fn bounded<T, F>(&self, fut: F) -> NonceResult<T>
    where
        F: std::future::Future<Output = Result<T, sqlx::Error>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(NonceError::BackingStoreUnavailable(e.to_string())),
            Err(_) => Err(NonceError::BackingStoreUnavailable(
                "operation timed out".to_string(),
            )),
        }
    }
}

#[async_trait]
impl NonceStore for SqliteNonceStore {
    async fn generate(&self, purpose: NoncePurpose) -> NonceResult<String> {
        let value = random_nonce();
        let key = storage_key(purpose, &value);
        let now = now_millis();
        let expires_at = now + self.ttls.ttl_for(purpose).as_millis() as i64;
        let pool = self.db.pool().clone();

        self.bounded(async {
            // Opportunistic purge keeps the table and tombstones bounded.
            sqlx::query("DELETE FROM nonces WHERE expires_at <= ?")
                .bind(now)
                .execute(&pool)
                .await?;
            sqlx::query("INSERT INTO nonces (key, expires_at, consumed) VALUES (?, ?, 0)")
                .bind(&key)
                .bind(expires_at)
                .execute(&pool)
                .await?;
            Ok(())
        })
        .await?;

        Ok(value)
    }

    async fn verify_and_consume(&self, nonce: &str, purpose: NoncePurpose) -> NonceResult<()> {
        let key = storage_key(purpose, nonce);
        let now = now_millis();
        let pool = self.db.pool().clone();

        // Single-statement consume: the serialization point for replays.
        let consumed_now = self
            .bounded(async {
                let result = sqlx::query(
                    "UPDATE nonces SET consumed = 1
                     WHERE key = ? AND consumed = 0 AND expires_at > ?",
                )
                .bind(&key)
                .bind(now)
                .execute(&pool)
                .await?;
                Ok(result.rows_affected() > 0)
            })
            .await?;

        if consumed_now {
            return Ok(());
        }

        // Losing the race: tell a replayed nonce apart from an unknown one.
        let tombstone = self
            .bounded(async {
                let row = sqlx::query(
                    "SELECT consumed FROM nonces WHERE key = ? AND expires_at > ?",
                )
                .bind(&key)
                .bind(now)
                .fetch_optional(&pool)
                .await?;
                Ok(row.map(|r| r.get::<i64, _>("consumed")))
            })
            .await?;

        match tombstone {
            Some(1) => Err(NonceError::Consumed),
            _ => Err(NonceError::NotFound),
        }
    }

    async fn ttl(&self, nonce: &str, purpose: NoncePurpose) -> NonceResult<Duration> {
        let key = storage_key(purpose, nonce);
        let now = now_millis();
        let pool = self.db.pool().clone();

        let expires_at = self
            .bounded(async {
                let row = sqlx::query(
                    "SELECT expires_at FROM nonces
                     WHERE key = ? AND consumed = 0 AND expires_at > ?",
                )
                .bind(&key)
                .bind(now)
                .fetch_optional(&pool)
                .await?;
                Ok(row.map(|r| r.get::<i64, _>("expires_at")))
            })
            .await?;

        match expires_at {
            Some(expires_at) => Ok(Duration::from_millis((expires_at - now).max(0) as u64)),
            None => Err(NonceError::NotFound),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct MemoryEntry {
    expires_at: i64,
    consumed: bool,
}

/// In-memory nonce store for tests (same semantics as the SQLite store).
pub struct MemoryNonceStore {
    entries: Mutex<HashMap<String, MemoryEntry>>,
    ttls: NonceTtls,
    unavailable: AtomicBool,
}

impl MemoryNonceStore {
    pub fn new(ttls: NonceTtls) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttls,
            unavailable: AtomicBool::new(false),
        }
    }

    /// Simulate a backing-store outage.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> NonceResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(NonceError::BackingStoreUnavailable(
                "simulated outage".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

impl Default for MemoryNonceStore {
    fn default() -> Self {
        Self::new(NonceTtls::default())
    }
}

#[async_trait]
impl NonceStore for MemoryNonceStore {
    async fn generate(&self, purpose: NoncePurpose) -> NonceResult<String> {
        self.check_available()?;
        let value = random_nonce();
        let expires_at = now_millis() + self.ttls.ttl_for(purpose).as_millis() as i64;
        self.entries.lock().await.insert(
            storage_key(purpose, &value),
            MemoryEntry {
                expires_at,
                consumed: false,
            },
        );
        Ok(value)
    }

    async fn verify_and_consume(&self, nonce: &str, purpose: NoncePurpose) -> NonceResult<()> {
        self.check_available()?;
        let key = storage_key(purpose, nonce);
        let now = now_millis();
        let mut entries = self.entries.lock().await;
        match entries.get_mut(&key) {
            Some(entry) if entry.expires_at <= now => Err(NonceError::NotFound),
            Some(entry) if entry.consumed => Err(NonceError::Consumed),
            Some(entry) => {
                entry.consumed = true;
                Ok(())
            }
            None => Err(NonceError::NotFound),
        }
    }

    async fn ttl(&self, nonce: &str, purpose: NoncePurpose) -> NonceResult<Duration> {
        self.check_available()?;
        let key = storage_key(purpose, nonce);
        let now = now_millis();
        let entries = self.entries.lock().await;
        match entries.get(&key) {
            Some(entry) if !entry.consumed && entry.expires_at > now => {
                Ok(Duration::from_millis((entry.expires_at - now) as u64))
            }
            _ => Err(NonceError::NotFound),
        }
    }
}
