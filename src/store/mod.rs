//! SQLite persistence for the ballot core (agora.db).
//!
//! Polls and options are written by the admin plane and only read here;
//! nullifiers, votes, poll roots, anchors, and audit rows are written only
//! by the core. Nothing the core writes is ever updated or deleted, with
//! the single exception of the monotonic `poll_roots` advance.
//!
//! The vote table carries the (opaque) nullifier value so the Merkle leaf
//! stream can be recomputed deterministically from the vote log alone; the
//! separate `nullifiers` table exists for the uniqueness constraint and
//! stores nothing but the poll id, the value, and a coarse bucket. No
//! table chain joins a vote to a voter identity.

pub mod nonce;

use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection, SqlitePool};
use thiserror::Error;

use crate::model::{
    format_bucket_ts, parse_bucket_ts, AudienceRules, Poll, PollKind, PollOption, PollStatus,
    VoteRow,
};

/// Result type for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Stored row is malformed: {0}")]
    Corrupt(String),
}

/// True when the error is a uniqueness-constraint violation; the vote path
/// maps exactly this class to `AlreadyVoted` and nothing else.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.kind() == sqlx::error::ErrorKind::UniqueViolation,
        _ => false,
    }
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS polls (
        id TEXT PRIMARY KEY,
        title TEXT NOT NULL,
        kind TEXT NOT NULL,
        status TEXT NOT NULL,
        audience TEXT NOT NULL,
        min_k_anonymity INTEGER NOT NULL,
        starts_at TEXT,
        ends_at TEXT,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS poll_options (
        id TEXT PRIMARY KEY,
        poll_id TEXT NOT NULL REFERENCES polls(id),
        label TEXT NOT NULL,
        display_order INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS nullifiers (
        poll_id TEXT NOT NULL,
        nullifier TEXT NOT NULL,
        created_bucket TEXT NOT NULL,
        UNIQUE(poll_id, nullifier)
    )",
    "CREATE TABLE IF NOT EXISTS votes (
        id TEXT PRIMARY KEY,
        poll_id TEXT NOT NULL,
        option_id TEXT NOT NULL,
        poll_seq INTEGER NOT NULL,
        nullifier TEXT NOT NULL,
        bucket_ts TEXT NOT NULL,
        demographics TEXT NOT NULL,
        UNIQUE(poll_id, poll_seq)
    )",
    "CREATE TABLE IF NOT EXISTS poll_roots (
        poll_id TEXT PRIMARY KEY,
        current_root TEXT NOT NULL,
        leaf_count INTEGER NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS anchors (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        poll_id TEXT NOT NULL,
        root TEXT NOT NULL,
        external_tx TEXT NOT NULL,
        anchored_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS audit_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        ts TEXT NOT NULL,
        event_kind TEXT NOT NULL,
        event_payload TEXT NOT NULL,
        prev_hash TEXT NOT NULL,
        content_hash TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS nonces (
        key TEXT PRIMARY KEY,
        expires_at INTEGER NOT NULL,
        consumed INTEGER NOT NULL DEFAULT 0
    )",
];

/// Shared database handle. Cheap to clone.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (and create if missing) the database at `url`.
    ///
    /// In-memory databases are pinned to a single pooled connection so
    /// every caller sees the same data.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let mut pool_options = SqlitePoolOptions::new();
        if url.contains(":memory:") {
            pool_options = pool_options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }
        let pool = pool_options.connect_with(options).await?;
        Ok(Self { pool })
    }

    /// Create the schema. Idempotent.
    pub async fn migrate(&self) -> StoreResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn begin(&self) -> StoreResult<sqlx::Transaction<'static, sqlx::Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    // ------------------------------------------------------------------
    // Polls and options (admin-plane data; core reads, seeds write)
    // ------------------------------------------------------------------

    /// Insert a poll with its options. Seed/test surface; production polls
    /// arrive through the admin plane's own writer.
    pub async fn insert_poll(&self, poll: &Poll, options: &[PollOption]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO polls (id, title, kind, status, audience, min_k_anonymity,
                                starts_at, ends_at, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&poll.id)
        .bind(&poll.title)
        .bind(poll.kind.as_str())
        .bind(poll.status.as_str())
        .bind(serde_json::to_string(&poll.audience).map_err(|e| StoreError::Corrupt(e.to_string()))?)
        .bind(poll.min_k_anonymity as i64)
        .bind(poll.starts_at.map(|t| t.to_rfc3339()))
        .bind(poll.ends_at.map(|t| t.to_rfc3339()))
        .bind(poll.created_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        for option in options {
            sqlx::query(
                "INSERT INTO poll_options (id, poll_id, label, display_order)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(&option.id)
            .bind(&option.poll_id)
            .bind(&option.label)
            .bind(option.display_order)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Advance a poll's lifecycle status. Admin-plane surface used by
    /// seeds and tests; the core itself never mutates polls.
    pub async fn set_poll_status(&self, poll_id: &str, status: PollStatus) -> StoreResult<()> {
        sqlx::query("UPDATE polls SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(poll_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_poll(&self, poll_id: &str) -> StoreResult<Option<Poll>> {
        let row = sqlx::query("SELECT * FROM polls WHERE id = ?")
            .bind(poll_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_poll(&r)).transpose()
    }

    pub async fn list_polls(&self) -> StoreResult<Vec<Poll>> {
        let rows = sqlx::query("SELECT * FROM polls ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_poll).collect()
    }

    pub async fn list_active_polls(&self) -> StoreResult<Vec<Poll>> {
        let rows = sqlx::query("SELECT * FROM polls WHERE status = 'active' ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_poll).collect()
    }

    pub async fn get_option(&self, option_id: &str) -> StoreResult<Option<PollOption>> {
        let row = sqlx::query("SELECT * FROM poll_options WHERE id = ?")
            .bind(option_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_option(&r)).transpose()
    }

    pub async fn list_options(&self, poll_id: &str) -> StoreResult<Vec<PollOption>> {
        let rows =
            sqlx::query("SELECT * FROM poll_options WHERE poll_id = ? ORDER BY display_order")
                .bind(poll_id)
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(row_to_option).collect()
    }

    // ------------------------------------------------------------------
    // Vote log reads
    // ------------------------------------------------------------------

    /// Leaf pre-image inputs for every vote of a poll, in insertion order.
    pub async fn list_vote_leaves(
        &self,
        poll_id: &str,
    ) -> StoreResult<Vec<(String, String, DateTime<Utc>)>> {
        let rows = sqlx::query(
            "SELECT option_id, nullifier, bucket_ts FROM votes
             WHERE poll_id = ? ORDER BY poll_seq",
        )
        .bind(poll_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let bucket: String = row.try_get("bucket_ts")?;
                let bucket_ts = parse_bucket_ts(&bucket)
                    .ok_or_else(|| StoreError::Corrupt(format!("bad bucket_ts: {bucket}")))?;
                Ok((
                    row.try_get("option_id")?,
                    row.try_get("nullifier")?,
                    bucket_ts,
                ))
            })
            .collect()
    }

    /// All votes of a poll with demographics, for aggregation.
    pub async fn list_votes(&self, poll_id: &str) -> StoreResult<Vec<VoteRow>> {
        let rows = sqlx::query("SELECT * FROM votes WHERE poll_id = ? ORDER BY poll_seq")
            .bind(poll_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_vote).collect()
    }

    pub async fn get_poll_root(&self, poll_id: &str) -> StoreResult<Option<(String, i64)>> {
        let row = sqlx::query(
            "SELECT current_root, leaf_count FROM poll_roots WHERE poll_id = ?",
        )
        .bind(poll_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(match row {
            Some(row) => Some((row.try_get("current_root")?, row.try_get("leaf_count")?)),
            None => None,
        })
    }

    // ------------------------------------------------------------------
    // Anchors
    // ------------------------------------------------------------------

    pub async fn last_anchor(&self, poll_id: &str) -> StoreResult<Option<(String, String)>> {
        let row = sqlx::query(
            "SELECT root, external_tx FROM anchors WHERE poll_id = ?
             ORDER BY id DESC LIMIT 1",
        )
        .bind(poll_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(match row {
            Some(row) => Some((row.try_get("root")?, row.try_get("external_tx")?)),
            None => None,
        })
    }

    /// Whether a specific (poll, root) pair was already anchored.
    pub async fn anchor_exists(&self, poll_id: &str, root: &str) -> StoreResult<bool> {
        Ok(self.find_anchor(poll_id, root).await?.is_some())
    }

    /// External transaction id of an anchored (poll, root) pair, if any.
    pub async fn find_anchor(&self, poll_id: &str, root: &str) -> StoreResult<Option<String>> {
        let row = sqlx::query(
            "SELECT external_tx FROM anchors WHERE poll_id = ? AND root = ? LIMIT 1",
        )
        .bind(poll_id)
        .bind(root)
        .fetch_optional(&self.pool)
        .await?;
        Ok(match row {
            Some(row) => Some(row.try_get("external_tx")?),
            None => None,
        })
    }

    pub async fn insert_anchor(
        &self,
        poll_id: &str,
        root: &str,
        external_tx: &str,
        anchored_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO anchors (poll_id, root, external_tx, anchored_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(poll_id)
        .bind(root)
        .bind(external_tx)
        .bind(anchored_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ----------------------------------------------------------------------
// Transaction-scoped writes (callers pass the open vote transaction)
// ----------------------------------------------------------------------

/// Insert the nullifier row; the unique constraint on (poll_id, nullifier)
/// is the serialization point for double-vote prevention.
pub async fn insert_nullifier(
    conn: &mut SqliteConnection,
    poll_id: &str,
    nullifier: &str,
    created_bucket: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO nullifiers (poll_id, nullifier, created_bucket) VALUES (?, ?, ?)")
        .bind(poll_id)
        .bind(nullifier)
        .bind(format_bucket_ts(created_bucket))
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn insert_vote(conn: &mut SqliteConnection, vote: &VoteRow) -> StoreResult<()> {
    sqlx::query(
        "INSERT INTO votes (id, poll_id, option_id, poll_seq, nullifier, bucket_ts, demographics)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&vote.id)
    .bind(&vote.poll_id)
    .bind(&vote.option_id)
    .bind(vote.poll_seq)
    .bind(&vote.nullifier)
    .bind(format_bucket_ts(vote.bucket_ts))
    .bind(serde_json::to_string(&vote.demographics).map_err(|e| StoreError::Corrupt(e.to_string()))?)
    .execute(conn)
    .await?;
    Ok(())
}

/// Advance the poll's root commitment. Monotonic: leaf_count only grows.
pub async fn upsert_poll_root(
    conn: &mut SqliteConnection,
    poll_id: &str,
    root: &str,
    leaf_count: i64,
    updated_at: DateTime<Utc>,
) -> StoreResult<()> {
    sqlx::query(
        "INSERT INTO poll_roots (poll_id, current_root, leaf_count, updated_at)
         VALUES (?, ?, ?, ?)
         ON CONFLICT(poll_id) DO UPDATE SET
             current_root = excluded.current_root,
             leaf_count = excluded.leaf_count,
             updated_at = excluded.updated_at",
    )
    .bind(poll_id)
    .bind(root)
    .bind(leaf_count)
    .bind(updated_at.to_rfc3339())
    .execute(conn)
    .await?;
    Ok(())
}

// ----------------------------------------------------------------------
// Row mapping
// ----------------------------------------------------------------------

fn row_to_poll(row: &SqliteRow) -> StoreResult<Poll> {
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    let audience: String = row.try_get("audience")?;
    let min_k: i64 = row.try_get("min_k_anonymity")?;
    let starts_at: Option<String> = row.try_get("starts_at")?;
    let ends_at: Option<String> = row.try_get("ends_at")?;
    let created_at: String = row.try_get("created_at")?;

    let audience: AudienceRules = serde_json::from_str(&audience)
        .map_err(|e| StoreError::Corrupt(format!("audience rules: {e}")))?;

    Ok(Poll {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        kind: PollKind::parse(&kind)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown poll kind: {kind}")))?,
        status: PollStatus::parse(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown poll status: {status}")))?,
        audience,
        min_k_anonymity: min_k as u32,
        starts_at: starts_at.as_deref().map(parse_rfc3339).transpose()?,
        ends_at: ends_at.as_deref().map(parse_rfc3339).transpose()?,
        created_at: parse_rfc3339(&created_at)?,
    })
}

fn row_to_option(row: &SqliteRow) -> StoreResult<PollOption> {
    Ok(PollOption {
        id: row.try_get("id")?,
        poll_id: row.try_get("poll_id")?,
        label: row.try_get("label")?,
        display_order: row.try_get("display_order")?,
    })
}

fn row_to_vote(row: &SqliteRow) -> StoreResult<VoteRow> {
    let bucket: String = row.try_get("bucket_ts")?;
    let demographics: String = row.try_get("demographics")?;
    Ok(VoteRow {
        id: row.try_get("id")?,
        poll_id: row.try_get("poll_id")?,
        option_id: row.try_get("option_id")?,
        poll_seq: row.try_get("poll_seq")?,
        nullifier: row.try_get("nullifier")?,
        bucket_ts: parse_bucket_ts(&bucket)
            .ok_or_else(|| StoreError::Corrupt(format!("bad bucket_ts: {bucket}")))?,
        demographics: serde_json::from_str(&demographics)
            .map_err(|e| StoreError::Corrupt(format!("demographics: {e}")))?,
    })
}

fn parse_rfc3339(s: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {s}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AgeBucket, AudienceRules, DemographicsSnapshot, Gender};
    use chrono::TimeZone;

    async fn test_db() -> Database {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    fn sample_poll(id: &str) -> Poll {
        Poll {
            id: id.to_string(),
            title: "Sample".to_string(),
            kind: PollKind::Referendum,
            status: PollStatus::Active,
            audience: AudienceRules::default(),
            min_k_anonymity: 30,
            starts_at: None,
            ends_at: None,
            created_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    fn sample_vote(poll_id: &str, seq: i64, nullifier: &str) -> VoteRow {
        VoteRow {
            id: format!("vote-{seq}"),
            poll_id: poll_id.to_string(),
            option_id: "optA".to_string(),
            poll_seq: seq,
            nullifier: nullifier.to_string(),
            bucket_ts: Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap(),
            demographics: DemographicsSnapshot {
                age_bucket: AgeBucket::From25To34,
                gender: Gender::Female,
                region: "reg_tbilisi".to_string(),
                citizenship: "GE".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn test_migrate_is_idempotent() {
        let db = test_db().await;
        db.migrate().await.unwrap();
    }

    #[tokio::test]
    async fn test_poll_round_trip() {
        let db = test_db().await;
        let poll = sample_poll("poll1");
        let option = PollOption {
            id: "optA".to_string(),
            poll_id: "poll1".to_string(),
            label: "Yes".to_string(),
            display_order: 0,
        };
        db.insert_poll(&poll, std::slice::from_ref(&option)).await.unwrap();

        let loaded = db.get_poll("poll1").await.unwrap().unwrap();
        assert_eq!(loaded.id, "poll1");
        assert_eq!(loaded.status, PollStatus::Active);
        assert_eq!(loaded.min_k_anonymity, 30);

        let options = db.list_options("poll1").await.unwrap();
        assert_eq!(options.len(), 1);
        assert_eq!(options[0].label, "Yes");

        assert!(db.get_poll("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_nullifier_unique_constraint() {
        let db = test_db().await;
        db.insert_poll(&sample_poll("poll1"), &[]).await.unwrap();
        let bucket = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();

        let mut tx = db.begin().await.unwrap();
        insert_nullifier(&mut *tx, "poll1", "n1", bucket).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = db.begin().await.unwrap();
        let err = insert_nullifier(&mut *tx, "poll1", "n1", bucket)
            .await
            .unwrap_err();
        assert!(is_unique_violation(&err));
        tx.rollback().await.unwrap();

        // Same nullifier under a different poll is fine.
        let mut tx = db.begin().await.unwrap();
        insert_nullifier(&mut *tx, "poll2", "n1", bucket).await.unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_vote_leaves_in_insertion_order() {
        let db = test_db().await;
        db.insert_poll(&sample_poll("poll1"), &[]).await.unwrap();

        for seq in 0..3 {
            let mut tx = db.begin().await.unwrap();
            insert_vote(&mut *tx, &sample_vote("poll1", seq, &format!("n{seq}")))
                .await
                .unwrap();
            tx.commit().await.unwrap();
        }

        let leaves = db.list_vote_leaves("poll1").await.unwrap();
        assert_eq!(leaves.len(), 3);
        assert_eq!(leaves[0].1, "n0");
        assert_eq!(leaves[2].1, "n2");
    }

    #[tokio::test]
    async fn test_rollback_leaves_no_rows() {
        let db = test_db().await;
        db.insert_poll(&sample_poll("poll1"), &[]).await.unwrap();
        let bucket = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();

        let mut tx = db.begin().await.unwrap();
        insert_nullifier(&mut *tx, "poll1", "n1", bucket).await.unwrap();
        insert_vote(&mut *tx, &sample_vote("poll1", 0, "n1")).await.unwrap();
        drop(tx); // rollback

        assert!(db.list_votes("poll1").await.unwrap().is_empty());
        let mut tx = db.begin().await.unwrap();
        // Nullifier must not survive the rolled-back vote.
        insert_nullifier(&mut *tx, "poll1", "n1", bucket).await.unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_poll_root_upsert() {
        let db = test_db().await;
        let at = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();

        let mut tx = db.begin().await.unwrap();
        upsert_poll_root(&mut *tx, "poll1", "root-a", 1, at).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(
            db.get_poll_root("poll1").await.unwrap(),
            Some(("root-a".to_string(), 1))
        );

        let mut tx = db.begin().await.unwrap();
        upsert_poll_root(&mut *tx, "poll1", "root-b", 2, at).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(
            db.get_poll_root("poll1").await.unwrap(),
            Some(("root-b".to_string(), 2))
        );
    }

    #[tokio::test]
    async fn test_anchor_bookkeeping() {
        let db = test_db().await;
        let at = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();

        assert!(db.last_anchor("poll1").await.unwrap().is_none());
        db.insert_anchor("poll1", "root-a", "tx-1", at).await.unwrap();
        db.insert_anchor("poll1", "root-b", "tx-2", at).await.unwrap();

        assert_eq!(
            db.last_anchor("poll1").await.unwrap(),
            Some(("root-b".to_string(), "tx-2".to_string()))
        );
        assert!(db.anchor_exists("poll1", "root-a").await.unwrap());
        assert!(!db.anchor_exists("poll1", "root-c").await.unwrap());
    }
}
