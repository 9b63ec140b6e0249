//! External-anchor worker.
//!
//! On a fixed cadence, each active poll whose current root moved since
//! the last anchor gets its (pollId, root) committed to the external
//! ledger, giving voters a timestamped tamper witness. Transient ledger
//! failures retry with exponential backoff inside the cycle; terminal
//! failures are audited and skipped until the next cycle. The worker
//! never blocks vote ingestion and holds no lock shared with the vote
//! path.

pub mod ledger;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::audit::{AuditChain, EventKind};
use crate::store::Database;
use self::ledger::{LedgerClient, LedgerError};

/// Worker tunables.
#[derive(Debug, Clone)]
pub struct AnchorConfig {
    pub interval: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub max_attempts: u32,
}

impl Default for AnchorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(600),
            backoff_base: Duration::from_secs(30),
            backoff_cap: Duration::from_secs(1800),
            max_attempts: 5,
        }
    }
}

/// Single-instance background worker anchoring poll roots.
pub struct AnchorWorker {
    db: Database,
    ledger: Arc<dyn LedgerClient>,
    audit: AuditChain,
    hasher_name: &'static str,
    config: AnchorConfig,
}

impl AnchorWorker {
    pub fn new(
        db: Database,
        ledger: Arc<dyn LedgerClient>,
        audit: AuditChain,
        hasher_name: &'static str,
        config: AnchorConfig,
    ) -> Self {
        Self {
            db,
            ledger,
            audit,
            hasher_name,
            config,
        }
    }

    /// Run until the shutdown signal flips. One cycle per interval tick.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_once().await {
                            warn!(error = %e, "anchor cycle failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("anchor worker shutting down");
                            return;
                        }
                    }
                }
            }
        })
    }

    /// One anchoring cycle over all active polls. Returns how many
    /// anchors were committed.
    pub async fn run_once(&self) -> Result<usize, crate::store::StoreError> {
        let polls = self.db.list_active_polls().await?;
        let mut committed = 0;
        for poll in polls {
            let Some((root, _)) = self.db.get_poll_root(&poll.id).await? else {
                continue;
            };
            // Idempotent: a (poll, root) pair is anchored at most once.
            if self.db.anchor_exists(&poll.id, &root).await? {
                continue;
            }
            if self.anchor_poll(&poll.id, &root).await {
                committed += 1;
            }
        }
        Ok(committed)
    }

    /// Submit one root with in-cycle retries. Returns true on commit.
    async fn anchor_poll(&self, poll_id: &str, root: &str) -> bool {
        let mut backoff = self.config.backoff_base;
        for attempt in 1..=self.config.max_attempts {
            match self.ledger.submit_anchor(poll_id, root).await {
                Ok(external_tx) => {
                    if let Err(e) = self
                        .db
                        .insert_anchor(poll_id, root, &external_tx, Utc::now())
                        .await
                    {
                        warn!(poll_id, error = %e, "anchor row insert failed");
                        return false;
                    }
                    let _ = self
                        .audit
                        .append(
                            EventKind::AnchorCommitted,
                            json!({
                                "poll_id": poll_id,
                                "root": root,
                                "external_tx": external_tx,
                                "hasher": self.hasher_name,
                            }),
                        )
                        .await;
                    info!(poll_id, root, external_tx = %external_tx, "anchor committed");
                    return true;
                }
                Err(LedgerError::Transient(reason)) => {
                    warn!(poll_id, attempt, reason = %reason, "transient anchor failure");
                    if attempt == self.config.max_attempts {
                        break;
                    }
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.config.backoff_cap);
                }
                Err(LedgerError::Terminal(reason)) => {
                    warn!(poll_id, reason = %reason, "terminal anchor failure");
                    break;
                }
            }
        }
        let _ = self
            .audit
            .append(
                EventKind::AnchorFailed,
                json!({"poll_id": poll_id, "root": root, "hasher": self.hasher_name}),
            )
            .await;
        false
    }
}
