//! External ledger client abstraction.
//!
//! The worker only needs one capability: submit a (poll, root) pair and
//! get back an external transaction id. The mock records submissions and
//! can be scripted to fail, transiently or terminally, for tests.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum LedgerError {
    /// Worth retrying with backoff (timeouts, congestion).
    #[error("Transient ledger failure: {0}")]
    Transient(String),

    /// Not worth retrying this cycle (rejection, auth failure).
    #[error("Terminal ledger failure: {0}")]
    Terminal(String),
}

/// Client for the external anchoring ledger.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Submit a root commitment; returns the external transaction id.
    async fn submit_anchor(&self, poll_id: &str, root: &str) -> Result<String, LedgerError>;
}

/// In-memory ledger for tests.
#[derive(Default)]
pub struct MockLedger {
    submissions: Mutex<Vec<(String, String)>>,
    transient_failures: AtomicU32,
    terminal: AtomicBool,
}

impl MockLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` submissions with a transient error.
    pub fn script_transient_failures(&self, n: u32) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    /// Fail every submission terminally until cleared.
    pub fn set_terminal(&self, terminal: bool) {
        self.terminal.store(terminal, Ordering::SeqCst);
    }

    pub async fn submissions(&self) -> Vec<(String, String)> {
        self.submissions.lock().await.clone()
    }
}

#[async_trait]
impl LedgerClient for MockLedger {
    async fn submit_anchor(&self, poll_id: &str, root: &str) -> Result<String, LedgerError> {
        if self.terminal.load(Ordering::SeqCst) {
            return Err(LedgerError::Terminal("submission rejected".to_string()));
        }
        if self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(LedgerError::Transient("ledger busy".to_string()));
        }
        let mut submissions = self.submissions.lock().await;
        submissions.push((poll_id.to_string(), root.to_string()));
        Ok(format!("mock-tx-{}", submissions.len()))
    }
}
