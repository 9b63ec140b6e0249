//! `agora verify-audit`: offline integrity check.
//!
//! Walks the audit chain from genesis and recomputes every poll's Merkle
//! root from the vote log, comparing against the stored commitment. A
//! database operator who rewrote history fails one of the two checks.

use std::sync::Arc;

use agora::audit::{AuditChain, AuditError};
use agora::crypto::registry::{CryptoRegistry, HasherKind};
use agora::merkle::MerkleService;
use agora::store::Database;

use super::config::AgoraConfig;
use super::init_logging;

pub async fn execute(config: AgoraConfig) -> Result<(), Box<dyn std::error::Error>> {
    init_logging(&config);

    let kind = HasherKind::parse(&config.crypto.hasher)?;
    let registry = Arc::new(CryptoRegistry::new(
        kind,
        config.nullifier_secret().as_deref(),
    )?);
    let db = Database::connect(&config.database.url).await?;
    db.migrate().await?;

    let mut failed = false;

    match AuditChain::new(db.clone()).verify().await {
        Ok(rows) => println!("audit chain: OK ({rows} rows)"),
        Err(AuditError::ChainBroken { id }) => {
            println!("audit chain: BROKEN at row {id}");
            failed = true;
        }
        Err(e) => return Err(e.into()),
    }

    let merkle = MerkleService::new(db.clone(), registry);
    for poll in db.list_polls().await? {
        if merkle.verify_poll_root(&poll.id).await? {
            println!("poll {}: root OK", poll.id);
        } else {
            println!("poll {}: root MISMATCH (vote log does not rebuild the stored root)", poll.id);
            failed = true;
        }
    }

    if failed {
        return Err("integrity verification failed".into());
    }
    Ok(())
}
