//! `agora run`: wire the core services together and run until ctrl-c.
//!
//! The HTTP transport is an external collaborator; this command brings up
//! everything behind it - crypto registry, database, nonce store,
//! submission engine, aggregation service, and the anchor worker - and
//! keeps the background services alive.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use agora::aggregation::{AggregationService, ResultCache};
use agora::anchor::ledger::MockLedger;
use agora::anchor::AnchorWorker;
use agora::audit::AuditChain;
use agora::crypto::receipt::ReceiptSigner;
use agora::crypto::registry::{CryptoRegistry, HasherKind};
use agora::merkle::MerkleService;
use agora::store::nonce::SqliteNonceStore;
use agora::store::Database;
use agora::submission::SubmissionEngine;

use super::config::{AgoraConfig, RECEIPT_PRIVATE_KEY_ENV};
use super::init_logging;

/// Load the receipt signer from the environment, generating an ephemeral
/// dev key when none is configured.
pub fn load_signer(config: &AgoraConfig) -> Result<ReceiptSigner, Box<dyn std::error::Error>> {
    match config.receipt_private_key() {
        Some(encoded) => Ok(ReceiptSigner::from_pkcs8_base64(&encoded)?),
        None => {
            let (signer, _) = ReceiptSigner::generate()?;
            warn!(
                "{} not set; using an ephemeral receipt key (receipts will \
                 not verify across restarts)",
                RECEIPT_PRIVATE_KEY_ENV
            );
            Ok(signer)
        }
    }
}

pub async fn execute(config: AgoraConfig) -> Result<(), Box<dyn std::error::Error>> {
    init_logging(&config);

    let kind = HasherKind::parse(&config.crypto.hasher)?;
    let registry = Arc::new(CryptoRegistry::new(
        kind,
        config.nullifier_secret().as_deref(),
    )?);
    info!(hasher = registry.active_hasher_name(), "crypto registry ready");

    let db = Database::connect(&config.database.url).await?;
    db.migrate().await?;
    info!(url = %config.database.url, "database ready");

    let signer = Arc::new(load_signer(&config)?);
    let audit = AuditChain::new(db.clone());
    let cache = Arc::new(ResultCache::default());
    let merkle = Arc::new(MerkleService::new(db.clone(), registry.clone()));
    let nonces = Arc::new(SqliteNonceStore::new(
        db.clone(),
        config.nonce_ttls(),
        std::time::Duration::from_secs(config.nonce.store_timeout_secs),
    ));

    let _engine = SubmissionEngine::new(
        db.clone(),
        registry.clone(),
        nonces,
        merkle,
        signer.clone(),
        audit.clone(),
        cache.clone(),
        config.submission_config(),
    );
    let _aggregation = AggregationService::new(
        db.clone(),
        audit.clone(),
        cache,
        registry.active_hasher_name(),
    );

    // Production deployments inject a real ledger client through the
    // library API; the bundled binary anchors against an in-process mock.
    warn!("anchoring against the in-process mock ledger (dev mode)");
    let ledger = Arc::new(MockLedger::new());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = AnchorWorker::new(
        db,
        ledger,
        audit,
        registry.active_hasher_name(),
        config.anchor_config(),
    );
    let worker_handle = worker.spawn(shutdown_rx);

    info!("agora core running; press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    info!("shutting down");
    shutdown_tx.send(true)?;
    worker_handle.await?;
    Ok(())
}
