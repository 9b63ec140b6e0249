//! Agora - Anonymous Ballot Ingestion & Audit Core
//!
//! Server-side pipeline for a privacy-preserving national referendum
//! platform.
//!
//! Key principles:
//! - One decisive ballot per enrolled voter per poll (nullifier uniqueness)
//! - No database path from a vote back to the voter
//! - Every accepted vote is committed into a per-poll Merkle tree and
//!   periodically anchored to an external ledger
//! - Demographic analytics are published only above a k-anonymity floor
//! - Every security-relevant event is witnessed by a hash-chained audit log

pub mod aggregation;
pub mod anchor;
pub mod audit;
pub mod credential;
pub mod crypto;
pub mod error;
pub mod merkle;
pub mod model;
pub mod store;
pub mod submission;
