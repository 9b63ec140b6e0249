//! Nullifier derivation: a per-(voter, poll) opaque identifier.
//!
//! The nullifier is the registry's keyed hash over the voter subject and
//! the poll id, each length-prefixed (see `registry::frame_inputs`).
//! Re-deriving for the same pair is byte-identical; deriving for a
//! different voter or poll diverges; and without the registry secret the
//! value reveals nothing about the voter, so an outsider who knows a poll
//! id cannot precompute nullifiers for guessed subjects.

use super::registry::CryptoRegistry;

/// Derive the canonical nullifier for a (voter subject, poll) pair.
pub fn compute_nullifier(registry: &CryptoRegistry, voter_subject: &str, poll_id: &str) -> String {
    registry
        .hasher()
        .keyed_hash(&[voter_subject.as_bytes(), poll_id.as_bytes()])
}

/// Constant-time check of a claimed nullifier against the fresh
/// derivation. The server's own derivation stays authoritative either way.
pub fn verify_nullifier(
    registry: &CryptoRegistry,
    voter_subject: &str,
    poll_id: &str,
    claimed: &str,
) -> bool {
    registry
        .hasher()
        .verify(claimed, &[voter_subject.as_bytes(), poll_id.as_bytes()])
}
