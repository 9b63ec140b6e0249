//! Operational error taxonomy for the ballot pipeline.
//!
//! Every error a caller can observe maps to a stable machine-readable code.
//! Messages stay generic on purpose: the server must not leak whether a
//! voter has voted in a *different* poll, nor any demographic fact.

use thiserror::Error;

/// Result type for vote submission.
pub type SubmitResult<T> = Result<T, SubmitError>;

/// Errors returned to the caller of the vote-submission path.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// Nonce missing, expired, or already consumed.
    #[error("Nonce is missing, expired, or already consumed")]
    NonceInvalid,

    /// Poll does not accept ballots right now.
    #[error("Poll is not accepting ballots")]
    PollInactive,

    /// Option does not belong to the poll.
    #[error("Option does not belong to this poll")]
    OptionInvalid,

    /// The credential's demographic bucket does not match the poll audience.
    #[error("Voter is not in this poll's audience")]
    Ineligible,

    /// Client-supplied nullifier disagrees with the server derivation.
    #[error("Claimed nullifier does not match the server derivation")]
    NullifierMismatch,

    /// A nullifier already exists for this (voter, poll).
    #[error("A ballot was already cast in this poll")]
    AlreadyVoted,

    /// Device attestation is required by configuration but was not supplied.
    #[error("Device attestation is required")]
    AttestationRequired,

    /// Referenced poll does not exist.
    #[error("Poll not found")]
    NotFound,

    /// A backing store (database, nonce store, audit chain) is unavailable.
    /// The server fails closed; the client may retry with a fresh nonce.
    #[error("Backing store unavailable: {0}")]
    BackingStoreUnavailable(String),
}

impl SubmitError {
    /// Stable machine-readable code for the wire.
    pub fn code(&self) -> &'static str {
        match self {
            SubmitError::NonceInvalid => "NonceInvalid",
            SubmitError::PollInactive => "PollInactive",
            SubmitError::OptionInvalid => "OptionInvalid",
            SubmitError::Ineligible => "Ineligible",
            SubmitError::NullifierMismatch => "NullifierMismatch",
            SubmitError::AlreadyVoted => "AlreadyVoted",
            SubmitError::AttestationRequired => "AttestationRequired",
            SubmitError::NotFound => "NotFound",
            SubmitError::BackingStoreUnavailable(_) => "BackingStoreUnavailable",
        }
    }

    /// Whether the client may retry the request (with a fresh nonce).
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            SubmitError::NonceInvalid | SubmitError::BackingStoreUnavailable(_)
        )
    }
}
