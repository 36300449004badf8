//! Error types for the graph crate.

use thiserror::Error;
use wot_core::{CoreError, IdentityId};

/// Errors raised by the graph store, the mutation API, and the score
/// engine.
#[derive(Error, Debug)]
pub enum GraphError {
    /// Lookup of an identity that is not in the store.
    #[error("unknown identity: {0}")]
    UnknownIdentity(IdentityId),

    /// Lookup of a trust edge that is not in the store.
    #[error("unknown trust: {truster} -> {trustee}")]
    UnknownTrust {
        /// The asserted truster.
        truster: IdentityId,
        /// The asserted trustee.
        trustee: IdentityId,
    },

    /// Lookup of an edition hint that is not in the store.
    #[error("unknown edition hint: {publisher} -> {subject}")]
    UnknownEditionHint {
        /// The identity that published the hint.
        publisher: IdentityId,
        /// The identity the hint points at.
        subject: IdentityId,
    },

    /// A uniqueness invariant was violated. Fatal: the current transaction
    /// is aborted and a full score verification is scheduled.
    #[error("duplicate object: {0}")]
    DuplicateObject(String),

    /// The single-writer transaction could not be acquired within the
    /// retry budget.
    #[error("store unavailable: write transaction could not be acquired")]
    Unavailable,

    /// A boundary validation failure from the core types.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// The underlying storage failed.
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    /// A stored record could not be decoded.
    #[error("corrupt record: {0}")]
    CorruptRecord(String),
}

/// Result type alias for [`GraphError`].
pub type Result<T> = std::result::Result<T, GraphError>;
