//! Events emitted towards the downloaders.
//!
//! Every mutating operation returns the list of events produced by its
//! committed transaction, in commit order. The engine forwards them to the
//! downloader controller after the commit, so downloaders never observe a
//! state that was rolled back.

use wot_core::IdentityId;

use crate::identity::Identity;

/// Which downloader manages an identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Partition {
    /// Continuous subscription; identities directly trusted by an own
    /// identity (rank ≤ 1 from some owner).
    Fast,
    /// One-shot fetches driven by the edition-hint queue.
    Slow,
}

/// An instruction to the downloaders.
#[derive(Clone, Debug, PartialEq)]
pub enum GraphEvent {
    /// The identity became eligible for download, or moved into the given
    /// partition.
    StartFetch {
        /// The identity to fetch.
        id: IdentityId,
        /// The partition now responsible for it.
        partition: Partition,
    },

    /// The identity stopped being eligible for download on the given
    /// partition. All of its stored hints were already deleted inside the
    /// same transaction.
    AbortFetch {
        /// The identity to stop fetching.
        id: IdentityId,
        /// The partition that was responsible for it.
        partition: Partition,
    },

    /// An own identity is about to be converted into a remote identity.
    /// Sent while the old record is still present.
    PreDeleteOwnIdentity {
        /// Snapshot of the own identity before the conversion.
        old: Box<Identity>,
    },

    /// An own identity was converted into a remote identity.
    PostDeleteOwnIdentity {
        /// The replacement record.
        new: Box<Identity>,
    },

    /// A remote identity is about to be converted into an own identity.
    PreRestoreOwnIdentity {
        /// Snapshot of the identity before the conversion.
        old: Box<Identity>,
    },

    /// A remote identity was converted into an own identity.
    PostRestoreOwnIdentity {
        /// The replacement record.
        new: Box<Identity>,
    },

    /// An identity is about to be removed entirely, together with all of
    /// its trusts and scores.
    PreDeleteIdentity {
        /// Snapshot of the identity before removal.
        old: Box<Identity>,
    },

    /// New edition hints were stored; the slow downloader should wake its
    /// request workers.
    HintsChanged,
}
