//! Score records.
//!
//! A [`Score`] is derived state: one record per (own identity, subject)
//! pair that the score engine keeps consistent with the trust table. The
//! capacity field is redundant with the rank (it is the tabulated function
//! of it) but is materialised because hint ingestion and download policy
//! read it on hot paths.

use serde::{Deserialize, Serialize};
use wot_core::{capacity_for_rank, IdentityId, Rank};

/// Key of a score record: `(owner, subject)`.
pub type ScoreKey = (IdentityId, IdentityId);

/// Derived rating of a subject from the point of view of one own identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Score {
    owner: IdentityId,
    subject: IdentityId,
    value: i32,
    rank: Rank,
    capacity: u8,
}

impl Score {
    /// Build a score; the capacity is always derived from the rank.
    #[must_use]
    pub fn new(owner: IdentityId, subject: IdentityId, value: i32, rank: Rank) -> Self {
        Score {
            owner,
            subject,
            value,
            rank,
            capacity: capacity_for_rank(rank),
        }
    }

    /// The own identity whose trust tree this score belongs to.
    #[must_use]
    pub fn owner(&self) -> IdentityId {
        self.owner
    }

    /// The rated subject.
    #[must_use]
    pub fn subject(&self) -> IdentityId {
        self.subject
    }

    /// The aggregated signed rating.
    #[must_use]
    pub fn value(&self) -> i32 {
        self.value
    }

    /// Shortest positive-trust distance from the owner.
    #[must_use]
    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// The tabulated capacity for this score's rank.
    #[must_use]
    pub fn capacity(&self) -> u8 {
        self.capacity
    }

    /// The `(owner, subject)` key of this record.
    #[must_use]
    pub fn key(&self) -> ScoreKey {
        (self.owner, self.subject)
    }

    /// Whether this single score justifies downloading the subject:
    /// positive capacity, or a finite rank with a non-negative value.
    #[must_use]
    pub fn justifies_download(&self) -> bool {
        self.capacity > 0 || (self.rank.is_finite() && self.value >= 0)
    }

    /// Whether the subject's trusts propagate capacity in this owner's
    /// tree: it must hold capacity and not be rated as a spammer.
    #[must_use]
    pub fn propagates_capacity(&self) -> bool {
        self.capacity > 0 && self.value >= 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wot_core::id::ID_BYTES;

    fn make_id(n: u8) -> IdentityId {
        let mut bytes = [0u8; ID_BYTES];
        bytes[0] = n;
        IdentityId::from_bytes(bytes)
    }

    #[test]
    fn capacity_is_derived_from_rank() {
        let score = Score::new(make_id(1), make_id(2), 40, Rank::Finite(2));
        assert_eq!(score.capacity(), 16);

        let sentinel = Score::new(make_id(1), make_id(2), -1, Rank::Unreachable);
        assert_eq!(sentinel.capacity(), 0);
    }

    #[test]
    fn download_predicate() {
        // Positive capacity is enough.
        assert!(Score::new(make_id(1), make_id(2), -50, Rank::Finite(1)).justifies_download());
        // Unreachable with non-negative value is not: the rank must be finite.
        assert!(!Score::new(make_id(1), make_id(2), 0, Rank::Unreachable).justifies_download());
        // Unreachable with negative value certainly is not.
        assert!(!Score::new(make_id(1), make_id(2), -1, Rank::Unreachable).justifies_download());
    }

    #[test]
    fn propagation_requires_nonnegative_value() {
        assert!(Score::new(make_id(1), make_id(2), 0, Rank::Finite(2)).propagates_capacity());
        assert!(!Score::new(make_id(1), make_id(2), -1, Rank::Finite(2)).propagates_capacity());
        assert!(!Score::new(make_id(1), make_id(2), 10, Rank::Unreachable).propagates_capacity());
    }
}
