//! Ranks and the rank → capacity table.
//!
//! The rank of a subject is its shortest-hop distance from an own identity
//! through positively valued trust edges. Capacity is a pure function of
//! rank: the weight with which the subject's own outgoing trusts contribute
//! to the scores of its trustees.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Capacities for ranks `0..=6`. Ranks beyond 6 keep capacity 1, the
/// unreachable sentinel has capacity 0.
pub const CAPACITIES: [u8; 7] = [100, 40, 16, 6, 2, 1, 1];

/// Distance from an own identity in the positive trust graph.
///
/// `Unreachable` is the sentinel for subjects that have no positive-trust
/// path from the owner (for example subjects the owner distrusts directly).
/// It orders above every finite rank.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Rank {
    /// Reachable through `n` positive-trust hops.
    Finite(u32),
    /// No positive-trust path exists.
    Unreachable,
}

impl Rank {
    /// Rank of an own identity relative to itself.
    pub const ROOT: Rank = Rank::Finite(0);

    /// Whether the rank is finite.
    #[must_use]
    pub const fn is_finite(&self) -> bool {
        matches!(self, Rank::Finite(_))
    }

    /// The rank one hop further away. Unreachable stays unreachable.
    #[must_use]
    pub const fn next_hop(&self) -> Rank {
        match self {
            Rank::Finite(n) => Rank::Finite(*n + 1),
            Rank::Unreachable => Rank::Unreachable,
        }
    }
}

impl PartialOrd for Rank {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Rank {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        use Rank::*;
        match (self, other) {
            (Finite(a), Finite(b)) => a.cmp(b),
            (Finite(_), Unreachable) => std::cmp::Ordering::Less,
            (Unreachable, Finite(_)) => std::cmp::Ordering::Greater,
            (Unreachable, Unreachable) => std::cmp::Ordering::Equal,
        }
    }
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rank::Finite(n) => write!(f, "{n}"),
            Rank::Unreachable => f.write_str("∞"),
        }
    }
}

impl fmt::Debug for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Rank({self})")
    }
}

/// The tabulated rank → capacity function.
#[must_use]
pub const fn capacity_for_rank(rank: Rank) -> u8 {
    match rank {
        Rank::Finite(n) if (n as usize) < CAPACITIES.len() => CAPACITIES[n as usize],
        Rank::Finite(_) => 1,
        Rank::Unreachable => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_table_matches_spec() {
        assert_eq!(capacity_for_rank(Rank::Finite(0)), 100);
        assert_eq!(capacity_for_rank(Rank::Finite(1)), 40);
        assert_eq!(capacity_for_rank(Rank::Finite(2)), 16);
        assert_eq!(capacity_for_rank(Rank::Finite(3)), 6);
        assert_eq!(capacity_for_rank(Rank::Finite(4)), 2);
        assert_eq!(capacity_for_rank(Rank::Finite(5)), 1);
        assert_eq!(capacity_for_rank(Rank::Finite(6)), 1);
    }

    #[test]
    fn deep_ranks_keep_capacity_one() {
        assert_eq!(capacity_for_rank(Rank::Finite(7)), 1);
        assert_eq!(capacity_for_rank(Rank::Finite(1000)), 1);
    }

    #[test]
    fn unreachable_has_zero_capacity() {
        assert_eq!(capacity_for_rank(Rank::Unreachable), 0);
    }

    #[test]
    fn unreachable_orders_above_all_finite_ranks() {
        assert!(Rank::Finite(0) < Rank::Finite(1));
        assert!(Rank::Finite(u32::MAX) < Rank::Unreachable);
        assert_eq!(Rank::Unreachable, Rank::Unreachable);
    }

    #[test]
    fn next_hop_increments_finite_only() {
        assert_eq!(Rank::Finite(2).next_hop(), Rank::Finite(3));
        assert_eq!(Rank::Unreachable.next_hop(), Rank::Unreachable);
    }
}
