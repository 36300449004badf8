//! The score engine.
//!
//! Keeps the derived score table consistent with the trust table. The
//! reference algorithm ([`ScoreEngine::recompute_owner`]) defines the
//! ground truth; the incremental path applied on every trust change
//! reproduces its result while touching only the affected part of the
//! graph, which is what makes large webs responsive. If the incremental
//! worklist exceeds its step budget it falls back to the reference
//! algorithm for the affected owner.
//!
//! ## Semantics
//!
//! For one own identity `O`:
//!
//! - A subject `S` has a score record iff `S == O` or at least one truster
//!   of `S` propagates capacity in `O`'s tree (positive capacity and
//!   non-negative value).
//! - `rank(S)` is the shortest positive-trust distance from `O` through
//!   propagating nodes. A direct trust from `O` dominates: positive pins
//!   rank 1, non-positive pins the unreachable sentinel no matter what
//!   other paths exist.
//! - `value(S)` is `O`'s direct trust value if `O` rated `S` directly,
//!   otherwise the sum of `trust(T,S) × capacity(T) / 100` over
//!   propagating trusters `T`, truncated toward zero per term and
//!   saturated to `i32`.
//! - `capacity(S)` is the tabulated function of `rank(S)`.
//!
//! The distrust cutoff (a node with negative value propagates nothing) is
//! applied as a fixpoint: recomputation repeats with the cutoff set of
//! the previous iteration until it stabilises. Acyclic value dependencies
//! stabilise within the iteration bound; a graph engineered to oscillate
//! is cut off at the bound and cleaned up by the periodic verification.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use tracing::{debug, info, warn};
use wot_core::config::ScoringConfig;
use wot_core::{IdentityId, Rank, TrustValue};

use crate::error::Result;
use crate::score::Score;
use crate::store::WriteTxn;

/// Default own-identity self value when no self-trust edge exists.
const OWN_SELF_VALUE: i32 = 100;

/// Maximum entries kept in the per-transaction rank cache.
const RANK_CACHE_CAPACITY: usize = 65_536;

/// Rank cache shared by successive rank recomputations inside one
/// transaction. Eviction is insertion-ordered, which matches the access
/// pattern of one bulk fill followed by point reads.
struct RankCache {
    ranks: HashMap<IdentityId, Rank>,
    order: VecDeque<IdentityId>,
}

impl RankCache {
    fn new() -> Self {
        RankCache {
            ranks: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&self, id: IdentityId) -> Option<Rank> {
        self.ranks.get(&id).copied()
    }

    fn put(&mut self, id: IdentityId, rank: Rank) {
        if self.ranks.insert(id, rank).is_none() {
            self.order.push_back(id);
            if self.order.len() > RANK_CACHE_CAPACITY {
                if let Some(evicted) = self.order.pop_front() {
                    self.ranks.remove(&evicted);
                }
            }
        }
    }

    fn clear(&mut self) {
        self.ranks.clear();
        self.order.clear();
    }
}

/// Step budget for one incremental update. Exhaustion triggers the full
/// recomputation fallback.
struct Budget {
    remaining: usize,
}

impl Budget {
    fn new(limit: usize) -> Self {
        Budget { remaining: limit }
    }

    /// Spend one step; returns false once the budget is gone.
    fn step(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        true
    }
}

enum Computed {
    Done(Option<(Rank, i32)>),
    Exhausted,
}

/// The score engine. Stateless apart from configuration; all graph state
/// lives in the transaction it operates on.
pub(crate) struct ScoreEngine<'c> {
    config: &'c ScoringConfig,
}

impl<'c> ScoreEngine<'c> {
    pub(crate) fn new(config: &'c ScoringConfig) -> Self {
        ScoreEngine { config }
    }

    /// React to one trust change `(truster, trustee, old -> new)` that has
    /// already been applied to the trust table inside `txn`. Returns the
    /// subjects whose scores changed for any owner.
    pub(crate) fn update_on_trust_change(
        &self,
        txn: &mut WriteTxn<'_>,
        truster: IdentityId,
        trustee: IdentityId,
        old_value: Option<TrustValue>,
        new_value: Option<TrustValue>,
    ) -> Result<HashSet<IdentityId>> {
        let mut affected = HashSet::new();
        for owner in txn.own_ids() {
            if self.config.legacy_reference_scoring {
                affected.extend(self.recompute_owner(txn, owner, false));
                continue;
            }
            match self.try_incremental(txn, owner, truster, trustee, old_value, new_value) {
                Some(subjects) => affected.extend(subjects),
                None => {
                    warn!(
                        owner = %owner,
                        "incremental score update exhausted its step budget, \
                         falling back to full recomputation"
                    );
                    affected.extend(self.recompute_owner(txn, owner, false));
                }
            }
        }
        Ok(affected)
    }

    /// Rebuild the whole score tree of one owner with the reference
    /// algorithm and diff-apply it. Returns the changed subjects.
    pub(crate) fn recompute_owner(
        &self,
        txn: &mut WriteTxn<'_>,
        owner: IdentityId,
        log_corrections: bool,
    ) -> HashSet<IdentityId> {
        let table = compute_owner_table(txn, owner);
        apply_owner_table(txn, owner, table, log_corrections).0
    }

    /// Rebuild every owner's score tree. Returns the changed subjects.
    pub(crate) fn recompute_all(&self, txn: &mut WriteTxn<'_>) -> HashSet<IdentityId> {
        let mut affected = HashSet::new();
        for owner in txn.own_ids() {
            affected.extend(self.recompute_owner(txn, owner, false));
        }
        affected
    }

    /// Full verification: recompute everything into scratch tables, diff
    /// against the stored scores, correct and log every discrepancy.
    /// Returns `(corrections, changed subjects)`.
    pub(crate) fn verify_and_correct(
        &self,
        txn: &mut WriteTxn<'_>,
    ) -> Result<(usize, HashSet<IdentityId>)> {
        let mut corrections = 0usize;
        let mut affected = HashSet::new();

        // Scores owned by identities that are no longer own are leaks.
        let own: HashSet<IdentityId> = txn.own_ids().into_iter().collect();
        let stale: Vec<Score> = txn
            .all_scores()
            .into_iter()
            .filter(|score| !own.contains(&score.owner()))
            .collect();
        for score in stale {
            warn!(
                owner = %score.owner(),
                subject = %score.subject(),
                "correcting score owned by a non-own identity"
            );
            txn.delete_score(score.key());
            affected.insert(score.subject());
            corrections += 1;
        }

        for owner in txn.own_ids() {
            let table = compute_owner_table(txn, owner);
            let (changed, count) = apply_owner_table(txn, owner, table, true);
            affected.extend(changed);
            corrections += count;
        }

        if corrections > 0 {
            warn!(corrections, "score verification corrected discrepancies");
        } else {
            info!("score verification found no discrepancies");
        }
        Ok((corrections, affected))
    }

    /// The incremental path for one owner. Returns `None` when the step
    /// budget was exhausted and the caller should fall back.
    fn try_incremental(
        &self,
        txn: &mut WriteTxn<'_>,
        owner: IdentityId,
        truster: IdentityId,
        trustee: IdentityId,
        old_value: Option<TrustValue>,
        new_value: Option<TrustValue>,
    ) -> Option<HashSet<IdentityId>> {
        // A trust given by a node outside this owner's web changes nothing:
        // only scored trusters contribute rank or value.
        if truster != owner && txn.score(owner, truster).is_none() {
            return Some(HashSet::new());
        }

        let was_positive = old_value.is_some_and(|v| v.is_positive());
        let is_positive = new_value.is_some_and(|v| v.is_positive());
        let rank_structure_changed = was_positive != is_positive;

        let mut budget = Budget::new(self.config.incremental_step_limit);
        let mut cache = RankCache::new();
        let mut affected = HashSet::new();

        let mut queue: VecDeque<IdentityId> = VecDeque::new();
        // Pending work; the flag records whether the rank needs a fresh
        // computation and upgrades if the node is re-queued.
        let mut pending: HashMap<IdentityId, bool> = HashMap::new();
        queue.push_back(trustee);
        pending.insert(trustee, rank_structure_changed);

        while let Some(subject) = queue.pop_front() {
            let check_rank = pending.remove(&subject).unwrap_or(false);
            if !budget.step() {
                return None;
            }

            let computed =
                match self.recompute_subject(txn, owner, subject, check_rank, &mut cache, &mut budget)
                {
                    Computed::Done(result) => result,
                    Computed::Exhausted => return None,
                };

            let stored = txn.score(owner, subject).copied();
            let old_state = stored.map(|score| (score.rank(), score.value()));
            if computed == old_state {
                continue;
            }

            // The gate mirrors the rank search's view of the node: scored
            // nodes propagate iff their value is non-negative, unscored
            // nodes are treated optimistically.
            let old_influence = stored
                .map_or(0, |score| influence_weight(score.capacity(), score.value()));
            let old_gate = stored.map_or(true, |score| score.value() >= 0);
            let old_rank = stored.map(|score| score.rank());

            let (new_influence, new_gate, new_rank) = match computed {
                Some((rank, value)) => {
                    let score = Score::new(owner, subject, value, rank);
                    let weight = influence_weight(score.capacity(), score.value());
                    txn.put_score(score);
                    (weight, value >= 0, Some(rank))
                }
                None => {
                    if let Some(score) = stored {
                        txn.delete_score(score.key());
                    }
                    (0, true, None)
                }
            };
            affected.insert(subject);

            // Value magnitude alone stays local; a changed rank or a
            // changed propagation weight cascades to the trustees.
            let rank_changed = old_rank != new_rank;
            if new_influence != old_influence || rank_changed {
                if new_gate != old_gate {
                    // The propagation gate flipped, so ranks discovered
                    // under the old structure are no longer trustworthy.
                    cache.clear();
                }
                let trustees: Vec<IdentityId> =
                    txn.mem().trusts_from(subject).map(|t| t.trustee()).collect();
                for next in trustees {
                    match pending.entry(next) {
                        std::collections::hash_map::Entry::Occupied(mut entry) => {
                            *entry.get_mut() |= rank_changed;
                        }
                        std::collections::hash_map::Entry::Vacant(entry) => {
                            entry.insert(rank_changed);
                            queue.push_back(next);
                        }
                    }
                }
            }
        }

        Some(affected)
    }

    /// Recompute rank and value of one subject against the current
    /// in-transaction state.
    fn recompute_subject(
        &self,
        txn: &WriteTxn<'_>,
        owner: IdentityId,
        subject: IdentityId,
        check_rank: bool,
        cache: &mut RankCache,
        budget: &mut Budget,
    ) -> Computed {
        if subject == owner {
            let value = txn
                .trust(owner, owner)
                .map_or(OWN_SELF_VALUE, |t| i32::from(t.value().value()));
            return Computed::Done(Some((Rank::Finite(0), value)));
        }

        // Existence and value from the in-trusters.
        let mut reachable = false;
        let mut sum: i64 = 0;
        for trust in txn.mem().trusts_to(subject) {
            let Some(truster_score) = txn.score(owner, trust.truster()) else {
                continue;
            };
            if !truster_score.propagates_capacity() {
                continue;
            }
            reachable = true;
            sum += i64::from(trust.value().value()) * i64::from(truster_score.capacity()) / 100;
        }
        if !reachable {
            return Computed::Done(None);
        }

        let direct = txn.trust(owner, subject);
        let value = match direct {
            Some(trust) => i32::from(trust.value().value()),
            None => clamp_value(sum),
        };

        let rank = match direct {
            // The owner's own opinion dominates the rank.
            Some(trust) if trust.value().is_positive() => Rank::Finite(1),
            Some(_) => Rank::Unreachable,
            None => {
                if check_rank {
                    match self.compute_rank_from_scratch(txn, owner, subject, cache, budget) {
                        Some(rank) => rank,
                        None => return Computed::Exhausted,
                    }
                } else {
                    match txn.score(owner, subject) {
                        Some(score) => score.rank(),
                        None => match self
                            .compute_rank_from_scratch(txn, owner, subject, cache, budget)
                        {
                            Some(rank) => rank,
                            None => return Computed::Exhausted,
                        },
                    }
                }
            }
        };

        Computed::Done(Some((rank, value)))
    }

    /// Shortest-path rank of `target` computed from scratch: a breadth
    /// first search of the positive subgraph from the owner, restricted to
    /// propagating nodes. Every settled distance is cached so successive
    /// calls in the same transaction are lookups.
    fn compute_rank_from_scratch(
        &self,
        txn: &WriteTxn<'_>,
        owner: IdentityId,
        target: IdentityId,
        cache: &mut RankCache,
        budget: &mut Budget,
    ) -> Option<Rank> {
        if let Some(rank) = cache.get(target) {
            return Some(rank);
        }

        // Subjects the owner distrusts directly never receive a finite
        // rank, and never forward one.
        let pinned: HashSet<IdentityId> = txn
            .mem()
            .trusts_from(owner)
            .filter(|t| !t.value().is_positive())
            .map(|t| t.trustee())
            .collect();

        let mut dist: HashMap<IdentityId, u32> = HashMap::new();
        let mut queue: VecDeque<IdentityId> = VecDeque::new();
        dist.insert(owner, 0);
        queue.push_back(owner);

        while let Some(node) = queue.pop_front() {
            if !budget.step() {
                return None;
            }
            // Expansion beyond the owner requires the node to propagate:
            // a distrusted node confers neither rank nor capacity.
            if node != owner {
                let propagates = txn
                    .score(owner, node)
                    .map_or(true, |score| score.value() >= 0);
                if !propagates {
                    continue;
                }
            }
            let here = dist[&node];
            for trust in txn.mem().trusts_from(node) {
                if !trust.value().is_positive() {
                    continue;
                }
                let next = trust.trustee();
                if pinned.contains(&next) || dist.contains_key(&next) {
                    continue;
                }
                dist.insert(next, here + 1);
                queue.push_back(next);
            }
        }

        for (id, d) in &dist {
            cache.put(*id, Rank::Finite(*d));
        }
        let rank = dist
            .get(&target)
            .map_or(Rank::Unreachable, |d| Rank::Finite(*d));
        cache.put(target, rank);
        Some(rank)
    }
}

fn clamp_value(sum: i64) -> i32 {
    sum.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
}

/// Contribution weight of a node towards its trustees' values: its
/// capacity if it propagates, zero otherwise.
fn influence_weight(capacity: u8, value: i32) -> u8 {
    if value >= 0 {
        capacity
    } else {
        0
    }
}

/// The reference computation: the full score table of one owner.
fn compute_owner_table(
    txn: &WriteTxn<'_>,
    owner: IdentityId,
) -> BTreeMap<IdentityId, (Rank, i32)> {
    let state = txn.mem();
    let mut veto: HashSet<IdentityId> = HashSet::new();
    let iteration_cap = state.identities.len() + 2;
    let mut iteration = 0usize;

    loop {
        iteration += 1;
        // Subjects the owner distrusts directly are pinned unreachable.
        let pinned: HashSet<IdentityId> = state
            .trusts_from(owner)
            .filter(|t| !t.value().is_positive())
            .map(|t| t.trustee())
            .collect();

        // Ranks: BFS over positive edges through non-vetoed nodes.
        let mut ranks: HashMap<IdentityId, u32> = HashMap::new();
        let mut queue: VecDeque<IdentityId> = VecDeque::new();
        ranks.insert(owner, 0);
        queue.push_back(owner);
        while let Some(node) = queue.pop_front() {
            if node != owner && veto.contains(&node) {
                continue;
            }
            let here = ranks[&node];
            for trust in state.trusts_from(node) {
                if !trust.value().is_positive() {
                    continue;
                }
                let next = trust.trustee();
                if pinned.contains(&next) || ranks.contains_key(&next) {
                    continue;
                }
                ranks.insert(next, here + 1);
                queue.push_back(next);
            }
        }

        // Values and existence.
        let propagator = |id: IdentityId| -> Option<u8> {
            if id == owner {
                return Some(wot_core::capacity_for_rank(Rank::Finite(0)));
            }
            if veto.contains(&id) {
                return None;
            }
            ranks
                .get(&id)
                .map(|r| wot_core::capacity_for_rank(Rank::Finite(*r)))
        };

        let mut table: BTreeMap<IdentityId, (Rank, i32)> = BTreeMap::new();
        let owner_value = state
            .trusts
            .get(&(owner, owner))
            .map_or(OWN_SELF_VALUE, |t| i32::from(t.value().value()));
        table.insert(owner, (Rank::Finite(0), owner_value));

        // Candidates: every trustee of a propagating node.
        let mut candidates: HashSet<IdentityId> = HashSet::new();
        for (key, _) in state.trusts.iter() {
            let (truster, trustee) = *key;
            if trustee != owner && propagator(truster).is_some() {
                candidates.insert(trustee);
            }
        }

        for subject in candidates {
            let direct = state.trusts.get(&(owner, subject));
            let value = match direct {
                Some(trust) => i32::from(trust.value().value()),
                None => {
                    let mut sum: i64 = 0;
                    for trust in state.trusts_to(subject) {
                        if let Some(capacity) = propagator(trust.truster()) {
                            sum += i64::from(trust.value().value()) * i64::from(capacity) / 100;
                        }
                    }
                    clamp_value(sum)
                }
            };
            let rank = match direct {
                Some(trust) if trust.value().is_positive() => Rank::Finite(1),
                Some(_) => Rank::Unreachable,
                None => ranks
                    .get(&subject)
                    .map_or(Rank::Unreachable, |r| Rank::Finite(*r)),
            };
            table.insert(subject, (rank, value));
        }

        // Recompute the cutoff from this iteration's values: nodes rated
        // as spammers at rank ≥ 2 must not propagate. Stop at the
        // fixpoint.
        let next_veto: HashSet<IdentityId> = table
            .iter()
            .filter(|(_, (rank, value))| {
                *value < 0 && matches!(rank, Rank::Finite(r) if *r >= 2)
            })
            .map(|(subject, _)| *subject)
            .collect();
        if next_veto == veto {
            return table;
        }
        if iteration >= iteration_cap {
            warn!(owner = %owner, "distrust cutoff did not stabilise, keeping last iteration");
            return table;
        }
        debug!(owner = %owner, vetoed = next_veto.len(), "distrust cutoff changed, recomputing");
        veto = next_veto;
    }
}

/// Diff the computed table against the stored tree and apply the
/// difference. Returns the changed subjects and the number of changes.
fn apply_owner_table(
    txn: &mut WriteTxn<'_>,
    owner: IdentityId,
    mut table: BTreeMap<IdentityId, (Rank, i32)>,
    log_corrections: bool,
) -> (HashSet<IdentityId>, usize) {
    let mut affected = HashSet::new();
    let mut changes = 0usize;

    for stored in txn.scores_of_owner(owner) {
        let subject = stored.subject();
        match table.remove(&subject) {
            Some((rank, value)) => {
                if stored.rank() != rank || stored.value() != value {
                    if log_corrections {
                        warn!(
                            owner = %owner, subject = %subject,
                            stored_rank = %stored.rank(), stored_value = stored.value(),
                            rank = %rank, value,
                            "correcting stored score"
                        );
                    }
                    txn.put_score(Score::new(owner, subject, value, rank));
                    affected.insert(subject);
                    changes += 1;
                }
            }
            None => {
                if log_corrections {
                    warn!(owner = %owner, subject = %subject, "deleting stored score with no basis");
                }
                txn.delete_score((owner, subject));
                affected.insert(subject);
                changes += 1;
            }
        }
    }

    for (subject, (rank, value)) in table {
        if log_corrections {
            warn!(owner = %owner, subject = %subject, %rank, value, "creating missing score");
        }
        txn.put_score(Score::new(owner, subject, value, rank));
        affected.insert(subject);
        changes += 1;
    }

    (affected, changes)
}
