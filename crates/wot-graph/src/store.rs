//! The graph store.
//!
//! Persists identities, trusts, scores, and edition hints in a sled
//! database and mirrors them into indexed in-memory maps. The in-memory
//! state is authoritative at runtime; sled provides durability and the
//! initial load.
//!
//! Writes go through single-writer transactions ([`WriteTxn`]): all
//! mutations of one logical event share one transaction, and dropping the
//! transaction without committing rolls the in-memory state back to its
//! pre-event image. Readers take a shared lock and see only committed
//! state.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard, TryLockError};
use std::time::Duration;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};
use wot_core::id::ID_BYTES;
use wot_core::IdentityId;

use crate::error::{GraphError, Result};
use crate::events::{GraphEvent, Partition};
use crate::hint::{EditionHint, HintKey, ObfuscationPad};
use crate::identity::Identity;
use crate::score::{Score, ScoreKey};
use crate::trust::{Trust, TrustKey};

const TREE_IDENTITIES: &str = "identities";
const TREE_TRUSTS: &str = "trusts";
const TREE_SCORES: &str = "scores";
const TREE_HINTS: &str = "hints";
const TREE_META: &str = "meta";

const META_PAD_KEY: &[u8] = b"obfuscation_pad";
const META_SCHEMA_KEY: &[u8] = b"schema_version";
const SCHEMA_VERSION: &[u8] = b"1";

/// Attempts to acquire the write lock before giving up.
const WRITE_RETRIES: u32 = 50;

/// Base backoff between write-lock attempts.
const WRITE_BACKOFF: Duration = Duration::from_millis(10);

const MIN_ID: IdentityId = IdentityId::from_bytes([0u8; ID_BYTES]);
const MAX_ID: IdentityId = IdentityId::from_bytes([0xffu8; ID_BYTES]);

/// In-memory image of the store plus its secondary indexes.
#[derive(Default)]
pub(crate) struct MemState {
    pub(crate) identities: HashMap<IdentityId, Identity>,
    pub(crate) own_ids: BTreeSet<IdentityId>,
    pub(crate) trusts: BTreeMap<TrustKey, Trust>,
    /// trustee -> trusters.
    pub(crate) trusters_of: HashMap<IdentityId, BTreeSet<IdentityId>>,
    pub(crate) scores: BTreeMap<ScoreKey, Score>,
    /// subject -> owners holding a score on it.
    pub(crate) owners_of: HashMap<IdentityId, BTreeSet<IdentityId>>,
    pub(crate) hints: BTreeMap<HintKey, EditionHint>,
    /// subject -> hint sources.
    pub(crate) hint_sources_of: HashMap<IdentityId, BTreeSet<IdentityId>>,
    /// The download queue, ordered by priority string. The hint key is
    /// part of the set element because two hints from different sources
    /// can share a priority string.
    pub(crate) hint_queue: BTreeSet<(String, HintKey)>,
    /// Identities the downloaders are currently told to fetch.
    pub(crate) fetching: HashMap<IdentityId, Partition>,
}

impl MemState {
    pub(crate) fn trusts_from(&self, truster: IdentityId) -> impl Iterator<Item = &Trust> {
        self.trusts
            .range((truster, MIN_ID)..=(truster, MAX_ID))
            .map(|(_, t)| t)
    }

    pub(crate) fn trusts_to(&self, trustee: IdentityId) -> Vec<&Trust> {
        match self.trusters_of.get(&trustee) {
            Some(trusters) => trusters
                .iter()
                .filter_map(|truster| self.trusts.get(&(*truster, trustee)))
                .collect(),
            None => Vec::new(),
        }
    }

    pub(crate) fn scores_of_owner(&self, owner: IdentityId) -> impl Iterator<Item = &Score> {
        self.scores
            .range((owner, MIN_ID)..=(owner, MAX_ID))
            .map(|(_, s)| s)
    }

    pub(crate) fn scores_of_subject(&self, subject: IdentityId) -> Vec<&Score> {
        match self.owners_of.get(&subject) {
            Some(owners) => owners
                .iter()
                .filter_map(|owner| self.scores.get(&(*owner, subject)))
                .collect(),
            None => Vec::new(),
        }
    }

    pub(crate) fn hints_from_source(&self, source: IdentityId) -> impl Iterator<Item = &EditionHint> {
        self.hints
            .range((source, MIN_ID)..=(source, MAX_ID))
            .map(|(_, h)| h)
    }

    pub(crate) fn hints_for_subject(&self, subject: IdentityId) -> Vec<&EditionHint> {
        match self.hint_sources_of.get(&subject) {
            Some(sources) => sources
                .iter()
                .filter_map(|source| self.hints.get(&(*source, subject)))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Download-eligibility predicate over the committed score table.
    pub(crate) fn compute_should_fetch(&self, id: IdentityId) -> bool {
        self.scores_of_subject(id)
            .iter()
            .any(|score| score.justifies_download())
    }

    /// Partition of a fetchable identity: fast iff some owner sees it at
    /// rank ≤ 1.
    pub(crate) fn compute_partition(&self, id: IdentityId) -> Partition {
        let direct = self.scores_of_subject(id).iter().any(|score| {
            matches!(score.rank(), wot_core::Rank::Finite(r) if r <= 1)
        });
        if direct {
            Partition::Fast
        } else {
            Partition::Slow
        }
    }

    fn apply_identity(&mut self, id: IdentityId, value: Option<Identity>) -> Option<Identity> {
        match value {
            Some(identity) => {
                if identity.is_own() {
                    self.own_ids.insert(id);
                } else {
                    self.own_ids.remove(&id);
                }
                self.identities.insert(id, identity)
            }
            None => {
                self.own_ids.remove(&id);
                self.identities.remove(&id)
            }
        }
    }

    fn apply_trust(&mut self, key: TrustKey, value: Option<Trust>) -> Option<Trust> {
        let (truster, trustee) = key;
        match value {
            Some(trust) => {
                self.trusters_of.entry(trustee).or_default().insert(truster);
                self.trusts.insert(key, trust)
            }
            None => {
                if let Some(trusters) = self.trusters_of.get_mut(&trustee) {
                    trusters.remove(&truster);
                    if trusters.is_empty() {
                        self.trusters_of.remove(&trustee);
                    }
                }
                self.trusts.remove(&key)
            }
        }
    }

    fn apply_score(&mut self, key: ScoreKey, value: Option<Score>) -> Option<Score> {
        let (owner, subject) = key;
        match value {
            Some(score) => {
                self.owners_of.entry(subject).or_default().insert(owner);
                self.scores.insert(key, score)
            }
            None => {
                if let Some(owners) = self.owners_of.get_mut(&subject) {
                    owners.remove(&owner);
                    if owners.is_empty() {
                        self.owners_of.remove(&subject);
                    }
                }
                self.scores.remove(&key)
            }
        }
    }

    fn apply_hint(&mut self, key: HintKey, value: Option<EditionHint>) -> Option<EditionHint> {
        let (source, subject) = key;
        match value {
            Some(hint) => {
                self.hint_sources_of.entry(subject).or_default().insert(source);
                let priority = hint.priority().to_string();
                let old = self.hints.insert(key, hint);
                if let Some(previous) = &old {
                    self.hint_queue.remove(&(previous.priority().to_string(), key));
                }
                self.hint_queue.insert((priority, key));
                old
            }
            None => {
                if let Some(sources) = self.hint_sources_of.get_mut(&subject) {
                    sources.remove(&source);
                    if sources.is_empty() {
                        self.hint_sources_of.remove(&subject);
                    }
                }
                let old = self.hints.remove(&key);
                if let Some(previous) = &old {
                    self.hint_queue.remove(&(previous.priority().to_string(), key));
                }
                old
            }
        }
    }

    fn apply_fetching(
        &mut self,
        id: IdentityId,
        value: Option<Partition>,
    ) -> Option<Partition> {
        match value {
            Some(partition) => self.fetching.insert(id, partition),
            None => self.fetching.remove(&id),
        }
    }
}

enum UndoOp {
    Identity(IdentityId, Option<Identity>),
    Trust(TrustKey, Option<Trust>),
    Score(ScoreKey, Option<Score>),
    Hint(HintKey, Option<EditionHint>),
    Fetching(IdentityId, Option<Partition>),
}

/// Statistics returned by [`GraphStore::defragment`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DefragStats {
    /// Number of records rewritten.
    pub records: usize,
    /// Size of the database on disk after the rewrite, in bytes.
    pub bytes_on_disk: u64,
}

/// The persistent, indexed graph store.
pub struct GraphStore {
    db: sled::Db,
    t_identities: sled::Tree,
    t_trusts: sled::Tree,
    t_scores: sled::Tree,
    t_hints: sled::Tree,
    state: RwLock<MemState>,
    pad: ObfuscationPad,
}

impl GraphStore {
    /// Open (or create) the store in the given directory and load all
    /// records into memory.
    pub fn open(path: &Path) -> Result<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// Open a temporary in-memory-backed store (testing).
    pub fn open_temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self> {
        let t_meta = db.open_tree(TREE_META)?;
        t_meta.insert(META_SCHEMA_KEY, SCHEMA_VERSION)?;
        let pad = load_or_create_pad(&t_meta)?;

        let t_identities = db.open_tree(TREE_IDENTITIES)?;
        let t_trusts = db.open_tree(TREE_TRUSTS)?;
        let t_scores = db.open_tree(TREE_SCORES)?;
        let t_hints = db.open_tree(TREE_HINTS)?;

        let mut state = MemState::default();
        for record in iter_records::<Identity>(&t_identities)? {
            state.apply_identity(record.id(), Some(record));
        }
        for record in iter_records::<Trust>(&t_trusts)? {
            state.apply_trust(record.key(), Some(record));
        }
        for record in iter_records::<Score>(&t_scores)? {
            state.apply_score(record.key(), Some(record));
        }
        for record in iter_records::<EditionHint>(&t_hints)? {
            state.apply_hint(record.key(), Some(record));
        }

        // The fetch map is derived state; rebuild it from the scores.
        let ids: Vec<IdentityId> = state.identities.keys().copied().collect();
        for id in ids {
            if state.compute_should_fetch(id) {
                let partition = state.compute_partition(id);
                state.apply_fetching(id, Some(partition));
            }
        }

        info!(
            identities = state.identities.len(),
            trusts = state.trusts.len(),
            scores = state.scores.len(),
            hints = state.hints.len(),
            "graph store loaded"
        );

        Ok(GraphStore {
            db,
            t_identities,
            t_trusts,
            t_scores,
            t_hints,
            state: RwLock::new(state),
            pad,
        })
    }

    /// The node-local obfuscation pad for hint priorities.
    #[must_use]
    pub fn pad(&self) -> &ObfuscationPad {
        &self.pad
    }

    /// Take a consistent read snapshot.
    pub fn read(&self) -> ReadView<'_> {
        let guard = match self.state.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("graph store lock was poisoned by a panicking writer");
                poisoned.into_inner()
            }
        };
        ReadView { state: guard }
    }

    /// Begin the single write transaction.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::Unavailable`] if the write lock cannot be
    /// acquired within the retry budget.
    pub fn begin(&self) -> Result<WriteTxn<'_>> {
        for attempt in 0..WRITE_RETRIES {
            match self.state.try_write() {
                Ok(guard) => {
                    return Ok(WriteTxn {
                        store: self,
                        state: guard,
                        undo: Vec::new(),
                        events: Vec::new(),
                        committed: false,
                    })
                }
                Err(TryLockError::Poisoned(poisoned)) => {
                    warn!("graph store lock was poisoned by a panicking writer");
                    return Ok(WriteTxn {
                        store: self,
                        state: poisoned.into_inner(),
                        undo: Vec::new(),
                        events: Vec::new(),
                        committed: false,
                    });
                }
                Err(TryLockError::WouldBlock) => {
                    std::thread::sleep(WRITE_BACKOFF * (attempt + 1));
                }
            }
        }
        Err(GraphError::Unavailable)
    }

    /// Flush all pending writes to disk.
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    /// Rewrite every tree from the in-memory image, compacting the
    /// on-disk representation.
    pub fn defragment(&self) -> Result<DefragStats> {
        // Taking the write lock keeps the image stable during the rewrite.
        let state = match self.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let mut records = 0usize;
        records += rewrite_tree(&self.t_identities, state.identities.values(), |i| {
            i.id().as_bytes().to_vec()
        })?;
        records += rewrite_tree(&self.t_trusts, state.trusts.values(), |t| {
            pair_key(t.truster(), t.trustee())
        })?;
        records += rewrite_tree(&self.t_scores, state.scores.values(), |s| {
            pair_key(s.owner(), s.subject())
        })?;
        records += rewrite_tree(&self.t_hints, state.hints.values(), |h| {
            pair_key(h.source(), h.subject())
        })?;
        drop(state);

        self.db.flush()?;
        let bytes_on_disk = self.db.size_on_disk()?;
        debug!(records, bytes_on_disk, "store defragmented");
        Ok(DefragStats {
            records,
            bytes_on_disk,
        })
    }
}

fn load_or_create_pad(meta: &sled::Tree) -> Result<ObfuscationPad> {
    if let Some(bytes) = meta.get(META_PAD_KEY)? {
        let pad: ObfuscationPad = bytes
            .as_ref()
            .try_into()
            .map_err(|_| GraphError::CorruptRecord("obfuscation pad has wrong length".into()))?;
        return Ok(pad);
    }
    let mut pad = [0u8; ID_BYTES];
    OsRng.fill_bytes(&mut pad);
    meta.insert(META_PAD_KEY, &pad[..])?;
    Ok(pad)
}

fn iter_records<T: DeserializeOwned>(tree: &sled::Tree) -> Result<Vec<T>> {
    let mut records = Vec::new();
    for entry in tree.iter() {
        let (_, value) = entry?;
        let record = bincode::deserialize(&value)
            .map_err(|e| GraphError::CorruptRecord(format!("{}: {e}", tree_name(tree))))?;
        records.push(record);
    }
    Ok(records)
}

fn tree_name(tree: &sled::Tree) -> String {
    String::from_utf8_lossy(&tree.name()).into_owned()
}

fn rewrite_tree<'a, T, I, K>(tree: &sled::Tree, records: I, key_of: K) -> Result<usize>
where
    T: Serialize + 'a,
    I: Iterator<Item = &'a T>,
    K: Fn(&T) -> Vec<u8>,
{
    tree.clear()?;
    let mut batch = sled::Batch::default();
    let mut count = 0usize;
    for record in records {
        batch.insert(key_of(record), encode(record)?);
        count += 1;
    }
    tree.apply_batch(batch)?;
    Ok(count)
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| GraphError::CorruptRecord(e.to_string()))
}

fn pair_key(a: IdentityId, b: IdentityId) -> Vec<u8> {
    let mut key = Vec::with_capacity(ID_BYTES * 2);
    key.extend_from_slice(a.as_bytes());
    key.extend_from_slice(b.as_bytes());
    key
}

/// A consistent read-only snapshot of the store.
pub struct ReadView<'a> {
    state: RwLockReadGuard<'a, MemState>,
}

impl ReadView<'_> {
    /// Look up an identity.
    #[must_use]
    pub fn identity(&self, id: IdentityId) -> Option<&Identity> {
        self.state.identities.get(&id)
    }

    /// Look up an identity, failing if it is unknown.
    pub fn require_identity(&self, id: IdentityId) -> Result<&Identity> {
        self.state
            .identities
            .get(&id)
            .ok_or(GraphError::UnknownIdentity(id))
    }

    /// All identities.
    pub fn identities(&self) -> impl Iterator<Item = &Identity> {
        self.state.identities.values()
    }

    /// All own identities.
    pub fn own_identities(&self) -> Vec<&Identity> {
        self.state
            .own_ids
            .iter()
            .filter_map(|id| self.state.identities.get(id))
            .collect()
    }

    /// Look up a trust edge.
    #[must_use]
    pub fn trust(&self, truster: IdentityId, trustee: IdentityId) -> Option<&Trust> {
        self.state.trusts.get(&(truster, trustee))
    }

    /// All trusts given by `truster`.
    pub fn trusts_from(&self, truster: IdentityId) -> Vec<&Trust> {
        self.state.trusts_from(truster).collect()
    }

    /// All trusts received by `trustee`.
    pub fn trusts_to(&self, trustee: IdentityId) -> Vec<&Trust> {
        self.state.trusts_to(trustee)
    }

    /// Look up a score record.
    #[must_use]
    pub fn score(&self, owner: IdentityId, subject: IdentityId) -> Option<&Score> {
        self.state.scores.get(&(owner, subject))
    }

    /// All scores in the tree of `owner`.
    pub fn scores_of_owner(&self, owner: IdentityId) -> Vec<&Score> {
        self.state.scores_of_owner(owner).collect()
    }

    /// All scores rating `subject`.
    pub fn scores_of_subject(&self, subject: IdentityId) -> Vec<&Score> {
        self.state.scores_of_subject(subject)
    }

    /// Look up an edition hint.
    #[must_use]
    pub fn hint(&self, source: IdentityId, subject: IdentityId) -> Option<&EditionHint> {
        self.state.hints.get(&(source, subject))
    }

    /// All hints pointing at `subject`.
    pub fn hints_for_subject(&self, subject: IdentityId) -> Vec<&EditionHint> {
        self.state.hints_for_subject(subject)
    }

    /// The hint queue, best first, skipping subjects in `exclude`.
    pub fn best_hints(&self, limit: usize, exclude: &BTreeSet<IdentityId>) -> Vec<EditionHint> {
        self.state
            .hint_queue
            .iter()
            .rev()
            .filter_map(|(_, key)| self.state.hints.get(key))
            .filter(|hint| !exclude.contains(&hint.subject()))
            .take(limit)
            .cloned()
            .collect()
    }

    /// The queue integrity check: index-order traversal must agree with
    /// the reference comparator over the raw hint fields.
    pub fn hint_queue_is_consistent(&self, pad: &ObfuscationPad) -> bool {
        let queued: Vec<&EditionHint> = self.hint_queue();
        let mut reference: Vec<&EditionHint> = self.state.hints.values().collect();
        reference.sort_by(|a, b| b.cmp_reference(a, pad).then_with(|| b.key().cmp(&a.key())));
        queued.len() == reference.len()
            && queued
                .iter()
                .zip(reference.iter())
                .all(|(a, b)| a.key() == b.key())
    }

    /// Number of stored hints.
    #[must_use]
    pub fn hint_count(&self) -> usize {
        self.state.hints.len()
    }

    /// Number of stored identities.
    #[must_use]
    pub fn identity_count(&self) -> usize {
        self.state.identities.len()
    }

    /// Number of own identities.
    #[must_use]
    pub fn own_identity_count(&self) -> usize {
        self.state.own_ids.len()
    }

    /// Number of stored trust edges.
    #[must_use]
    pub fn trust_count(&self) -> usize {
        self.state.trusts.len()
    }

    /// Number of stored score records.
    #[must_use]
    pub fn score_count(&self) -> usize {
        self.state.scores.len()
    }

    /// Ids currently commanded to be fetched.
    pub fn fetching_ids(&self) -> Vec<IdentityId> {
        self.state.fetching.keys().copied().collect()
    }

    /// Whether the downloaders are currently told to fetch `id`.
    #[must_use]
    pub fn is_fetching(&self, id: IdentityId) -> bool {
        self.state.fetching.contains_key(&id)
    }

    /// The partition currently fetching `id`, if any.
    #[must_use]
    pub fn fetching_partition(&self, id: IdentityId) -> Option<Partition> {
        self.state.fetching.get(&id).copied()
    }

    /// Recompute the download predicate from the score table (ignores the
    /// cached fetch map).
    #[must_use]
    pub fn should_fetch(&self, id: IdentityId) -> bool {
        self.state.compute_should_fetch(id)
    }

    /// All hints in queue order, best first. Debug and verification use.
    pub fn hint_queue(&self) -> Vec<&EditionHint> {
        self.state
            .hint_queue
            .iter()
            .rev()
            .filter_map(|(_, key)| self.state.hints.get(key))
            .collect()
    }
}

/// The single write transaction.
///
/// Dropping the transaction without calling [`WriteTxn::commit`] rolls all
/// of its mutations back.
pub struct WriteTxn<'a> {
    store: &'a GraphStore,
    state: RwLockWriteGuard<'a, MemState>,
    undo: Vec<UndoOp>,
    events: Vec<GraphEvent>,
    committed: bool,
}

impl WriteTxn<'_> {
    /// The node-local obfuscation pad.
    #[must_use]
    pub fn pad(&self) -> &ObfuscationPad {
        &self.store.pad
    }

    /// Direct access to the in-memory image, for the score engine's
    /// traversals.
    pub(crate) fn mem(&self) -> &MemState {
        &self.state
    }

    /// Every stored score record.
    pub fn all_scores(&self) -> Vec<Score> {
        self.state.scores.values().cloned().collect()
    }

    // === Reads (same view as ReadView, but inside the transaction) ===

    /// Look up an identity.
    #[must_use]
    pub fn identity(&self, id: IdentityId) -> Option<&Identity> {
        self.state.identities.get(&id)
    }

    /// Look up an identity, failing if it is unknown.
    pub fn require_identity(&self, id: IdentityId) -> Result<&Identity> {
        self.state
            .identities
            .get(&id)
            .ok_or(GraphError::UnknownIdentity(id))
    }

    /// Ids of all own identities.
    pub fn own_ids(&self) -> Vec<IdentityId> {
        self.state.own_ids.iter().copied().collect()
    }

    /// Ids of all identities.
    pub fn identity_ids(&self) -> Vec<IdentityId> {
        self.state.identities.keys().copied().collect()
    }

    /// Look up a trust edge.
    #[must_use]
    pub fn trust(&self, truster: IdentityId, trustee: IdentityId) -> Option<&Trust> {
        self.state.trusts.get(&(truster, trustee))
    }

    /// All trusts given by `truster`.
    pub fn trusts_from(&self, truster: IdentityId) -> Vec<Trust> {
        self.state.trusts_from(truster).cloned().collect()
    }

    /// All trusts received by `trustee`.
    pub fn trusts_to(&self, trustee: IdentityId) -> Vec<Trust> {
        self.state
            .trusts_to(trustee)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Look up a score record.
    #[must_use]
    pub fn score(&self, owner: IdentityId, subject: IdentityId) -> Option<&Score> {
        self.state.scores.get(&(owner, subject))
    }

    /// All scores in the tree of `owner`.
    pub fn scores_of_owner(&self, owner: IdentityId) -> Vec<Score> {
        self.state.scores_of_owner(owner).cloned().collect()
    }

    /// All scores rating `subject`.
    pub fn scores_of_subject(&self, subject: IdentityId) -> Vec<Score> {
        self.state
            .scores_of_subject(subject)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Look up an edition hint.
    #[must_use]
    pub fn hint(&self, source: IdentityId, subject: IdentityId) -> Option<&EditionHint> {
        self.state.hints.get(&(source, subject))
    }

    /// All hints pointing at `subject`.
    pub fn hints_for_subject(&self, subject: IdentityId) -> Vec<EditionHint> {
        self.state
            .hints_for_subject(subject)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Whether the downloaders are currently told to fetch `id`.
    #[must_use]
    pub fn is_fetching(&self, id: IdentityId) -> bool {
        self.state.fetching.contains_key(&id)
    }

    /// The partition currently fetching `id`, if any.
    #[must_use]
    pub fn fetching_partition(&self, id: IdentityId) -> Option<Partition> {
        self.state.fetching.get(&id).copied()
    }

    /// Recompute the download predicate from the (in-transaction) scores.
    #[must_use]
    pub fn compute_should_fetch(&self, id: IdentityId) -> bool {
        self.state.compute_should_fetch(id)
    }

    /// Compute the partition from the (in-transaction) scores.
    #[must_use]
    pub fn compute_partition(&self, id: IdentityId) -> Partition {
        self.state.compute_partition(id)
    }

    // === Mutations ===

    /// Insert or replace an identity record.
    pub fn put_identity(&mut self, identity: Identity) {
        let id = identity.id();
        let old = self.state.apply_identity(id, Some(identity));
        self.undo.push(UndoOp::Identity(id, old));
    }

    /// Remove an identity record. Trusts, scores, and hints referring to
    /// it are the caller's responsibility.
    pub fn delete_identity(&mut self, id: IdentityId) {
        let old = self.state.apply_identity(id, None);
        self.undo.push(UndoOp::Identity(id, old));
    }

    /// Insert or replace a trust edge.
    pub fn put_trust(&mut self, trust: Trust) {
        let key = trust.key();
        let old = self.state.apply_trust(key, Some(trust));
        self.undo.push(UndoOp::Trust(key, old));
    }

    /// Remove a trust edge.
    pub fn delete_trust(&mut self, key: TrustKey) {
        let old = self.state.apply_trust(key, None);
        self.undo.push(UndoOp::Trust(key, old));
    }

    /// Insert or replace a score record.
    pub fn put_score(&mut self, score: Score) {
        let key = score.key();
        let old = self.state.apply_score(key, Some(score));
        self.undo.push(UndoOp::Score(key, old));
    }

    /// Remove a score record.
    pub fn delete_score(&mut self, key: ScoreKey) {
        let old = self.state.apply_score(key, None);
        self.undo.push(UndoOp::Score(key, old));
    }

    /// Insert or replace an edition hint.
    pub fn put_hint(&mut self, hint: EditionHint) {
        let key = hint.key();
        let old = self.state.apply_hint(key, Some(hint));
        self.undo.push(UndoOp::Hint(key, old));
    }

    /// Remove an edition hint.
    pub fn delete_hint(&mut self, key: HintKey) {
        let old = self.state.apply_hint(key, None);
        self.undo.push(UndoOp::Hint(key, old));
    }

    /// Remove every hint pointing at `subject`. Returns how many were
    /// deleted.
    pub fn delete_hints_for_subject(&mut self, subject: IdentityId) -> usize {
        let keys: Vec<HintKey> = self
            .state
            .hints_for_subject(subject)
            .iter()
            .map(|h| h.key())
            .collect();
        for key in &keys {
            self.delete_hint(*key);
        }
        keys.len()
    }

    /// Remove every hint published by `source`. Returns how many were
    /// deleted.
    pub fn delete_hints_from_source(&mut self, source: IdentityId) -> usize {
        let keys: Vec<HintKey> = self
            .state
            .hints_from_source(source)
            .map(|h| h.key())
            .collect();
        for key in &keys {
            self.delete_hint(*key);
        }
        keys.len()
    }

    /// Update the fetch map entry for `id`.
    pub fn set_fetching(&mut self, id: IdentityId, partition: Option<Partition>) {
        let old = self.state.apply_fetching(id, partition);
        self.undo.push(UndoOp::Fetching(id, old));
    }

    /// Queue an event for the downloaders; delivered only on commit.
    pub fn push_event(&mut self, event: GraphEvent) {
        self.events.push(event);
    }

    /// Commit: persist all touched records and return the queued events
    /// in order.
    pub fn commit(mut self) -> Result<Vec<GraphEvent>> {
        let mut identities = sled::Batch::default();
        let mut trusts = sled::Batch::default();
        let mut scores = sled::Batch::default();
        let mut hints = sled::Batch::default();

        // The undo log names exactly the touched keys; the current state
        // has their final values. Touched-more-than-once keys produce
        // redundant batch entries, which sled resolves last-write-wins.
        for op in &self.undo {
            match op {
                UndoOp::Identity(id, _) => {
                    let key = id.as_bytes().to_vec();
                    match self.state.identities.get(id) {
                        Some(identity) => identities.insert(key, encode(identity)?),
                        None => identities.remove(key),
                    }
                }
                UndoOp::Trust(key, _) => {
                    let raw = pair_key(key.0, key.1);
                    match self.state.trusts.get(key) {
                        Some(trust) => trusts.insert(raw, encode(trust)?),
                        None => trusts.remove(raw),
                    }
                }
                UndoOp::Score(key, _) => {
                    let raw = pair_key(key.0, key.1);
                    match self.state.scores.get(key) {
                        Some(score) => scores.insert(raw, encode(score)?),
                        None => scores.remove(raw),
                    }
                }
                UndoOp::Hint(key, _) => {
                    let raw = pair_key(key.0, key.1);
                    match self.state.hints.get(key) {
                        Some(hint) => hints.insert(raw, encode(hint)?),
                        None => hints.remove(raw),
                    }
                }
                UndoOp::Fetching(_, _) => {}
            }
        }

        self.store.t_identities.apply_batch(identities)?;
        self.store.t_trusts.apply_batch(trusts)?;
        self.store.t_scores.apply_batch(scores)?;
        self.store.t_hints.apply_batch(hints)?;

        self.committed = true;
        Ok(std::mem::take(&mut self.events))
    }
}

impl Drop for WriteTxn<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if !self.undo.is_empty() {
            debug!(ops = self.undo.len(), "rolling back uncommitted transaction");
        }
        // Restore pre-transaction values in reverse order.
        while let Some(op) = self.undo.pop() {
            match op {
                UndoOp::Identity(id, old) => {
                    self.state.apply_identity(id, old);
                }
                UndoOp::Trust(key, old) => {
                    self.state.apply_trust(key, old);
                }
                UndoOp::Score(key, old) => {
                    self.state.apply_score(key, old);
                }
                UndoOp::Hint(key, old) => {
                    self.state.apply_hint(key, old);
                }
                UndoOp::Fetching(id, old) => {
                    self.state.apply_fetching(id, old);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use wot_core::{Nickname, Rank, RequestKey, TrustValue};

    fn make_id(n: u8) -> IdentityId {
        let mut bytes = [0u8; ID_BYTES];
        bytes[0] = n;
        IdentityId::from_bytes(bytes)
    }

    fn make_identity(n: u8) -> Identity {
        Identity::new_remote(
            RequestKey::new(make_id(n), 0),
            Some(Nickname::new("peer").unwrap()),
            Utc::now(),
        )
    }

    fn make_trust(truster: u8, trustee: u8, value: i16) -> Trust {
        Trust::new(
            make_id(truster),
            make_id(trustee),
            TrustValue::new(value).unwrap(),
            "",
            0,
        )
        .unwrap()
    }

    #[test]
    fn commit_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = GraphStore::open(dir.path()).unwrap();
            let mut txn = store.begin().unwrap();
            txn.put_identity(make_identity(1));
            txn.put_identity(make_identity(2));
            txn.put_trust(make_trust(1, 2, 75));
            txn.commit().unwrap();
            store.flush().unwrap();
        }
        let store = GraphStore::open(dir.path()).unwrap();
        let view = store.read();
        assert!(view.identity(make_id(1)).is_some());
        assert!(view.identity(make_id(2)).is_some());
        assert_eq!(
            view.trust(make_id(1), make_id(2)).unwrap().value().value(),
            75
        );
    }

    #[test]
    fn pad_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let first = {
            let store = GraphStore::open(dir.path()).unwrap();
            *store.pad()
        };
        let second = {
            let store = GraphStore::open(dir.path()).unwrap();
            *store.pad()
        };
        assert_eq!(first, second);
    }

    #[test]
    fn drop_without_commit_rolls_back() {
        let store = GraphStore::open_temporary().unwrap();
        {
            let mut txn = store.begin().unwrap();
            txn.put_identity(make_identity(1));
            txn.commit().unwrap();
        }
        {
            let mut txn = store.begin().unwrap();
            txn.put_identity(make_identity(2));
            txn.put_trust(make_trust(1, 2, 10));
            txn.delete_identity(make_id(1));
            // Dropped without commit.
        }
        let view = store.read();
        assert!(view.identity(make_id(1)).is_some());
        assert!(view.identity(make_id(2)).is_none());
        assert!(view.trust(make_id(1), make_id(2)).is_none());
    }

    #[test]
    fn rollback_restores_indexes() {
        let store = GraphStore::open_temporary().unwrap();
        let mut txn = store.begin().unwrap();
        txn.put_identity(make_identity(1));
        txn.put_identity(make_identity(2));
        txn.put_trust(make_trust(1, 2, 50));
        txn.commit().unwrap();

        {
            let mut txn = store.begin().unwrap();
            txn.delete_trust((make_id(1), make_id(2)));
            txn.put_trust(make_trust(2, 1, 30));
            // Dropped without commit.
        }
        let view = store.read();
        assert_eq!(view.trusts_to(make_id(2)).len(), 1);
        assert_eq!(view.trusts_to(make_id(1)).len(), 0);
        assert_eq!(view.trusts_from(make_id(2)).len(), 0);
    }

    #[test]
    fn trust_indexes_answer_both_directions() {
        let store = GraphStore::open_temporary().unwrap();
        let mut txn = store.begin().unwrap();
        for n in 1..=3 {
            txn.put_identity(make_identity(n));
        }
        txn.put_trust(make_trust(1, 2, 10));
        txn.put_trust(make_trust(1, 3, 20));
        txn.put_trust(make_trust(2, 3, 30));
        txn.commit().unwrap();

        let view = store.read();
        assert_eq!(view.trusts_from(make_id(1)).len(), 2);
        assert_eq!(view.trusts_to(make_id(3)).len(), 2);
        assert_eq!(view.trusts_to(make_id(1)).len(), 0);
    }

    #[test]
    fn score_index_by_subject() {
        let store = GraphStore::open_temporary().unwrap();
        let mut txn = store.begin().unwrap();
        txn.put_score(Score::new(make_id(1), make_id(3), 40, Rank::Finite(2)));
        txn.put_score(Score::new(make_id(2), make_id(3), -5, Rank::Finite(1)));
        txn.commit().unwrap();

        let view = store.read();
        assert_eq!(view.scores_of_subject(make_id(3)).len(), 2);
        assert_eq!(view.scores_of_owner(make_id(1)).len(), 1);
    }

    #[test]
    fn hint_queue_orders_by_priority() {
        use crate::hint::EditionHint;
        let store = GraphStore::open_temporary().unwrap();
        let pad = *store.pad();
        let now = Utc::now();

        let mut txn = store.begin().unwrap();
        let low = EditionHint::new(
            make_id(1),
            make_id(9),
            false,
            now,
            now,
            16,
            10,
            5,
            &pad,
            1,
        )
        .unwrap();
        let high = EditionHint::new(
            make_id(2),
            make_id(9),
            false,
            now,
            now,
            40,
            10,
            5,
            &pad,
            1,
        )
        .unwrap();
        txn.put_hint(low);
        txn.put_hint(high.clone());
        txn.commit().unwrap();

        let view = store.read();
        let best = view.best_hints(1, &BTreeSet::new());
        assert_eq!(best[0], high);
    }

    #[test]
    fn replacing_hint_removes_old_queue_entry() {
        use crate::hint::EditionHint;
        let store = GraphStore::open_temporary().unwrap();
        let pad = *store.pad();
        let now = Utc::now();

        let mut txn = store.begin().unwrap();
        let old = EditionHint::new(make_id(1), make_id(9), false, now, now, 16, 10, 5, &pad, 1)
            .unwrap();
        let new = EditionHint::new(make_id(1), make_id(9), false, now, now, 40, 10, 7, &pad, 1)
            .unwrap();
        txn.put_hint(old);
        txn.put_hint(new);
        txn.commit().unwrap();

        let view = store.read();
        assert_eq!(view.hint_count(), 1);
        assert_eq!(view.hint_queue().len(), 1);
        assert_eq!(view.hint_queue()[0].edition(), 7);
    }

    #[test]
    fn defragment_keeps_all_records() {
        let store = GraphStore::open_temporary().unwrap();
        let mut txn = store.begin().unwrap();
        for n in 1..=5 {
            txn.put_identity(make_identity(n));
        }
        txn.put_trust(make_trust(1, 2, 10));
        txn.commit().unwrap();

        let stats = store.defragment().unwrap();
        assert_eq!(stats.records, 6);

        let view = store.read();
        assert!(view.identity(make_id(5)).is_some());
        assert!(view.trust(make_id(1), make_id(2)).is_some());
    }
}
