//! The trust graph mutation API.
//!
//! Every public operation runs as one transaction: it validates its
//! inputs, applies the mutation, lets the score engine restore the derived
//! state, reconciles the download policy, and returns the downloader
//! events produced by the commit. The `*_in` variants operate inside a
//! caller-supplied transaction so a whole identity file can be ingested
//! atomically.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use wot_core::config::ScoringConfig;
use wot_core::{CoreError, IdentityId, InsertKey, Nickname, RequestKey, TrustValue};

use crate::error::{GraphError, Result};
use crate::events::GraphEvent;
use crate::hint::EditionHint;
use crate::identity::Identity;
use crate::policy::refresh_fetch_state;
use crate::score_engine::ScoreEngine;
use crate::store::{GraphStore, WriteTxn};
use crate::trust::Trust;

/// Trust value of the self-trust installed for own identities.
const SELF_TRUST_VALUE: i16 = 100;

/// The trust graph: identities, trusts, and the machinery that keeps
/// scores and download state consistent with them.
pub struct TrustGraph {
    store: Arc<GraphStore>,
    config: ScoringConfig,
}

impl TrustGraph {
    /// Create the API over a store.
    pub fn new(store: Arc<GraphStore>, config: ScoringConfig) -> Self {
        TrustGraph { store, config }
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<GraphStore> {
        &self.store
    }

    /// The scoring configuration.
    #[must_use]
    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    fn engine(&self) -> ScoreEngine<'_> {
        ScoreEngine::new(&self.config)
    }

    // === Identity creation ===

    /// Create a fresh own identity from a matching key pair.
    pub fn create_own_identity(
        &self,
        request_key: &RequestKey,
        insert_key: &InsertKey,
        nickname: &str,
        publishes_trust_list: bool,
    ) -> Result<(Identity, Vec<GraphEvent>)> {
        let nickname = Nickname::new(nickname)?;
        if !insert_key.matches(request_key) {
            return Err(CoreError::malformed(
                "request key and insert key belong to different identities",
            )
            .into());
        }

        let mut txn = self.store.begin()?;
        let id = request_key.id();
        if txn.identity(id).is_some() {
            return Err(GraphError::DuplicateObject(format!("identity {id}")));
        }

        let identity = Identity::new_own(
            request_key.clone(),
            insert_key.clone(),
            nickname,
            publishes_trust_list,
            Utc::now(),
        );
        txn.put_identity(identity.clone());

        let affected = self.install_self_trust(&mut txn, id)?;
        refresh_fetch_state(&mut txn, affected.into_iter().chain([id]));

        let events = txn.commit()?;
        info!(id = %id, "created own identity");
        Ok((identity, events))
    }

    /// Add a remote identity known only by its request URI. The edition in
    /// the URI becomes an advisory hint, never the current edition.
    pub fn add_identity_from_uri(
        &self,
        uri: &RequestKey,
        nickname: Option<Nickname>,
    ) -> Result<(Identity, Vec<GraphEvent>)> {
        let mut txn = self.store.begin()?;
        let id = uri.id();
        if txn.identity(id).is_some() {
            return Err(GraphError::DuplicateObject(format!("identity {id}")));
        }

        let identity = Identity::new_remote(uri.clone(), nickname, Utc::now());
        txn.put_identity(identity.clone());
        refresh_fetch_state(&mut txn, [id]);

        let events = txn.commit()?;
        debug!(id = %id, "added identity from URI");
        Ok((identity, events))
    }

    /// Look up an identity by URI, creating it if unknown. Used while
    /// ingesting trust lists that mention identities we have never seen.
    pub fn get_or_add_identity_in(
        &self,
        txn: &mut WriteTxn<'_>,
        uri: &RequestKey,
    ) -> Result<IdentityId> {
        let id = uri.id();
        match txn.identity(id) {
            Some(_) => Ok(id),
            None => {
                let identity = Identity::new_remote(uri.clone(), None, Utc::now());
                txn.put_identity(identity);
                Ok(id)
            }
        }
    }

    // === Trust mutation ===

    /// Set (create or update) a trust edge.
    pub fn set_trust(
        &self,
        truster: IdentityId,
        trustee: IdentityId,
        value: i16,
        comment: &str,
    ) -> Result<Vec<GraphEvent>> {
        let mut txn = self.store.begin()?;
        let affected = self.set_trust_in(&mut txn, truster, trustee, value, comment)?;
        refresh_fetch_state(&mut txn, affected);
        txn.commit()
    }

    /// Set a trust edge inside an open transaction. Returns the subjects
    /// whose scores changed; the caller must run the policy refresh before
    /// committing.
    pub fn set_trust_in(
        &self,
        txn: &mut WriteTxn<'_>,
        truster: IdentityId,
        trustee: IdentityId,
        value: i16,
        comment: &str,
    ) -> Result<HashSet<IdentityId>> {
        let value = TrustValue::new(value)?;
        let truster_identity = txn.require_identity(truster)?;
        if truster == trustee && !truster_identity.is_own() {
            return Err(CoreError::invalid(
                "self-trust is only allowed for own identities",
            )
            .into());
        }
        let trust_list_edition = truster_identity.current_edition();
        txn.require_identity(trustee)?;

        let old_value = txn.trust(truster, trustee).map(|t| t.value());
        match txn.trust(truster, trustee) {
            Some(existing) => {
                let mut updated = existing.clone();
                updated.update(value, comment, trust_list_edition)?;
                txn.put_trust(updated);
            }
            None => {
                txn.put_trust(Trust::new(
                    truster,
                    trustee,
                    value,
                    comment,
                    trust_list_edition,
                )?);
            }
        }

        self.engine()
            .update_on_trust_change(txn, truster, trustee, old_value, Some(value))
    }

    /// Remove a trust edge.
    pub fn remove_trust(&self, truster: IdentityId, trustee: IdentityId) -> Result<Vec<GraphEvent>> {
        let mut txn = self.store.begin()?;
        let affected = self.remove_trust_in(&mut txn, truster, trustee)?;
        refresh_fetch_state(&mut txn, affected);
        txn.commit()
    }

    /// Remove a trust edge inside an open transaction.
    pub fn remove_trust_in(
        &self,
        txn: &mut WriteTxn<'_>,
        truster: IdentityId,
        trustee: IdentityId,
    ) -> Result<HashSet<IdentityId>> {
        let old_value = match txn.trust(truster, trustee) {
            Some(trust) => trust.value(),
            None => return Err(GraphError::UnknownTrust { truster, trustee }),
        };
        txn.delete_trust((truster, trustee));
        self.engine()
            .update_on_trust_change(txn, truster, trustee, Some(old_value), None)
    }

    // === Fetch bookkeeping ===

    /// Record a successfully fetched and parsed edition, and garbage
    /// collect the hints it made obsolete.
    pub fn on_fetched_and_parsed(&self, id: IdentityId, edition: u64) -> Result<Vec<GraphEvent>> {
        let mut txn = self.store.begin()?;
        self.on_fetched_and_parsed_in(&mut txn, id, edition, Utc::now())?;
        txn.commit()
    }

    /// In-transaction variant of [`TrustGraph::on_fetched_and_parsed`].
    pub fn on_fetched_and_parsed_in(
        &self,
        txn: &mut WriteTxn<'_>,
        id: IdentityId,
        edition: u64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut identity = txn.require_identity(id)?.clone();
        identity.on_fetched_and_parsed(edition, now)?;
        let current = identity.current_edition();
        txn.put_identity(identity);
        self.collect_obsolete_hints(txn, id, current);
        Ok(())
    }

    /// Record a fetched edition whose parse failed.
    pub fn on_fetched_and_parsing_failed(
        &self,
        id: IdentityId,
        edition: u64,
    ) -> Result<Vec<GraphEvent>> {
        let mut txn = self.store.begin()?;
        let mut identity = txn.require_identity(id)?.clone();
        identity.on_fetched_and_parsing_failed(edition, Utc::now())?;
        let current = identity.current_edition();
        warn!(id = %id, edition, "fetched edition failed to parse, skipping it");
        txn.put_identity(identity);
        self.collect_obsolete_hints(&mut txn, id, current);
        txn.commit()
    }

    /// Request that the identity's current edition is fetched again, e.g.
    /// after restoring an old database snapshot.
    pub fn mark_for_refetch(&self, id: IdentityId) -> Result<Vec<GraphEvent>> {
        let mut txn = self.store.begin()?;
        let mut identity = txn.require_identity(id)?.clone();
        identity.mark_for_refetch(Utc::now());
        txn.put_identity(identity);
        // The fetch set is unchanged, but the downloaders must be told to
        // pick the older edition up again.
        if let Some(partition) = txn.fetching_partition(id) {
            txn.push_event(GraphEvent::StartFetch { id, partition });
        }
        txn.commit()
    }

    /// Drop every hint that no longer advances past the subject's current
    /// edition.
    fn collect_obsolete_hints(&self, txn: &mut WriteTxn<'_>, subject: IdentityId, current: i64) {
        let obsolete: Vec<_> = txn
            .hints_for_subject(subject)
            .into_iter()
            .filter(|hint| (hint.edition() as i64) <= current)
            .map(|hint| hint.key())
            .collect();
        for key in obsolete {
            debug!(source = %key.0, subject = %key.1, "garbage collecting obsolete hint");
            txn.delete_hint(key);
        }
    }

    // === Edition hints ===

    /// Ingest an edition hint received from `source` about `subject`.
    /// Returns whether it was stored.
    pub fn store_edition_hint(
        &self,
        source: IdentityId,
        subject: IdentityId,
        date: DateTime<Utc>,
        edition: u64,
    ) -> Result<(bool, Vec<GraphEvent>)> {
        let mut txn = self.store.begin()?;
        let stored = self.store_edition_hint_in(&mut txn, source, subject, date, edition)?;
        let events = txn.commit()?;
        Ok((stored, events))
    }

    /// In-transaction variant of [`TrustGraph::store_edition_hint`].
    pub fn store_edition_hint_in(
        &self,
        txn: &mut WriteTxn<'_>,
        source: IdentityId,
        subject: IdentityId,
        date: DateTime<Utc>,
        edition: u64,
    ) -> Result<bool> {
        let subject_identity = txn.require_identity(subject)?;

        // Obsolete: we already have this edition (or a newer one).
        if subject_identity.current_edition() >= edition as i64 {
            debug!(source = %source, subject = %subject, edition, "discarding obsolete hint");
            return Ok(false);
        }
        // Hints may only queue downloads of identities we want at all.
        if !txn.compute_should_fetch(subject) {
            debug!(source = %source, subject = %subject, "discarding hint for unwanted identity");
            return Ok(false);
        }
        if !txn.compute_should_fetch(source) {
            debug!(source = %source, subject = %subject, "discarding hint from unwanted source");
            return Ok(false);
        }

        let source_identity = txn.require_identity(source)?;
        let source_is_own = source_identity.is_own();
        let (best_capacity, best_score) = best_capacity_and_score(txn, source);
        let min_capacity = self.config.min_hint_capacity();
        if best_capacity < min_capacity {
            debug!(
                source = %source, subject = %subject, best_capacity,
                "discarding hint from low-capacity source"
            );
            return Ok(false);
        }

        let hint = EditionHint::new(
            source,
            subject,
            source_is_own,
            date,
            Utc::now(),
            best_capacity,
            best_score,
            edition,
            txn.pad(),
            min_capacity,
        )?;

        if let Some(existing) = txn.hint(source, subject) {
            let old_edition = existing.edition();
            let old_key = existing.key();
            if edition <= old_edition {
                warn!(
                    source = %source, subject = %subject,
                    old_edition, new_edition = edition,
                    "source re-announced an old hint, discarding"
                );
                return Ok(false);
            }
            txn.delete_hint(old_key);
        }
        txn.put_hint(hint);

        let mut subject_identity = txn.require_identity(subject)?.clone();
        subject_identity.update_edition_hint(edition);
        txn.put_identity(subject_identity);

        txn.push_event(GraphEvent::HintsChanged);
        Ok(true)
    }

    /// Drop the hint for `(source, subject)` after a terminal download
    /// outcome. Missing hints are fine: the abort path may have removed it
    /// concurrently.
    pub fn discard_hint(&self, source: IdentityId, subject: IdentityId) -> Result<()> {
        let mut txn = self.store.begin()?;
        txn.delete_hint((source, subject));
        txn.commit()?;
        Ok(())
    }

    // === Own identity lifecycle ===

    /// Convert an own identity back into a remote identity, preserving the
    /// id and all incoming trusts and dropping the trust tree it owned.
    pub fn delete_own_identity(&self, id: IdentityId) -> Result<(Identity, Vec<GraphEvent>)> {
        let mut txn = self.store.begin()?;
        let old = txn.require_identity(id)?.clone();
        if !old.is_own() {
            return Err(CoreError::invalid(format!("identity {id} is not an own identity")).into());
        }
        txn.push_event(GraphEvent::PreDeleteOwnIdentity {
            old: Box::new(old.clone()),
        });

        // Flip the tag first so the score engine stops treating it as a
        // tree owner for the rest of the transaction.
        let mut converted = old;
        converted.demote_to_remote(Utc::now());
        txn.put_identity(converted.clone());

        let mut affected: HashSet<IdentityId> = HashSet::new();
        for score in txn.scores_of_owner(id) {
            affected.insert(score.subject());
            txn.delete_score(score.key());
        }

        // The self-trust exists only to serve own-ness; other owners may
        // have counted it, so its removal goes through the engine.
        if txn.trust(id, id).is_some() {
            affected.extend(self.remove_trust_in(&mut txn, id, id)?);
        }

        txn.push_event(GraphEvent::PostDeleteOwnIdentity {
            new: Box::new(converted.clone()),
        });
        affected.insert(id);
        refresh_fetch_state(&mut txn, affected);

        let events = txn.commit()?;
        info!(id = %id, "deleted own identity, kept as remote identity");
        Ok((converted, events))
    }

    /// Convert a remote identity into an own identity (or create it), the
    /// inverse of [`TrustGraph::delete_own_identity`]. All incoming trusts
    /// are preserved and the identity's trust tree is rebuilt.
    pub fn restore_own_identity(
        &self,
        insert_uri: &InsertKey,
    ) -> Result<(Identity, Vec<GraphEvent>)> {
        let id = insert_uri.id();
        let mut txn = self.store.begin()?;

        let existing = txn.identity(id).cloned();
        let restored = match existing {
            Some(identity) => {
                if identity.is_own() {
                    return Err(CoreError::invalid(format!(
                        "identity {id} is already an own identity"
                    ))
                    .into());
                }
                txn.push_event(GraphEvent::PreRestoreOwnIdentity {
                    old: Box::new(identity.clone()),
                });
                let mut identity = identity;
                identity.promote_to_own(insert_uri.clone(), Utc::now());
                identity.update_edition_hint(insert_uri.suggested_edition());
                txn.put_identity(identity.clone());
                identity
            }
            None => {
                let mut identity =
                    Identity::new_remote(insert_uri.derive_request_key(), None, Utc::now());
                txn.push_event(GraphEvent::PreRestoreOwnIdentity {
                    old: Box::new(identity.clone()),
                });
                identity.promote_to_own(insert_uri.clone(), Utc::now());
                txn.put_identity(identity.clone());
                identity
            }
        };

        let mut affected = self.install_self_trust(&mut txn, id)?;
        // The new owner's whole tree is derived state; build it from the
        // trusts that already exist.
        affected.extend(self.engine().recompute_owner(&mut txn, id, false));

        txn.push_event(GraphEvent::PostRestoreOwnIdentity {
            new: Box::new(restored.clone()),
        });
        affected.insert(id);
        refresh_fetch_state(&mut txn, affected);

        let events = txn.commit()?;
        info!(id = %id, "restored own identity");
        Ok((restored, events))
    }

    /// Remove an identity and everything that refers to it. Operator
    /// action; normal operation never hard-deletes.
    pub fn delete_identity(&self, id: IdentityId) -> Result<Vec<GraphEvent>> {
        let mut txn = self.store.begin()?;
        let old = txn.require_identity(id)?.clone();
        txn.push_event(GraphEvent::PreDeleteIdentity {
            old: Box::new(old),
        });

        let mut affected: HashSet<IdentityId> = HashSet::new();
        for trust in txn.trusts_from(id) {
            affected.insert(trust.trustee());
            txn.delete_trust(trust.key());
        }
        for trust in txn.trusts_to(id) {
            txn.delete_trust(trust.key());
        }
        for score in txn.scores_of_subject(id) {
            txn.delete_score(score.key());
        }
        for score in txn.scores_of_owner(id) {
            affected.insert(score.subject());
            txn.delete_score(score.key());
        }
        txn.delete_hints_for_subject(id);
        txn.delete_hints_from_source(id);
        if let Some(partition) = txn.fetching_partition(id) {
            txn.set_fetching(id, None);
            txn.push_event(GraphEvent::AbortFetch { id, partition });
        }
        txn.delete_identity(id);

        // Deleting edges in bulk makes the incremental path pointless;
        // this is a rare operator action, so rebuild from scratch.
        affected.extend(self.engine().recompute_all(&mut txn));
        refresh_fetch_state(&mut txn, affected);

        let events = txn.commit()?;
        info!(id = %id, "deleted identity");
        Ok(events)
    }

    // === Verification ===

    /// Recompute every score from scratch, diff against the stored table,
    /// correct discrepancies, and return how many were corrected.
    pub fn verify_and_correct_stored_scores(&self) -> Result<(usize, Vec<GraphEvent>)> {
        let mut txn = self.store.begin()?;
        let (corrections, affected) = self.engine().verify_and_correct(&mut txn)?;
        refresh_fetch_state(&mut txn, affected);
        let events = txn.commit()?;
        Ok((corrections, events))
    }

    /// Audit every stored edition hint against its invariants: both
    /// endpoints still fetchable, source capacity sufficient, edition
    /// still ahead of the subject, and the persisted priority string
    /// identical to a recomputation. Violations are logged and deleted;
    /// returns how many there were.
    pub fn audit_stored_hints(&self) -> Result<usize> {
        let mut txn = self.store.begin()?;
        let min_capacity = self.config.min_hint_capacity();
        let now = Utc::now();

        let mut violations: Vec<(IdentityId, IdentityId, &'static str)> = Vec::new();
        {
            let hints: Vec<EditionHint> = txn
                .identity_ids()
                .into_iter()
                .flat_map(|id| txn.hints_for_subject(id))
                .collect();
            for hint in &hints {
                let source = hint.source();
                let subject = hint.subject();
                let verdict = if !txn.compute_should_fetch(source) {
                    Some("source is not fetchable")
                } else if !txn.compute_should_fetch(subject) {
                    Some("subject is not fetchable")
                } else if best_capacity_and_score(&txn, source).0 < min_capacity.max(1) {
                    Some("source capacity is insufficient")
                } else if txn
                    .identity(subject)
                    .is_some_and(|s| s.current_edition() >= hint.edition() as i64)
                {
                    Some("hint is obsolete")
                } else {
                    // The persisted sort key must reproduce bit-exactly.
                    let source_is_own = txn.identity(source).is_some_and(Identity::is_own);
                    let recomputed = EditionHint::new(
                        source,
                        subject,
                        source_is_own,
                        hint.date().and_hms_opt(0, 0, 0).map_or(now, |t| t.and_utc()),
                        now,
                        hint.source_capacity(),
                        i32::from(hint.source_score_sign()),
                        hint.edition(),
                        txn.pad(),
                        min_capacity,
                    );
                    match recomputed {
                        Ok(ref fresh) if fresh.priority() == hint.priority() => None,
                        _ => Some("priority string does not reproduce"),
                    }
                };
                if let Some(reason) = verdict {
                    warn!(source = %source, subject = %subject, reason, "hint failed its audit");
                    violations.push((source, subject, reason));
                }
            }
        }

        for (source, subject, _) in &violations {
            txn.delete_hint((*source, *subject));
        }
        let count = violations.len();
        txn.commit()?;
        Ok(count)
    }

    /// Reconcile the commanded download state of the given subjects with
    /// the download predicate. Callers composing their own transactions
    /// from the `*_in` operations must run this before committing.
    pub fn refresh_fetch_state_in<I>(&self, txn: &mut WriteTxn<'_>, affected: I)
    where
        I: IntoIterator<Item = IdentityId>,
    {
        refresh_fetch_state(txn, affected);
    }

    /// Install the self-trust of an own identity and run the score update
    /// for it.
    fn install_self_trust(
        &self,
        txn: &mut WriteTxn<'_>,
        id: IdentityId,
    ) -> Result<HashSet<IdentityId>> {
        self.set_trust_in(txn, id, id, SELF_TRUST_VALUE, "")
    }
}

/// Best capacity and best score of an identity across all owners.
fn best_capacity_and_score(txn: &WriteTxn<'_>, id: IdentityId) -> (u8, i32) {
    let mut best_capacity = 0u8;
    let mut best_score = i32::MIN;
    for score in txn.scores_of_subject(id) {
        best_capacity = best_capacity.max(score.capacity());
        best_score = best_score.max(score.value());
    }
    if best_score == i32::MIN {
        best_score = -1;
    }
    (best_capacity, best_score)
}
