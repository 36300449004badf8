//! Identity records.
//!
//! An [`Identity`] is a remote pseudonym known to this node. Own identities
//! (those whose private insert key is held locally) are the same record
//! with the [`IdentityKind::Own`] tag, so the delete/restore type change is
//! an in-place tag flip that preserves the id and all incoming trusts.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use wot_core::limits::{
    MAX_CONTEXTS, MAX_CONTEXT_LEN, MAX_PROPERTY_NAME_LEN, MAX_PROPERTY_VALUE_LEN,
};
use wot_core::{CoreError, IdentityId, InsertKey, Nickname, RequestKey};

use crate::error::Result;

/// Parse status of the identity's most recently fetched edition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchState {
    /// Nothing has been fetched yet (or a refetch was requested).
    NotFetched,
    /// The current edition was fetched and parsed successfully.
    Fetched,
    /// The current edition was fetched but could not be parsed; it is
    /// skipped and the next edition will be tried.
    ParsingFailed,
}

/// Distinguishes remote identities from own ones.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdentityKind {
    /// A remote pseudonym; only the public request key is known.
    Remote,
    /// An identity whose private insert key is held on this node.
    Own {
        /// Key used to publish new editions.
        insert_key: InsertKey,
        /// Last edition this node inserted, if any.
        last_inserted_edition: Option<u64>,
    },
}

/// A pseudonym in the trust graph.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    id: IdentityId,
    request_key: RequestKey,
    kind: IdentityKind,
    current_edition: i64,
    last_fetched_maybe_valid_edition: i64,
    fetch_state: FetchState,
    latest_edition_hint: u64,
    nickname: Option<Nickname>,
    publishes_trust_list: bool,
    contexts: BTreeSet<String>,
    properties: BTreeMap<String, String>,
    created_at: DateTime<Utc>,
    last_changed_at: DateTime<Utc>,
    last_fetched_at: Option<DateTime<Utc>>,
}

impl Identity {
    /// Create a remote identity from its request key.
    ///
    /// The edition suggested by the key is stored as an advisory hint only.
    /// Trusting it as the real current edition would let a malicious peer
    /// block the identity's download on an edition that never appears.
    #[must_use]
    pub fn new_remote(
        request_key: RequestKey,
        nickname: Option<Nickname>,
        now: DateTime<Utc>,
    ) -> Self {
        let latest_edition_hint = request_key.suggested_edition();
        Identity {
            id: request_key.id(),
            request_key,
            kind: IdentityKind::Remote,
            current_edition: 0,
            last_fetched_maybe_valid_edition: 0,
            fetch_state: FetchState::NotFetched,
            latest_edition_hint,
            nickname,
            publishes_trust_list: false,
            contexts: BTreeSet::new(),
            properties: BTreeMap::new(),
            created_at: now,
            last_changed_at: now,
            last_fetched_at: None,
        }
    }

    /// Create an own identity from a matching key pair.
    ///
    /// The advisory edition is clamped to 0: a freshly created own identity
    /// has published nothing yet.
    #[must_use]
    pub fn new_own(
        request_key: RequestKey,
        insert_key: InsertKey,
        nickname: Nickname,
        publishes_trust_list: bool,
        now: DateTime<Utc>,
    ) -> Self {
        let request_key = request_key.with_edition(0);
        Identity {
            id: request_key.id(),
            request_key,
            kind: IdentityKind::Own {
                insert_key,
                last_inserted_edition: None,
            },
            current_edition: 0,
            last_fetched_maybe_valid_edition: 0,
            fetch_state: FetchState::NotFetched,
            latest_edition_hint: 0,
            nickname: Some(nickname),
            publishes_trust_list,
            contexts: BTreeSet::new(),
            properties: BTreeMap::new(),
            created_at: now,
            last_changed_at: now,
            last_fetched_at: None,
        }
    }

    /// The immutable identity id.
    #[must_use]
    pub fn id(&self) -> IdentityId {
        self.id
    }

    /// The current public fetch key.
    #[must_use]
    pub fn request_key(&self) -> &RequestKey {
        &self.request_key
    }

    /// Whether this is an own identity.
    #[must_use]
    pub fn is_own(&self) -> bool {
        matches!(self.kind, IdentityKind::Own { .. })
    }

    /// The insert key, if this is an own identity.
    #[must_use]
    pub fn insert_key(&self) -> Option<&InsertKey> {
        match &self.kind {
            IdentityKind::Own { insert_key, .. } => Some(insert_key),
            IdentityKind::Remote => None,
        }
    }

    /// Last edition fetched and parsed successfully. Starts at 0 and only
    /// moves backwards through [`Identity::mark_for_refetch`].
    #[must_use]
    pub fn current_edition(&self) -> i64 {
        self.current_edition
    }

    /// Last edition fetched whose parse may have failed; throttles retries.
    #[must_use]
    pub fn last_fetched_maybe_valid_edition(&self) -> i64 {
        self.last_fetched_maybe_valid_edition
    }

    /// Parse status of the most recent fetch.
    #[must_use]
    pub fn fetch_state(&self) -> FetchState {
        self.fetch_state
    }

    /// Highest advisory edition observed from any source.
    #[must_use]
    pub fn latest_edition_hint(&self) -> u64 {
        self.latest_edition_hint
    }

    /// The nickname, if one has been learned.
    #[must_use]
    pub fn nickname(&self) -> Option<&Nickname> {
        self.nickname.as_ref()
    }

    /// Whether this identity publishes a trust list.
    #[must_use]
    pub fn publishes_trust_list(&self) -> bool {
        self.publishes_trust_list
    }

    /// The identity's contexts.
    #[must_use]
    pub fn contexts(&self) -> &BTreeSet<String> {
        &self.contexts
    }

    /// The identity's properties.
    #[must_use]
    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    /// Creation instant.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Instant of the last mutation.
    #[must_use]
    pub fn last_changed_at(&self) -> DateTime<Utc> {
        self.last_changed_at
    }

    /// Instant of the last fetch, if any.
    #[must_use]
    pub fn last_fetched_at(&self) -> Option<DateTime<Utc>> {
        self.last_fetched_at
    }

    /// The next edition worth requesting from the network: one past
    /// everything already fetched, whether or not it parsed.
    #[must_use]
    pub fn next_edition_to_fetch(&self) -> u64 {
        (self
            .current_edition
            .max(self.last_fetched_maybe_valid_edition)
            + 1)
        .max(0) as u64
    }

    /// Record a successfully fetched and parsed edition.
    ///
    /// # Errors
    ///
    /// Fails without mutating if `edition` does not advance past the
    /// current edition.
    pub fn on_fetched_and_parsed(&mut self, edition: u64, now: DateTime<Utc>) -> Result<()> {
        if edition as i64 <= self.current_edition {
            return Err(CoreError::invalid(format!(
                "edition {edition} does not advance past current edition {}",
                self.current_edition
            ))
            .into());
        }
        self.current_edition = edition as i64;
        self.last_fetched_maybe_valid_edition = edition as i64;
        self.fetch_state = FetchState::Fetched;
        self.latest_edition_hint = self.latest_edition_hint.max(edition);
        self.last_fetched_at = Some(now);
        self.last_changed_at = now;
        Ok(())
    }

    /// Record a fetched edition whose parse failed. The edition is skipped
    /// so the downloader moves on instead of retrying garbage forever.
    ///
    /// # Errors
    ///
    /// Fails without mutating if `edition` does not advance past the
    /// current edition.
    pub fn on_fetched_and_parsing_failed(
        &mut self,
        edition: u64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if edition as i64 <= self.current_edition {
            return Err(CoreError::invalid(format!(
                "edition {edition} does not advance past current edition {}",
                self.current_edition
            ))
            .into());
        }
        self.current_edition = edition as i64;
        self.fetch_state = FetchState::ParsingFailed;
        self.last_fetched_at = Some(now);
        self.last_changed_at = now;
        Ok(())
    }

    /// Force a refetch of the current edition, e.g. after importing an old
    /// database snapshot.
    pub fn mark_for_refetch(&mut self, now: DateTime<Utc>) {
        let previous = self.current_edition - 1;
        self.current_edition = previous;
        self.last_fetched_maybe_valid_edition = previous;
        self.fetch_state = FetchState::NotFetched;
        self.last_changed_at = now;
    }

    /// Merge an advisory edition observation.
    pub fn update_edition_hint(&mut self, edition: u64) {
        self.latest_edition_hint = self.latest_edition_hint.max(edition);
    }

    /// Replace the nickname.
    pub fn set_nickname(&mut self, nickname: Nickname, now: DateTime<Utc>) {
        self.nickname = Some(nickname);
        self.last_changed_at = now;
    }

    /// Replace the publish flag.
    pub fn set_publishes_trust_list(&mut self, publishes: bool, now: DateTime<Utc>) {
        self.publishes_trust_list = publishes;
        self.last_changed_at = now;
    }

    /// Replace the context set.
    ///
    /// # Errors
    ///
    /// Fails without mutating if there are more than 32 contexts or any
    /// context exceeds 32 characters.
    pub fn set_contexts<I>(&mut self, contexts: I, now: DateTime<Utc>) -> Result<()>
    where
        I: IntoIterator<Item = String>,
    {
        let contexts: BTreeSet<String> = contexts.into_iter().collect();
        if contexts.len() > MAX_CONTEXTS {
            return Err(CoreError::invalid(format!(
                "too many contexts: maximum {MAX_CONTEXTS}, got {}",
                contexts.len()
            ))
            .into());
        }
        for context in &contexts {
            if context.is_empty() || context.chars().count() > MAX_CONTEXT_LEN {
                return Err(CoreError::invalid(format!(
                    "context length must be 1..={MAX_CONTEXT_LEN} characters: {context:?}"
                ))
                .into());
            }
        }
        self.contexts = contexts;
        self.last_changed_at = now;
        Ok(())
    }

    /// Replace the property map.
    ///
    /// # Errors
    ///
    /// Fails without mutating on oversized names or values.
    pub fn set_properties<I>(&mut self, properties: I, now: DateTime<Utc>) -> Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let properties: BTreeMap<String, String> = properties.into_iter().collect();
        for (name, value) in &properties {
            if name.is_empty() || name.chars().count() > MAX_PROPERTY_NAME_LEN {
                return Err(CoreError::invalid(format!(
                    "property name length must be 1..={MAX_PROPERTY_NAME_LEN} characters: {name:?}"
                ))
                .into());
            }
            if value.chars().count() > MAX_PROPERTY_VALUE_LEN {
                return Err(CoreError::invalid(format!(
                    "property {name:?} value exceeds {MAX_PROPERTY_VALUE_LEN} characters"
                ))
                .into());
            }
        }
        self.properties = properties;
        self.last_changed_at = now;
        Ok(())
    }

    /// Flip a remote identity into an own identity, preserving everything
    /// else. Used by restore.
    pub fn promote_to_own(&mut self, insert_key: InsertKey, now: DateTime<Utc>) {
        self.kind = IdentityKind::Own {
            insert_key,
            last_inserted_edition: None,
        };
        self.last_changed_at = now;
    }

    /// Flip an own identity into a remote identity, preserving everything
    /// else. Used by own-identity deletion.
    pub fn demote_to_remote(&mut self, now: DateTime<Utc>) {
        self.kind = IdentityKind::Remote;
        self.last_changed_at = now;
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

    fn make_remote(n: u8) -> Identity {
        Identity::new_remote(RequestKey::new(make_id(n), 5), None, Utc::now())
    }

    fn make_own(n: u8) -> Identity {
        let id = make_id(n);
        Identity::new_own(
            RequestKey::new(id, 9),
            InsertKey::new(id, [n; 32], 9),
            Nickname::new("tester").unwrap(),
            true,
            Utc::now(),
        )
    }

    #[test]
    fn uri_edition_becomes_hint_not_current() {
        let identity = make_remote(1);
        assert_eq!(identity.current_edition(), 0);
        assert_eq!(identity.latest_edition_hint(), 5);
    }

    #[test]
    fn own_identity_clamps_advisory_edition() {
        let identity = make_own(1);
        assert_eq!(identity.latest_edition_hint(), 0);
        assert_eq!(identity.request_key().suggested_edition(), 0);
    }

    #[test]
    fn fetch_success_advances_edition() {
        let mut identity = make_remote(1);
        identity.on_fetched_and_parsed(3, Utc::now()).unwrap();
        assert_eq!(identity.current_edition(), 3);
        assert_eq!(identity.fetch_state(), FetchState::Fetched);
        assert_eq!(identity.last_fetched_maybe_valid_edition(), 3);
        assert_eq!(identity.latest_edition_hint(), 5);
    }

    #[test]
    fn fetch_success_rejects_stale_edition() {
        let mut identity = make_remote(1);
        identity.on_fetched_and_parsed(3, Utc::now()).unwrap();
        let before = identity.clone();
        assert!(identity.on_fetched_and_parsed(3, Utc::now()).is_err());
        assert!(identity.on_fetched_and_parsed(2, Utc::now()).is_err());
        assert_eq!(identity, before);
    }

    #[test]
    fn parse_failure_skips_edition_but_keeps_maybe_valid() {
        let mut identity = make_remote(1);
        identity.on_fetched_and_parsed(3, Utc::now()).unwrap();
        identity.on_fetched_and_parsing_failed(4, Utc::now()).unwrap();
        assert_eq!(identity.current_edition(), 4);
        assert_eq!(identity.fetch_state(), FetchState::ParsingFailed);
        assert_eq!(identity.last_fetched_maybe_valid_edition(), 3);
        // The broken edition is skipped, not retried.
        assert_eq!(identity.next_edition_to_fetch(), 5);
    }

    #[test]
    fn parse_failure_rejects_stale_edition() {
        let mut identity = make_remote(1);
        identity.on_fetched_and_parsed(3, Utc::now()).unwrap();
        assert!(identity
            .on_fetched_and_parsing_failed(3, Utc::now())
            .is_err());
    }

    #[test]
    fn mark_for_refetch_steps_back() {
        let mut identity = make_remote(1);
        identity.on_fetched_and_parsed(3, Utc::now()).unwrap();
        identity.mark_for_refetch(Utc::now());
        assert_eq!(identity.current_edition(), 2);
        assert_eq!(identity.last_fetched_maybe_valid_edition(), 2);
        assert_eq!(identity.fetch_state(), FetchState::NotFetched);
        assert_eq!(identity.next_edition_to_fetch(), 3);
    }

    #[test]
    fn context_limits_enforced() {
        let mut identity = make_remote(1);
        let now = Utc::now();

        let many: Vec<String> = (0..=MAX_CONTEXTS).map(|i| format!("ctx{i}")).collect();
        assert!(identity.set_contexts(many, now).is_err());

        let long = vec!["x".repeat(MAX_CONTEXT_LEN + 1)];
        assert!(identity.set_contexts(long, now).is_err());

        let ok = vec!["Freetalk".to_string(), "Introduction".to_string()];
        assert!(identity.set_contexts(ok, now).is_ok());
        assert_eq!(identity.contexts().len(), 2);
    }

    #[test]
    fn property_limits_enforced() {
        let mut identity = make_remote(1);
        let now = Utc::now();

        let long_name = vec![("n".repeat(MAX_PROPERTY_NAME_LEN + 1), String::new())];
        assert!(identity.set_properties(long_name, now).is_err());

        let long_value = vec![("a".to_string(), "v".repeat(MAX_PROPERTY_VALUE_LEN + 1))];
        assert!(identity.set_properties(long_value, now).is_err());

        let ok = vec![("IntroductionPuzzleCount".to_string(), "10".to_string())];
        assert!(identity.set_properties(ok, now).is_ok());
    }

    #[test]
    fn kind_flip_preserves_identity() {
        let mut identity = make_own(1);
        let id = identity.id();
        assert!(identity.is_own());

        identity.demote_to_remote(Utc::now());
        assert!(!identity.is_own());
        assert!(identity.insert_key().is_none());
        assert_eq!(identity.id(), id);

        identity.promote_to_own(InsertKey::new(id, [1; 32], 0), Utc::now());
        assert!(identity.is_own());
        assert_eq!(identity.id(), id);
    }

    #[test]
    fn serde_roundtrip_preserves_equality() {
        let mut identity = make_remote(7);
        identity.on_fetched_and_parsed(2, Utc::now()).unwrap();
        let bytes = bincode::serialize(&identity).unwrap();
        let restored: Identity = bincode::deserialize(&bytes).unwrap();
        assert_eq!(identity, restored);
    }
}
