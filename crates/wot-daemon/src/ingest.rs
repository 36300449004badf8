//! The identity-file ingestion pipeline.
//!
//! Download outcomes from both downloaders land here, on transport or
//! worker threads. Each file is processed in one transaction: bookkeeping
//! of the fetched edition, identity attributes, the full trust-list diff,
//! and the edition hints carried as bonus payload. The lock order is
//! always engine monitor, then store write transaction; the resulting
//! events are routed to the downloaders only after the commit, outside
//! the monitor.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, Weak};

use chrono::Utc;
use tracing::{debug, warn};
use wot_core::{IdentityId, Nickname};
use wot_downloader::{DownloadHandler, DownloaderController, IdentityFileCodec, IdentityFileData};
use wot_graph::{GraphEvent, Result as GraphResult, TrustGraph};

/// Consumes terminal download outcomes for the engine.
pub(crate) struct IngestHandler {
    monitor: Arc<Mutex<()>>,
    graph: Arc<TrustGraph>,
    codec: Arc<dyn IdentityFileCodec>,
    controller: Weak<DownloaderController>,
}

impl IngestHandler {
    pub(crate) fn new(
        monitor: Arc<Mutex<()>>,
        graph: Arc<TrustGraph>,
        codec: Arc<dyn IdentityFileCodec>,
        controller: Weak<DownloaderController>,
    ) -> Self {
        IngestHandler {
            monitor,
            graph,
            codec,
            controller,
        }
    }

    fn route(&self, events: Vec<GraphEvent>) {
        if events.is_empty() {
            return;
        }
        if let Some(controller) = self.controller.upgrade() {
            controller.handle_events(&events);
        }
    }

    /// Mark the edition as fetched-but-unusable so it is skipped.
    fn mark_parse_failed(&self, subject: IdentityId, edition: u64) -> Vec<GraphEvent> {
        match self.graph.on_fetched_and_parsing_failed(subject, edition) {
            Ok(events) => events,
            Err(error) => {
                // Stale events (an even newer edition already arrived) are
                // expected here and harmless.
                debug!(subject = %subject, edition, %error, "parse-failure bookkeeping skipped");
                Vec::new()
            }
        }
    }

    /// Apply one parsed identity file. Returns the committed events, or
    /// an error if the file content failed validation (the caller then
    /// treats the whole file as unparseable).
    fn ingest_file(
        &self,
        subject: IdentityId,
        edition: u64,
        file: &IdentityFileData,
    ) -> GraphResult<Vec<GraphEvent>> {
        let now = Utc::now();
        let graph = &self.graph;
        let mut txn = graph.store().begin()?;

        let Some(identity) = txn.identity(subject) else {
            debug!(subject = %subject, "dropping file, identity is gone");
            return Ok(Vec::new());
        };
        if edition as i64 <= identity.current_edition() {
            debug!(subject = %subject, edition, "dropping file, edition is stale");
            return Ok(Vec::new());
        }
        // The download may have been aborted while the request was in
        // flight; unwanted data is dropped here.
        if !txn.compute_should_fetch(subject) {
            debug!(subject = %subject, "dropping file of unwanted identity");
            return Ok(Vec::new());
        }

        graph.on_fetched_and_parsed_in(&mut txn, subject, edition, now)?;

        // Identity attributes, all size-checked.
        let mut updated = txn
            .identity(subject)
            .expect("identity was present above")
            .clone();
        if let Some(nickname) = &file.nickname {
            updated.set_nickname(Nickname::new(nickname)?, now);
        }
        updated.set_publishes_trust_list(file.publishes_trust_list, now);
        updated.set_contexts(file.contexts.iter().cloned(), now)?;
        updated.set_properties(file.properties.iter().cloned(), now)?;
        txn.put_identity(updated);

        // Diff the published trust list against the stored one: upsert
        // everything asserted, drop what is no longer asserted.
        let mut affected: HashSet<IdentityId> = HashSet::new();
        let previous: Vec<IdentityId> = txn
            .trusts_from(subject)
            .iter()
            .map(|t| t.trustee())
            .filter(|trustee| *trustee != subject)
            .collect();
        let mut asserted: HashSet<IdentityId> = HashSet::new();
        for entry in &file.trust_list {
            let trustee = graph.get_or_add_identity_in(&mut txn, &entry.trustee_uri)?;
            if trustee == subject {
                debug!(subject = %subject, "ignoring self-entry in trust list");
                continue;
            }
            asserted.insert(trustee);
            affected.extend(graph.set_trust_in(&mut txn, subject, trustee, entry.value, &entry.comment)?);
        }
        for trustee in previous {
            if !asserted.contains(&trustee) {
                affected.extend(graph.remove_trust_in(&mut txn, subject, trustee)?);
            }
        }

        // Edition hints ride along in the trustee URIs. Stored after the
        // score updates so the source capacity they record is current.
        for entry in &file.trust_list {
            let hinted_edition = entry.trustee_uri.suggested_edition();
            let trustee = entry.trustee_uri.id();
            if hinted_edition > 0 && asserted.contains(&trustee) {
                graph.store_edition_hint_in(&mut txn, subject, trustee, now, hinted_edition)?;
            }
        }

        graph.refresh_fetch_state_in(&mut txn, affected);
        txn.commit()
    }
}

impl DownloadHandler for IngestHandler {
    fn on_downloaded(&self, subject: IdentityId, edition: u64, payload: Vec<u8>) {
        let decoded = self.codec.decode(&payload);
        let events = {
            let _engine = self.monitor.lock().unwrap_or_else(|e| e.into_inner());
            match decoded {
                Ok(file) if file.id == subject => {
                    match self.ingest_file(subject, edition, &file) {
                        Ok(events) => events,
                        Err(error) => {
                            warn!(subject = %subject, edition, %error, "identity file failed validation");
                            self.mark_parse_failed(subject, edition)
                        }
                    }
                }
                Ok(file) => {
                    warn!(
                        subject = %subject,
                        claimed = %file.id,
                        "identity file claims a different publisher"
                    );
                    self.mark_parse_failed(subject, edition)
                }
                Err(error) => {
                    warn!(subject = %subject, edition, %error, "identity file failed to parse");
                    self.mark_parse_failed(subject, edition)
                }
            }
        };
        self.route(events);
    }

    fn on_download_failed(&self, source: IdentityId, subject: IdentityId, edition: u64) {
        let events = {
            let _engine = self.monitor.lock().unwrap_or_else(|e| e.into_inner());
            // The hinted edition is treated like a parse failure: skip it
            // and wait for a better hint from another peer.
            match self.graph.on_fetched_and_parsing_failed(subject, edition) {
                Ok(events) => events,
                Err(_) => {
                    let _ = self.graph.discard_hint(source, subject);
                    Vec::new()
                }
            }
        };
        self.route(events);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testcodec::JsonCodec;
    use std::sync::Weak as StdWeak;
    use wot_core::config::ScoringConfig;
    use wot_core::{InsertKey, Rank, RequestKey};
    use wot_downloader::TrustListEntry;
    use wot_graph::{FetchState, GraphStore};

    fn make_id(n: u8) -> IdentityId {
        let mut bytes = [0u8; 32];
        bytes[0] = n;
        IdentityId::from_bytes(bytes)
    }

    fn make_handler() -> (IngestHandler, Arc<TrustGraph>, IdentityId, IdentityId) {
        let store = Arc::new(GraphStore::open_temporary().unwrap());
        let graph = Arc::new(TrustGraph::new(store, ScoringConfig::default()));

        let owner = make_id(1);
        graph
            .create_own_identity(
                &RequestKey::new(owner, 0),
                &InsertKey::new(owner, [1; 32], 0),
                "owner",
                true,
            )
            .unwrap();
        let a = make_id(2);
        graph
            .add_identity_from_uri(&RequestKey::new(a, 0), None)
            .unwrap();
        graph.set_trust(owner, a, 100, "").unwrap();

        let handler = IngestHandler::new(
            Arc::new(Mutex::new(())),
            Arc::clone(&graph),
            Arc::new(JsonCodec),
            StdWeak::new(),
        );
        (handler, graph, owner, a)
    }

    fn file_payload(
        id: IdentityId,
        edition: u64,
        nickname: &str,
        trust_list: Vec<TrustListEntry>,
    ) -> Vec<u8> {
        let file = IdentityFileData {
            id,
            edition,
            nickname: Some(nickname.to_string()),
            publishes_trust_list: true,
            contexts: vec!["Introduction".to_string()],
            properties: vec![("IntroductionPuzzleCount".to_string(), "10".to_string())],
            trust_list,
        };
        serde_json::to_vec(&file).unwrap()
    }

    #[test]
    fn ingests_trust_list_with_hints() {
        let (handler, graph, owner, a) = make_handler();
        let b = make_id(3);
        let c = make_id(4);

        let payload = file_payload(
            a,
            1,
            "alice",
            vec![
                TrustListEntry {
                    trustee_uri: RequestKey::new(b, 7),
                    value: 100,
                    comment: "good publisher".to_string(),
                },
                TrustListEntry {
                    trustee_uri: RequestKey::new(c, 0),
                    value: -50,
                    comment: "spammer".to_string(),
                },
            ],
        );
        handler.on_downloaded(a, 1, payload);

        let view = graph.store().read();

        let alice = view.identity(a).unwrap();
        assert_eq!(alice.current_edition(), 1);
        assert_eq!(alice.fetch_state(), FetchState::Fetched);
        assert_eq!(alice.nickname().unwrap().as_str(), "alice");
        assert!(alice.contexts().contains("Introduction"));

        // B: positively trusted at rank 2, with the hint from the URI.
        let score_b = view.score(owner, b).unwrap();
        assert_eq!(score_b.rank(), Rank::Finite(2));
        assert_eq!(score_b.value(), 40);
        let hint = view.hint(a, b).unwrap();
        assert_eq!(hint.edition(), 7);
        assert_eq!(hint.source_capacity(), 40);

        // C: distrusted, unreachable, not fetched.
        let score_c = view.score(owner, c).unwrap();
        assert_eq!(score_c.rank(), Rank::Unreachable);
        assert_eq!(score_c.value(), -20);
        assert!(!view.should_fetch(c));
        assert!(view.hints_for_subject(c).is_empty());
    }

    #[test]
    fn dropped_trusts_are_removed_on_next_edition() {
        let (handler, graph, owner, a) = make_handler();
        let b = make_id(3);

        handler.on_downloaded(
            a,
            1,
            file_payload(
                a,
                1,
                "alice",
                vec![TrustListEntry {
                    trustee_uri: RequestKey::new(b, 0),
                    value: 100,
                    comment: String::new(),
                }],
            ),
        );
        assert!(graph.store().read().score(owner, b).is_some());

        // Edition 2 no longer asserts the trust.
        handler.on_downloaded(a, 2, file_payload(a, 2, "alice", Vec::new()));

        let view = graph.store().read();
        assert!(view.trust(a, b).is_none());
        assert!(view.score(owner, b).is_none());
        assert!(!view.should_fetch(b));
    }

    #[test]
    fn garbage_payload_marks_parsing_failed() {
        let (handler, graph, _, a) = make_handler();
        handler.on_downloaded(a, 1, b"certainly not json".to_vec());

        let view = graph.store().read();
        let alice = view.identity(a).unwrap();
        assert_eq!(alice.fetch_state(), FetchState::ParsingFailed);
        assert_eq!(alice.current_edition(), 1);
        // The maybe-valid edition was not advanced by the bad file.
        assert_eq!(alice.last_fetched_maybe_valid_edition(), 0);
    }

    #[test]
    fn file_claiming_wrong_publisher_is_rejected() {
        let (handler, graph, _, a) = make_handler();
        let payload = file_payload(make_id(9), 1, "imposter", Vec::new());
        handler.on_downloaded(a, 1, payload);

        let view = graph.store().read();
        assert_eq!(view.identity(a).unwrap().fetch_state(), FetchState::ParsingFailed);
    }

    #[test]
    fn stale_edition_is_dropped_without_changes() {
        let (handler, graph, _, a) = make_handler();
        handler.on_downloaded(a, 3, file_payload(a, 3, "alice", Vec::new()));
        handler.on_downloaded(a, 2, file_payload(a, 2, "old-name", Vec::new()));

        let view = graph.store().read();
        let alice = view.identity(a).unwrap();
        assert_eq!(alice.current_edition(), 3);
        assert_eq!(alice.nickname().unwrap().as_str(), "alice");
    }

    #[test]
    fn failed_hint_download_skips_the_edition() {
        let (handler, graph, owner, a) = make_handler();
        let x = make_id(5);
        graph
            .add_identity_from_uri(&RequestKey::new(x, 0), None)
            .unwrap();
        graph.set_trust(owner, x, 50, "").unwrap();
        graph.store_edition_hint(a, x, chrono::Utc::now(), 4).unwrap();

        handler.on_download_failed(a, x, 4);

        let view = graph.store().read();
        assert!(view.hint(a, x).is_none());
        assert_eq!(view.identity(x).unwrap().current_edition(), 4);
        assert_eq!(
            view.identity(x).unwrap().fetch_state(),
            FetchState::ParsingFailed
        );
    }
}
