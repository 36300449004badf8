//! The engine facade.
//!
//! [`WotEngine`] assembles the store, the trust graph, the score engine,
//! the downloaders, and the maintenance jobs, and exposes the public
//! operations of the daemon. Every mutating operation takes the engine
//! monitor first, runs one transaction, and only after releasing the
//! monitor forwards the committed events to the downloaders — the lock
//! hierarchy is engine monitor, then downloader monitor, then the store's
//! write transaction, and the transport is never called under the engine
//! monitor.

use std::fs;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{info, warn};
use wot_core::{IdentityId, InsertKey, Nickname, RequestKey, WotConfig};
use wot_downloader::{DownloaderController, IdentityFileCodec, NetworkClient};
use wot_graph::{GraphEvent, GraphStore, Identity, TrustGraph};
use wot_jobs::BackgroundJobFactory;

use crate::error::Result;
use crate::ingest::IngestHandler;
use crate::maintenance::MaintenanceScheduler;

/// How long shutdown waits for background jobs to finish.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Aggregate counters for status displays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EngineStats {
    /// Stored identities.
    pub identities: usize,
    /// Own identities among them.
    pub own_identities: usize,
    /// Stored trust edges.
    pub trusts: usize,
    /// Stored score records.
    pub scores: usize,
    /// Stored edition hints.
    pub hints: usize,
    /// Identities currently commanded to be fetched.
    pub fetching: usize,
}

/// The assembled web-of-trust engine.
pub struct WotEngine {
    config: WotConfig,
    monitor: Arc<Mutex<()>>,
    store: Arc<GraphStore>,
    graph: Arc<TrustGraph>,
    jobs: Arc<BackgroundJobFactory>,
    controller: Arc<DownloaderController>,
    maintenance: MaintenanceScheduler,
}

impl WotEngine {
    /// Open the store, wire everything up, start the downloaders and
    /// maintenance jobs, and resume downloads of everything the stored
    /// scores make fetchable.
    pub fn start(
        config: WotConfig,
        client: Arc<dyn NetworkClient>,
        codec: Arc<dyn IdentityFileCodec>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let store = if config.storage.in_memory {
            Arc::new(GraphStore::open_temporary()?)
        } else {
            fs::create_dir_all(&config.storage.data_dir)?;
            Arc::new(GraphStore::open(&config.storage.data_dir)?)
        };

        let monitor = Arc::new(Mutex::new(()));
        let graph = Arc::new(TrustGraph::new(Arc::clone(&store), config.scoring.clone()));
        let jobs = Arc::new(BackgroundJobFactory::new());
        let controller = Arc::new(DownloaderController::new(
            Arc::clone(&store),
            client,
            &jobs,
            &config.download,
        ));

        let handler = Arc::new(IngestHandler::new(
            Arc::clone(&monitor),
            Arc::clone(&graph),
            codec,
            Arc::downgrade(&controller),
        ));
        controller.start(handler);

        let data_dir = (!config.storage.in_memory).then(|| config.storage.data_dir.clone());
        let maintenance = MaintenanceScheduler::start(
            Arc::clone(&monitor),
            Arc::clone(&graph),
            Arc::clone(&store),
            &jobs,
            config.maintenance.clone(),
            data_dir.as_deref(),
            Arc::downgrade(&controller),
        )?;

        let engine = Arc::new(WotEngine {
            config,
            monitor,
            store,
            graph,
            jobs,
            controller,
            maintenance,
        });
        engine.resume_downloads();
        info!("web-of-trust engine started");
        Ok(engine)
    }

    /// Re-issue start commands for everything the loaded score table
    /// makes fetchable.
    fn resume_downloads(&self) {
        let events: Vec<GraphEvent> = {
            let view = self.store.read();
            view.fetching_ids()
                .into_iter()
                .filter_map(|id| {
                    view.fetching_partition(id)
                        .map(|partition| GraphEvent::StartFetch { id, partition })
                })
                .collect()
        };
        if !events.is_empty() {
            info!(count = events.len(), "resuming downloads from stored scores");
            self.controller.handle_events(&events);
        }
    }

    /// The trust graph, for read access and embedding UIs.
    #[must_use]
    pub fn graph(&self) -> &Arc<TrustGraph> {
        &self.graph
    }

    /// The engine configuration.
    #[must_use]
    pub fn config(&self) -> &WotConfig {
        &self.config
    }

    /// Aggregate counters.
    #[must_use]
    pub fn stats(&self) -> EngineStats {
        let view = self.store.read();
        EngineStats {
            identities: view.identity_count(),
            own_identities: view.own_identity_count(),
            trusts: view.trust_count(),
            scores: view.score_count(),
            hints: view.hint_count(),
            fetching: view.fetching_ids().len(),
        }
    }

    // === Identity and trust operations ===

    /// Create a fresh own identity from a matching request/insert URI
    /// pair.
    pub fn create_own_identity(
        &self,
        request_uri: &str,
        insert_uri: &str,
        nickname: &str,
        publishes_trust_list: bool,
    ) -> Result<Identity> {
        let request = RequestKey::parse(request_uri)?;
        let insert = InsertKey::parse(insert_uri)?;
        let (identity, events) = {
            let _engine = self.lock_monitor();
            self.graph
                .create_own_identity(&request, &insert, nickname, publishes_trust_list)?
        };
        self.controller.handle_events(&events);
        Ok(identity)
    }

    /// Add a remote identity by request URI.
    pub fn add_identity(&self, request_uri: &str, nickname: Option<&str>) -> Result<Identity> {
        let request = RequestKey::parse(request_uri)?;
        let nickname = nickname.map(Nickname::new).transpose()?;
        let (identity, events) = {
            let _engine = self.lock_monitor();
            self.graph.add_identity_from_uri(&request, nickname)?
        };
        self.controller.handle_events(&events);
        Ok(identity)
    }

    /// Set a trust rating.
    pub fn set_trust(
        &self,
        truster: IdentityId,
        trustee: IdentityId,
        value: i16,
        comment: &str,
    ) -> Result<()> {
        let events = {
            let _engine = self.lock_monitor();
            self.graph.set_trust(truster, trustee, value, comment)?
        };
        self.controller.handle_events(&events);
        Ok(())
    }

    /// Remove a trust rating.
    pub fn remove_trust(&self, truster: IdentityId, trustee: IdentityId) -> Result<()> {
        let events = {
            let _engine = self.lock_monitor();
            self.graph.remove_trust(truster, trustee)?
        };
        self.controller.handle_events(&events);
        Ok(())
    }

    /// Convert an own identity back into a remote identity. Verification
    /// and defragmentation run immediately afterwards so derived data of
    /// the removed tree does not linger.
    pub fn delete_own_identity(&self, id: IdentityId) -> Result<Identity> {
        let (identity, events) = {
            let _engine = self.lock_monitor();
            self.graph.delete_own_identity(id)?
        };
        self.controller.handle_events(&events);
        self.maintenance.run_now();
        Ok(identity)
    }

    /// Convert a remote identity into an own identity (or create it).
    pub fn restore_own_identity(&self, insert_uri: &str) -> Result<Identity> {
        let insert = InsertKey::parse(insert_uri)?;
        let (identity, events) = {
            let _engine = self.lock_monitor();
            self.graph.restore_own_identity(&insert)?
        };
        self.controller.handle_events(&events);
        Ok(identity)
    }

    /// Remove an identity and everything referring to it.
    pub fn delete_identity(&self, id: IdentityId) -> Result<()> {
        let events = {
            let _engine = self.lock_monitor();
            self.graph.delete_identity(id)?
        };
        self.controller.handle_events(&events);
        Ok(())
    }

    /// Fetch the identity's current edition again, e.g. after importing
    /// an old database snapshot.
    pub fn mark_for_refetch(&self, id: IdentityId) -> Result<()> {
        let events = {
            let _engine = self.lock_monitor();
            self.graph.mark_for_refetch(id)?
        };
        self.controller.handle_events(&events);
        Ok(())
    }

    /// Run the full score verification now. Returns the number of
    /// corrected discrepancies (zero on a healthy store).
    pub fn verify_scores_now(&self) -> Result<usize> {
        let (corrections, events) = {
            let _engine = self.lock_monitor();
            self.graph.verify_and_correct_stored_scores()?
        };
        self.controller.handle_events(&events);
        Ok(corrections)
    }

    /// Stop downloads and background jobs and flush the store.
    pub fn shutdown(&self) {
        info!("engine shutting down");
        self.controller.terminate();
        self.maintenance.terminate();
        self.jobs.terminate_all();
        if !self.jobs.wait_for_termination_of_all(SHUTDOWN_TIMEOUT) {
            warn!("some background jobs did not terminate in time");
        }
        if let Err(error) = self.store.flush() {
            warn!(%error, "flushing the store failed during shutdown");
        }
        info!("engine shut down");
    }

    fn lock_monitor(&self) -> std::sync::MutexGuard<'_, ()> {
        self.monitor.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offline::OfflineNetworkClient;
    use crate::testcodec::JsonCodec;
    use wot_core::Rank;

    fn make_id(n: u8) -> IdentityId {
        let mut bytes = [0u8; 32];
        bytes[0] = n;
        IdentityId::from_bytes(bytes)
    }

    fn request_uri(n: u8) -> String {
        RequestKey::new(make_id(n), 0).to_string()
    }

    fn insert_uri(n: u8) -> String {
        InsertKey::new(make_id(n), [n; 32], 0).to_string()
    }

    fn start_engine() -> Arc<WotEngine> {
        WotEngine::start(
            WotConfig::in_memory(),
            Arc::new(OfflineNetworkClient),
            Arc::new(JsonCodec),
        )
        .unwrap()
    }

    #[test]
    fn lifecycle_create_trust_delete() {
        let engine = start_engine();

        let owner = engine
            .create_own_identity(&request_uri(1), &insert_uri(1), "owner", true)
            .unwrap();
        assert!(owner.is_own());

        engine.add_identity(&request_uri(2), Some("alice")).unwrap();
        engine.set_trust(owner.id(), make_id(2), 100, "friend").unwrap();

        let stats = engine.stats();
        assert_eq!(stats.identities, 2);
        assert_eq!(stats.own_identities, 1);
        // Self trust plus the explicit one.
        assert_eq!(stats.trusts, 2);

        {
            let view = engine.graph().store().read();
            let score = view.score(owner.id(), make_id(2)).unwrap();
            assert_eq!(score.rank(), Rank::Finite(1));
        }

        let converted = engine.delete_own_identity(owner.id()).unwrap();
        assert!(!converted.is_own());
        assert_eq!(engine.stats().own_identities, 0);

        engine.shutdown();
    }

    #[test]
    fn mismatched_key_pair_rejected() {
        let engine = start_engine();
        let result = engine.create_own_identity(&request_uri(1), &insert_uri(2), "owner", true);
        assert!(result.is_err());
        engine.shutdown();
    }

    #[test]
    fn insert_uri_rejected_where_request_uri_expected() {
        let engine = start_engine();
        let result = engine.add_identity(&insert_uri(1), None);
        assert!(result.is_err());
        engine.shutdown();
    }

    #[test]
    fn verification_is_clean_after_mutations() {
        let engine = start_engine();
        let owner = engine
            .create_own_identity(&request_uri(1), &insert_uri(1), "owner", true)
            .unwrap();
        for n in 2..6 {
            engine.add_identity(&request_uri(n), None).unwrap();
            engine.set_trust(owner.id(), make_id(n), 50, "").unwrap();
        }
        engine.remove_trust(owner.id(), make_id(3)).unwrap();

        assert_eq!(engine.verify_scores_now().unwrap(), 0);
        engine.shutdown();
    }

    #[test]
    fn shutdown_terminates_all_jobs() {
        let engine = start_engine();
        engine.shutdown();
        // A second shutdown must be harmless.
        engine.shutdown();
    }
}
