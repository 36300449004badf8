//! In-process fakes for downloader tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use wot_core::{IdentityId, InsertKey, RequestKey};
use wot_graph::TrustGraph;

use crate::client::{
    DownloadHandler, NetworkClient, SubscriptionId, SubscriptionSink,
};
use crate::error::{DownloadError, Result};

/// A scriptable in-memory transport.
#[derive(Default)]
pub(crate) struct MockClient {
    subscriptions: Mutex<HashMap<u64, (IdentityId, Box<dyn SubscriptionSink>)>>,
    next_id: AtomicU64,
    fail_subscribes: AtomicU32,
    fail_fetches: AtomicBool,
    fetch_log: Mutex<Vec<(IdentityId, u64)>>,
}

impl MockClient {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` subscribe calls fail.
    pub(crate) fn fail_next_subscribes(&self, n: u32) {
        self.fail_subscribes.store(n, Ordering::SeqCst);
    }

    /// Make every fetch fail (as if no edition existed).
    pub(crate) fn fail_all_fetches(&self) {
        self.fail_fetches.store(true, Ordering::SeqCst);
    }

    /// Deliver an edition to every live subscription of `id`.
    pub(crate) fn push_subscription_edition(&self, id: IdentityId, edition: u64, payload: Vec<u8>) {
        let subscriptions = self.subscriptions.lock().unwrap();
        for (subscribed, sink) in subscriptions.values() {
            if *subscribed == id {
                sink.on_edition(edition, payload.clone());
            }
        }
    }

    pub(crate) fn active_subscription_count(&self) -> usize {
        self.subscriptions.lock().unwrap().len()
    }

    /// Every fetch performed, as `(subject, edition)` in call order.
    pub(crate) fn fetch_log(&self) -> Vec<(IdentityId, u64)> {
        self.fetch_log.lock().unwrap().clone()
    }
}

impl NetworkClient for MockClient {
    fn subscribe(
        &self,
        key: &RequestKey,
        sink: Box<dyn SubscriptionSink>,
    ) -> Result<SubscriptionId> {
        let failures = self.fail_subscribes.load(Ordering::SeqCst);
        if failures > 0 {
            self.fail_subscribes.store(failures - 1, Ordering::SeqCst);
            return Err(DownloadError::TransportFailure("scripted failure".into()));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subscriptions
            .lock()
            .unwrap()
            .insert(id, (key.id(), sink));
        Ok(SubscriptionId(id))
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.subscriptions.lock().unwrap().remove(&id.0);
    }

    fn fetch(&self, key: &RequestKey) -> Result<Vec<u8>> {
        self.fetch_log
            .lock()
            .unwrap()
            .push((key.id(), key.suggested_edition()));
        if self.fail_fetches.load(Ordering::SeqCst) {
            return Err(DownloadError::TransportFailure("not found".into()));
        }
        Ok(b"identity-file".to_vec())
    }

    fn insert(&self, _key: &InsertKey, _payload: &[u8]) -> Result<()> {
        Ok(())
    }
}

/// Records every outcome it receives.
#[derive(Default)]
pub(crate) struct RecordingHandler {
    downloads: Mutex<Vec<(IdentityId, u64, Vec<u8>)>>,
    failures: Mutex<Vec<(IdentityId, IdentityId, u64)>>,
}

impl RecordingHandler {
    pub(crate) fn downloads(&self) -> Vec<(IdentityId, u64, Vec<u8>)> {
        self.downloads.lock().unwrap().clone()
    }
}

impl DownloadHandler for RecordingHandler {
    fn on_downloaded(&self, subject: IdentityId, edition: u64, payload: Vec<u8>) {
        self.downloads.lock().unwrap().push((subject, edition, payload));
    }

    fn on_download_failed(&self, source: IdentityId, subject: IdentityId, edition: u64) {
        self.failures.lock().unwrap().push((source, subject, edition));
    }
}

/// A handler that performs the minimal real bookkeeping against a trust
/// graph: successful downloads advance the identity (which garbage
/// collects its hints), failures discard the hint.
pub(crate) struct GraphBackedHandler {
    graph: Arc<TrustGraph>,
}

impl GraphBackedHandler {
    pub(crate) fn new(graph: Arc<TrustGraph>) -> Self {
        GraphBackedHandler { graph }
    }
}

impl DownloadHandler for GraphBackedHandler {
    fn on_downloaded(&self, subject: IdentityId, edition: u64, _payload: Vec<u8>) {
        let _ = self.graph.on_fetched_and_parsed(subject, edition);
    }

    fn on_download_failed(&self, source: IdentityId, subject: IdentityId, _edition: u64) {
        let _ = self.graph.discard_hint(source, subject);
    }
}
