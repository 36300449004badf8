//! The fast downloader.
//!
//! Keeps a continuous transport subscription for every identity in its
//! partition: the own identities and their direct trustees. The partition
//! is small (on the order of the user's outgoing trust degree), so the
//! polling load of the subscriptions is acceptable, and these are exactly
//! the identities whose updates matter most.
//!
//! Failed subscriptions are retried indefinitely through a delayed
//! background job, so a flaky transport degrades into a slower
//! subscription setup instead of a lost identity.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use tracing::{debug, info, warn};
use wot_core::IdentityId;
use wot_graph::GraphStore;
use wot_jobs::{BackgroundJobFactory, DelayedBackgroundJob};

use crate::client::{DownloadHandler, NetworkClient, SubscriptionId, SubscriptionSink};

struct FastShared {
    store: Arc<GraphStore>,
    client: Arc<dyn NetworkClient>,
    handler: RwLock<Option<Arc<dyn DownloadHandler>>>,
    subscriptions: Mutex<HashMap<IdentityId, SubscriptionId>>,
    pending_retry: Mutex<HashSet<IdentityId>>,
    retry_job: Mutex<Option<Weak<DelayedBackgroundJob>>>,
    terminated: AtomicBool,
}

/// Schedule a retry round if any subscription is pending.
fn schedule_retry(shared: &FastShared) {
    if lock(&shared.pending_retry).is_empty() {
        return;
    }
    if let Some(job) = lock(&shared.retry_job).as_ref().and_then(Weak::upgrade) {
        job.trigger_execution();
    }
}

/// Continuous-subscription downloader for directly trusted identities.
pub struct FastDownloader {
    shared: Arc<FastShared>,
    retry_job: Arc<DelayedBackgroundJob>,
}

impl FastDownloader {
    /// Create the downloader. No subscriptions exist until the first
    /// [`FastDownloader::start_fetch`].
    pub fn new(
        store: Arc<GraphStore>,
        client: Arc<dyn NetworkClient>,
        jobs: &BackgroundJobFactory,
        retry_backoff: Duration,
    ) -> Self {
        let shared = Arc::new(FastShared {
            store,
            client,
            handler: RwLock::new(None),
            subscriptions: Mutex::new(HashMap::new()),
            pending_retry: Mutex::new(HashSet::new()),
            retry_job: Mutex::new(None),
            terminated: AtomicBool::new(false),
        });

        let retry_shared = Arc::clone(&shared);
        let retry_job = jobs.new_job("fast-downloader-retry", retry_backoff, move |context| {
            let pending: Vec<IdentityId> = {
                let mut set = lock(&retry_shared.pending_retry);
                set.drain().collect()
            };
            for id in pending {
                if context.interrupted() {
                    return;
                }
                subscribe(&retry_shared, id);
            }
            // Fresh failures have re-queued themselves.
            schedule_retry(&retry_shared);
        });
        *lock(&shared.retry_job) = Some(Arc::downgrade(&retry_job));

        FastDownloader { shared, retry_job }
    }

    /// Install the handler that consumes downloaded editions.
    pub fn set_handler(&self, handler: Arc<dyn DownloadHandler>) {
        *self
            .shared
            .handler
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    /// Subscribe to an identity, or refresh an existing subscription so a
    /// changed start edition (e.g. after a refetch request) takes effect.
    pub fn start_fetch(&self, id: IdentityId) {
        if self.shared.terminated.load(Ordering::SeqCst) {
            return;
        }
        // Resubscribing picks up the current next-edition-to-fetch.
        if let Some(existing) = lock(&self.shared.subscriptions).remove(&id) {
            self.shared.client.unsubscribe(existing);
        }
        subscribe(&self.shared, id);
    }

    /// Cancel the subscription for an identity.
    pub fn abort_fetch(&self, id: IdentityId) {
        lock(&self.shared.pending_retry).remove(&id);
        if let Some(handle) = lock(&self.shared.subscriptions).remove(&id) {
            self.shared.client.unsubscribe(handle);
            debug!(id = %id, "fast downloader unsubscribed");
        }
    }

    /// Whether the identity currently has a subscription.
    #[must_use]
    pub fn is_subscribed(&self, id: IdentityId) -> bool {
        lock(&self.shared.subscriptions).contains_key(&id)
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        lock(&self.shared.subscriptions).len()
    }

    /// Cancel everything and stop retrying.
    pub fn terminate(&self) {
        self.shared.terminated.store(true, Ordering::SeqCst);
        self.retry_job.terminate();
        self.retry_job
            .wait_for_termination(Duration::from_secs(10));
        let handles: Vec<SubscriptionId> =
            lock(&self.shared.subscriptions).drain().map(|(_, h)| h).collect();
        for handle in handles {
            self.shared.client.unsubscribe(handle);
        }
        lock(&self.shared.pending_retry).clear();
        info!("fast downloader terminated");
    }
}

/// Attempt one subscription; on failure queue the identity for retry.
/// Returns whether the subscription is now live.
fn subscribe(shared: &Arc<FastShared>, id: IdentityId) -> bool {
    if shared.terminated.load(Ordering::SeqCst) {
        return true;
    }
    let key = {
        let view = shared.store.read();
        match view.identity(id) {
            Some(identity) => identity
                .request_key()
                .with_edition(identity.next_edition_to_fetch()),
            None => {
                debug!(id = %id, "not subscribing, identity is gone");
                return true;
            }
        }
    };

    let sink = Box::new(FastSink {
        id,
        shared: Arc::downgrade(shared),
    });
    match shared.client.subscribe(&key, sink) {
        Ok(handle) => {
            lock(&shared.subscriptions).insert(id, handle);
            debug!(id = %id, "fast downloader subscribed");
            true
        }
        Err(error) => {
            warn!(id = %id, %error, "subscription failed, will retry");
            lock(&shared.pending_retry).insert(id);
            schedule_retry(shared);
            false
        }
    }
}

struct FastSink {
    id: IdentityId,
    shared: Weak<FastShared>,
}

impl SubscriptionSink for FastSink {
    fn on_edition(&self, edition: u64, payload: Vec<u8>) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        // Events raced against an unsubscribe are dropped here; the
        // transport stops calling after the unsubscribe returns.
        if !lock(&shared.subscriptions).contains_key(&self.id) {
            return;
        }
        let handler = shared
            .handler
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match handler {
            Some(handler) => handler.on_downloaded(self.id, edition, payload),
            None => warn!(id = %self.id, "dropping edition, no download handler installed"),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
