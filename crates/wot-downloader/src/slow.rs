//! The slow downloader.
//!
//! Fetches identities the fast downloader does not cover, driven by the
//! edition-hint priority queue: a small pool of worker threads each take
//! the best hint whose subject is not already being fetched, perform one
//! direct fetch of the hinted edition, and hand the outcome to the
//! download handler. A hint is never retried: if it lied or the edition
//! vanished, a better hint from another peer will supersede it.
//!
//! Because hints are sorted by date, then source capacity, the download
//! wavefront moves outwards through the trust graph like a breadth-first
//! search by rank.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};
use wot_core::{IdentityId, RequestKey};
use wot_graph::GraphStore;

use crate::client::{DownloadHandler, NetworkClient};

/// How long an idle worker sleeps before re-checking the queue even
/// without a wakeup.
const IDLE_POLL: Duration = Duration::from_millis(500);

struct SlowShared {
    store: Arc<GraphStore>,
    client: Arc<dyn NetworkClient>,
    handler: RwLock<Option<Arc<dyn DownloadHandler>>>,
    /// Subjects with a request in flight; never fetched twice at once.
    in_flight: Mutex<BTreeSet<IdentityId>>,
    wakeup: Condvar,
    terminated: AtomicBool,
}

/// One unit of work: the best eligible hint, resolved to a fetch key.
struct Claim {
    source: IdentityId,
    subject: IdentityId,
    edition: u64,
    key: RequestKey,
}

/// Hint-queue downloader for indirectly trusted identities.
pub struct SlowDownloader {
    shared: Arc<SlowShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl SlowDownloader {
    /// Create the downloader. Workers are spawned by
    /// [`SlowDownloader::start`].
    pub fn new(store: Arc<GraphStore>, client: Arc<dyn NetworkClient>) -> Self {
        SlowDownloader {
            shared: Arc::new(SlowShared {
                store,
                client,
                handler: RwLock::new(None),
                in_flight: Mutex::new(BTreeSet::new()),
                wakeup: Condvar::new(),
                terminated: AtomicBool::new(false),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Install the handler that consumes download outcomes.
    pub fn set_handler(&self, handler: Arc<dyn DownloadHandler>) {
        *self
            .shared
            .handler
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    /// Spawn `slots` request workers. At most `slots` fetches run
    /// concurrently.
    pub fn start(&self, slots: usize) {
        let mut workers = lock_workers(&self.workers);
        for n in 0..slots {
            let shared = Arc::clone(&self.shared);
            let handle = thread::Builder::new()
                .name(format!("wot-slow-downloader-{n}"))
                .spawn(move || worker_loop(&shared))
                .expect("spawning a downloader worker thread cannot fail");
            workers.push(handle);
        }
        info!(slots, "slow downloader started");
    }

    /// Wake the workers; called when hints changed or slots may have
    /// become useful again.
    pub fn wake(&self) {
        self.shared.wakeup.notify_all();
    }

    /// Number of fetches currently in flight.
    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.shared
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Stop the workers and wait for them to finish. The transport must
    /// fail still-blocking fetches during shutdown for this to return
    /// promptly.
    pub fn terminate(&self) {
        self.shared.terminated.store(true, Ordering::SeqCst);
        self.shared.wakeup.notify_all();
        let workers: Vec<JoinHandle<()>> = lock_workers(&self.workers).drain(..).collect();
        for worker in workers {
            if worker.join().is_err() {
                warn!("slow downloader worker panicked during shutdown");
            }
        }
        info!("slow downloader terminated");
    }
}

fn lock_workers(workers: &Mutex<Vec<JoinHandle<()>>>) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
    workers.lock().unwrap_or_else(|e| e.into_inner())
}

fn worker_loop(shared: &Arc<SlowShared>) {
    loop {
        if shared.terminated.load(Ordering::SeqCst) {
            return;
        }

        let claim = claim_best_hint(shared);
        let Some(claim) = claim else {
            // Nothing eligible; sleep until hints change (or poll, in
            // case a wakeup slipped past between the check and the wait).
            let guard = shared.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            let _ = shared
                .wakeup
                .wait_timeout(guard, IDLE_POLL)
                .unwrap_or_else(|e| e.into_inner());
            continue;
        };

        debug!(
            subject = %claim.subject,
            edition = claim.edition,
            source = %claim.source,
            "fetching hinted edition"
        );
        let outcome = shared.client.fetch(&claim.key);

        let handler = shared
            .handler
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(handler) = handler {
            match outcome {
                Ok(payload) => handler.on_downloaded(claim.subject, claim.edition, payload),
                Err(error) => {
                    debug!(
                        subject = %claim.subject,
                        edition = claim.edition,
                        %error,
                        "hinted fetch failed, dropping the hint"
                    );
                    handler.on_download_failed(claim.source, claim.subject, claim.edition);
                }
            }
        } else {
            warn!(subject = %claim.subject, "dropping outcome, no download handler installed");
        }

        shared
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&claim.subject);
        shared.wakeup.notify_all();
    }
}

/// Take the best hint whose subject is not in flight and mark it so.
fn claim_best_hint(shared: &SlowShared) -> Option<Claim> {
    let mut in_flight = shared.in_flight.lock().unwrap_or_else(|e| e.into_inner());
    let view = shared.store.read();
    let hint = view.best_hints(1, &in_flight).into_iter().next()?;
    let identity = view.identity(hint.subject())?;
    let key = identity.request_key().with_edition(hint.edition());
    in_flight.insert(hint.subject());
    Some(Claim {
        source: hint.source(),
        subject: hint.subject(),
        edition: hint.edition(),
        key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{GraphBackedHandler, MockClient};
    use chrono::Utc;
    use std::time::Instant;
    use wot_core::config::ScoringConfig;
    use wot_core::{InsertKey, RequestKey};
    use wot_graph::TrustGraph;

    fn make_id(n: u8) -> IdentityId {
        let mut bytes = [0u8; 32];
        bytes[0] = n;
        IdentityId::from_bytes(bytes)
    }

    /// owner -> a (capacity 40) -> c (capacity 16); x and y reachable.
    fn make_web() -> (Arc<TrustGraph>, IdentityId, IdentityId, IdentityId, IdentityId) {
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
        let mut ids = Vec::new();
        for n in [2u8, 3, 4, 5] {
            let id = make_id(n);
            graph
                .add_identity_from_uri(&RequestKey::new(id, 0), None)
                .unwrap();
            ids.push(id);
        }
        let (a, c, x, y) = (ids[0], ids[1], ids[2], ids[3]);
        graph.set_trust(owner, a, 100, "").unwrap();
        graph.set_trust(a, c, 100, "").unwrap();
        graph.set_trust(a, x, 50, "").unwrap();
        graph.set_trust(a, y, 50, "").unwrap();
        (graph, a, c, x, y)
    }

    fn wait_until(deadline: Duration, condition: impl Fn() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        condition()
    }

    #[test]
    fn fetches_hints_in_priority_order() {
        let (graph, a, c, x, y) = make_web();
        let date = Utc::now();
        // Capacity 16 hint for y, capacity 40 hint for x: x must go first.
        graph.store_edition_hint(c, y, date, 9).unwrap();
        graph.store_edition_hint(a, x, date, 5).unwrap();

        let client = Arc::new(MockClient::new());
        client.fail_all_fetches();

        let slow = SlowDownloader::new(Arc::clone(graph.store()), client.clone());
        slow.set_handler(Arc::new(GraphBackedHandler::new(Arc::clone(&graph))));
        // One slot: strictly sequential, so the order is observable.
        slow.start(1);
        slow.wake();

        assert!(wait_until(Duration::from_secs(5), || {
            client.fetch_log().len() >= 2
        }));
        let log = client.fetch_log();
        assert_eq!(log[0], (x, 5));
        assert_eq!(log[1], (y, 9));

        slow.terminate();
    }

    #[test]
    fn failed_hint_is_discarded_not_retried() {
        let (graph, a, _, x, _) = make_web();
        graph.store_edition_hint(a, x, Utc::now(), 5).unwrap();

        let client = Arc::new(MockClient::new());
        client.fail_all_fetches();

        let slow = SlowDownloader::new(Arc::clone(graph.store()), client.clone());
        slow.set_handler(Arc::new(GraphBackedHandler::new(Arc::clone(&graph))));
        slow.start(2);
        slow.wake();

        assert!(wait_until(Duration::from_secs(5), || {
            graph.store().read().hint_count() == 0
        }));
        // Give workers a chance to (incorrectly) retry, then check they
        // fetched exactly once.
        thread::sleep(Duration::from_millis(200));
        assert_eq!(client.fetch_log().len(), 1);

        slow.terminate();
    }

    #[test]
    fn successful_fetch_reaches_the_handler_and_advances_the_identity() {
        let (graph, a, _, x, _) = make_web();
        graph.store_edition_hint(a, x, Utc::now(), 5).unwrap();

        let client = Arc::new(MockClient::new());

        let slow = SlowDownloader::new(Arc::clone(graph.store()), client.clone());
        let handler = Arc::new(GraphBackedHandler::new(Arc::clone(&graph)));
        slow.set_handler(handler.clone());
        slow.start(2);
        slow.wake();

        assert!(wait_until(Duration::from_secs(5), || {
            graph.store().read().hint_count() == 0
        }));
        let view = graph.store().read();
        assert_eq!(view.identity(x).unwrap().current_edition(), 5);

        slow.terminate();
    }

    #[test]
    fn terminate_joins_workers() {
        let (graph, ..) = make_web();
        let client = Arc::new(MockClient::new());
        let slow = SlowDownloader::new(Arc::clone(graph.store()), client);
        slow.set_handler(Arc::new(GraphBackedHandler::new(graph)));
        slow.start(4);
        slow.terminate();
        assert_eq!(slow.in_flight_count(), 0);
    }
}
