//! The downloader controller.
//!
//! Routes graph events to the two downloaders and keeps start/abort for
//! the same identity serialised: everything goes through the controller
//! monitor, in commit order.

use std::sync::{Arc, Mutex};

use tracing::debug;
use wot_core::config::DownloadConfig;
use wot_graph::{GraphEvent, GraphStore, Partition};
use wot_jobs::BackgroundJobFactory;

use crate::client::{DownloadHandler, NetworkClient};
use crate::fast::FastDownloader;
use crate::slow::SlowDownloader;

/// Owns both downloaders and routes fetch commands between them.
pub struct DownloaderController {
    fast: FastDownloader,
    slow: SlowDownloader,
    slots: usize,
    monitor: Mutex<()>,
}

impl DownloaderController {
    /// Create the controller and its downloaders. Nothing runs until
    /// [`DownloaderController::start`].
    pub fn new(
        store: Arc<GraphStore>,
        client: Arc<dyn NetworkClient>,
        jobs: &BackgroundJobFactory,
        config: &DownloadConfig,
    ) -> Self {
        let fast = FastDownloader::new(
            Arc::clone(&store),
            Arc::clone(&client),
            jobs,
            config.fast_retry_backoff,
        );
        let slow = SlowDownloader::new(store, client);
        DownloaderController {
            fast,
            slow,
            slots: config.slow_download_slots,
            monitor: Mutex::new(()),
        }
    }

    /// Install the outcome handler and start the slow workers.
    pub fn start(&self, handler: Arc<dyn DownloadHandler>) {
        self.fast.set_handler(Arc::clone(&handler));
        self.slow.set_handler(handler);
        self.slow.start(self.slots);
    }

    /// Route one batch of committed graph events.
    pub fn handle_events(&self, events: &[GraphEvent]) {
        let _serialised = self.monitor.lock().unwrap_or_else(|e| e.into_inner());
        for event in events {
            match event {
                GraphEvent::StartFetch {
                    id,
                    partition: Partition::Fast,
                } => self.fast.start_fetch(*id),
                GraphEvent::StartFetch {
                    id: _,
                    partition: Partition::Slow,
                } => self.slow.wake(),
                GraphEvent::AbortFetch {
                    id,
                    partition: Partition::Fast,
                } => self.fast.abort_fetch(*id),
                GraphEvent::AbortFetch {
                    id,
                    partition: Partition::Slow,
                } => {
                    // The hints were deleted in the same transaction. A
                    // request already in flight for this identity is left
                    // to finish: it causes no follow-up work and the
                    // ingestion check drops unwanted data.
                    debug!(id = %id, "slow fetch aborted");
                }
                GraphEvent::HintsChanged => self.slow.wake(),
                GraphEvent::PreDeleteOwnIdentity { old } => {
                    // The own identity's own subscription must not
                    // outlive its keys.
                    self.fast.abort_fetch(old.id());
                }
                GraphEvent::PreDeleteIdentity { old } => {
                    self.fast.abort_fetch(old.id());
                }
                GraphEvent::PostDeleteOwnIdentity { new } => {
                    debug!(id = %new.id(), "own identity became remote");
                }
                GraphEvent::PreRestoreOwnIdentity { old } => {
                    // Restart below picks the restored key state up.
                    self.fast.abort_fetch(old.id());
                }
                GraphEvent::PostRestoreOwnIdentity { new } => {
                    self.fast.start_fetch(new.id());
                }
            }
        }
    }

    /// The fast downloader, for inspection.
    #[must_use]
    pub fn fast(&self) -> &FastDownloader {
        &self.fast
    }

    /// The slow downloader, for inspection.
    #[must_use]
    pub fn slow(&self) -> &SlowDownloader {
        &self.slow
    }

    /// Stop both downloaders.
    pub fn terminate(&self) {
        let _serialised = self.monitor.lock().unwrap_or_else(|e| e.into_inner());
        self.fast.terminate();
        self.slow.terminate();
    }
}
