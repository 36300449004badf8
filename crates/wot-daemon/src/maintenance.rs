//! Periodic maintenance.
//!
//! Two jobs keep the store healthy:
//!
//! - **Score verification**: the reference recomputation diffed against
//!   the stored scores, every 28 days by default.
//! - **Defragmentation**: a compacting rewrite of the store, every 7 days
//!   by default.
//!
//! Both run immediately after an own identity is deleted, so derived data
//! of the removed trust tree cannot linger on disk.
//!
//! A sidecar file next to the store remembers when each job last ran, so
//! restarts do not reset the schedule.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use wot_core::config::MaintenanceConfig;
use wot_graph::{GraphStore, TrustGraph};
use wot_jobs::{BackgroundJobFactory, DelayedBackgroundJob};

use crate::error::Result;
use wot_downloader::DownloaderController;

const SIDECAR_FILE: &str = "maintenance.json";

/// Timestamps of the most recent maintenance runs.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
struct MaintenanceState {
    last_verification: Option<DateTime<Utc>>,
    last_defragmentation: Option<DateTime<Utc>>,
}

/// Schedules score verification and store defragmentation.
pub struct MaintenanceScheduler {
    state: Arc<Mutex<MaintenanceState>>,
    sidecar: Option<PathBuf>,
    config: MaintenanceConfig,
    verification: Arc<DelayedBackgroundJob>,
    defragmentation: Arc<DelayedBackgroundJob>,
}

impl MaintenanceScheduler {
    /// Create the scheduler and its jobs, and queue the initial runs
    /// based on the sidecar timestamps.
    pub fn start(
        monitor: Arc<Mutex<()>>,
        graph: Arc<TrustGraph>,
        store: Arc<GraphStore>,
        jobs: &BackgroundJobFactory,
        config: MaintenanceConfig,
        data_dir: Option<&Path>,
        controller: Weak<DownloaderController>,
    ) -> Result<Self> {
        let sidecar = data_dir.map(|dir| dir.join(SIDECAR_FILE));
        let state = Arc::new(Mutex::new(load_state(sidecar.as_deref())?));

        let verification = {
            let monitor = Arc::clone(&monitor);
            let graph = Arc::clone(&graph);
            let state = Arc::clone(&state);
            let sidecar = sidecar.clone();
            spawn_periodic(
                jobs,
                "score-verification",
                config.score_verification_interval,
                move || {
                    let outcome = {
                        let _engine = monitor.lock().unwrap_or_else(|e| e.into_inner());
                        graph.verify_and_correct_stored_scores()
                    };
                    match outcome {
                        Ok((corrections, events)) => {
                            info!(corrections, "periodic score verification finished");
                            if let Some(controller) = controller.upgrade() {
                                controller.handle_events(&events);
                            }
                        }
                        Err(error) => error!(%error, "periodic score verification failed"),
                    }
                    let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
                    state.last_verification = Some(Utc::now());
                    save_state(sidecar.as_deref(), *state);
                },
            )
        };

        let defragmentation = {
            let state = Arc::clone(&state);
            let sidecar = sidecar.clone();
            spawn_periodic(jobs, "store-defragmentation", config.defrag_interval, move || {
                let outcome = {
                    let _engine = monitor.lock().unwrap_or_else(|e| e.into_inner());
                    store.defragment()
                };
                match outcome {
                    Ok(stats) => info!(
                        records = stats.records,
                        bytes_on_disk = stats.bytes_on_disk,
                        "store defragmentation finished"
                    ),
                    Err(error) => error!(%error, "store defragmentation failed"),
                }
                let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
                state.last_defragmentation = Some(Utc::now());
                save_state(sidecar.as_deref(), *state);
            })
        };

        let scheduler = MaintenanceScheduler {
            state,
            sidecar,
            config,
            verification,
            defragmentation,
        };
        scheduler.queue_initial_runs();
        Ok(scheduler)
    }

    fn queue_initial_runs(&self) {
        let state = *self.state.lock().unwrap_or_else(|e| e.into_inner());
        self.verification.trigger_execution_after(remaining(
            state.last_verification,
            self.config.score_verification_interval,
        ));
        self.defragmentation.trigger_execution_after(remaining(
            state.last_defragmentation,
            self.config.defrag_interval,
        ));
    }

    /// Run both jobs as soon as possible. Called after the deletion of an
    /// own identity to evict any derived data of the removed tree.
    pub fn run_now(&self) {
        self.verification.trigger_execution_after(Duration::ZERO);
        self.defragmentation.trigger_execution_after(Duration::ZERO);
    }

    /// The sidecar file path, if one is configured.
    #[must_use]
    pub fn sidecar_path(&self) -> Option<&Path> {
        self.sidecar.as_deref()
    }

    /// Stop both jobs.
    pub fn terminate(&self) {
        self.verification.terminate();
        self.defragmentation.terminate();
    }
}

/// Time until a job whose last run was `last` is due again.
fn remaining(last: Option<DateTime<Utc>>, interval: Duration) -> Duration {
    let Some(last) = last else {
        return interval;
    };
    let elapsed = (Utc::now() - last).to_std().unwrap_or(Duration::ZERO);
    interval.saturating_sub(elapsed)
}

/// A job that re-arms itself with its default delay after every run.
fn spawn_periodic<F>(
    jobs: &BackgroundJobFactory,
    name: &str,
    interval: Duration,
    body: F,
) -> Arc<DelayedBackgroundJob>
where
    F: Fn() + Send + 'static,
{
    let slot: Arc<Mutex<Option<Weak<DelayedBackgroundJob>>>> = Arc::new(Mutex::new(None));
    let rearm = Arc::clone(&slot);
    let job = jobs.new_job(name, interval, move |context| {
        if context.interrupted() {
            return;
        }
        body();
        if let Some(job) = rearm
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .and_then(Weak::upgrade)
        {
            job.trigger_execution();
        }
    });
    *slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::downgrade(&job));
    job
}

fn load_state(path: Option<&Path>) -> Result<MaintenanceState> {
    let Some(path) = path else {
        return Ok(MaintenanceState::default());
    };
    match fs::read(path) {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(state) => Ok(state),
            Err(error) => {
                warn!(%error, "maintenance sidecar is unreadable, resetting the schedule");
                Ok(MaintenanceState::default())
            }
        },
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            Ok(MaintenanceState::default())
        }
        Err(error) => Err(error.into()),
    }
}

fn save_state(path: Option<&Path>, state: MaintenanceState) {
    let Some(path) = path else {
        return;
    };
    match serde_json::to_vec_pretty(&state) {
        Ok(bytes) => {
            if let Err(error) = fs::write(path, bytes) {
                warn!(%error, "could not persist maintenance sidecar");
            }
        }
        Err(error) => warn!(%error, "could not serialise maintenance sidecar"),
    }
}
