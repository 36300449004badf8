//! The job factory and registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::job::{DelayedBackgroundJob, JobContext};

/// Creates [`DelayedBackgroundJob`]s and tracks them until termination.
///
/// Registration is explicit: every job created through the factory is
/// registered, and [`BackgroundJobFactory::reap_terminated`] (called by
/// the shutdown helpers) removes jobs that have reached their terminal
/// state, so the registry never keeps dead jobs and never grows without
/// bound.
#[derive(Default)]
pub struct BackgroundJobFactory {
    jobs: Mutex<HashMap<u64, Arc<DelayedBackgroundJob>>>,
    next_id: AtomicU64,
}

impl BackgroundJobFactory {
    /// Create an empty factory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create, register, and return a new job.
    pub fn new_job<F>(
        &self,
        name: impl Into<String>,
        default_delay: Duration,
        job: F,
    ) -> Arc<DelayedBackgroundJob>
    where
        F: Fn(&JobContext) + Send + 'static,
    {
        let job = DelayedBackgroundJob::new(name, default_delay, job);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.lock().insert(id, Arc::clone(&job));
        debug!(job = %job.name(), "registered background job");
        job
    }

    /// Number of registered, not yet reaped jobs.
    #[must_use]
    pub fn job_count(&self) -> usize {
        self.lock().len()
    }

    /// Request termination of every registered job.
    pub fn terminate_all(&self) {
        for job in self.lock().values() {
            job.terminate();
        }
    }

    /// Whether every registered job has terminated.
    #[must_use]
    pub fn all_terminated(&self) -> bool {
        self.lock().values().all(|job| job.is_terminated())
    }

    /// Wait up to `timeout` for every registered job to terminate,
    /// reaping the ones that did. Returns whether all of them made it.
    pub fn wait_for_termination_of_all(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let jobs: Vec<Arc<DelayedBackgroundJob>> = self.lock().values().cloned().collect();
        for job in jobs {
            let now = Instant::now();
            let remaining = deadline.saturating_duration_since(now);
            if !job.wait_for_termination(remaining) {
                self.reap_terminated();
                return false;
            }
        }
        self.reap_terminated();
        true
    }

    /// Drop registry entries for jobs that have terminated.
    pub fn reap_terminated(&self) {
        self.lock().retain(|_, job| !job.is_terminated());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Arc<DelayedBackgroundJob>>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn factory_tracks_and_terminates_jobs() {
        let factory = BackgroundJobFactory::new();
        let counter = Arc::new(AtomicU32::new(0));

        for n in 0..3 {
            let count = Arc::clone(&counter);
            factory.new_job(format!("job-{n}"), Duration::from_millis(5), move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(factory.job_count(), 3);
        assert!(!factory.all_terminated());

        factory.terminate_all();
        assert!(factory.wait_for_termination_of_all(Duration::from_secs(2)));
        assert!(factory.all_terminated());
    }

    #[test]
    fn reaping_removes_terminated_jobs() {
        let factory = BackgroundJobFactory::new();
        let job = factory.new_job("reapable", Duration::from_millis(5), |_| {});
        assert_eq!(factory.job_count(), 1);

        job.terminate();
        assert!(job.wait_for_termination(Duration::from_secs(1)));
        factory.reap_terminated();
        assert_eq!(factory.job_count(), 0);
    }

    #[test]
    fn wait_reports_timeout_when_a_job_hangs() {
        let factory = BackgroundJobFactory::new();
        let job = factory.new_job("stuck", Duration::from_millis(1), |ctx| {
            // Ignores the polite part of the interrupt contract for a
            // while, but not forever.
            while !ctx.interrupted() {
                std::thread::sleep(Duration::from_millis(10));
            }
        });
        job.trigger_execution();
        std::thread::sleep(Duration::from_millis(50));

        // Not terminated yet and nobody asked it to stop.
        assert!(!factory.wait_for_termination_of_all(Duration::from_millis(50)));

        factory.terminate_all();
        assert!(factory.wait_for_termination_of_all(Duration::from_secs(2)));
    }
}
