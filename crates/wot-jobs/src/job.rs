//! The delayed background job.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, trace};

/// Lifecycle states of a [`DelayedBackgroundJob`].
///
/// Normal operation cycles `Idle → Waiting → Running → Idle`; shutdown
/// moves through `Terminating` (only from `Running`) into the final
/// `Terminated`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    /// No run is scheduled.
    Idle,
    /// A run is scheduled for a deadline.
    Waiting,
    /// The closure is executing.
    Running,
    /// Termination was requested while running; the worker has been
    /// interrupted and will terminate when the closure returns.
    Terminating,
    /// The job is finished for good. Terminal state.
    Terminated,
}

/// Handed to the job closure; exposes the interrupt flag.
///
/// A closure must observe the flag at every suspension point, at minimum
/// by sleeping through [`JobContext::sleep`] instead of
/// [`std::thread::sleep`].
pub struct JobContext {
    interrupted: Arc<AtomicBool>,
    wakeup: Arc<(Mutex<()>, Condvar)>,
}

impl JobContext {
    /// Whether termination has been requested.
    #[must_use]
    pub fn interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Sleep up to `duration`, returning early when interrupted.
    /// Returns `false` if the sleep was cut short by an interrupt.
    pub fn sleep(&self, duration: Duration) -> bool {
        let (lock, condvar) = &*self.wakeup;
        let deadline = Instant::now() + duration;
        let mut guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if self.interrupted() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            let (g, _) = condvar
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            guard = g;
        }
    }
}

struct Shared {
    state: JobState,
    /// Deadline of the pending run while `Waiting`.
    deadline: Option<Instant>,
    /// Deadline of the single follow-up run requested while `Running`.
    follow_up: Option<Instant>,
}

struct Inner {
    name: String,
    default_delay: Duration,
    shared: Mutex<Shared>,
    /// Wakes the worker on triggers and termination.
    signal: Condvar,
    /// Wakes threads blocked in `wait_for_termination`.
    state_changed: Condvar,
    interrupted: Arc<AtomicBool>,
    sleep_wakeup: Arc<(Mutex<()>, Condvar)>,
}

/// A background job that coalesces triggers into delayed runs.
pub struct DelayedBackgroundJob {
    inner: Arc<Inner>,
}

impl DelayedBackgroundJob {
    /// Create the job and start its worker thread. The closure does not
    /// run until the first trigger.
    pub fn new<F>(name: impl Into<String>, default_delay: Duration, job: F) -> Arc<Self>
    where
        F: Fn(&JobContext) + Send + 'static,
    {
        let inner = Arc::new(Inner {
            name: name.into(),
            default_delay,
            shared: Mutex::new(Shared {
                state: JobState::Idle,
                deadline: None,
                follow_up: None,
            }),
            signal: Condvar::new(),
            state_changed: Condvar::new(),
            interrupted: Arc::new(AtomicBool::new(false)),
            sleep_wakeup: Arc::new((Mutex::new(()), Condvar::new())),
        });

        let worker_inner = Arc::clone(&inner);
        let thread_name = format!("wot-job-{}", inner.name);
        thread::Builder::new()
            .name(thread_name)
            .spawn(move || worker_loop(worker_inner, job))
            .expect("spawning a job worker thread cannot fail");

        Arc::new(DelayedBackgroundJob { inner })
    }

    /// The job's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Schedule a run after the configured default delay.
    pub fn trigger_execution(&self) {
        self.trigger_execution_after(self.inner.default_delay);
    }

    /// Schedule a run after `delay`, which may shorten (but never
    /// lengthen) an already pending delay. A zero delay forces immediate
    /// scheduling but never concurrent execution.
    pub fn trigger_execution_after(&self, delay: Duration) {
        let deadline = Instant::now() + delay;
        let mut shared = self.lock();
        match shared.state {
            JobState::Idle => {
                shared.state = JobState::Waiting;
                shared.deadline = Some(deadline);
                trace!(job = %self.inner.name, ?delay, "run scheduled");
                self.inner.signal.notify_all();
            }
            JobState::Waiting => {
                let current = shared.deadline.unwrap_or(deadline);
                if deadline < current {
                    shared.deadline = Some(deadline);
                    trace!(job = %self.inner.name, ?delay, "pending delay shortened");
                    self.inner.signal.notify_all();
                }
            }
            JobState::Running => {
                let current = shared.follow_up.unwrap_or(deadline);
                shared.follow_up = Some(current.min(deadline));
                trace!(job = %self.inner.name, "follow-up run scheduled");
            }
            JobState::Terminating | JobState::Terminated => {}
        }
    }

    /// Request termination. Idempotent. From `Idle` or `Waiting` the job
    /// terminates immediately without running; from `Running` the worker
    /// is interrupted and terminates when the closure returns.
    pub fn terminate(&self) {
        let mut shared = self.lock();
        match shared.state {
            JobState::Idle | JobState::Waiting => {
                shared.state = JobState::Terminated;
                shared.deadline = None;
                shared.follow_up = None;
                debug!(job = %self.inner.name, "terminated");
                self.inner.signal.notify_all();
                self.inner.state_changed.notify_all();
            }
            JobState::Running => {
                shared.state = JobState::Terminating;
                self.inner.interrupted.store(true, Ordering::SeqCst);
                let (_, condvar) = &*self.inner.sleep_wakeup;
                condvar.notify_all();
                debug!(job = %self.inner.name, "terminating, worker interrupted");
                self.inner.signal.notify_all();
            }
            JobState::Terminating | JobState::Terminated => {}
        }
    }

    /// Whether the job reached its terminal state.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.lock().state == JobState::Terminated
    }

    /// The current state.
    #[must_use]
    pub fn state(&self) -> JobState {
        self.lock().state
    }

    /// Block until the job is terminated or the timeout elapses. Returns
    /// whether termination was reached.
    pub fn wait_for_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut shared = self.lock();
        while shared.state != JobState::Terminated {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .inner
                .state_changed
                .wait_timeout(shared, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            shared = guard;
        }
        true
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Shared> {
        self.inner.shared.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn worker_loop<F>(inner: Arc<Inner>, job: F)
where
    F: Fn(&JobContext) + Send + 'static,
{
    let context = JobContext {
        interrupted: Arc::clone(&inner.interrupted),
        wakeup: Arc::clone(&inner.sleep_wakeup),
    };

    let mut shared = inner.shared.lock().unwrap_or_else(|e| e.into_inner());
    loop {
        match shared.state {
            JobState::Idle => {
                let (guard, _) = inner
                    .signal
                    .wait(shared)
                    .map(|g| (g, ()))
                    .unwrap_or_else(|e| (e.into_inner(), ()));
                shared = guard;
            }
            JobState::Waiting => {
                let deadline = shared.deadline.expect("waiting state always has a deadline");
                let now = Instant::now();
                if now < deadline {
                    let (guard, _) = inner
                        .signal
                        .wait_timeout(shared, deadline - now)
                        .unwrap_or_else(|e| e.into_inner());
                    shared = guard;
                    continue;
                }
                shared.state = JobState::Running;
                shared.deadline = None;
                drop(shared);

                trace!(job = %inner.name, "run starting");
                let result = catch_unwind(AssertUnwindSafe(|| job(&context)));
                if result.is_err() {
                    error!(job = %inner.name, "background job panicked");
                }

                shared = inner.shared.lock().unwrap_or_else(|e| e.into_inner());
                match shared.state {
                    JobState::Terminating => {
                        shared.state = JobState::Terminated;
                        shared.follow_up = None;
                        debug!(job = %inner.name, "terminated after interrupt");
                        inner.state_changed.notify_all();
                        return;
                    }
                    _ => {
                        if let Some(follow_up) = shared.follow_up.take() {
                            shared.state = JobState::Waiting;
                            shared.deadline = Some(follow_up);
                        } else {
                            shared.state = JobState::Idle;
                        }
                    }
                }
            }
            JobState::Running | JobState::Terminating => {
                // Only this thread moves into or out of Running; seeing it
                // here would mean two workers exist.
                unreachable!("job worker observed a foreign Running state");
            }
            JobState::Terminated => {
                inner.state_changed.notify_all();
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn counting_job(counter: Arc<AtomicU32>, duration: Duration) -> impl Fn(&JobContext) {
        move |context: &JobContext| {
            counter.fetch_add(1, Ordering::SeqCst);
            context.sleep(duration);
        }
    }

    #[test]
    fn starts_idle_and_does_not_run_untriggered() {
        let counter = Arc::new(AtomicU32::new(0));
        let job = DelayedBackgroundJob::new(
            "untriggered",
            Duration::from_millis(5),
            counting_job(Arc::clone(&counter), Duration::ZERO),
        );
        assert_eq!(job.state(), JobState::Idle);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        job.terminate();
        assert!(job.wait_for_termination(Duration::from_secs(1)));
    }

    #[test]
    fn single_trigger_runs_once() {
        let counter = Arc::new(AtomicU32::new(0));
        let job = DelayedBackgroundJob::new(
            "single",
            Duration::from_millis(10),
            counting_job(Arc::clone(&counter), Duration::ZERO),
        );
        job.trigger_execution();
        thread::sleep(Duration::from_millis(200));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(job.state(), JobState::Idle);
        job.terminate();
        assert!(job.wait_for_termination(Duration::from_secs(1)));
    }

    #[test]
    fn triggers_are_coalesced_and_follow_up_is_single() {
        // Delay 150ms, job duration 20ms. Ten threads trigger for 180ms:
        // every trigger in [0, 150) coalesces into the first run, the
        // triggers landing during the run coalesce into exactly one
        // follow-up.
        let counter = Arc::new(AtomicU32::new(0));
        let job = DelayedBackgroundJob::new(
            "coalesce",
            Duration::from_millis(150),
            counting_job(Arc::clone(&counter), Duration::from_millis(20)),
        );

        let mut handles = Vec::new();
        for _ in 0..10 {
            let job_ref = Arc::clone(&job);
            handles.push(thread::spawn(move || {
                let start = Instant::now();
                while start.elapsed() < Duration::from_millis(180) {
                    job_ref.trigger_execution();
                    thread::sleep(Duration::from_millis(10));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        thread::sleep(Duration::from_millis(600));
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        job.terminate();
        assert!(job.wait_for_termination(Duration::from_secs(1)));
    }

    #[test]
    fn trigger_shortens_but_never_lengthens() {
        let counter = Arc::new(AtomicU32::new(0));
        let job = DelayedBackgroundJob::new(
            "shorten",
            Duration::from_secs(3600),
            counting_job(Arc::clone(&counter), Duration::ZERO),
        );

        // An hour-long delay shortened to 10ms must run promptly.
        job.trigger_execution();
        job.trigger_execution_after(Duration::from_millis(10));
        thread::sleep(Duration::from_millis(300));
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        // The other way around the long trigger must not postpone it.
        job.trigger_execution_after(Duration::from_millis(10));
        job.trigger_execution_after(Duration::from_secs(3600));
        thread::sleep(Duration::from_millis(300));
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        job.terminate();
        assert!(job.wait_for_termination(Duration::from_secs(1)));
    }

    #[test]
    fn zero_delay_forces_immediate_run() {
        let counter = Arc::new(AtomicU32::new(0));
        let job = DelayedBackgroundJob::new(
            "immediate",
            Duration::from_secs(3600),
            counting_job(Arc::clone(&counter), Duration::ZERO),
        );
        job.trigger_execution_after(Duration::ZERO);
        thread::sleep(Duration::from_millis(200));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        job.terminate();
        assert!(job.wait_for_termination(Duration::from_secs(1)));
    }

    #[test]
    fn terminate_from_waiting_skips_the_run() {
        let counter = Arc::new(AtomicU32::new(0));
        let job = DelayedBackgroundJob::new(
            "skip",
            Duration::from_secs(3600),
            counting_job(Arc::clone(&counter), Duration::ZERO),
        );
        job.trigger_execution();
        assert_eq!(job.state(), JobState::Waiting);
        job.terminate();
        assert!(job.wait_for_termination(Duration::from_secs(1)));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn terminate_interrupts_a_running_job() {
        let counter = Arc::new(AtomicU32::new(0));
        let was_interrupted = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&was_interrupted);
        let count = Arc::clone(&counter);
        let job = DelayedBackgroundJob::new("interrupt", Duration::from_millis(1), move |ctx| {
            count.fetch_add(1, Ordering::SeqCst);
            if !ctx.sleep(Duration::from_secs(3600)) {
                flag.store(true, Ordering::SeqCst);
            }
        });
        job.trigger_execution();

        // Let the run start, then interrupt it.
        thread::sleep(Duration::from_millis(100));
        assert_eq!(job.state(), JobState::Running);
        job.terminate();

        assert!(job.wait_for_termination(Duration::from_secs(2)));
        assert!(was_interrupted.load(Ordering::SeqCst));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn terminate_is_idempotent() {
        let job = DelayedBackgroundJob::new("idem", Duration::from_millis(1), |_| {});
        job.terminate();
        job.terminate();
        assert!(job.wait_for_termination(Duration::from_secs(1)));
        assert!(job.is_terminated());
    }

    #[test]
    fn triggers_after_termination_are_ignored() {
        let counter = Arc::new(AtomicU32::new(0));
        let job = DelayedBackgroundJob::new(
            "dead",
            Duration::from_millis(1),
            counting_job(Arc::clone(&counter), Duration::ZERO),
        );
        job.terminate();
        job.trigger_execution();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn wait_for_termination_is_bounded() {
        let job = DelayedBackgroundJob::new("bounded", Duration::from_secs(3600), |_| {});
        let start = Instant::now();
        let terminated = job.wait_for_termination(Duration::from_millis(100));
        let elapsed = start.elapsed();
        assert!(!terminated);
        // The wall-clock budget is timeout × 1.1; leave headroom for slow
        // schedulers but catch unbounded blocking.
        assert!(elapsed < Duration::from_millis(1000));
        job.terminate();
        assert!(job.wait_for_termination(Duration::from_secs(1)));
    }

    #[test]
    fn state_trajectory_for_one_cycle() {
        let job = DelayedBackgroundJob::new("trajectory", Duration::from_millis(60), |ctx| {
            ctx.sleep(Duration::from_millis(60));
        });
        assert_eq!(job.state(), JobState::Idle);
        job.trigger_execution();
        assert_eq!(job.state(), JobState::Waiting);
        thread::sleep(Duration::from_millis(90));
        assert_eq!(job.state(), JobState::Running);
        thread::sleep(Duration::from_millis(90));
        assert_eq!(job.state(), JobState::Idle);
        job.terminate();
        assert!(job.wait_for_termination(Duration::from_secs(1)));
    }

    #[test]
    fn panicking_job_does_not_kill_the_worker() {
        let counter = Arc::new(AtomicU32::new(0));
        let count = Arc::clone(&counter);
        let job = DelayedBackgroundJob::new("panicky", Duration::from_millis(1), move |_| {
            if count.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("first run explodes");
            }
        });
        job.trigger_execution();
        thread::sleep(Duration::from_millis(100));
        job.trigger_execution();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        job.terminate();
        assert!(job.wait_for_termination(Duration::from_secs(1)));
    }
}
