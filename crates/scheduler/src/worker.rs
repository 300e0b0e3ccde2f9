//! Worker pools for process execution.
//!
//! Two fixed pools of threads pull work from a [`ProcessScheduler`]: admin
//! workers (high-priority queue, plus overflow from the user queue) and user
//! workers (user queue only). A supervisor thread enforces the cancellation
//! grace period and evicts old terminal records.
//!
//! Each task runs inline on its worker thread. A panic inside a task is caught
//! and recorded as a failure; the worker keeps serving.

use crate::priority::WorkerTier;
use crate::scheduler::{ClaimedProcess, ProcessScheduler};
use crate::task::TaskError;
use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, info_span, warn};

/// Admin and user worker pools bound to one scheduler.
///
/// Pool sizes and the poll interval come from the scheduler's
/// [`SchedulerConfig`](crate::SchedulerConfig).
///
/// # Example
///
/// ```
/// use bgproc_scheduler::{
///     task_fn, ProcessRequest, ProcessScheduler, ProcessType, SchedulerConfig, TaskOutput,
///     WorkerPool,
/// };
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let scheduler = Arc::new(ProcessScheduler::new(SchedulerConfig::new(1, 2)).unwrap());
/// let pool = WorkerPool::start(Arc::clone(&scheduler)).unwrap();
///
/// scheduler
///     .submit(
///         ProcessRequest::admin(ProcessType::QuotaRefresh, "nightly quota refresh"),
///         task_fn(|_ctx| Ok(TaskOutput::empty())),
///     )
///     .unwrap();
///
/// assert!(scheduler.wait_idle(Duration::from_secs(5)));
/// pool.shutdown();
/// ```
pub struct WorkerPool {
    scheduler: Arc<ProcessScheduler>,
    workers: Vec<Worker>,
    supervisor: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    admin_workers: usize,
    user_workers: usize,
}

impl WorkerPool {
    /// Spawn both pools and the supervisor.
    ///
    /// If a thread cannot be spawned, the threads already started are stopped
    /// and the error is returned.
    pub fn start(scheduler: Arc<ProcessScheduler>) -> io::Result<Self> {
        let config = scheduler.config().clone();
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut pool = Self {
            scheduler: Arc::clone(&scheduler),
            workers: Vec::with_capacity(config.admin_workers + config.user_workers),
            supervisor: None,
            shutdown: Arc::clone(&shutdown),
            admin_workers: config.admin_workers,
            user_workers: config.user_workers,
        };

        let tiers = std::iter::repeat(WorkerTier::Admin)
            .take(config.admin_workers)
            .enumerate()
            .chain(std::iter::repeat(WorkerTier::User).take(config.user_workers).enumerate());
        for (index, tier) in tiers {
            match Worker::spawn(tier, index, Arc::clone(&scheduler), Arc::clone(&shutdown)) {
                Ok(worker) => pool.workers.push(worker),
                Err(error) => {
                    pool.stop();
                    return Err(error);
                }
            }
        }

        let supervisor = {
            let scheduler = Arc::clone(&scheduler);
            let shutdown = Arc::clone(&shutdown);
            thread::Builder::new()
                .name("bgproc-supervisor".to_string())
                .spawn(move || supervise(&scheduler, &shutdown))
        };
        match supervisor {
            Ok(handle) => pool.supervisor = Some(handle),
            Err(error) => {
                pool.stop();
                return Err(error);
            }
        }

        info!(
            admin_workers = pool.admin_workers,
            user_workers = pool.user_workers,
            "worker pools started"
        );
        Ok(pool)
    }

    pub fn admin_workers(&self) -> usize {
        self.admin_workers
    }

    pub fn user_workers(&self) -> usize {
        self.user_workers
    }

    /// Total number of worker threads (supervisor excluded).
    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Stop the pools gracefully.
    ///
    /// Each worker finishes the task it is running, then exits. Queued
    /// processes are left `Pending`. Blocks until every thread has exited.
    pub fn shutdown(mut self) {
        self.stop();
        info!("worker pools stopped");
    }

    /// Signal shutdown without waiting for the threads.
    pub fn shutdown_nowait(self) {
        self.shutdown.store(true, Ordering::Release);
        self.scheduler.wake_workers();
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.scheduler.wake_workers();

        for worker in self.workers.drain(..) {
            worker.join();
        }
        if let Some(supervisor) = self.supervisor.take() {
            if supervisor.join().is_err() {
                warn!("supervisor thread panicked");
            }
        }
    }
}

struct Worker {
    name: String,
    thread: JoinHandle<()>,
}

impl Worker {
    fn spawn(
        tier: WorkerTier,
        index: usize,
        scheduler: Arc<ProcessScheduler>,
        shutdown: Arc<AtomicBool>,
    ) -> io::Result<Self> {
        let name = format!("bgproc-{tier}-{index}");
        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || Self::run(tier, &scheduler, &shutdown))?;
        Ok(Self { name, thread })
    }

    /// Pull, execute and finish processes until shutdown is signalled.
    fn run(tier: WorkerTier, scheduler: &ProcessScheduler, shutdown: &AtomicBool) {
        let poll_interval = scheduler.config().poll_interval;
        debug!(%tier, "worker started");

        while !shutdown.load(Ordering::Acquire) {
            if let Some(claimed) = scheduler.wait_for_job(tier, poll_interval) {
                execute(scheduler, claimed);
            }
        }

        debug!(%tier, "worker exiting");
    }

    fn join(self) {
        if self.thread.join().is_err() {
            warn!(worker = %self.name, "worker thread panicked");
        }
    }
}

fn execute(scheduler: &ProcessScheduler, claimed: ClaimedProcess<'_>) {
    let span = info_span!(
        "process",
        process_id = %claimed.id(),
        kind = %claimed.process_type(),
        priority = %claimed.priority(),
        tier = %claimed.tier(),
    );
    let _enter = span.enter();

    debug!("task started");
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| claimed.run())).unwrap_or_else(|payload| {
        let message = panic_message(&*payload);
        warn!(panic = %message, "task panicked");
        Err(TaskError::Failed(format!("task panicked: {message}")))
    });

    scheduler.finish(claimed, outcome);
}

fn supervise(scheduler: &ProcessScheduler, shutdown: &AtomicBool) {
    let interval = scheduler.config().poll_interval;
    while !shutdown.load(Ordering::Acquire) {
        thread::sleep(interval);
        scheduler.enforce_cancel_grace();
        scheduler.evict_history();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
