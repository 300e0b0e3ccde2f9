//! Background Process Scheduler Library
//!
//! Two-tier priority scheduler for long-running maintenance processes.
//!
//! Processes are admitted with a priority. `High` work (administrator
//! maintenance) goes to the admin queue and `Normal` work (user-initiated jobs)
//! goes to the user queue. Two fixed worker pools drain the queues: admin
//! workers serve the admin queue and may borrow from the user queue when it
//! is idle, while user workers only ever serve the user queue. A burst of user
//! work therefore never delays an administrator task by more than one
//! dispatch cycle.
//!
//! Every process has a record that moves through
//! `Pending -> Running -> {Completed | Failed | Cancelled}` (or straight from
//! `Pending` to `Cancelled`). Records can be polled individually or through
//! the status snapshots.
//!
//! # Example
//!
//! ```
//! use bgproc_scheduler::{
//!     ProcessRequest, ProcessScheduler, ProcessStatus, ProcessType, SchedulerConfig,
//!     TaskOutput, TaskRegistry, WorkerPool,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let registry = TaskRegistry::new()
//!     .with(ProcessType::QuotaRefresh, |ctx| {
//!         for step in 1..=4 {
//!             ctx.report_progress(step as f32 * 25.0)?;
//!         }
//!         Ok(TaskOutput::empty())
//!     })
//!     .with(ProcessType::Cleanup, |_ctx| Ok(TaskOutput::empty()));
//!
//! let scheduler = Arc::new(
//!     ProcessScheduler::new(SchedulerConfig::new(1, 2))
//!         .unwrap()
//!         .with_registry(registry),
//! );
//! let pool = WorkerPool::start(Arc::clone(&scheduler)).unwrap();
//!
//! let quota = scheduler
//!     .trigger_system_task(ProcessType::QuotaRefresh, "refresh quotas")
//!     .unwrap();
//! let cleanup = scheduler
//!     .submit_registered(ProcessRequest::user(ProcessType::Cleanup, "purge tmp"))
//!     .unwrap();
//!
//! assert!(scheduler.wait_idle(Duration::from_secs(5)));
//! assert_eq!(scheduler.get_process(quota).unwrap().status, ProcessStatus::Completed);
//! assert_eq!(scheduler.get_process(cleanup).unwrap().status, ProcessStatus::Completed);
//! assert_eq!(scheduler.priority_system_info().total_requests_processed, 2);
//!
//! pool.shutdown();
//! ```

mod cancel;
mod config;
mod error;
mod notify;
mod priority;
mod record;
mod scheduler;
mod status;
mod task;
mod worker;

// Re-export public API
pub use cancel::CancellationToken;
pub use config::{
    ConfigFile, SchedulerConfig, ENV_ADMIN_WORKERS, ENV_ALLOW_OVERFLOW, ENV_CANCEL_GRACE_MS,
    ENV_HISTORY_LIMIT, ENV_HISTORY_TTL_MS, ENV_OVERFLOW_RESERVE, ENV_POLL_INTERVAL_MS,
    ENV_USER_WORKERS,
};
pub use error::{AdmissionError, CancelError, ConfigError, TransitionError};
pub use notify::TerminalSink;
pub use priority::{Priority, ProcessId, ProcessType, QueuePair, WorkerTier};
pub use record::{ProcessRecord, ProcessRequest, ProcessStatus};
pub use scheduler::{CancelOutcome, ClaimedProcess, ProcessScheduler, DROPPED_CLAIM_MESSAGE};
pub use status::{PrioritySystemInfo, QueueStatus, SchedulerStats};
pub use task::{task_fn, TaskContext, TaskError, TaskFn, TaskOutput, TaskRegistry, TaskResult};
pub use worker::WorkerPool;
