//! Process scheduler
//!
//! Owns the admin/user queue pair and the process table. Handles admission,
//! the dispatch policy between the two queues, cancellation routing, terminal
//! bookkeeping and status snapshots. Execution itself happens on the
//! [`WorkerPool`](crate::WorkerPool) threads, which pull work through
//! [`ProcessScheduler::wait_for_job`] and hand outcomes back through
//! [`ProcessScheduler::finish`].
//!
//! Locking: the dispatch lock (queues + slot accounting), the table lock and
//! each record's own lock are always taken in that order. No lock is held
//! while a task runs.

use crate::cancel::CancellationToken;
use crate::config::SchedulerConfig;
use crate::error::{AdmissionError, CancelError, ConfigError};
use crate::notify::{Notifier, TerminalSink};
use crate::priority::{Priority, ProcessId, ProcessType, QueuePair, WorkerTier};
use crate::record::{ProcessRecord, ProcessRequest, ProcessStatus};
use crate::status::{Counters, PrioritySystemInfo, QueueStatus, SchedulerStats};
use crate::task::{TaskContext, TaskError, TaskFn, TaskRegistry, TaskResult};
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Lock a mutex, recovering the data if a previous holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Result of a successful cancel request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The process was still queued; it is now `Cancelled` and will never run
    Cancelled,

    /// The process is running; its token was raised and it will be reported
    /// `Cancelled` when the task stops or the grace period runs out
    Requested,
}

pub(crate) struct EntryState {
    pub(crate) record: ProcessRecord,
    cancel_requested_at: Option<Instant>,
}

/// Table entry for one process
pub(crate) struct ProcessEntry {
    id: ProcessId,
    seq: u64,
    task: TaskFn,
    token: CancellationToken,
    state: Mutex<EntryState>,
}

impl ProcessEntry {
    fn new(record: ProcessRecord, task: TaskFn, seq: u64) -> Self {
        Self {
            id: record.process_id,
            seq,
            task,
            token: CancellationToken::new(),
            state: Mutex::new(EntryState { record, cancel_requested_at: None }),
        }
    }

    /// A running entry that belongs to no scheduler
    pub(crate) fn detached(process_type: ProcessType) -> Self {
        let request = ProcessRequest::user(process_type, "detached");
        let mut record = ProcessRecord::admit(request, Utc::now());
        // A freshly admitted record always accepts the start transition.
        let _ = record.start(WorkerTier::User, Utc::now());
        let task: TaskFn = Arc::new(|_ctx: &TaskContext| Err(TaskError::failed("detached")));
        Self::new(record, task, 0)
    }

    pub(crate) fn id(&self) -> ProcessId {
        self.id
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, EntryState> {
        lock(&self.state)
    }
}

/// Outcome recorded for a claim dropped without [`ProcessScheduler::finish`]
pub const DROPPED_CLAIM_MESSAGE: &str = "claim dropped before finish";

/// A process claimed by a worker slot
///
/// Produced by [`ProcessScheduler::next_job`] or
/// [`ProcessScheduler::wait_for_job`] and handed back to
/// [`ProcessScheduler::finish`] to release the slot. Dropping it unfinished
/// releases the slot as well and records the process as `Failed`.
pub struct ClaimedProcess<'a> {
    scheduler: &'a ProcessScheduler,
    armed: bool,
    id: ProcessId,
    process_type: ProcessType,
    priority: Priority,
    tier: WorkerTier,
    task: TaskFn,
    context: TaskContext,
}

impl ClaimedProcess<'_> {
    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn process_type(&self) -> ProcessType {
        self.process_type
    }

    /// Priority the process was admitted with (unchanged when borrowed)
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Pool whose slot is executing the process
    pub fn tier(&self) -> WorkerTier {
        self.tier
    }

    pub fn context(&self) -> &TaskContext {
        &self.context
    }

    /// Invoke the task on the current thread
    pub fn run(&self) -> TaskResult {
        (self.task)(&self.context)
    }
}

impl Drop for ClaimedProcess<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!(process_id = %self.id, "claim dropped before finish");
            self.scheduler
                .release(self.id, self.tier, Err(TaskError::failed(DROPPED_CLAIM_MESSAGE)));
        }
    }
}

impl fmt::Debug for ClaimedProcess<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClaimedProcess")
            .field("id", &self.id)
            .field("process_type", &self.process_type)
            .field("priority", &self.priority)
            .field("tier", &self.tier)
            .finish()
    }
}

#[derive(Debug, Default)]
struct DispatchState {
    queues: QueuePair,
    /// Records currently in `Running`
    running: usize,
    admin_busy: usize,
    user_busy: usize,
}

impl DispatchState {
    fn in_flight(&self) -> usize {
        self.queues.len(WorkerTier::Admin) + self.queues.len(WorkerTier::User) + self.running
    }

    fn busy_mut(&mut self, tier: WorkerTier) -> &mut usize {
        match tier {
            WorkerTier::Admin => &mut self.admin_busy,
            WorkerTier::User => &mut self.user_busy,
        }
    }
}

/// Two-tier process scheduler
///
/// Thread-safe; share it as `Arc<ProcessScheduler>` between the admin layer
/// and a [`WorkerPool`](crate::WorkerPool).
///
/// # Example
///
/// ```
/// use bgproc_scheduler::{
///     task_fn, ProcessRequest, ProcessScheduler, ProcessStatus, ProcessType, SchedulerConfig,
///     TaskOutput, WorkerTier,
/// };
///
/// let scheduler = ProcessScheduler::new(SchedulerConfig::new(1, 1)).unwrap();
///
/// let id = scheduler
///     .submit(
///         ProcessRequest::user(ProcessType::Cleanup, "purge tmp"),
///         task_fn(|ctx| {
///             ctx.report_progress(50.0)?;
///             Ok(TaskOutput::empty())
///         }),
///     )
///     .unwrap();
///
/// // Drive one dispatch cycle by hand.
/// let claimed = scheduler.next_job(WorkerTier::User).unwrap();
/// let outcome = claimed.run();
/// scheduler.finish(claimed, outcome);
///
/// assert_eq!(scheduler.get_process(id).unwrap().status, ProcessStatus::Completed);
/// ```
pub struct ProcessScheduler {
    config: SchedulerConfig,
    registry: TaskRegistry,
    dispatch: Mutex<DispatchState>,
    job_available: Condvar,
    /// Signalled whenever a process leaves the in-flight set
    settled: Condvar,
    table: RwLock<HashMap<ProcessId, Arc<ProcessEntry>>>,
    /// Terminal records in completion order
    history: Mutex<VecDeque<(ProcessId, Instant)>>,
    counters: Counters,
    /// Admission order; only advanced under the dispatch lock
    next_seq: AtomicU64,
    notifier: Option<Notifier>,
    closed: AtomicBool,
}

impl ProcessScheduler {
    pub fn new(config: SchedulerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            registry: TaskRegistry::new(),
            dispatch: Mutex::new(DispatchState::default()),
            job_available: Condvar::new(),
            settled: Condvar::new(),
            table: RwLock::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            counters: Counters::default(),
            next_seq: AtomicU64::new(0),
            notifier: None,
            closed: AtomicBool::new(false),
        })
    }

    /// Attach the task registry used by [`submit_registered`](Self::submit_registered)
    pub fn with_registry(mut self, registry: TaskRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Forward every terminal record to `sink` on a background thread
    pub fn with_sink(mut self, sink: impl TerminalSink) -> std::io::Result<Self> {
        self.notifier = Some(Notifier::spawn(Arc::new(sink))?);
        Ok(self)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    // ----- admission -------------------------------------------------------

    /// Admit a process with an explicit task
    ///
    /// Returns immediately; the process is `Pending` until a worker claims it.
    pub fn submit(&self, request: ProcessRequest, task: TaskFn) -> Result<ProcessId, AdmissionError> {
        if self.is_closed() {
            return Err(AdmissionError::ShuttingDown);
        }

        let record = ProcessRecord::admit(request, Utc::now());
        let id = record.process_id;
        let priority = record.priority;
        let process_type = record.process_type;

        {
            let mut state = lock(&self.dispatch);
            // `close` flips the flag under this lock.
            if self.is_closed() {
                return Err(AdmissionError::ShuttingDown);
            }
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            let entry = Arc::new(ProcessEntry::new(record, task, seq));
            self.table
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(id, entry);
            state.queues.push(priority, id);
        }
        self.counters.record_submitted();
        self.job_available.notify_all();

        info!(process_id = %id, kind = %process_type, %priority, "process admitted");
        Ok(id)
    }

    /// Admit a process whose task comes from the registry
    pub fn submit_registered(&self, request: ProcessRequest) -> Result<ProcessId, AdmissionError> {
        let task = self
            .registry
            .get(request.process_type)
            .ok_or(AdmissionError::MissingTask(request.process_type))?;
        self.submit(request, task)
    }

    /// Admit an administrator maintenance task
    ///
    /// Always `High` priority and admin-initiated, whoever calls it.
    pub fn trigger_system_task(
        &self,
        process_type: ProcessType,
        description: impl Into<String>,
    ) -> Result<ProcessId, AdmissionError> {
        self.submit_registered(ProcessRequest::admin(process_type, description))
    }

    /// Stop admitting new processes and wake every waiting worker
    ///
    /// Queued processes stay `Pending`.
    pub fn close(&self) {
        {
            let _state = lock(&self.dispatch);
            self.closed.store(true, Ordering::Release);
        }
        self.wake_workers();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // ----- dispatch --------------------------------------------------------

    /// Claim the next process for a slot of `tier` without blocking
    ///
    /// Admin slots take the admin queue first. When it is empty they may
    /// borrow from the user queue, as long as `overflow_reserve` admin slots
    /// stay idle afterwards. User slots only ever take the user queue.
    pub fn next_job(&self, tier: WorkerTier) -> Option<ClaimedProcess<'_>> {
        let mut state = lock(&self.dispatch);
        self.claim_locked(&mut state, tier)
    }

    /// Claim the next process, waiting up to `timeout` for one to arrive
    pub fn wait_for_job(&self, tier: WorkerTier, timeout: Duration) -> Option<ClaimedProcess<'_>> {
        let mut state = lock(&self.dispatch);
        if let Some(claimed) = self.claim_locked(&mut state, tier) {
            return Some(claimed);
        }
        if self.is_closed() {
            return None;
        }

        let (mut state, _) = self
            .job_available
            .wait_timeout(state, timeout)
            .unwrap_or_else(PoisonError::into_inner);
        self.claim_locked(&mut state, tier)
    }

    pub(crate) fn wake_workers(&self) {
        self.job_available.notify_all();
    }

    fn claim_locked(
        &self,
        state: &mut DispatchState,
        tier: WorkerTier,
    ) -> Option<ClaimedProcess<'_>> {
        loop {
            let (id, borrowed) = match state.queues.pop(tier) {
                Some(id) => (id, false),
                None if tier == WorkerTier::Admin && self.may_borrow(state) => {
                    (state.queues.pop(WorkerTier::User)?, true)
                }
                None => return None,
            };

            let Some(entry) = self.entry(id) else {
                warn!(process_id = %id, "queued process missing from table");
                continue;
            };

            let mut entry_state = entry.lock();
            if let Err(error) = entry_state.record.start(tier, Utc::now()) {
                debug!(%error, "skipping stale queue entry");
                continue;
            }
            let record = &entry_state.record;
            let claimed = ClaimedProcess {
                scheduler: self,
                armed: true,
                id,
                process_type: record.process_type,
                priority: record.priority,
                tier,
                task: Arc::clone(&entry.task),
                context: TaskContext::new(id, record.process_type, Arc::clone(&entry)),
            };
            drop(entry_state);

            state.running += 1;
            *state.busy_mut(tier) += 1;

            if borrowed {
                debug!(process_id = %id, "admin slot borrowed user process");
            } else {
                debug!(process_id = %id, %tier, "process claimed");
            }
            return Some(claimed);
        }
    }

    fn may_borrow(&self, state: &DispatchState) -> bool {
        self.config.allow_overflow
            && state.queues.len(WorkerTier::User) > 0
            && self.config.admin_workers.saturating_sub(state.admin_busy + 1)
                >= self.config.overflow_reserve
    }

    /// Release the claimed slot and record the task's outcome
    ///
    /// Returns the terminal status that was recorded, or `None` when the
    /// record had already been force-cancelled and the late outcome was
    /// discarded.
    pub fn finish(
        &self,
        mut claimed: ClaimedProcess<'_>,
        outcome: TaskResult,
    ) -> Option<ProcessStatus> {
        claimed.armed = false;
        claimed.scheduler.release(claimed.id, claimed.tier, outcome)
    }

    fn release(
        &self,
        id: ProcessId,
        tier: WorkerTier,
        outcome: TaskResult,
    ) -> Option<ProcessStatus> {
        let settled = {
            let mut state = lock(&self.dispatch);
            let busy = state.busy_mut(tier);
            *busy = busy.saturating_sub(1);

            let entry = self.entry(id);
            let settled = entry.and_then(|entry| {
                let mut entry_state = entry.lock();
                let now = Utc::now();
                let applied = match outcome {
                    Ok(output) => entry_state.record.complete(output, now),
                    Err(TaskError::Failed(message)) => entry_state.record.fail(message, now),
                    Err(TaskError::Cancelled) => entry_state.record.cancel(now),
                };
                match applied {
                    Ok(()) => Some(entry_state.record.clone()),
                    Err(error) => {
                        debug!(%error, "discarding late task outcome");
                        None
                    }
                }
            });
            if let Some(record) = &settled {
                state.running = state.running.saturating_sub(1);
                self.counters.record_terminal(record.status);
            }
            settled
        };

        // A freed admin slot may make a borrow possible again.
        self.wake_workers();
        self.settled.notify_all();

        settled.map(|record| {
            let status = record.status;
            self.settle(record);
            status
        })
    }

    // ----- cancellation ----------------------------------------------------

    /// Cancel a process
    ///
    /// Pending processes are removed from their queue and marked `Cancelled`
    /// at once. Running processes get their token raised; the task is
    /// expected to stop at its next checkpoint. Never waits for the task.
    pub fn cancel(&self, id: ProcessId) -> Result<CancelOutcome, CancelError> {
        let entry = self.entry(id).ok_or(CancelError::NotFound(id))?;

        let record = {
            let mut state = lock(&self.dispatch);
            let mut entry_state = entry.lock();
            match entry_state.record.status {
                ProcessStatus::Pending => {
                    state.queues.remove(id);
                    entry_state
                        .record
                        .cancel(Utc::now())
                        .map_err(|error| CancelError::AlreadyTerminal { id, status: error.from })?;
                    self.counters.record_terminal(ProcessStatus::Cancelled);
                    entry_state.record.clone()
                }
                ProcessStatus::Running => {
                    if entry.token.cancel() {
                        entry_state.cancel_requested_at = Some(Instant::now());
                        entry_state.record.cancel_requested = true;
                        info!(process_id = %id, "cancellation requested");
                    }
                    return Ok(CancelOutcome::Requested);
                }
                status => return Err(CancelError::AlreadyTerminal { id, status }),
            }
        };

        self.settled.notify_all();
        self.settle(record);
        Ok(CancelOutcome::Cancelled)
    }

    /// Mark running processes `Cancelled` once they have ignored a cancel
    /// request for longer than the grace period
    ///
    /// The task keeps running on its worker until it returns; its outcome is
    /// then discarded. Returns the number of processes force-cancelled.
    pub fn enforce_cancel_grace(&self) -> usize {
        let grace = self.config.cancel_grace_period;
        let overdue: Vec<Arc<ProcessEntry>> = self
            .table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|entry| {
                let entry_state = entry.lock();
                entry_state.record.status == ProcessStatus::Running
                    && entry_state
                        .cancel_requested_at
                        .is_some_and(|requested| requested.elapsed() >= grace)
            })
            .cloned()
            .collect();

        let mut forced = 0;
        for entry in overdue {
            let record = {
                let mut state = lock(&self.dispatch);
                let mut entry_state = entry.lock();
                if entry_state.record.cancel(Utc::now()).is_err() {
                    // Finished on its own in the meantime.
                    continue;
                }
                state.running = state.running.saturating_sub(1);
                self.counters.record_terminal(ProcessStatus::Cancelled);
                entry_state.record.clone()
            };
            self.settled.notify_all();
            warn!(
                process_id = %record.process_id,
                grace_ms = grace.as_millis() as u64,
                "task ignored cancellation, marked cancelled"
            );
            self.settle(record);
            forced += 1;
        }
        forced
    }

    // ----- terminal bookkeeping --------------------------------------------

    /// History, logging and sink delivery for a record that just turned
    /// terminal. Counters are bumped by the caller under the dispatch lock.
    fn settle(&self, record: ProcessRecord) {
        lock(&self.history).push_back((record.process_id, Instant::now()));

        match record.status {
            ProcessStatus::Failed => warn!(
                process_id = %record.process_id,
                kind = %record.process_type,
                error = record.error_message.as_deref().unwrap_or_default(),
                "process failed"
            ),
            status => info!(
                process_id = %record.process_id,
                kind = %record.process_type,
                %status,
                "process finished"
            ),
        }

        if let Some(notifier) = &self.notifier {
            notifier.notify(record);
        }
        self.evict_history();
    }

    /// Drop terminal records beyond the configured count cap or age
    ///
    /// Returns the number of records evicted.
    pub fn evict_history(&self) -> usize {
        let mut expired = Vec::new();
        {
            let mut history = lock(&self.history);
            if let Some(limit) = self.config.history_limit {
                while history.len() > limit {
                    if let Some((id, _)) = history.pop_front() {
                        expired.push(id);
                    }
                }
            }
            if let Some(ttl) = self.config.history_ttl {
                while history.front().is_some_and(|(_, at)| at.elapsed() >= ttl) {
                    if let Some((id, _)) = history.pop_front() {
                        expired.push(id);
                    }
                }
            }
        }

        if !expired.is_empty() {
            let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
            for id in &expired {
                table.remove(id);
            }
            debug!(count = expired.len(), "evicted terminal records");
        }
        expired.len()
    }

    // ----- status ----------------------------------------------------------

    /// Queue depths and the number of running processes
    pub fn queue_status(&self) -> QueueStatus {
        let state = lock(&self.dispatch);
        QueueStatus {
            admin_queue_size: state.queues.len(WorkerTier::Admin),
            user_queue_size: state.queues.len(WorkerTier::User),
            processing_count: state.running,
        }
    }

    /// Pending and running processes, in admission order
    pub fn active_processes(&self) -> Vec<ProcessRecord> {
        let mut active: Vec<(u64, ProcessRecord)> = self
            .table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter_map(|entry| {
                let entry_state = entry.lock();
                entry_state
                    .record
                    .status
                    .is_active()
                    .then(|| (entry.seq, entry_state.record.clone()))
            })
            .collect();
        active.sort_by_key(|(seq, _)| *seq);
        active.into_iter().map(|(_, record)| record).collect()
    }

    pub fn priority_system_info(&self) -> PrioritySystemInfo {
        PrioritySystemInfo {
            admin_workers: self.config.admin_workers,
            user_workers: self.config.user_workers,
            total_requests_processed: self.counters.snapshot().total_processed,
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        self.counters.snapshot()
    }

    /// Snapshot of one process, until its record is evicted
    pub fn get_process(&self, id: ProcessId) -> Option<ProcessRecord> {
        self.entry(id).map(|entry| entry.lock().record.clone())
    }

    /// Most recently finished processes, newest first
    pub fn recent_processes(&self, limit: usize) -> Vec<ProcessRecord> {
        let ids: Vec<ProcessId> =
            lock(&self.history).iter().rev().take(limit).map(|(id, _)| *id).collect();
        ids.into_iter().filter_map(|id| self.get_process(id)).collect()
    }

    /// Block until both queues are empty and nothing is running
    ///
    /// Returns `false` if `timeout` elapsed first.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let state = lock(&self.dispatch);
        let (state, _) = self
            .settled
            .wait_timeout_while(state, timeout, |state| state.in_flight() > 0)
            .unwrap_or_else(PoisonError::into_inner);
        state.in_flight() == 0
    }

    fn entry(&self, id: ProcessId) -> Option<Arc<ProcessEntry>> {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }
}

impl fmt::Debug for ProcessScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessScheduler")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("queue_status", &self.queue_status())
            .field("closed", &self.is_closed())
            .finish()
    }
}
