//! Status snapshots
//!
//! Cheap point-in-time views that the admin layer can poll.

use crate::record::ProcessStatus;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Queue depths and in-flight count
///
/// Sampled under the dispatch lock: every live process is counted in exactly
/// one of the three fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub admin_queue_size: usize,
    pub user_queue_size: usize,
    pub processing_count: usize,
}

impl QueueStatus {
    /// Processes admitted but not yet terminal
    pub fn in_flight(&self) -> usize {
        self.admin_queue_size + self.user_queue_size + self.processing_count
    }
}

/// Pool sizes and lifetime throughput
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PrioritySystemInfo {
    pub admin_workers: usize,
    pub user_workers: usize,
    /// Incremented exactly once per process reaching a terminal state
    pub total_requests_processed: u64,
}

/// Lifetime counters broken down by outcome
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Sum of the three terminal counters
    pub total_processed: u64,
}

impl SchedulerStats {
    /// Admitted processes that have not reached a terminal state
    pub fn outstanding(&self) -> u64 {
        self.submitted.saturating_sub(self.total_processed)
    }
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

impl Counters {
    pub(crate) fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one terminal transition. Callers invoke this only after the
    /// record's state machine accepted the transition.
    pub(crate) fn record_terminal(&self, status: ProcessStatus) {
        let counter = match status {
            ProcessStatus::Completed => &self.completed,
            ProcessStatus::Failed => &self.failed,
            ProcessStatus::Cancelled => &self.cancelled,
            ProcessStatus::Pending | ProcessStatus::Running => return,
        };
        counter.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn snapshot(&self) -> SchedulerStats {
        let completed = self.completed.load(Ordering::Acquire);
        let failed = self.failed.load(Ordering::Acquire);
        let cancelled = self.cancelled.load(Ordering::Acquire);
        SchedulerStats {
            submitted: self.submitted.load(Ordering::Acquire),
            completed,
            failed,
            cancelled,
            total_processed: completed + failed + cancelled,
        }
    }
}
