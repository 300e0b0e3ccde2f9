//! Process records and their lifecycle state machine
//!
//! A record is created at admission in `Pending` and moves through
//! `Running` into exactly one terminal state. Identity fields never change
//! after admission; timestamps are each written once and never rewound.

use crate::error::TransitionError;
use crate::priority::{Priority, ProcessId, ProcessType, WorkerTier};
use crate::task::TaskOutput;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProcessStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ProcessStatus {
    /// `Completed`, `Failed` and `Cancelled` are final
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProcessStatus::Completed | ProcessStatus::Failed | ProcessStatus::Cancelled
        )
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProcessStatus::Pending => "PENDING",
            ProcessStatus::Running => "RUNNING",
            ProcessStatus::Completed => "COMPLETED",
            ProcessStatus::Failed => "FAILED",
            ProcessStatus::Cancelled => "CANCELLED",
        }
    }

    fn can_become(self, next: ProcessStatus) -> bool {
        use ProcessStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a caller asks the scheduler to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRequest {
    pub process_type: ProcessType,
    pub priority: Priority,
    pub description: String,
    pub admin_initiated: bool,
}

impl ProcessRequest {
    /// Provenance defaults to the priority: `High` is treated as admin-initiated.
    pub fn new(process_type: ProcessType, priority: Priority, description: impl Into<String>) -> Self {
        Self {
            process_type,
            priority,
            description: description.into(),
            admin_initiated: priority == Priority::High,
        }
    }

    pub fn admin(process_type: ProcessType, description: impl Into<String>) -> Self {
        Self::new(process_type, Priority::High, description)
    }

    pub fn user(process_type: ProcessType, description: impl Into<String>) -> Self {
        Self::new(process_type, Priority::Normal, description)
    }

    pub fn with_admin_initiated(mut self, admin_initiated: bool) -> Self {
        self.admin_initiated = admin_initiated;
        self
    }
}

/// Snapshot of one process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub process_id: ProcessId,
    pub process_type: ProcessType,
    pub priority: Priority,
    pub description: String,
    pub admin_initiated: bool,
    pub status: ProcessStatus,
    /// Percent complete, 0 to 100
    pub progress: f32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub result: Option<serde_json::Value>,
    pub metadata: Option<serde_json::Value>,
    /// Pool that executed the process; a borrowed user job reports `admin`
    pub worker_tier: Option<WorkerTier>,
    pub cancel_requested: bool,
}

impl ProcessRecord {
    pub(crate) fn admit(request: ProcessRequest, now: DateTime<Utc>) -> Self {
        Self {
            process_id: ProcessId::new(),
            process_type: request.process_type,
            priority: request.priority,
            description: request.description,
            admin_initiated: request.admin_initiated,
            status: ProcessStatus::Pending,
            progress: 0.0,
            created_at: now,
            started_at: None,
            completed_at: None,
            error_message: None,
            result: None,
            metadata: None,
            worker_tier: None,
            cancel_requested: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Wall time between start and completion, if both are set
    pub fn run_time(&self) -> Option<chrono::Duration> {
        Some(self.completed_at? - self.started_at?)
    }

    pub(crate) fn start(&mut self, tier: WorkerTier, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(ProcessStatus::Running)?;
        self.started_at = Some(now.max(self.created_at));
        self.worker_tier = Some(tier);
        Ok(())
    }

    /// Store progress; ignored unless the process is running
    pub(crate) fn set_progress(&mut self, progress: f32) -> bool {
        if self.status != ProcessStatus::Running {
            return false;
        }
        let progress = if progress.is_nan() { 0.0 } else { progress.clamp(0.0, 100.0) };
        self.progress = progress;
        true
    }

    pub(crate) fn complete(&mut self, output: TaskOutput, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(ProcessStatus::Completed)?;
        self.progress = 100.0;
        self.result = output.result;
        self.metadata = output.metadata;
        self.stamp_completion(now);
        Ok(())
    }

    pub(crate) fn fail(&mut self, message: impl Into<String>, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(ProcessStatus::Failed)?;
        let message = message.into();
        self.error_message = Some(if message.trim().is_empty() {
            "task failed without an error message".to_string()
        } else {
            message
        });
        self.stamp_completion(now);
        Ok(())
    }

    pub(crate) fn cancel(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(ProcessStatus::Cancelled)?;
        self.stamp_completion(now);
        Ok(())
    }

    fn transition(&mut self, next: ProcessStatus) -> Result<(), TransitionError> {
        if !self.status.can_become(next) {
            return Err(TransitionError { id: self.process_id, from: self.status, to: next });
        }
        self.status = next;
        Ok(())
    }

    fn stamp_completion(&mut self, now: DateTime<Utc>) {
        let floor = self.started_at.unwrap_or(self.created_at);
        self.completed_at = Some(now.max(floor));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn pending() -> ProcessRecord {
        ProcessRecord::admit(
            ProcessRequest::user(ProcessType::Cleanup, "purge temp files"),
            Utc::now(),
        )
    }

    #[test]
    fn test_admit_defaults() {
        let record = pending();
        assert_eq!(record.status, ProcessStatus::Pending);
        assert_eq!(record.priority, Priority::Normal);
        assert!(!record.admin_initiated);
        assert_eq!(record.progress, 0.0);
        assert!(record.started_at.is_none());
        assert!(record.completed_at.is_none());
        assert!(record.worker_tier.is_none());
    }

    #[test]
    fn test_request_provenance() {
        let admin = ProcessRequest::admin(ProcessType::QuotaRefresh, "refresh all quotas");
        assert!(admin.admin_initiated);
        assert_eq!(admin.priority, Priority::High);

        let escalated = ProcessRequest::user(ProcessType::MassBackup, "backup")
            .with_admin_initiated(true);
        assert!(escalated.admin_initiated);
        assert_eq!(escalated.priority, Priority::Normal);
    }

    #[test]
    fn test_happy_path() {
        let mut record = pending();
        record.start(WorkerTier::User, Utc::now()).unwrap();
        assert_eq!(record.status, ProcessStatus::Running);
        assert_eq!(record.worker_tier, Some(WorkerTier::User));

        assert!(record.set_progress(42.5));
        assert_eq!(record.progress, 42.5);

        record
            .complete(TaskOutput::with_result(json!({"freed": 12})), Utc::now())
            .unwrap();
        assert_eq!(record.status, ProcessStatus::Completed);
        assert_eq!(record.progress, 100.0);
        assert_eq!(record.result, Some(json!({"freed": 12})));
        assert!(record.error_message.is_none());
    }

    #[test]
    fn test_progress_clamped_and_only_while_running() {
        let mut record = pending();
        assert!(!record.set_progress(50.0));
        assert_eq!(record.progress, 0.0);

        record.start(WorkerTier::User, Utc::now()).unwrap();
        record.set_progress(250.0);
        assert_eq!(record.progress, 100.0);
        record.set_progress(-3.0);
        assert_eq!(record.progress, 0.0);
        record.set_progress(f32::NAN);
        assert_eq!(record.progress, 0.0);
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let mut record = pending();
        let err = record.complete(TaskOutput::empty(), Utc::now()).unwrap_err();
        assert_eq!(err.from, ProcessStatus::Pending);
        assert_eq!(err.to, ProcessStatus::Completed);
        assert_eq!(record.status, ProcessStatus::Pending);

        record.cancel(Utc::now()).unwrap();
        let completed_at = record.completed_at;

        assert!(record.start(WorkerTier::Admin, Utc::now()).is_err());
        assert!(record.cancel(Utc::now()).is_err());
        assert!(record.fail("late", Utc::now()).is_err());
        assert_eq!(record.status, ProcessStatus::Cancelled);
        assert_eq!(record.completed_at, completed_at);
        assert!(record.started_at.is_none());
    }

    #[test]
    fn test_fail_always_has_message() {
        let mut record = pending();
        record.start(WorkerTier::User, Utc::now()).unwrap();
        record.fail("  ", Utc::now()).unwrap();
        assert_eq!(record.status, ProcessStatus::Failed);
        assert!(!record.error_message.unwrap().is_empty());
    }

    #[test]
    fn test_timestamps_never_rewind() {
        let mut record = pending();
        let created = record.created_at;

        // Clock stepped backwards between admission and start.
        record.start(WorkerTier::User, created - Duration::seconds(30)).unwrap();
        assert_eq!(record.started_at, Some(created));

        record.fail("boom", created - Duration::seconds(60)).unwrap();
        let started = record.started_at.unwrap();
        let completed = record.completed_at.unwrap();
        assert!(created <= started && started <= completed);
        assert_eq!(record.run_time(), Some(Duration::zero()));
    }

    #[test]
    fn test_status_terminal_set() {
        assert!(!ProcessStatus::Pending.is_terminal());
        assert!(!ProcessStatus::Running.is_terminal());
        assert!(ProcessStatus::Completed.is_terminal());
        assert!(ProcessStatus::Failed.is_terminal());
        assert!(ProcessStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_record_json_shape() {
        let record = pending();
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["status"], "PENDING");
        assert_eq!(value["priority"], "NORMAL");
        assert_eq!(value["process_type"], "cleanup");
        assert_eq!(value["process_id"], record.process_id.to_string());

        let back: ProcessRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, record);
    }
}
