//! Task contract
//!
//! A task is an opaque callable. The scheduler hands it a [`TaskContext`] for
//! progress reporting and cancellation checks and records whatever it returns.

use crate::cancel::CancellationToken;
use crate::priority::{ProcessId, ProcessType};
use crate::scheduler::ProcessEntry;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Outcome returned by a task
pub type TaskResult = Result<TaskOutput, TaskError>;

/// Shared task callable
pub type TaskFn = Arc<dyn Fn(&TaskContext) -> TaskResult + Send + Sync>;

/// Wrap a closure as a [`TaskFn`]
pub fn task_fn<F>(f: F) -> TaskFn
where
    F: Fn(&TaskContext) -> TaskResult + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Payload stored on a completed record
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskOutput {
    pub result: Option<serde_json::Value>,
    pub metadata: Option<serde_json::Value>,
}

impl TaskOutput {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_result(result: serde_json::Value) -> Self {
        Self { result: Some(result), metadata: None }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Why a task did not complete
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// The task observed a cancellation request and stopped early
    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Failed(String),
}

impl TaskError {
    pub fn failed(message: impl fmt::Display) -> Self {
        TaskError::Failed(message.to_string())
    }
}

/// Handle passed to a running task
///
/// `report_progress` doubles as a cancellation checkpoint, so a task written as
///
/// ```
/// use bgproc_scheduler::{TaskContext, TaskOutput, TaskResult};
///
/// fn sweep(ctx: &TaskContext) -> TaskResult {
///     for step in 1..=4 {
///         // ... one unit of work ...
///         ctx.report_progress(step as f32 * 25.0)?;
///     }
///     Ok(TaskOutput::empty())
/// }
/// ```
///
/// stops at the next step once the process is cancelled.
#[derive(Clone)]
pub struct TaskContext {
    process_id: ProcessId,
    process_type: ProcessType,
    entry: Arc<ProcessEntry>,
}

impl TaskContext {
    pub(crate) fn new(process_id: ProcessId, process_type: ProcessType, entry: Arc<ProcessEntry>) -> Self {
        Self { process_id, process_type, entry }
    }

    /// Context backed by a private running record, for exercising a task
    /// outside a scheduler
    pub fn detached(process_type: ProcessType) -> Self {
        let entry = ProcessEntry::detached(process_type);
        let process_id = entry.id();
        Self::new(process_id, process_type, Arc::new(entry))
    }

    pub fn process_id(&self) -> ProcessId {
        self.process_id
    }

    pub fn process_type(&self) -> ProcessType {
        self.process_type
    }

    /// Record progress (percent, clamped to 0..=100)
    ///
    /// Returns `Err(TaskError::Cancelled)` once cancellation was requested; the
    /// progress value is not stored in that case.
    pub fn report_progress(&self, progress: f32) -> Result<(), TaskError> {
        self.checkpoint()?;
        self.entry.lock().record.set_progress(progress);
        Ok(())
    }

    /// Cancellation check without a progress update
    pub fn checkpoint(&self) -> Result<(), TaskError> {
        if self.is_cancelled() {
            Err(TaskError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.entry.token().is_cancelled()
    }

    pub fn token(&self) -> CancellationToken {
        self.entry.token().clone()
    }

    /// Last stored progress value
    pub fn progress(&self) -> f32 {
        self.entry.lock().record.progress
    }
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("process_id", &self.process_id)
            .field("process_type", &self.process_type)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Maps each process type to the task that implements it
///
/// Resolved once at admission by
/// [`ProcessScheduler::submit_registered`](crate::ProcessScheduler::submit_registered).
#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: HashMap<ProcessType, TaskFn>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the task for a process type
    pub fn register<F>(&mut self, process_type: ProcessType, task: F) -> &mut Self
    where
        F: Fn(&TaskContext) -> TaskResult + Send + Sync + 'static,
    {
        self.tasks.insert(process_type, Arc::new(task));
        self
    }

    /// Builder form of [`register`](Self::register)
    pub fn with<F>(mut self, process_type: ProcessType, task: F) -> Self
    where
        F: Fn(&TaskContext) -> TaskResult + Send + Sync + 'static,
    {
        self.register(process_type, task);
        self
    }

    pub fn get(&self, process_type: ProcessType) -> Option<TaskFn> {
        self.tasks.get(&process_type).cloned()
    }

    pub fn contains(&self, process_type: ProcessType) -> bool {
        self.tasks.contains_key(&process_type)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.tasks.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_registry_register_and_get() {
        let mut registry = TaskRegistry::new();
        assert!(registry.is_empty());

        registry.register(ProcessType::Cleanup, |_ctx| Ok(TaskOutput::empty()));
        assert!(registry.contains(ProcessType::Cleanup));
        assert!(!registry.contains(ProcessType::MassBackup));
        assert_eq!(registry.len(), 1);

        let task = registry.get(ProcessType::Cleanup).unwrap();
        let ctx = TaskContext::detached(ProcessType::Cleanup);
        assert_eq!(task(&ctx), Ok(TaskOutput::empty()));
        assert!(registry.get(ProcessType::QuotaRefresh).is_none());
    }

    #[test]
    fn test_registry_replace() {
        let registry = TaskRegistry::new()
            .with(ProcessType::QuotaRefresh, |_ctx| Err(TaskError::failed("old")))
            .with(ProcessType::QuotaRefresh, |_ctx| Ok(TaskOutput::with_result(json!(1))));

        assert_eq!(registry.len(), 1);
        let task = registry.get(ProcessType::QuotaRefresh).unwrap();
        let ctx = TaskContext::detached(ProcessType::QuotaRefresh);
        assert_eq!(task(&ctx).unwrap().result, Some(json!(1)));
    }

    #[test]
    fn test_context_progress_and_cancellation() {
        let ctx = TaskContext::detached(ProcessType::IntegrityCheck);
        assert_eq!(ctx.process_type(), ProcessType::IntegrityCheck);

        ctx.report_progress(30.0).unwrap();
        assert_eq!(ctx.progress(), 30.0);

        ctx.token().cancel();
        assert!(ctx.is_cancelled());
        assert_eq!(ctx.report_progress(60.0), Err(TaskError::Cancelled));
        assert_eq!(ctx.checkpoint(), Err(TaskError::Cancelled));
        assert_eq!(ctx.progress(), 30.0);
    }

    #[test]
    fn test_task_stops_at_next_checkpoint() {
        let task = task_fn(|ctx| {
            for step in 1..=10 {
                if step == 3 {
                    ctx.token().cancel();
                }
                ctx.report_progress(step as f32 * 10.0)?;
            }
            Ok(TaskOutput::empty())
        });

        let ctx = TaskContext::detached(ProcessType::MassBackup);
        assert_eq!(task(&ctx), Err(TaskError::Cancelled));
        assert_eq!(ctx.progress(), 20.0);
    }

    #[test]
    fn test_task_error_display() {
        assert_eq!(TaskError::failed("disk full").to_string(), "disk full");
        assert_eq!(TaskError::Cancelled.to_string(), "cancelled");
    }

    #[test]
    fn test_output_builders() {
        let output = TaskOutput::with_result(json!({"checked": 10}))
            .with_metadata(json!({"host": "a"}));
        assert_eq!(output.result, Some(json!({"checked": 10})));
        assert_eq!(output.metadata, Some(json!({"host": "a"})));
        assert_eq!(TaskOutput::empty().result, None);
    }
}
