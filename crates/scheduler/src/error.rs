use crate::priority::{ProcessId, ProcessType};
use crate::record::ProcessStatus;

/// Rejected submission. No record is created.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("invalid priority: {0:?} (expected \"high\" or \"normal\")")]
    InvalidPriority(String),
    #[error("unknown process type: {0:?}")]
    UnknownProcessType(String),
    #[error("no task registered for process type {0}")]
    MissingTask(ProcessType),
    #[error("scheduler is shutting down")]
    ShuttingDown,
}

/// Typed failure of a cancel request
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CancelError {
    #[error("process {0} not found")]
    NotFound(ProcessId),
    #[error("process {id} already {status}")]
    AlreadyTerminal { id: ProcessId, status: ProcessStatus },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("process {id}: illegal transition {from} -> {to}")]
pub struct TransitionError {
    pub id: ProcessId,
    pub from: ProcessStatus,
    pub to: ProcessStatus,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed configuration: {0}")]
    Json(#[from] serde_json::Error),
}
