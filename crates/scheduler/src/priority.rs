//! Priority tiers and the admin/user queue pair
//!
//! Processes are split into two independent FIFO queues. The admin queue holds
//! `High` priority work and the user queue holds `Normal` priority work. There is
//! no ordering between the two queues; which queue an idle worker pulls from is
//! decided by the dispatch policy in the scheduler.

use crate::error::AdmissionError;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique process identifier, assigned at admission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(Uuid);

impl ProcessId {
    /// Allocate a fresh random identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ProcessId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ProcessId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Process priority
///
/// `High` is reserved for administrator-initiated work and is drained by the
/// dedicated admin pool. `Normal` covers bulk user workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    /// Admin-initiated work (admin queue)
    High,

    /// User-initiated work (user queue)
    Normal,
}

impl Priority {
    /// The queue tier a process of this priority is admitted to
    pub fn tier(self) -> WorkerTier {
        match self {
            Priority::High => WorkerTier::Admin,
            Priority::Normal => WorkerTier::User,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::High => "HIGH",
            Priority::Normal => "NORMAL",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = AdmissionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" | "admin" => Ok(Priority::High),
            "normal" | "user" => Ok(Priority::Normal),
            _ => Err(AdmissionError::InvalidPriority(s.to_string())),
        }
    }
}

/// Kind of background process; selects the task that runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessType {
    /// Recalculate storage quota usage
    QuotaRefresh,

    /// Back up many accounts at once
    MassBackup,

    /// Remove expired or orphaned data
    Cleanup,

    /// Verify stored file checksums
    IntegrityCheck,
}

impl ProcessType {
    pub const ALL: [ProcessType; 4] = [
        ProcessType::QuotaRefresh,
        ProcessType::MassBackup,
        ProcessType::Cleanup,
        ProcessType::IntegrityCheck,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProcessType::QuotaRefresh => "quota_refresh",
            ProcessType::MassBackup => "mass_backup",
            ProcessType::Cleanup => "cleanup",
            ProcessType::IntegrityCheck => "integrity_check",
        }
    }
}

impl fmt::Display for ProcessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessType {
    type Err = AdmissionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        ProcessType::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(name))
            .ok_or_else(|| AdmissionError::UnknownProcessType(s.to_string()))
    }
}

/// Worker pool tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerTier {
    Admin,
    User,
}

impl WorkerTier {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerTier::Admin => "admin",
            WorkerTier::User => "user",
        }
    }
}

impl fmt::Display for WorkerTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The admin and user FIFO queues
///
/// Holds process ids only; the records themselves live in the scheduler's
/// table. Not synchronized on its own: the scheduler keeps it behind the
/// dispatch lock together with worker slot accounting.
#[derive(Debug, Default)]
pub struct QueuePair {
    admin: VecDeque<ProcessId>,
    user: VecDeque<ProcessId>,
}

impl QueuePair {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a process to the back of the queue matching its priority
    pub fn push(&mut self, priority: Priority, id: ProcessId) {
        self.queue_mut(priority.tier()).push_back(id);
    }

    /// Take the oldest process from one queue
    pub fn pop(&mut self, tier: WorkerTier) -> Option<ProcessId> {
        self.queue_mut(tier).pop_front()
    }

    /// Remove a specific process from whichever queue holds it
    ///
    /// Returns `true` if the process was queued.
    pub fn remove(&mut self, id: ProcessId) -> bool {
        for queue in [&mut self.admin, &mut self.user] {
            if let Some(pos) = queue.iter().position(|queued| *queued == id) {
                queue.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn len(&self, tier: WorkerTier) -> usize {
        match tier {
            WorkerTier::Admin => self.admin.len(),
            WorkerTier::User => self.user.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.admin.is_empty() && self.user.is_empty()
    }

    fn queue_mut(&mut self, tier: WorkerTier) -> &mut VecDeque<ProcessId> {
        match tier {
            WorkerTier::Admin => &mut self.admin,
            WorkerTier::User => &mut self.user,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_maps_to_tier() {
        assert_eq!(Priority::High.tier(), WorkerTier::Admin);
        assert_eq!(Priority::Normal.tier(), WorkerTier::User);
    }

    #[test]
    fn test_priority_parse() {
        assert_eq!("high".parse::<Priority>().unwrap(), Priority::High);
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        assert_eq!("admin".parse::<Priority>().unwrap(), Priority::High);
        assert_eq!(" normal ".parse::<Priority>().unwrap(), Priority::Normal);
        assert_eq!("user".parse::<Priority>().unwrap(), Priority::Normal);

        let err = "urgent".parse::<Priority>().unwrap_err();
        assert!(matches!(err, AdmissionError::InvalidPriority(ref s) if s == "urgent"));
    }

    #[test]
    fn test_priority_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&Priority::High).unwrap(), "\"HIGH\"");
        assert_eq!(serde_json::to_string(&Priority::Normal).unwrap(), "\"NORMAL\"");
    }

    #[test]
    fn test_process_type_parse() {
        for kind in ProcessType::ALL {
            assert_eq!(kind.as_str().parse::<ProcessType>().unwrap(), kind);
        }
        assert_eq!("Mass_Backup".parse::<ProcessType>().unwrap(), ProcessType::MassBackup);
        assert!(matches!(
            "defrag".parse::<ProcessType>(),
            Err(AdmissionError::UnknownProcessType(_))
        ));
    }

    #[test]
    fn test_process_type_serde_matches_display() {
        for kind in ProcessType::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind));
        }
    }

    #[test]
    fn test_process_id_unique_and_parseable() {
        let a = ProcessId::new();
        let b = ProcessId::new();
        assert_ne!(a, b);

        let parsed: ProcessId = a.to_string().parse().unwrap();
        assert_eq!(parsed, a);
        assert!("not-a-uuid".parse::<ProcessId>().is_err());
    }

    #[test]
    fn test_queue_pair_fifo_per_tier() {
        let mut queues = QueuePair::new();
        let ids: Vec<ProcessId> = (0..3).map(|_| ProcessId::new()).collect();
        let admin = ProcessId::new();

        for id in &ids {
            queues.push(Priority::Normal, *id);
        }
        queues.push(Priority::High, admin);

        assert_eq!(queues.len(WorkerTier::User), 3);
        assert_eq!(queues.len(WorkerTier::Admin), 1);

        assert_eq!(queues.pop(WorkerTier::Admin), Some(admin));
        assert_eq!(queues.pop(WorkerTier::Admin), None);

        for id in &ids {
            assert_eq!(queues.pop(WorkerTier::User), Some(*id));
        }
        assert!(queues.is_empty());
    }

    #[test]
    fn test_queue_pair_remove() {
        let mut queues = QueuePair::new();
        let first = ProcessId::new();
        let second = ProcessId::new();
        let third = ProcessId::new();
        queues.push(Priority::Normal, first);
        queues.push(Priority::Normal, second);
        queues.push(Priority::Normal, third);

        assert!(queues.remove(second));
        assert!(!queues.remove(second));
        assert!(!queues.remove(ProcessId::new()));

        assert_eq!(queues.pop(WorkerTier::User), Some(first));
        assert_eq!(queues.pop(WorkerTier::User), Some(third));
    }
}
