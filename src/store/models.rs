use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "running" => Some(TaskStatus::Running),
            "paused" => Some(TaskStatus::Paused),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    /// Completed and failed tasks are never reclaimable.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work progressing enqueue -> claim -> run -> terminal state.
///
/// Invariants maintained by the store layer:
/// - lock fields (`locked_by`, `locked_at`, `lease_expires_at`) are non-null
///   iff the task is running
/// - `result` is non-null iff completed; `error` is non-null iff failed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub user_id: i64,
    pub task_type: String,
    pub status: TaskStatus,
    pub input_text: String,
    /// Opaque structured payload supplied at enqueue time.
    pub input_data: Value,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Why a task was paused mid-plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PauseReason {
    /// A human decision is required before the plan can continue.
    Approval,
}

impl PauseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PauseReason::Approval => "approval",
        }
    }
}

/// Kind of entry in the append-only task event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskEventType {
    Created,
    Started,
    Paused,
    Resumed,
    Succeeded,
    Failed,
}

impl TaskEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskEventType::Created => "created",
            TaskEventType::Started => "started",
            TaskEventType::Paused => "paused",
            TaskEventType::Resumed => "resumed",
            TaskEventType::Succeeded => "succeeded",
            TaskEventType::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(TaskEventType::Created),
            "started" => Some(TaskEventType::Started),
            "paused" => Some(TaskEventType::Paused),
            "resumed" => Some(TaskEventType::Resumed),
            "succeeded" => Some(TaskEventType::Succeeded),
            "failed" => Some(TaskEventType::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for TaskEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only record of what happened to a task. Pause payloads live here,
/// and recovery reads this log to learn "what happened last".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    pub id: i64,
    pub task_id: i64,
    pub event_type: TaskEventType,
    pub event_data: Value,
    pub created_at: DateTime<Utc>,
}

/// Durable state of one plan step for one task. Written only by the lease
/// holder; completed rows are the replay source on resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub task_id: i64,
    pub step_id: String,
    pub status: String,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Paused,
            TaskStatus::Completed,
            TaskStatus::Failed,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TaskStatus::parse("bogus"), None);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(!TaskStatus::Paused.is_terminal());
    }

    #[test]
    fn test_event_type_round_trip() {
        for kind in [
            TaskEventType::Created,
            TaskEventType::Started,
            TaskEventType::Paused,
            TaskEventType::Resumed,
            TaskEventType::Succeeded,
            TaskEventType::Failed,
        ] {
            assert_eq!(TaskEventType::parse(kind.as_str()), Some(kind));
        }
    }
}
