use thiserror::Error;

use crate::store::models::TaskStatus;

/// Errors surfaced by the engine itself.
///
/// Handler failures (a tool or completion provider returning an error) are
/// deliberately absent: those are captured into error-bearing step results
/// and never escalate to this taxonomy.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The row store is unavailable or a query failed.
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("task {task_id} not found")]
    TaskNotFound { task_id: i64 },

    /// A lifecycle call was made against a task in the wrong status.
    /// This signals a caller bug and is never silently ignored.
    #[error("task {task_id}: cannot {op} while '{actual}' (expected {expected})")]
    OrderingViolation {
        task_id: i64,
        op: &'static str,
        expected: &'static str,
        actual: TaskStatus,
    },

    #[error("no plan template registered for task type '{0}'")]
    UnknownTaskType(String),

    /// The dependency graph of a plan template is cyclic.
    #[error("plan '{task_type}': dependency cycle involving step '{step_id}'")]
    CyclicPlan { task_type: String, step_id: String },

    #[error("plan '{task_type}': {message}")]
    InvalidPlan { task_type: String, message: String },

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
