//! stepflow — a lease-based task execution engine.
//!
//! Tasks are enqueued, claimed under a time-boxed lease, and run through a
//! plan: a small DAG of steps, each dispatched to one of five handler
//! kinds. Approval steps suspend the task for a human decision; lease
//! expiry plus the reaper provides crash recovery; completed step results
//! are replayed on resume so nothing runs twice.

pub mod config;
pub mod error;
pub mod executor;
pub mod llm;
pub mod manager;
pub mod plan;
pub mod registry;
pub mod store;
pub mod worker;

pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use executor::{ExecutionContext, Executor, RunOutcome, StepExecutor, StepOutcome};
pub use llm::{Completion, CompletionProvider};
pub use manager::TaskManager;
pub use plan::templates::{PlanTemplate, StepTemplate};
pub use plan::{Plan, PlanManager, Step, StepAction, StepStatus};
pub use registry::{Capability, CapabilityRegistry};
pub use store::models::{
    PauseReason, StepRecord, Task, TaskEvent, TaskEventType, TaskStatus,
};
pub use store::TaskStore;
pub use worker::Worker;
