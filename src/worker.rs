//! The claim -> execute -> finish loop. Each worker is independent;
//! parallelism exists only across distinct tasks, so running several
//! workers against one store is the whole scaling story.

use chrono::{Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::executor::{Executor, RunOutcome};
use crate::manager::TaskManager;

pub struct Worker {
    id: String,
    manager: TaskManager,
    executor: Arc<Executor>,
    lease_duration: Duration,
    poll_interval: std::time::Duration,
}

impl Worker {
    pub fn new(manager: TaskManager, executor: Arc<Executor>, config: &EngineConfig) -> Self {
        Self {
            id: format!("worker-{}", Uuid::new_v4()),
            manager,
            executor,
            lease_duration: Duration::seconds(config.lease_secs as i64),
            poll_interval: std::time::Duration::from_millis(config.poll_interval_ms),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// One pass: reap expired leases, claim the oldest pending task, run
    /// it. Returns the run outcome, or None when the queue was empty.
    pub async fn run_once(&self) -> Result<Option<RunOutcome>> {
        self.manager.reap(Utc::now()).await?;

        let Some(task) = self.manager.claim(&self.id, self.lease_duration).await? else {
            return Ok(None);
        };

        let outcome = match self.executor.run(&task).await {
            Ok(outcome) => outcome,
            // Plan validation failures already failed the task; the
            // worker moves on to the next one.
            Err(
                e @ (EngineError::UnknownTaskType(_)
                | EngineError::CyclicPlan { .. }
                | EngineError::InvalidPlan { .. }),
            ) => {
                tracing::warn!(task_id = task.id, error = %e, "plan validation failed");
                RunOutcome::Failed(e.to_string())
            }
            Err(e) => return Err(e),
        };
        Ok(Some(outcome))
    }

    /// Poll the queue until cancelled. Store errors end the loop; failed
    /// tasks do not (their terminal state is already recorded).
    pub async fn run(&self) -> Result<()> {
        tracing::info!(worker_id = %self.id, "worker loop starting");
        loop {
            match self.run_once().await? {
                Some(outcome) => {
                    tracing::debug!(worker_id = %self.id, ?outcome, "task run finished");
                }
                None => tokio::time::sleep(self.poll_interval).await,
            }
        }
    }
}
