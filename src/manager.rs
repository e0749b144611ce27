//! Task lifecycle management.
//!
//! The TaskManager is the only component that mutates task rows. Every
//! transition is a single-row compare-and-swap keyed on the expected prior
//! status; a transition that finds the task in any other status is an
//! `OrderingViolation`. Lease expiry plus `reap` is the sole retry
//! mechanism — there is no bounded-attempt counter, callers needing
//! max-retry semantics encode attempt counts in `input_data`.

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::{EngineError, Result};
use crate::store::models::{PauseReason, Task, TaskEvent, TaskEventType};
use crate::store::TaskStore;

#[derive(Clone)]
pub struct TaskManager {
    store: Arc<TaskStore>,
}

impl TaskManager {
    pub fn new(store: Arc<TaskStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    /// Create a pending task. Fails only if persistence is unavailable.
    pub async fn enqueue(
        &self,
        user_id: i64,
        task_type: &str,
        input_text: &str,
        input_data: Value,
    ) -> Result<Task> {
        let task = self
            .store
            .insert_task(user_id, task_type, input_text, &input_data)
            .await?;

        self.store
            .append_event(task.id, TaskEventType::Created, &json!({ "task_type": task_type }))
            .await?;

        tracing::info!(task_id = task.id, task_type, "task enqueued");
        Ok(task)
    }

    /// Atomically claim the oldest pending task for `worker_id`, moving it
    /// to running with a lease. Returns None when the queue is empty.
    pub async fn claim(&self, worker_id: &str, lease_duration: Duration) -> Result<Option<Task>> {
        let now = Utc::now();
        let claimed = self
            .store
            .claim_oldest_pending(worker_id, lease_duration, now)
            .await?;

        if let Some(task) = &claimed {
            self.store
                .append_event(
                    task.id,
                    TaskEventType::Started,
                    &json!({ "worker_id": worker_id }),
                )
                .await?;
            tracing::info!(
                task_id = task.id,
                worker_id,
                lease_secs = lease_duration.num_seconds(),
                "task claimed"
            );
        }

        Ok(claimed)
    }

    /// Revert running tasks with expired leases to pending, making them
    /// claimable again. Returns the number of tasks reaped.
    pub async fn reap(&self, now: DateTime<Utc>) -> Result<u64> {
        let reaped = self.store.release_expired_leases(now).await?;
        if reaped > 0 {
            tracing::warn!(reaped, "reaped tasks with expired leases");
        }
        Ok(reaped)
    }

    /// running -> paused, recording the reason and an inspection payload
    /// (e.g. draft content) in the event log for the approver.
    pub async fn pause(&self, task_id: i64, reason: PauseReason, data: Value) -> Result<()> {
        if !self.store.mark_paused(task_id).await? {
            return Err(self.ordering_violation(task_id, "pause", "running").await?);
        }

        let mut event_data = json!({ "reason": reason.as_str() });
        merge_object(&mut event_data, data);
        self.store
            .append_event(task_id, TaskEventType::Paused, &event_data)
            .await?;

        tracing::info!(task_id, reason = reason.as_str(), "task paused");
        Ok(())
    }

    /// paused -> pending. The next claim re-runs the plan from the first
    /// unexecuted step.
    pub async fn resume(&self, task_id: i64) -> Result<()> {
        self.resume_with(task_id, json!({})).await
    }

    /// Resume carrying a decision payload in the resumed event. An
    /// approval step re-entered after a resume whose payload has
    /// `"approved": true` completes instead of pausing again.
    pub async fn resume_with(&self, task_id: i64, data: Value) -> Result<()> {
        if !self.store.mark_resumed(task_id).await? {
            return Err(self.ordering_violation(task_id, "resume", "paused").await?);
        }

        self.store
            .append_event(task_id, TaskEventType::Resumed, &data)
            .await?;

        tracing::info!(task_id, "task resumed");
        Ok(())
    }

    /// running -> completed with a result payload.
    pub async fn succeed(&self, task_id: i64, result: Value) -> Result<()> {
        if !self.store.mark_completed(task_id, &result).await? {
            return Err(self.ordering_violation(task_id, "succeed", "running").await?);
        }

        self.store
            .append_event(task_id, TaskEventType::Succeeded, &json!({ "result": result }))
            .await?;

        tracing::info!(task_id, "task completed");
        Ok(())
    }

    /// running or paused -> failed with a human-readable error string.
    pub async fn fail(&self, task_id: i64, error: &str) -> Result<()> {
        if !self.store.mark_failed(task_id, error).await? {
            return Err(self
                .ordering_violation(task_id, "fail", "running or paused")
                .await?);
        }

        self.store
            .append_event(task_id, TaskEventType::Failed, &json!({ "error": error }))
            .await?;

        tracing::warn!(task_id, error, "task failed");
        Ok(())
    }

    pub async fn get_task(&self, task_id: i64) -> Result<Option<Task>> {
        self.store.get_task(task_id).await
    }

    /// The append-only event log for a task, oldest first. Pause payloads
    /// (approval drafts and the like) are recovered from here.
    pub async fn events(&self, task_id: i64) -> Result<Vec<TaskEvent>> {
        self.store.list_events(task_id).await
    }

    /// Build the error for a compare-and-swap that matched no row: either
    /// the task does not exist or it was in the wrong status.
    async fn ordering_violation(
        &self,
        task_id: i64,
        op: &'static str,
        expected: &'static str,
    ) -> Result<EngineError> {
        let actual = match self.store.get_task(task_id).await? {
            Some(task) => task.status,
            None => return Ok(EngineError::TaskNotFound { task_id }),
        };
        Ok(EngineError::OrderingViolation {
            task_id,
            op,
            expected,
            actual,
        })
    }
}

/// Shallow-merge `extra`'s keys into `base` (both JSON objects).
fn merge_object(base: &mut Value, extra: Value) {
    if let (Some(base_map), Value::Object(extra_map)) = (base.as_object_mut(), extra) {
        for (k, v) in extra_map {
            base_map.insert(k, v);
        }
    }
}
