//! Top-level run loop for one claimed task.
//!
//! loading -> selecting -> dispatching -> finished. The executor resolves
//! the plan, replays stored step results into a fresh context, then walks
//! ready steps in dependency order, one at a time. Outcomes map onto task
//! manager calls: full completion succeeds the task, a pause signal stops
//! the run with the task already paused, anything else fails fast — no
//! partial continuation.

pub mod context;
pub mod step;

pub use context::ExecutionContext;
pub use step::{StepExecutor, StepOutcome};

use serde_json::{json, Value};

use crate::error::{EngineError, Result};
use crate::manager::TaskManager;
use crate::plan::{Plan, PlanManager, Step, StepStatus};
use crate::store::models::{StepRecord, Task, TaskStatus};

/// Terminal outcome of one executor run.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// Every step completed; the task has been succeeded.
    Completed(Value),
    /// An approval gate suspended the run; the task is paused and the
    /// payload is what the approver sees.
    Paused { payload: Value },
    /// A step failed; the task has been failed with this error.
    Failed(String),
}

pub struct Executor {
    manager: TaskManager,
    plans: PlanManager,
    steps: StepExecutor,
}

impl Executor {
    pub fn new(manager: TaskManager, plans: PlanManager, steps: StepExecutor) -> Self {
        Self {
            manager,
            plans,
            steps,
        }
    }

    /// Run a claimed (running) task to its next stopping point. Exactly
    /// one of succeed/fail is invoked here, unless a handler already
    /// recorded a pause.
    pub async fn run(&self, task: &Task) -> Result<RunOutcome> {
        if task.status != TaskStatus::Running {
            return Err(EngineError::OrderingViolation {
                task_id: task.id,
                op: "run",
                expected: "running",
                actual: task.status,
            });
        }

        // loading: resolve the plan. Validation failures are fatal before
        // any step runs.
        let mut plan = match self
            .plans
            .resolve(&task.task_type, &task.input_text, &task.input_data)
        {
            Ok(plan) => plan,
            Err(e) => {
                self.manager.fail(task.id, &e.to_string()).await?;
                return Err(e);
            }
        };

        let mut ctx = ExecutionContext::for_task(task);
        self.hydrate(task.id, &mut plan, &mut ctx).await?;

        tracing::info!(
            task_id = task.id,
            task_type = %task.task_type,
            total_steps = plan.steps.len(),
            replayed = ctx.steps_executed,
            "executor run starting"
        );

        loop {
            // selecting
            let Some(i) = plan.next_ready() else {
                if plan.is_complete() {
                    let result = json!({
                        "steps_executed": ctx.steps_executed,
                        "output": plan.steps.last().and_then(|s| s.result.clone()),
                    });
                    self.manager.succeed(task.id, result.clone()).await?;
                    return Ok(RunOutcome::Completed(result));
                }

                let message = "plan stuck: no runnable steps remain".to_string();
                self.manager.fail(task.id, &message).await?;
                return Ok(RunOutcome::Failed(message));
            };

            // dispatching
            let outcome = self.steps.execute(&mut plan.steps[i], &mut ctx).await?;
            match outcome {
                StepOutcome::Completed(_) => {
                    self.persist_step(task.id, &plan.steps[i]).await?;
                }
                StepOutcome::Paused { payload, .. } => {
                    // The step stays pending; a future resume re-invokes it.
                    tracing::info!(
                        task_id = task.id,
                        step_id = %plan.steps[i].step_id,
                        "run suspended for approval"
                    );
                    return Ok(RunOutcome::Paused { payload });
                }
                StepOutcome::Failed(message) => {
                    self.persist_step(task.id, &plan.steps[i]).await?;
                    self.manager.fail(task.id, &message).await?;
                    return Ok(RunOutcome::Failed(message));
                }
            }
        }
    }

    /// Replay completed step rows into the plan and context so resumed
    /// runs skip finished work. Rows for steps the current template no
    /// longer names are ignored.
    async fn hydrate(&self, task_id: i64, plan: &mut Plan, ctx: &mut ExecutionContext) -> Result<()> {
        let records = self.manager.store().load_steps(task_id).await?;
        for record in records {
            if record.status != StepStatus::Completed.as_str() {
                continue;
            }
            let Some(step) = plan
                .steps
                .iter_mut()
                .find(|s| s.step_id == record.step_id)
            else {
                continue;
            };

            step.status = StepStatus::Completed;
            step.result = record.result.clone();
            step.started_at = record.started_at;
            step.completed_at = record.completed_at;
            if let Some(result) = record.result {
                ctx.record(&record.step_id, result);
            }
            ctx.steps_executed += 1;
        }
        Ok(())
    }

    async fn persist_step(&self, task_id: i64, step: &Step) -> Result<()> {
        self.manager
            .store()
            .upsert_step(&StepRecord {
                task_id,
                step_id: step.step_id.clone(),
                status: step.status.as_str().to_string(),
                result: step.result.clone(),
                error: step.error.clone(),
                started_at: step.started_at,
                completed_at: step.completed_at,
            })
            .await
    }
}
