use anyhow::Result;
use async_trait::async_trait;
use chrono::Duration;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use stepflow::{
    Capability, CapabilityRegistry, EngineError, Executor, PlanManager, PlanTemplate, RunOutcome,
    StepAction, StepExecutor, StepTemplate, Task, TaskManager, TaskStatus, TaskStore,
};

async fn engine_with(
    plans: PlanManager,
    registry: CapabilityRegistry,
) -> Result<(TaskManager, Executor)> {
    let store = Arc::new(TaskStore::in_memory().await?);
    let manager = TaskManager::new(store);
    let steps = StepExecutor::new(manager.clone(), Arc::new(registry));
    let executor = Executor::new(manager.clone(), plans, steps);
    Ok((manager, executor))
}

fn template(task_type: &str, steps: Vec<StepTemplate>) -> PlanManager {
    let mut plans = PlanManager::empty();
    plans.register(PlanTemplate {
        task_type: task_type.to_string(),
        steps,
    });
    plans
}

fn step(id: &str, action: StepAction, action_data: Value, deps: &[&str]) -> StepTemplate {
    StepTemplate {
        step_id: id.to_string(),
        action,
        action_data,
        depends_on: deps.iter().map(|s| s.to_string()).collect(),
    }
}

async fn claimed(manager: &TaskManager, task_type: &str, input: &str) -> Result<Task> {
    manager.enqueue(1, task_type, input, json!({})).await?;
    Ok(manager
        .claim("test-worker", Duration::seconds(60))
        .await?
        .expect("task should be claimable"))
}

struct Counting {
    name: &'static str,
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl Capability for Counting {
    fn name(&self) -> &str {
        self.name
    }

    fn declared_parameters(&self) -> &[&str] {
        &["text", "query"]
    }

    async fn invoke(&self, args: Map<String, Value>) -> anyhow::Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({
            "parsed": args.get("text").cloned().unwrap_or(Value::Null),
        }))
    }
}

struct Sink;

#[async_trait]
impl Capability for Sink {
    fn name(&self) -> &str {
        "sink"
    }

    fn declared_parameters(&self) -> &[&str] {
        &["source"]
    }

    async fn invoke(&self, args: Map<String, Value>) -> anyhow::Result<Value> {
        Ok(json!({
            "stored": args.get("source").cloned().unwrap_or(Value::Null),
        }))
    }
}

struct Broken;

#[async_trait]
impl Capability for Broken {
    fn name(&self) -> &str {
        "broken"
    }

    fn declared_parameters(&self) -> &[&str] {
        &["query"]
    }

    async fn invoke(&self, _args: Map<String, Value>) -> anyhow::Result<Value> {
        anyhow::bail!("upstream unavailable")
    }
}

#[tokio::test]
async fn test_linear_chain_runs_to_completion() -> Result<()> {
    let plans = template(
        "chain",
        vec![
            step("a", StepAction::ToolCall, json!({ "tool": "fetch" }), &[]),
            step("b", StepAction::ToolCall, json!({ "tool": "clean" }), &["a"]),
            step(
                "c",
                StepAction::Aggregate,
                json!({ "step_ids": ["a", "b"] }),
                &["a", "b"],
            ),
        ],
    );
    let (manager, executor) = engine_with(plans, CapabilityRegistry::new()).await?;
    let task = claimed(&manager, "chain", "material").await?;

    let outcome = executor.run(&task).await?;
    let RunOutcome::Completed(result) = outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!(result["steps_executed"], json!(3));
    assert_eq!(result["output"]["count"], json!(2));

    let done = manager.get_task(task.id).await?.expect("task exists");
    assert_eq!(done.status, TaskStatus::Completed);

    let records = manager.store().load_steps(task.id).await?;
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.status == "completed"));

    Ok(())
}

#[tokio::test]
async fn test_unregistered_tool_yields_placeholder() -> Result<()> {
    let plans = template(
        "solo",
        vec![step(
            "only",
            StepAction::ToolCall,
            json!({ "tool": "not_installed" }),
            &[],
        )],
    );
    let (manager, executor) = engine_with(plans, CapabilityRegistry::new()).await?;
    let task = claimed(&manager, "solo", "x").await?;

    let outcome = executor.run(&task).await?;
    let RunOutcome::Completed(result) = outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!(
        result["output"],
        json!({ "tool": "not_installed", "result": "placeholder" })
    );

    Ok(())
}

#[tokio::test]
async fn test_tool_error_is_captured_not_fatal() -> Result<()> {
    let plans = template(
        "fragile",
        vec![
            step(
                "fetch",
                StepAction::ToolCall,
                json!({ "tool": "broken", "query": "{input}" }),
                &[],
            ),
            step(
                "check",
                StepAction::Condition,
                json!({ "condition": "ok(fetch)" }),
                &["fetch"],
            ),
        ],
    );
    let mut registry = CapabilityRegistry::new();
    registry.register(Arc::new(Broken));
    let (manager, executor) = engine_with(plans, registry).await?;
    let task = claimed(&manager, "fragile", "x").await?;

    // The handler error becomes an error-bearing result; the run keeps
    // going and the condition step observes it.
    let outcome = executor.run(&task).await?;
    let RunOutcome::Completed(result) = outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!(result["output"]["branch"], json!("false"));

    let records = manager.store().load_steps(task.id).await?;
    let fetch = records
        .iter()
        .find(|r| r.step_id == "fetch")
        .expect("fetch row persisted");
    assert_eq!(fetch.status, "completed");
    assert_eq!(
        fetch.result.as_ref().and_then(|r| r["error"].as_str()),
        Some("upstream unavailable")
    );

    Ok(())
}

#[tokio::test]
async fn test_tool_args_are_filtered_to_declared() -> Result<()> {
    let plans = template(
        "filtered",
        vec![step(
            "call",
            StepAction::ToolCall,
            json!({ "tool": "counting", "text": "{input}", "routing_hint": "ignore-me" }),
            &[],
        )],
    );
    let calls = Arc::new(AtomicU32::new(0));
    let mut registry = CapabilityRegistry::new();
    registry.register(Arc::new(Counting {
        name: "counting",
        calls: calls.clone(),
    }));
    let (manager, executor) = engine_with(plans, registry).await?;
    let task = claimed(&manager, "filtered", "payload").await?;

    let outcome = executor.run(&task).await?;
    let RunOutcome::Completed(result) = outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(result["output"]["parsed"], json!("payload"));
    assert_eq!(result["output"]["tool"], json!("counting"));

    Ok(())
}

#[tokio::test]
async fn test_source_step_id_injects_upstream_result() -> Result<()> {
    let plans = template(
        "pipeline",
        vec![
            step("fetch", StepAction::ToolCall, json!({ "tool": "fetcher" }), &[]),
            step(
                "persist",
                StepAction::ToolCall,
                json!({ "tool": "sink", "source_step_id": "fetch" }),
                &["fetch"],
            ),
        ],
    );
    let mut registry = CapabilityRegistry::new();
    registry.register(Arc::new(Sink));
    let (manager, executor) = engine_with(plans, registry).await?;
    let task = claimed(&manager, "pipeline", "x").await?;

    let outcome = executor.run(&task).await?;
    let RunOutcome::Completed(result) = outcome else {
        panic!("expected completion, got {outcome:?}");
    };

    // The sink receives fetch's whole result under `source`.
    assert_eq!(
        result["output"]["stored"],
        json!({ "tool": "fetcher", "result": "placeholder" })
    );
    assert_eq!(result["output"]["tool"], json!("sink"));

    Ok(())
}

#[tokio::test]
async fn test_malformed_condition_fails_task() -> Result<()> {
    let plans = template(
        "bad",
        vec![step(
            "cond",
            StepAction::Condition,
            json!({ "condition": "whenever" }),
            &[],
        )],
    );
    let (manager, executor) = engine_with(plans, CapabilityRegistry::new()).await?;
    let task = claimed(&manager, "bad", "x").await?;

    let outcome = executor.run(&task).await?;
    assert!(matches!(outcome, RunOutcome::Failed(_)));

    let failed = manager.get_task(task.id).await?.expect("task exists");
    assert_eq!(failed.status, TaskStatus::Failed);
    assert!(failed.error.is_some());

    let records = manager.store().load_steps(task.id).await?;
    assert_eq!(records[0].status, "failed");

    Ok(())
}

#[tokio::test]
async fn test_llm_step_falls_back_to_mock_without_provider() -> Result<()> {
    let plans = template(
        "analyze-lite",
        vec![step(
            "style",
            StepAction::LlmCall,
            json!({ "purpose": "analyze_style", "input_text": "{input}" }),
            &[],
        )],
    );
    let (manager, executor) = engine_with(plans, CapabilityRegistry::new()).await?;
    let task = claimed(&manager, "analyze-lite", "@channel").await?;

    let outcome = executor.run(&task).await?;
    let RunOutcome::Completed(result) = outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!(result["output"]["model"], json!("mock"));
    assert_eq!(
        result["output"]["response"],
        json!("Style analysis of: @channel")
    );

    Ok(())
}

#[tokio::test]
async fn test_approval_pauses_task_with_inspectable_payload() -> Result<()> {
    let (manager, executor) = engine_with(PlanManager::new(), CapabilityRegistry::new()).await?;
    let task = claimed(&manager, "demo", "hello world").await?;

    let outcome = executor.run(&task).await?;
    let RunOutcome::Paused { payload } = outcome else {
        panic!("expected pause, got {outcome:?}");
    };
    assert_eq!(payload["step_id"], json!("approve"));
    assert_eq!(payload["draft_content"]["tool"], json!("parse"));

    let paused = manager.get_task(task.id).await?.expect("task exists");
    assert_eq!(paused.status, TaskStatus::Paused);

    // Only the parse step is durably recorded; the gate itself stays
    // pending for the next run.
    let records = manager.store().load_steps(task.id).await?;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].step_id, "parse");

    Ok(())
}

#[tokio::test]
async fn test_resume_replays_completed_steps() -> Result<()> {
    let calls = Arc::new(AtomicU32::new(0));
    let mut registry = CapabilityRegistry::new();
    registry.register(Arc::new(Counting {
        name: "parse",
        calls: calls.clone(),
    }));
    let (manager, executor) = engine_with(PlanManager::new(), registry).await?;
    let task = claimed(&manager, "demo", "hello").await?;

    assert!(matches!(
        executor.run(&task).await?,
        RunOutcome::Paused { .. }
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // A plain resume carries no decision, so the gate pauses again --
    // but parse is replayed from its stored row, not re-invoked.
    manager.resume(task.id).await?;
    let task = manager
        .claim("test-worker", Duration::seconds(60))
        .await?
        .expect("resumed task should be claimable");

    assert!(matches!(
        executor.run(&task).await?,
        RunOutcome::Paused { .. }
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    Ok(())
}

#[tokio::test]
async fn test_approving_resume_completes_the_gate() -> Result<()> {
    let (manager, executor) = engine_with(PlanManager::new(), CapabilityRegistry::new()).await?;
    let task = claimed(&manager, "demo", "hello").await?;

    assert!(matches!(
        executor.run(&task).await?,
        RunOutcome::Paused { .. }
    ));

    manager
        .resume_with(task.id, json!({ "approved": true, "approver": "ops" }))
        .await?;
    let task = manager
        .claim("test-worker", Duration::seconds(60))
        .await?
        .expect("resumed task should be claimable");

    let outcome = executor.run(&task).await?;
    let RunOutcome::Completed(result) = outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!(result["steps_executed"], json!(2));
    assert_eq!(result["output"]["approved"], json!(true));
    assert_eq!(result["output"]["decision"]["approver"], json!("ops"));

    let done = manager.get_task(task.id).await?.expect("task exists");
    assert_eq!(done.status, TaskStatus::Completed);

    Ok(())
}

#[tokio::test]
async fn test_run_requires_running_task() -> Result<()> {
    let (manager, executor) = engine_with(PlanManager::new(), CapabilityRegistry::new()).await?;
    let task = manager.enqueue(1, "demo", "x", json!({})).await?;

    let err = executor.run(&task).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::OrderingViolation {
            actual: TaskStatus::Pending,
            ..
        }
    ));

    Ok(())
}

#[tokio::test]
async fn test_unknown_task_type_fails_before_any_step() -> Result<()> {
    let (manager, executor) = engine_with(PlanManager::new(), CapabilityRegistry::new()).await?;
    let task = claimed(&manager, "no-such-plan", "x").await?;

    let err = executor.run(&task).await.unwrap_err();
    assert!(matches!(err, EngineError::UnknownTaskType(_)));

    let failed = manager.get_task(task.id).await?.expect("task exists");
    assert_eq!(failed.status, TaskStatus::Failed);
    assert!(manager.store().load_steps(task.id).await?.is_empty());

    Ok(())
}
