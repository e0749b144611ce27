//! Step dispatch: routes one step to the handler for its action kind and
//! enforces the handler contract.
//!
//! Failure tolerance is deliberate and uneven: LLM_CALL and TOOL_CALL
//! capture handler errors into error-bearing results (a later CONDITION
//! step may route on them), APPROVAL always suspends the task, and
//! everything else fails the run. Suspension is an explicit `Paused`
//! outcome, not an unwind — callers cannot forget to handle it.

use chrono::Utc;
use serde_json::{json, Map, Value};
use std::sync::Arc;

use crate::error::Result;
use crate::executor::context::ExecutionContext;
use crate::llm::CompletionProvider;
use crate::manager::TaskManager;
use crate::plan::{Step, StepAction, StepStatus};
use crate::registry::CapabilityRegistry;
use crate::store::models::{PauseReason, TaskEventType};

/// Three-way result of dispatching one step.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    Completed(Value),
    Paused { reason: PauseReason, payload: Value },
    Failed(String),
}

pub struct StepExecutor {
    manager: TaskManager,
    registry: Arc<CapabilityRegistry>,
    provider: Option<Arc<dyn CompletionProvider>>,
}

impl StepExecutor {
    pub fn new(manager: TaskManager, registry: Arc<CapabilityRegistry>) -> Self {
        Self {
            manager,
            registry,
            provider: None,
        }
    }

    /// Attach a completion provider. Without one, LLM_CALL steps return
    /// deterministic mock completions (useful in tests and dry runs).
    pub fn with_provider(mut self, provider: Arc<dyn CompletionProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Execute one step against the shared context, updating the step's
    /// in-memory state. Only store/ordering failures surface as `Err`.
    pub async fn execute(
        &self,
        step: &mut Step,
        ctx: &mut ExecutionContext,
    ) -> Result<StepOutcome> {
        step.status = StepStatus::Running;
        step.started_at = Some(Utc::now());
        tracing::debug!(
            task_id = ctx.task_id,
            step_id = %step.step_id,
            action = %step.action,
            "dispatching step"
        );

        let outcome = match step.action {
            StepAction::LlmCall => StepOutcome::Completed(self.handle_llm_call(step, ctx).await),
            StepAction::ToolCall => StepOutcome::Completed(self.handle_tool_call(step, ctx).await),
            StepAction::Approval => self.handle_approval(step, ctx).await?,
            StepAction::Condition => match self.handle_condition(step, ctx) {
                Ok(value) => StepOutcome::Completed(value),
                Err(message) => StepOutcome::Failed(message),
            },
            StepAction::Aggregate => StepOutcome::Completed(self.handle_aggregate(step, ctx)),
        };

        match &outcome {
            StepOutcome::Completed(result) => {
                step.status = StepStatus::Completed;
                step.result = Some(result.clone());
                step.completed_at = Some(Utc::now());
                ctx.record(&step.step_id, result.clone());
                ctx.steps_executed += 1;
            }
            StepOutcome::Paused { .. } => {
                // Approval handlers must be idempotent: the step reverts to
                // pending and is re-invoked wholesale on resume.
                step.status = StepStatus::Pending;
                step.started_at = None;
            }
            StepOutcome::Failed(message) => {
                step.status = StepStatus::Failed;
                step.error = Some(message.clone());
                step.completed_at = Some(Utc::now());
            }
        }

        Ok(outcome)
    }

    // ==================== handlers ====================

    /// Delegate to the completion provider. Provider errors are captured
    /// into an error-bearing result, never propagated.
    async fn handle_llm_call(&self, step: &Step, ctx: &ExecutionContext) -> Value {
        let purpose = step.action_data["purpose"].as_str().unwrap_or("general");
        let input_text = step.action_data["input_text"]
            .as_str()
            .unwrap_or(&ctx.input_text);

        let system_prompt = step.action_data["system_prompt"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| default_system_prompt(purpose).to_string());
        let user_prompt = self.build_user_prompt(step, ctx, input_text);

        let Some(provider) = &self.provider else {
            tracing::debug!(purpose, "no completion provider, returning mock");
            return json!({
                "purpose": purpose,
                "response": mock_completion(purpose, input_text),
                "model": "mock",
                "tokens_used": 0,
            });
        };

        match provider
            .complete(&system_prompt, &user_prompt, ctx.user_id, ctx.task_id)
            .await
        {
            Ok(completion) => {
                tracing::info!(
                    task_id = ctx.task_id,
                    purpose,
                    tokens = completion.total_tokens,
                    "llm call completed"
                );
                json!({
                    "purpose": purpose,
                    "response": completion.content,
                    "model": completion.model,
                    "tokens_used": completion.total_tokens,
                })
            }
            Err(e) => {
                tracing::warn!(task_id = ctx.task_id, purpose, error = %e, "llm call failed");
                json!({ "purpose": purpose, "error": e.to_string() })
            }
        }
    }

    fn build_user_prompt(&self, step: &Step, ctx: &ExecutionContext, input_text: &str) -> String {
        let mut prompt = match step.action_data["prompt"].as_str() {
            Some(template) => template.to_string(),
            None => input_text.to_string(),
        };

        // Results of dependency steps ride along as context.
        let mut context_blocks = Vec::new();
        for dep_id in &step.depends_on {
            if let Some(result) = ctx.step_result(dep_id) {
                context_blocks.push(format!("[{dep_id}]\n{result}"));
            }
        }
        if !context_blocks.is_empty() {
            prompt.push_str("\n\nContext from earlier steps:\n");
            prompt.push_str(&context_blocks.join("\n\n"));
        }

        prompt
    }

    /// Look up the named capability. Unregistered tools yield a
    /// deterministic placeholder (plans stay robust during incremental
    /// rollout); handler errors are captured into the result.
    async fn handle_tool_call(&self, step: &Step, ctx: &ExecutionContext) -> Value {
        let tool = step.action_data["tool"].as_str().unwrap_or("unknown");

        let mut args: Map<String, Value> = step
            .action_data
            .as_object()
            .map(|m| {
                m.iter()
                    .filter(|(k, _)| k.as_str() != "tool" && k.as_str() != "source_step_id")
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default();

        args.entry("user_id".to_string())
            .or_insert_with(|| json!(ctx.user_id));

        // source_step_id wires a prior step's result into the call.
        if let Some(source_id) = step.action_data["source_step_id"].as_str() {
            if let Some(source) = ctx.step_result(source_id) {
                args.insert("source".to_string(), source.clone());
            }
        }

        let Some(capability) = self.registry.get(tool) else {
            tracing::debug!(task_id = ctx.task_id, tool, "tool not registered, placeholder result");
            return json!({ "tool": tool, "result": "placeholder" });
        };

        let filtered = CapabilityRegistry::filter_args(capability.as_ref(), args);
        match capability.invoke(filtered).await {
            Ok(Value::Object(mut map)) => {
                map.insert("tool".to_string(), json!(tool));
                Value::Object(map)
            }
            Ok(other) => json!({ "tool": tool, "output": other }),
            Err(e) => {
                tracing::warn!(task_id = ctx.task_id, tool, error = %e, "tool call failed");
                json!({ "tool": tool, "error": e.to_string() })
            }
        }
    }

    /// Suspends on first encounter: records the pause on the task, then
    /// unwinds the run with an explicit Paused outcome. The pause payload
    /// carries the step id and, when `draft_step_id` names a prior step,
    /// its output for the approver to inspect. On re-entry after a resume
    /// whose payload granted approval, the gate completes instead.
    async fn handle_approval(
        &self,
        step: &Step,
        ctx: &ExecutionContext,
    ) -> Result<StepOutcome> {
        if let Some(decision) = self.granted_approval(ctx.task_id, &step.step_id).await? {
            tracing::info!(
                task_id = ctx.task_id,
                step_id = %step.step_id,
                "approval granted on resume"
            );
            return Ok(StepOutcome::Completed(json!({
                "step_id": step.step_id,
                "approved": true,
                "decision": decision,
            })));
        }

        let message = step.action_data["message"]
            .as_str()
            .unwrap_or("Approval required");

        let draft_content = step.action_data["draft_step_id"]
            .as_str()
            .and_then(|id| ctx.step_result(id))
            .map(|result| match result.get("response") {
                Some(Value::String(text)) => json!(text),
                _ => result.clone(),
            })
            .unwrap_or(Value::Null);

        let payload = json!({
            "step_id": step.step_id,
            "message": message,
            "draft_content": draft_content,
        });

        self.manager
            .pause(ctx.task_id, PauseReason::Approval, payload.clone())
            .await?;

        Ok(StepOutcome::Paused {
            reason: PauseReason::Approval,
            payload,
        })
    }

    /// Scan the event log for a resume granting this gate. Only resumes
    /// recorded after the step's own latest pause count, so a stale grant
    /// never approves a later re-pause.
    async fn granted_approval(&self, task_id: i64, step_id: &str) -> Result<Option<Value>> {
        let events = self.manager.events(task_id).await?;
        let Some(pause_idx) = events.iter().rposition(|e| {
            e.event_type == TaskEventType::Paused
                && e.event_data["step_id"].as_str() == Some(step_id)
        }) else {
            return Ok(None);
        };

        for event in &events[pause_idx + 1..] {
            if event.event_type == TaskEventType::Resumed
                && event.event_data["approved"] == json!(true)
            {
                return Ok(Some(event.event_data.clone()));
            }
        }
        Ok(None)
    }

    /// Evaluate a boolean expression over the context. The grammar is
    /// closed: `true`, `false`, `has(step_id)`, `ok(step_id)`, with `!`
    /// negation. A malformed expression fails the step.
    fn handle_condition(
        &self,
        step: &Step,
        ctx: &ExecutionContext,
    ) -> std::result::Result<Value, String> {
        let expr = step.action_data["condition"].as_str().unwrap_or("true");
        let result = eval_condition(expr, ctx)?;

        Ok(json!({
            "condition": expr,
            "result": result,
            "branch": if result { "true" } else { "false" },
        }))
    }

    /// Collect named prior steps' results into one payload. Pure; missing
    /// inputs are simply omitted.
    fn handle_aggregate(&self, step: &Step, ctx: &ExecutionContext) -> Value {
        let step_ids: Vec<&str> = step.action_data["step_ids"]
            .as_array()
            .map(|ids| ids.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        let mut aggregated = Map::new();
        for id in step_ids {
            if let Some(result) = ctx.step_result(id) {
                aggregated.insert(id.to_string(), result.clone());
            }
        }

        json!({ "count": aggregated.len(), "aggregated": aggregated })
    }
}

fn eval_condition(expr: &str, ctx: &ExecutionContext) -> std::result::Result<bool, String> {
    let trimmed = expr.trim();
    if let Some(inner) = trimmed.strip_prefix('!') {
        return eval_condition(inner, ctx).map(|b| !b);
    }

    if trimmed == "true" {
        return Ok(true);
    }
    if trimmed == "false" {
        return Ok(false);
    }

    if let Some(step_id) = call_arg(trimmed, "has") {
        return Ok(ctx.has_result(step_id));
    }
    if let Some(step_id) = call_arg(trimmed, "ok") {
        return Ok(ctx
            .step_result(step_id)
            .map(|r| r.get("error").is_none())
            .unwrap_or(false));
    }

    Err(format!("unrecognized condition expression '{expr}'"))
}

fn call_arg<'a>(expr: &'a str, func: &str) -> Option<&'a str> {
    expr.strip_prefix(func)?
        .strip_prefix('(')?
        .strip_suffix(')')
        .map(str::trim)
}

fn default_system_prompt(purpose: &str) -> &'static str {
    match purpose {
        "analyze_style" => "You are a content analyst. Break down the style of posts for a copywriter.",
        "generate_draft" => "You are a copywriter. Write channel posts in the client's voice.",
        "research" => "You are a researcher. Analyze the material and surface what matters.",
        _ => "You are a helpful assistant.",
    }
}

fn mock_completion(purpose: &str, input_text: &str) -> String {
    match purpose {
        "analyze_style" => format!("Style analysis of: {input_text}"),
        "generate_draft" => format!("Draft post about: {input_text}"),
        "research" => format!("Research notes on: {input_text}"),
        _ => format!("Mock response for {purpose}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_with(results: &[(&str, Value)]) -> ExecutionContext {
        let mut ctx = ExecutionContext::new(1, 1, "topic");
        for (id, value) in results {
            ctx.record(id, value.clone());
        }
        ctx
    }

    #[test]
    fn test_eval_condition_literals() {
        let ctx = ctx_with(&[]);
        assert!(eval_condition("true", &ctx).unwrap());
        assert!(!eval_condition("false", &ctx).unwrap());
        assert!(!eval_condition("!true", &ctx).unwrap());
    }

    #[test]
    fn test_eval_condition_has() {
        let ctx = ctx_with(&[("a", json!({ "x": 1 }))]);
        assert!(eval_condition("has(a)", &ctx).unwrap());
        assert!(!eval_condition("has(b)", &ctx).unwrap());
        assert!(eval_condition("!has(b)", &ctx).unwrap());
    }

    #[test]
    fn test_eval_condition_ok_detects_error_results() {
        let ctx = ctx_with(&[
            ("good", json!({ "response": "fine" })),
            ("bad", json!({ "error": "boom" })),
        ]);
        assert!(eval_condition("ok(good)", &ctx).unwrap());
        assert!(!eval_condition("ok(bad)", &ctx).unwrap());
        assert!(!eval_condition("ok(missing)", &ctx).unwrap());
    }

    #[test]
    fn test_eval_condition_rejects_garbage() {
        let ctx = ctx_with(&[]);
        assert!(eval_condition("maybe", &ctx).is_err());
        assert!(eval_condition("has a", &ctx).is_err());
    }
}
