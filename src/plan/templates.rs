//! Plan templates: the external configuration that maps a task type to a
//! step graph. Templates are plain data (serde-friendly), so embedders can
//! load them from files or build them in code and register them on the
//! `PlanManager`.
//!
//! Placeholder binding: inside `action_data`, the string `"{input}"`
//! expands to the task's `input_text`, and `"{input_data.<key>}"` to the
//! named field of `input_data`. A string consisting of exactly one
//! placeholder is replaced by the referenced value itself (preserving
//! non-string types); otherwise placeholders are spliced in textually.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{Step, StepAction};

/// One step of a template, before placeholder binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepTemplate {
    pub step_id: String,
    pub action: StepAction,
    #[serde(default)]
    pub action_data: Value,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// A named step graph for one task type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanTemplate {
    pub task_type: String,
    pub steps: Vec<StepTemplate>,
}

impl PlanTemplate {
    /// Bind placeholders against a task's input, producing concrete steps
    /// in declaration order.
    pub fn bind(&self, input_text: &str, input_data: &Value) -> Vec<Step> {
        self.steps
            .iter()
            .map(|t| {
                Step::new(
                    t.step_id.clone(),
                    t.action,
                    bind_value(&t.action_data, input_text, input_data),
                )
                .with_dependencies(t.depends_on.clone())
            })
            .collect()
    }
}

fn bind_value(value: &Value, input_text: &str, input_data: &Value) -> Value {
    match value {
        Value::String(s) => bind_string(s, input_text, input_data),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| bind_value(v, input_text, input_data))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), bind_value(v, input_text, input_data)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn bind_string(s: &str, input_text: &str, input_data: &Value) -> Value {
    // Whole-string placeholders keep the referenced value's type.
    if s == "{input}" {
        return Value::String(input_text.to_string());
    }
    if let Some(key) = s
        .strip_prefix("{input_data.")
        .and_then(|rest| rest.strip_suffix('}'))
    {
        if !key.contains('{') {
            return input_data.get(key).cloned().unwrap_or(Value::Null);
        }
    }

    // Otherwise splice placeholders into the text.
    let mut out = s.replace("{input}", input_text);
    if let Some(map) = input_data.as_object() {
        for (key, val) in map {
            let marker = format!("{{input_data.{key}}}");
            if out.contains(&marker) {
                let text = match val {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                out = out.replace(&marker, &text);
            }
        }
    }
    Value::String(out)
}

/// The built-in template library.
///
/// `demo` is the minimal approval-gated plan; `analyze` and `generate` are
/// the content-agent plans this engine grew up around: analyze a source
/// channel and remember its style, then generate a draft and hold it at an
/// approval gate until a human decides.
pub fn builtin() -> Vec<PlanTemplate> {
    vec![
        PlanTemplate {
            task_type: "demo".to_string(),
            steps: vec![
                StepTemplate {
                    step_id: "parse".to_string(),
                    action: StepAction::ToolCall,
                    action_data: json!({
                        "tool": "parse",
                        "text": "{input}",
                    }),
                    depends_on: vec![],
                },
                StepTemplate {
                    step_id: "approve".to_string(),
                    action: StepAction::Approval,
                    action_data: json!({
                        "message": "Approve result of parse?",
                        "draft_step_id": "parse",
                    }),
                    depends_on: vec!["parse".to_string()],
                },
            ],
        },
        PlanTemplate {
            task_type: "analyze".to_string(),
            steps: vec![
                StepTemplate {
                    step_id: "parse_channel".to_string(),
                    action: StepAction::ToolCall,
                    action_data: json!({
                        "tool": "parse_channel",
                        "channel": "{input}",
                        "limit": 20,
                    }),
                    depends_on: vec![],
                },
                StepTemplate {
                    step_id: "analyze_style".to_string(),
                    action: StepAction::LlmCall,
                    action_data: json!({
                        "purpose": "analyze_style",
                        "input_text": "{input}",
                    }),
                    depends_on: vec!["parse_channel".to_string()],
                },
                StepTemplate {
                    step_id: "store_analysis".to_string(),
                    action: StepAction::ToolCall,
                    action_data: json!({
                        "tool": "memory_store",
                        "source_step_id": "analyze_style",
                        "channel": "{input}",
                    }),
                    depends_on: vec!["analyze_style".to_string()],
                },
            ],
        },
        PlanTemplate {
            task_type: "generate".to_string(),
            steps: vec![
                StepTemplate {
                    step_id: "recall".to_string(),
                    action: StepAction::ToolCall,
                    action_data: json!({
                        "tool": "memory_search",
                        "query": "{input}",
                    }),
                    depends_on: vec![],
                },
                StepTemplate {
                    step_id: "research".to_string(),
                    action: StepAction::ToolCall,
                    action_data: json!({
                        "tool": "web_search",
                        "query": "{input}",
                    }),
                    depends_on: vec![],
                },
                StepTemplate {
                    step_id: "draft".to_string(),
                    action: StepAction::LlmCall,
                    action_data: json!({
                        "purpose": "generate_draft",
                        "input_text": "{input}",
                        "context": "{input_data.context}",
                    }),
                    depends_on: vec!["recall".to_string(), "research".to_string()],
                },
                StepTemplate {
                    step_id: "approve_draft".to_string(),
                    action: StepAction::Approval,
                    action_data: json!({
                        "message": "Approve generated draft?",
                        "draft_step_id": "draft",
                    }),
                    depends_on: vec!["draft".to_string()],
                },
            ],
        },
    ]
}
