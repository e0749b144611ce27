//! Plan resolution: task type + input -> a concrete DAG of steps.
//!
//! Plans are never persisted independently; they are deterministically
//! derived from `(task_type, input_text, input_data)` so that re-running a
//! resumed task always produces the same step sequence. The manager binds
//! template placeholders, validates the dependency graph, and emits steps
//! in a deterministic topological order (ties broken by declaration
//! order).

pub mod templates;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use crate::error::{EngineError, Result};
use templates::PlanTemplate;

/// The five step kinds. A closed vocabulary with exhaustive dispatch —
/// not an open registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    LlmCall,
    ToolCall,
    Approval,
    Condition,
    Aggregate,
}

impl StepAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepAction::LlmCall => "llm_call",
            StepAction::ToolCall => "tool_call",
            StepAction::Approval => "approval",
            StepAction::Condition => "condition",
            StepAction::Aggregate => "aggregate",
        }
    }
}

impl fmt::Display for StepAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-run state of a step. There is no "paused" terminal: a step whose
/// handler signals an approval pause reverts to pending, pausing is a
/// task-level concept only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(StepStatus::Pending),
            "running" => Some(StepStatus::Running),
            "completed" => Some(StepStatus::Completed),
            "failed" => Some(StepStatus::Failed),
            _ => None,
        }
    }
}

/// One action within a plan, bound to one of the five step kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Unique within the plan.
    pub step_id: String,
    pub action: StepAction,
    /// Concrete handler parameters, placeholders already bound.
    pub action_data: Value,
    pub depends_on: Vec<String>,
    pub status: StepStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Step {
    pub fn new(step_id: impl Into<String>, action: StepAction, action_data: Value) -> Self {
        Self {
            step_id: step_id.into(),
            action,
            action_data,
            depends_on: Vec::new(),
            status: StepStatus::Pending,
            result: None,
            error: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.depends_on = deps;
        self
    }
}

/// The DAG of steps resolved for a task, stored in execution order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub task_type: String,
    /// Steps in deterministic topological order.
    pub steps: Vec<Step>,
}

impl Plan {
    /// Whether every dependency of `step` is completed.
    pub fn dependencies_met(&self, step: &Step) -> bool {
        step.depends_on.iter().all(|dep_id| {
            self.steps
                .iter()
                .find(|s| &s.step_id == dep_id)
                .map(|s| s.status == StepStatus::Completed)
                .unwrap_or(false)
        })
    }

    /// The next pending step whose dependencies are all completed.
    pub fn next_ready(&self) -> Option<usize> {
        self.steps
            .iter()
            .position(|s| s.status == StepStatus::Pending && self.dependencies_met(s))
    }

    pub fn is_complete(&self) -> bool {
        self.steps.iter().all(|s| s.status == StepStatus::Completed)
    }
}

/// Resolves task types into concrete plans from registered templates.
pub struct PlanManager {
    templates: HashMap<String, PlanTemplate>,
}

impl PlanManager {
    /// A manager pre-loaded with the built-in template library.
    pub fn new() -> Self {
        let mut manager = Self {
            templates: HashMap::new(),
        };
        for template in templates::builtin() {
            manager.register(template);
        }
        manager
    }

    /// A manager with no templates. Embedders register their own.
    pub fn empty() -> Self {
        Self {
            templates: HashMap::new(),
        }
    }

    pub fn register(&mut self, template: PlanTemplate) {
        self.templates.insert(template.task_type.clone(), template);
    }

    /// Resolve a task type and input into a concrete plan: bind template
    /// placeholders, validate the graph, order steps deterministically.
    pub fn resolve(&self, task_type: &str, input_text: &str, input_data: &Value) -> Result<Plan> {
        let template = self
            .templates
            .get(task_type)
            .ok_or_else(|| EngineError::UnknownTaskType(task_type.to_string()))?;

        let steps = template.bind(input_text, input_data);
        self.validate(task_type, &steps)?;
        let ordered = self.topological_order(task_type, steps)?;

        Ok(Plan {
            task_type: task_type.to_string(),
            steps: ordered,
        })
    }

    fn validate(&self, task_type: &str, steps: &[Step]) -> Result<()> {
        if steps.is_empty() {
            return Err(EngineError::InvalidPlan {
                task_type: task_type.to_string(),
                message: "template has no steps".to_string(),
            });
        }

        let mut seen = HashSet::new();
        for step in steps {
            if !seen.insert(step.step_id.as_str()) {
                return Err(EngineError::InvalidPlan {
                    task_type: task_type.to_string(),
                    message: format!("duplicate step id '{}'", step.step_id),
                });
            }
        }

        for step in steps {
            for dep in &step.depends_on {
                if !seen.contains(dep.as_str()) {
                    return Err(EngineError::InvalidPlan {
                        task_type: task_type.to_string(),
                        message: format!(
                            "step '{}' depends on unknown step '{}'",
                            step.step_id, dep
                        ),
                    });
                }
                if dep == &step.step_id {
                    return Err(EngineError::CyclicPlan {
                        task_type: task_type.to_string(),
                        step_id: step.step_id.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Kahn's algorithm with a FIFO ready queue seeded in declaration
    /// order, so identical inputs always execute steps in the same
    /// sequence. A cycle leaves steps unordered and is rejected.
    fn topological_order(&self, task_type: &str, steps: Vec<Step>) -> Result<Vec<Step>> {
        let index: HashMap<&str, usize> = steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.step_id.as_str(), i))
            .collect();

        let mut in_degree = vec![0usize; steps.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
        for (i, step) in steps.iter().enumerate() {
            for dep in &step.depends_on {
                let d = index[dep.as_str()];
                in_degree[i] += 1;
                dependents[d].push(i);
            }
        }

        let mut ready: VecDeque<usize> = (0..steps.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(steps.len());
        while let Some(i) = ready.pop_front() {
            order.push(i);
            for &j in &dependents[i] {
                in_degree[j] -= 1;
                if in_degree[j] == 0 {
                    ready.push_back(j);
                }
            }
        }

        if order.len() != steps.len() {
            let stuck = in_degree
                .iter()
                .position(|&d| d > 0)
                .expect("cycle implies a step with unresolved dependencies");
            return Err(EngineError::CyclicPlan {
                task_type: task_type.to_string(),
                step_id: steps[stuck].step_id.clone(),
            });
        }

        let mut slots: Vec<Option<Step>> = steps.into_iter().map(Some).collect();
        Ok(order
            .into_iter()
            .map(|i| slots[i].take().expect("each index appears once"))
            .collect())
    }
}

impl Default for PlanManager {
    fn default() -> Self {
        Self::new()
    }
}
