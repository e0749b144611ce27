//! Per-run execution context: the in-memory scratchpad of prior step
//! results. Rebuilt fresh on every run — continuity across pause/resume
//! comes from replaying stored step rows, never from persisting this
//! struct.

use serde_json::Value;
use std::collections::HashMap;

use crate::store::models::Task;

#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub task_id: i64,
    pub user_id: i64,
    pub input_text: String,
    pub steps_executed: u32,
    step_results: HashMap<String, Value>,
}

impl ExecutionContext {
    pub fn new(task_id: i64, user_id: i64, input_text: impl Into<String>) -> Self {
        Self {
            task_id,
            user_id,
            input_text: input_text.into(),
            steps_executed: 0,
            step_results: HashMap::new(),
        }
    }

    pub fn for_task(task: &Task) -> Self {
        Self::new(task.id, task.user_id, task.input_text.clone())
    }

    pub fn record(&mut self, step_id: &str, result: Value) {
        self.step_results.insert(step_id.to_string(), result);
    }

    pub fn step_result(&self, step_id: &str) -> Option<&Value> {
        self.step_results.get(step_id)
    }

    pub fn has_result(&self, step_id: &str) -> bool {
        self.step_results.contains_key(step_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    use crate::store::models::TaskStatus;

    fn task() -> Task {
        let now = Utc::now();
        Task {
            id: 7,
            user_id: 3,
            task_type: "demo".to_string(),
            status: TaskStatus::Running,
            input_text: "topic".to_string(),
            input_data: json!({}),
            result: None,
            error: None,
            locked_by: None,
            locked_at: None,
            lease_expires_at: None,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_record_and_lookup() {
        let mut ctx = ExecutionContext::for_task(&task());
        assert_eq!(ctx.task_id, 7);
        assert_eq!(ctx.user_id, 3);
        assert!(!ctx.has_result("a"));

        ctx.record("a", json!({ "ok": true }));
        assert!(ctx.has_result("a"));
        assert_eq!(ctx.step_result("a"), Some(&json!({ "ok": true })));
    }
}
