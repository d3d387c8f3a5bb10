//! Per-session workflow state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Placeholder workflow while only lifecycle workflows apply.
pub const LIFECYCLE_WORKFLOW: &str = "__lifecycle__";

/// Terminal placeholder after a step workflow has ended.
pub const ENDED_WORKFLOW: &str = "__ended__";

/// Variable guarded against silent reassignment.
pub const SESSION_TASK_VARIABLE: &str = "session_task";

/// Observation log capacity; the oldest entries are dropped first.
pub const MAX_OBSERVATIONS: usize = 50;

pub fn is_placeholder_workflow(name: &str) -> bool {
    name == LIFECYCLE_WORKFLOW || name == ENDED_WORKFLOW
}

/// One live row per session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub session_id: String,
    pub workflow_name: String,
    pub step: String,
    pub step_entered_at: DateTime<Utc>,
    pub step_action_count: i64,
    pub total_action_count: i64,
    pub variables: Map<String, Value>,
    pub observations: Vec<Observation>,
    pub reflection_pending: bool,
    pub context_injected: bool,
    pub updated_at: DateTime<Utc>,
}

/// Record of an observer firing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub observer: String,
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    pub at: DateTime<Utc>,
}

impl WorkflowState {
    pub fn new(session_id: &str, workflow_name: &str, step: &str) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.to_string(),
            workflow_name: workflow_name.to_string(),
            step: step.to_string(),
            step_entered_at: now,
            step_action_count: 0,
            total_action_count: 0,
            variables: Map::new(),
            observations: Vec::new(),
            reflection_pending: false,
            context_injected: false,
            updated_at: now,
        }
    }

    /// State for a session that has no step workflow yet.
    pub fn lifecycle(session_id: &str) -> Self {
        Self::new(session_id, LIFECYCLE_WORKFLOW, "")
    }

    pub fn is_placeholder(&self) -> bool {
        is_placeholder_workflow(&self.workflow_name)
    }

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name).filter(|v| !v.is_null())
    }

    pub fn set_variable(&mut self, name: &str, value: Value) {
        self.variables.insert(name.to_string(), value);
    }

    /// Move to `step`, resetting the per-step counter.
    pub fn enter_step(&mut self, step: &str) {
        self.step = step.to_string();
        self.step_entered_at = Utc::now();
        self.step_action_count = 0;
    }

    pub fn record_action(&mut self) {
        self.step_action_count += 1;
        self.total_action_count += 1;
    }

    pub fn record_observation(&mut self, observation: Observation) {
        self.observations.push(observation);
        if self.observations.len() > MAX_OBSERVATIONS {
            let excess = self.observations.len() - MAX_OBSERVATIONS;
            self.observations.drain(..excess);
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
