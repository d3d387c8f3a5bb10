//! Declarative workflow definitions
//!
//! ```yaml
//! name: plan-and-build
//! type: task
//! steps:
//!   - name: plan
//!     transitions:
//!       - to: build
//!         when: variables.plan_approved
//!   - name: build
//!     blocked_tools: [Write]
//! observers:
//!   - name: count-edits
//!     on: after_tool
//!     match: { tool: Edit }
//!     set: { edits: "{{ (variables.edits or 0) + 1 }}" }
//! ```

use crate::errors::{DefinitionError, DefinitionResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// Workflow category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowType {
    /// Always-on rules applied to every session
    Lifecycle,
    /// Step workflow attached to a unit of work
    Task,
    #[default]
    Adhoc,
}

impl fmt::Display for WorkflowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowType::Lifecycle => write!(f, "lifecycle"),
            WorkflowType::Task => write!(f, "task"),
            WorkflowType::Adhoc => write!(f, "adhoc"),
        }
    }
}

fn default_priority() -> i64 {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,

    #[serde(rename = "type", default)]
    pub workflow_type: WorkflowType,

    /// Lifecycle ordering, lower runs first
    #[serde(default = "default_priority")]
    pub priority: i64,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub steps: Vec<StepDefinition>,

    /// Keyed by trigger name, e.g. `on_session_start`
    #[serde(default)]
    pub triggers: BTreeMap<String, Vec<TriggerAction>>,

    #[serde(default)]
    pub observers: Vec<Observer>,

    /// Initial variables applied on activation
    #[serde(default)]
    pub variables: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub transitions: Vec<Transition>,

    #[serde(default)]
    pub on_enter: Vec<TriggerAction>,

    #[serde(default)]
    pub blocked_tools: Vec<String>,
}

/// An edge out of a step. A transition with `when` is automatic only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub to: String,

    #[serde(default)]
    pub when: Option<String>,
}

/// A single action inside a trigger list or `on_enter` block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerAction {
    pub action: String,

    #[serde(default)]
    pub when: Option<String>,

    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl TriggerAction {
    pub fn new(action: &str) -> Self {
        Self {
            action: action.to_string(),
            when: None,
            params: Map::new(),
        }
    }

    pub fn with_param(mut self, key: &str, value: Value) -> Self {
        self.params.insert(key.to_string(), value);
        self
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }
}

/// Event-triggered rule that mutates session variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observer {
    pub name: String,

    /// Event kind, e.g. `after_tool`
    pub on: String,

    /// ANDed criteria; empty matches every event of kind `on`
    #[serde(rename = "match", default)]
    pub criteria: BTreeMap<String, String>,

    /// Variable name to template
    #[serde(default)]
    pub set: BTreeMap<String, String>,

    /// Built-in routine handled outside the observer engine
    #[serde(default)]
    pub behavior: Option<String>,
}

impl WorkflowDefinition {
    pub fn from_yaml(source: &str) -> DefinitionResult<Self> {
        let definition: WorkflowDefinition =
            serde_yaml::from_str(source).map_err(|e| DefinitionError::Parse {
                path: "<inline>".to_string(),
                message: e.to_string(),
            })?;
        definition.validate()?;
        Ok(definition)
    }

    pub fn is_lifecycle(&self) -> bool {
        self.workflow_type == WorkflowType::Lifecycle
    }

    pub fn step(&self, name: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn first_step(&self) -> Option<&StepDefinition> {
        self.steps.first()
    }

    pub fn triggers_for(&self, trigger: &str) -> &[TriggerAction] {
        self.triggers
            .get(trigger)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn validate(&self) -> DefinitionResult<()> {
        let invalid = |message: String| DefinitionError::Invalid {
            name: self.name.clone(),
            message,
        };

        if self.name.trim().is_empty() {
            return Err(invalid("workflow name must not be empty".to_string()));
        }
        if self.name.starts_with("__") {
            return Err(invalid("names starting with '__' are reserved".to_string()));
        }
        if !self.is_lifecycle() && self.steps.is_empty() {
            return Err(invalid(format!(
                "{} workflows need at least one step",
                self.workflow_type
            )));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.name.as_str()) {
                return Err(invalid(format!("duplicate step '{}'", step.name)));
            }
        }
        for step in &self.steps {
            for transition in &step.transitions {
                if !seen.contains(transition.to.as_str()) {
                    return Err(invalid(format!(
                        "step '{}' transitions to unknown step '{}'",
                        step.name, transition.to
                    )));
                }
            }
        }

        for observer in &self.observers {
            if observer.set.is_empty() && observer.behavior.is_none() {
                return Err(invalid(format!(
                    "observer '{}' needs either 'set' or 'behavior'",
                    observer.name
                )));
            }
        }

        Ok(())
    }
}
