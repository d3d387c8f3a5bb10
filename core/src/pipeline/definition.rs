//! Declarative pipeline definitions
//!
//! ```yaml
//! name: release
//! inputs:
//!   version: { type: string }
//! steps:
//!   - id: build
//!     exec: cargo build --release
//!   - id: notes
//!     prompt: "Write release notes for {{ inputs.version }}"
//!     input: $build.output
//!     approval:
//!       required: true
//!       message: Publish these notes?
//! webhooks:
//!   on_complete:
//!     url: https://hooks.example.com/release
//!     headers:
//!       Authorization: "Bearer ${RELEASE_TOKEN}"
//! ```

use crate::errors::{DefinitionError, DefinitionResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub inputs: BTreeMap<String, InputSpec>,

    pub steps: Vec<PipelineStep>,

    #[serde(default)]
    pub webhooks: Webhooks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    #[default]
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct InputSpec {
    #[serde(rename = "type", default)]
    pub input_type: InputType,

    #[serde(default)]
    pub default: Option<Value>,

    #[serde(default)]
    pub description: Option<String>,
}

impl InputSpec {
    /// Coerce a caller-supplied value to the declared type.
    pub fn coerce(&self, name: &str, value: &Value) -> Result<Value, String> {
        let mismatch = || format!("input '{}' expects {:?}, got {}", name, self.input_type, value);
        match (self.input_type, value) {
            (InputType::String, Value::String(_)) => Ok(value.clone()),
            (InputType::String, Value::Number(_) | Value::Bool(_)) => {
                Ok(Value::String(value.to_string()))
            }
            (InputType::Number, Value::Number(_)) => Ok(value.clone()),
            (InputType::Number, Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .ok_or_else(mismatch),
            (InputType::Integer, Value::Number(n)) => {
                n.as_i64().map(Value::from).ok_or_else(mismatch)
            }
            (InputType::Integer, Value::String(s)) => {
                s.trim().parse::<i64>().map(Value::from).map_err(|_| mismatch())
            }
            (InputType::Boolean, Value::Bool(_)) => Ok(value.clone()),
            (InputType::Boolean, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Ok(Value::Bool(true)),
                "false" | "no" | "0" => Ok(Value::Bool(false)),
                _ => Err(mismatch()),
            },
            (InputType::Array, Value::Array(_)) => Ok(value.clone()),
            (InputType::Object, Value::Object(_)) => Ok(value.clone()),
            _ => Err(mismatch()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStep {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,

    /// `$<step_id>.output`, or literal text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval: Option<ApprovalSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalSpec {
    #[serde(default)]
    pub required: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// The executable body of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepBody<'a> {
    Exec(&'a str),
    Prompt(&'a str),
}

impl PipelineStep {
    pub fn exec(id: &str, command: &str) -> Self {
        Self {
            id: id.to_string(),
            exec: Some(command.to_string()),
            prompt: None,
            input: None,
            condition: None,
            approval: None,
        }
    }

    pub fn body(&self) -> Option<StepBody<'_>> {
        match (&self.exec, &self.prompt) {
            (Some(cmd), None) => Some(StepBody::Exec(cmd)),
            (None, Some(prompt)) => Some(StepBody::Prompt(prompt)),
            _ => None,
        }
    }

    pub fn requires_approval(&self) -> bool {
        self.approval.as_ref().map(|a| a.required).unwrap_or(false)
    }

    /// Step id named by an `$<id>.output` reference, if `input` is one.
    pub fn input_reference(&self) -> Option<&str> {
        self.input.as_deref().and_then(parse_output_reference)
    }
}

/// Parse `$<step_id>.output` into the step id.
pub fn parse_output_reference(reference: &str) -> Option<&str> {
    reference
        .trim()
        .strip_prefix('$')
        .and_then(|rest| rest.strip_suffix(".output"))
        .filter(|id| !id.is_empty() && !id.contains(char::is_whitespace))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Webhooks {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_approval_pending: Option<WebhookEndpoint>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_complete: Option<WebhookEndpoint>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<WebhookEndpoint>,
}

fn default_method() -> String {
    "POST".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEndpoint {
    pub url: String,

    #[serde(default = "default_method")]
    pub method: String,

    /// Values may reference `${ENV_VAR}`
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

impl WebhookEndpoint {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            method: default_method(),
            headers: BTreeMap::new(),
            timeout_secs: default_timeout_secs(),
            retry: None,
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_secs() -> f64 {
    1.0
}

/// Upper bound on the configured base delay
pub const MAX_BACKOFF_SECS: f64 = 300.0;

/// No single retry wait exceeds this, however many doublings precede it
pub const MAX_RETRY_DELAY_SECS: f64 = 3600.0;

fn default_retry_statuses() -> Vec<u16> {
    vec![408, 429, 500, 502, 503, 504]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay, doubled after each failed attempt
    #[serde(default = "default_backoff_secs", alias = "backoff_seconds")]
    pub backoff_secs: f64,

    #[serde(default = "default_retry_statuses")]
    pub retry_on_status: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_secs: default_backoff_secs(),
            retry_on_status: default_retry_statuses(),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, where `attempt` starts at 1.
    pub fn backoff_for_attempt(&self, attempt: u32) -> std::time::Duration {
        let factor = 2f64.powi(attempt.saturating_sub(1).min(16) as i32);
        let secs = self.backoff_secs * factor;
        // NaN fails every comparison and lands on zero
        if !(secs > 0.0) {
            return std::time::Duration::ZERO;
        }
        std::time::Duration::try_from_secs_f64(secs.min(MAX_RETRY_DELAY_SECS))
            .unwrap_or(std::time::Duration::from_secs(MAX_RETRY_DELAY_SECS as u64))
    }

    pub fn should_retry_status(&self, status: u16) -> bool {
        self.retry_on_status.contains(&status)
    }
}

impl PipelineDefinition {
    pub fn from_yaml(source: &str) -> DefinitionResult<Self> {
        let definition: PipelineDefinition =
            serde_yaml::from_str(source).map_err(|e| DefinitionError::Parse {
                path: "<inline>".to_string(),
                message: e.to_string(),
            })?;
        definition.validate()?;
        Ok(definition)
    }

    pub fn step(&self, id: &str) -> Option<&PipelineStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Resolve caller inputs against the declared inputs.
    ///
    /// Declared inputs fall back to their default; a declared input with
    /// neither a value nor a default is an error. Undeclared inputs pass
    /// through untouched.
    pub fn resolve_inputs(&self, supplied: &Map<String, Value>) -> Result<Map<String, Value>, String> {
        let mut resolved = supplied.clone();
        for (name, spec) in &self.inputs {
            match supplied.get(name).filter(|v| !v.is_null()) {
                Some(value) => {
                    resolved.insert(name.clone(), spec.coerce(name, value)?);
                }
                None => match &spec.default {
                    Some(default) => {
                        resolved.insert(name.clone(), default.clone());
                    }
                    None => return Err(format!("missing required input '{}'", name)),
                },
            }
        }
        Ok(resolved)
    }

    pub fn validate(&self) -> DefinitionResult<()> {
        let invalid = |message: String| DefinitionError::Invalid {
            name: self.name.clone(),
            message,
        };

        if self.name.trim().is_empty() {
            return Err(invalid("pipeline name must not be empty".to_string()));
        }
        if self.steps.is_empty() {
            return Err(invalid("pipeline needs at least one step".to_string()));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if step.id.trim().is_empty() {
                return Err(invalid("step id must not be empty".to_string()));
            }
            if step.body().is_none() {
                return Err(invalid(format!(
                    "step '{}' must have exactly one of 'exec' or 'prompt'",
                    step.id
                )));
            }
            if let Some(reference) = step.input_reference() {
                if !seen.contains(reference) {
                    return Err(invalid(format!(
                        "step '{}' reads ${}.output before that step runs",
                        step.id, reference
                    )));
                }
            }
            if !seen.insert(step.id.as_str()) {
                return Err(invalid(format!("duplicate step id '{}'", step.id)));
            }
        }

        for (event, endpoint) in [
            ("on_approval_pending", &self.webhooks.on_approval_pending),
            ("on_complete", &self.webhooks.on_complete),
            ("on_failure", &self.webhooks.on_failure),
        ] {
            let Some(endpoint) = endpoint else { continue };
            if !(1..=300).contains(&endpoint.timeout_secs) {
                return Err(invalid(format!(
                    "webhook {} timeout_secs must be between 1 and 300, got {}",
                    event, endpoint.timeout_secs
                )));
            }
            if let Some(retry) = &endpoint.retry {
                if !(1..=10).contains(&retry.max_attempts) {
                    return Err(invalid(format!(
                        "webhook {} retry.max_attempts must be between 1 and 10, got {}",
                        event, retry.max_attempts
                    )));
                }
                if !(0.0..=MAX_BACKOFF_SECS).contains(&retry.backoff_secs) {
                    return Err(invalid(format!(
                        "webhook {} retry.backoff_secs must be between 0 and {}, got {}",
                        event, MAX_BACKOFF_SECS, retry.backoff_secs
                    )));
                }
            }
        }

        Ok(())
    }
}
