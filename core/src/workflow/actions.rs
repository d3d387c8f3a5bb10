//! Built-in trigger actions
//!
//! Actions run against a shared [`WorkflowState`] and accumulate their
//! effects into a [`TriggerResponse`] so that later actions (and later
//! lifecycle workflows) observe what earlier ones did.

use super::definition::TriggerAction;
use super::state::WorkflowState;
use crate::expression_eval::{evaluate_condition, render_template, EvalContext};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// Session variable gating `inject_context`.
pub const CONTEXT_INJECTION_GATE: &str = "enable_context_injection";

/// Session variable gating `inject_message`.
pub const MESSAGE_INJECTION_GATE: &str = "enable_message_injection";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerResponse {
    /// Context blocks to prepend to the agent's next turn
    pub context: Vec<String>,
    /// User-visible messages
    pub messages: Vec<String>,
    /// Set when an action blocked the event
    pub blocked: Option<String>,
    /// Action failures; they never abort the remaining actions
    pub errors: Vec<String>,
}

impl TriggerResponse {
    pub fn merge(&mut self, other: TriggerResponse) {
        self.context.extend(other.context);
        self.messages.extend(other.messages);
        if self.blocked.is_none() {
            self.blocked = other.blocked;
        }
        self.errors.extend(other.errors);
    }

    pub fn is_empty(&self) -> bool {
        self.context.is_empty()
            && self.messages.is_empty()
            && self.blocked.is_none()
            && self.errors.is_empty()
    }
}

/// A gate counts as closed only when the variable is present and falsy.
fn gate_closed(state: &WorkflowState, gate: &str) -> bool {
    match state.variables.get(gate) {
        None | Some(Value::Null) => false,
        Some(v) => !crate::expression_eval::truthy(v),
    }
}

/// Run `actions` in order. `source` names the workflow for log context.
pub fn execute_actions(
    source: &str,
    actions: &[TriggerAction],
    state: &mut WorkflowState,
    response: &mut TriggerResponse,
) {
    for action in actions {
        if let Some(when) = &action.when {
            let ctx = EvalContext::from_variables(&state.variables);
            match evaluate_condition(when, &ctx) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(workflow = %source, action = %action.action, "Guard false, skipping");
                    continue;
                }
                Err(e) => {
                    warn!(workflow = %source, action = %action.action, error = %e, "Guard failed");
                    response
                        .errors
                        .push(format!("{}: invalid 'when' on {}: {}", source, action.action, e));
                    continue;
                }
            }
        }

        if let Err(message) = execute_action(action, state, response) {
            warn!(workflow = %source, action = %action.action, error = %message, "Action failed");
            response.errors.push(format!("{}: {}", source, message));
        }
    }
}

fn render_param(action: &TriggerAction, key: &str, state: &WorkflowState) -> Result<String, String> {
    let raw = action
        .param_str(key)
        .ok_or_else(|| format!("{} requires '{}'", action.action, key))?;
    let ctx = EvalContext::from_variables(&state.variables);
    render_template(raw, &ctx).map_err(|e| format!("{}: {}", action.action, e))
}

fn execute_action(
    action: &TriggerAction,
    state: &mut WorkflowState,
    response: &mut TriggerResponse,
) -> Result<(), String> {
    match action.action.as_str() {
        "set_variable" => {
            let name = action
                .param_str("name")
                .ok_or("set_variable requires 'name'")?
                .to_string();
            let value = match action.params.get("value") {
                // Strings are templates; other YAML scalars keep their type
                Some(Value::String(template)) => {
                    let ctx = EvalContext::from_variables(&state.variables);
                    let rendered = render_template(template, &ctx)
                        .map_err(|e| format!("set_variable: {}", e))?;
                    super::observers::coerce_value(&rendered)
                }
                Some(other) => other.clone(),
                None => Value::Null,
            };
            state.set_variable(&name, value);
        }
        "increment_variable" => {
            let name = action
                .param_str("name")
                .ok_or("increment_variable requires 'name'")?
                .to_string();
            let amount = action.params.get("amount").and_then(Value::as_i64).unwrap_or(1);
            let current = state.variables.get(&name).and_then(Value::as_i64).unwrap_or(0);
            state.set_variable(&name, Value::from(current + amount));
        }
        "inject_context" => {
            if gate_closed(state, CONTEXT_INJECTION_GATE) {
                debug!("Context injection disabled for session {}", state.session_id);
                return Ok(());
            }
            let once = action.params.get("once").and_then(Value::as_bool).unwrap_or(false);
            if once && state.context_injected {
                return Ok(());
            }
            let content = render_param(action, "content", state)?;
            response.context.push(content);
            state.context_injected = true;
        }
        "inject_message" => {
            if gate_closed(state, MESSAGE_INJECTION_GATE) {
                debug!("Message injection disabled for session {}", state.session_id);
                return Ok(());
            }
            let content = render_param(action, "content", state)?;
            response.messages.push(content);
        }
        "block" => {
            let reason = render_param(action, "reason", state)
                .unwrap_or_else(|_| "Blocked by workflow".to_string());
            response.blocked.get_or_insert(reason);
        }
        "request_reflection" => {
            state.reflection_pending = true;
        }
        "clear_reflection" => {
            state.reflection_pending = false;
        }
        other => return Err(format!("unknown action '{}'", other)),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run(actions: &[TriggerAction], state: &mut WorkflowState) -> TriggerResponse {
        let mut response = TriggerResponse::default();
        execute_actions("test", actions, state, &mut response);
        response
    }

    #[test]
    fn test_set_and_increment() {
        let mut state = WorkflowState::lifecycle("s1");
        let actions = vec![
            TriggerAction::new("set_variable")
                .with_param("name", json!("mode"))
                .with_param("value", json!("strict")),
            TriggerAction::new("set_variable")
                .with_param("name", json!("limit"))
                .with_param("value", json!(3)),
            TriggerAction::new("increment_variable").with_param("name", json!("turns")),
            TriggerAction::new("increment_variable")
                .with_param("name", json!("turns"))
                .with_param("amount", json!(2)),
        ];
        let response = run(&actions, &mut state);
        assert!(response.errors.is_empty());
        assert_eq!(state.variables.get("mode"), Some(&json!("strict")));
        assert_eq!(state.variables.get("limit"), Some(&json!(3)));
        assert_eq!(state.variables.get("turns"), Some(&json!(3)));
    }

    #[test]
    fn test_context_gate() {
        let mut state = WorkflowState::lifecycle("s1");
        let inject = vec![TriggerAction::new("inject_context").with_param("content", json!("rules"))];

        state.set_variable(CONTEXT_INJECTION_GATE, json!(false));
        assert!(run(&inject, &mut state).context.is_empty());

        state.set_variable(CONTEXT_INJECTION_GATE, json!(true));
        assert_eq!(run(&inject, &mut state).context, vec!["rules".to_string()]);
    }

    #[test]
    fn test_message_gate_independent_of_context_gate() {
        let mut state = WorkflowState::lifecycle("s1");
        state.set_variable(CONTEXT_INJECTION_GATE, json!(false));
        let actions = vec![TriggerAction::new("inject_message").with_param("content", json!("hi"))];
        assert_eq!(run(&actions, &mut state).messages, vec!["hi".to_string()]);

        state.set_variable(MESSAGE_INJECTION_GATE, json!(false));
        assert!(run(&actions, &mut state).messages.is_empty());
    }

    #[test]
    fn test_inject_once() {
        let mut state = WorkflowState::lifecycle("s1");
        let actions = vec![TriggerAction::new("inject_context")
            .with_param("content", json!("intro"))
            .with_param("once", json!(true))];
        assert_eq!(run(&actions, &mut state).context.len(), 1);
        assert!(run(&actions, &mut state).context.is_empty());
    }

    #[test]
    fn test_when_guard_and_templates() {
        let mut state = WorkflowState::lifecycle("s1");
        state.set_variable("task", json!("T-12"));
        let mut guarded = TriggerAction::new("inject_message")
            .with_param("content", json!("Working on {{ variables.task }}"));
        guarded.when = Some("variables.task".to_string());
        let mut skipped = TriggerAction::new("inject_message").with_param("content", json!("nope"));
        skipped.when = Some("variables.missing".to_string());

        let response = run(&[guarded, skipped], &mut state);
        assert_eq!(response.messages, vec!["Working on T-12".to_string()]);
    }

    #[test]
    fn test_unknown_action_reported() {
        let mut state = WorkflowState::lifecycle("s1");
        let actions = vec![
            TriggerAction::new("launch_rockets"),
            TriggerAction::new("request_reflection"),
        ];
        let response = run(&actions, &mut state);
        assert_eq!(response.errors.len(), 1);
        assert!(response.errors[0].contains("launch_rockets"));
        assert!(state.reflection_pending);
    }

    #[test]
    fn test_block_keeps_first_reason() {
        let mut state = WorkflowState::lifecycle("s1");
        let actions = vec![
            TriggerAction::new("block").with_param("reason", json!("first")),
            TriggerAction::new("block").with_param("reason", json!("second")),
        ];
        assert_eq!(run(&actions, &mut state).blocked.as_deref(), Some("first"));
    }
}
