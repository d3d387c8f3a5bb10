//! Observer engine
//!
//! Observers fire on one event kind, AND-match their criteria against the
//! event, then render their `set` templates against a snapshot of the
//! session variables and write the coerced results back.

use super::definition::Observer;
use super::events::HookEvent;
use super::state::{Observation, WorkflowState};
use crate::expression_eval::{render_template, EvalContext};
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, warn};

/// Run `observers` against `event`, mutating `state` in place.
///
/// Returns the names of the observers that fired.
pub fn evaluate_observers(
    observers: &[Observer],
    event: &HookEvent,
    state: &mut WorkflowState,
) -> Vec<String> {
    let mut fired = Vec::new();

    for observer in observers {
        if observer.on != event.kind.as_str() {
            continue;
        }
        if observer.set.is_empty() {
            // Behavior observers are dispatched elsewhere
            debug!(observer = %observer.name, "Skipping behavior observer");
            continue;
        }
        if !matches_event(observer, event) {
            continue;
        }

        // All templates see the variables as they were before this observer
        let snapshot = EvalContext::from_variables(&state.variables);
        for (name, template) in &observer.set {
            match render_template(template, &snapshot) {
                Ok(rendered) => {
                    state.set_variable(name, coerce_value(&rendered));
                }
                Err(e) => {
                    warn!(
                        observer = %observer.name,
                        variable = %name,
                        error = %e,
                        "Observer expression failed, variable left unchanged"
                    );
                }
            }
        }

        state.record_observation(Observation {
            observer: observer.name.clone(),
            event: event.kind.as_str().to_string(),
            tool: event.tool_name().map(str::to_string),
            at: Utc::now(),
        });
        fired.push(observer.name.clone());
    }

    fired
}

/// AND-match every criterion. Unknown criteria never match.
pub fn matches_event(observer: &Observer, event: &HookEvent) -> bool {
    observer.criteria.iter().all(|(key, expected)| {
        let tool = event.tool.as_ref();
        match key.as_str() {
            "tool" => tool.map(|t| t.raw_name() == expected).unwrap_or(false),
            "mcp_server" => tool
                .and_then(|t| t.mcp_server())
                .map(|s| s == expected)
                .unwrap_or(false),
            "mcp_tool" => tool
                .and_then(|t| t.mcp_tool())
                .map(|s| s == expected)
                .unwrap_or(false),
            other => {
                debug!(observer = %observer.name, criterion = %other, "Unknown match criterion");
                false
            }
        }
    })
}

/// Turn rendered template text back into a typed value.
///
/// Transport collapses everything to strings, so `"false"` must come back
/// as a boolean rather than a truthy string.
pub fn coerce_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    let lower = trimmed.to_ascii_lowercase();

    match lower.as_str() {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        "" | "null" | "none" => return Value::Null,
        _ => {}
    }

    if let Ok(i) = trimmed.parse::<i64>() {
        return Value::from(i);
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return Value::Number(n);
        }
    }

    Value::String(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::events::EventKind;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn observer(name: &str, criteria: &[(&str, &str)], set: &[(&str, &str)]) -> Observer {
        Observer {
            name: name.to_string(),
            on: "after_tool".to_string(),
            criteria: criteria
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
            set: set
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            behavior: None,
        }
    }

    #[test]
    fn test_coercion() {
        assert_eq!(coerce_value("true"), json!(true));
        assert_eq!(coerce_value("FALSE"), json!(false));
        assert_eq!(coerce_value("null"), json!(null));
        assert_eq!(coerce_value("None"), json!(null));
        assert_eq!(coerce_value("   "), json!(null));
        assert_eq!(coerce_value("42"), json!(42));
        assert_eq!(coerce_value("3.14"), json!(3.14));
        assert_eq!(coerce_value("hello"), json!("hello"));
        assert_eq!(coerce_value("  padded "), json!("padded"));
    }

    #[test]
    fn test_coercion_is_idempotent() {
        for raw in ["true", "FALSE", "null", "42", "3.14", "hello"] {
            let once = coerce_value(raw);
            let rendered = crate::expression_eval::render_value(&once);
            assert_eq!(coerce_value(&rendered), once);
        }
    }

    #[test]
    fn test_counter_observer() {
        let observers = vec![observer(
            "count-edits",
            &[("tool", "Edit")],
            &[("edits", "{{ (variables.edits or 0) + 1 }}")],
        )];
        let mut state = WorkflowState::lifecycle("s1");
        let event = HookEvent::tool_call(EventKind::AfterTool, "s1", "Edit", json!({}));

        evaluate_observers(&observers, &event, &mut state);
        evaluate_observers(&observers, &event, &mut state);

        assert_eq!(state.variables.get("edits"), Some(&json!(2)));
        assert_eq!(state.observations.len(), 2);
    }

    #[test]
    fn test_mismatch_has_no_side_effect() {
        let observers = vec![observer("o", &[("tool", "Edit")], &[("x", "1")])];
        let mut state = WorkflowState::lifecycle("s1");
        let event = HookEvent::tool_call(EventKind::AfterTool, "s1", "Read", json!({}));

        let fired = evaluate_observers(&observers, &event, &mut state);
        assert!(fired.is_empty());
        assert!(state.variables.is_empty());
        assert!(state.observations.is_empty());
    }

    #[test]
    fn test_mcp_criteria_require_wrapper() {
        let obs = observer(
            "task-closed",
            &[("mcp_server", "tasks"), ("mcp_tool", "close_task")],
            &[("task_closed", "true")],
        );
        let wrapped = HookEvent::tool_call(
            EventKind::AfterTool,
            "s1",
            "call_tool",
            json!({"server_name": "tasks", "tool_name": "close_task"}),
        );
        let other_tool = HookEvent::tool_call(
            EventKind::AfterTool,
            "s1",
            "call_tool",
            json!({"server_name": "tasks", "tool_name": "list_tasks"}),
        );
        let native = HookEvent::tool_call(
            EventKind::AfterTool,
            "s1",
            "close_task",
            json!({"server_name": "tasks", "tool_name": "close_task"}),
        );

        assert!(matches_event(&obs, &wrapped));
        assert!(!matches_event(&obs, &other_tool));
        assert!(!matches_event(&obs, &native));
    }

    #[test]
    fn test_empty_match_fires_for_kind_only() {
        let observers = vec![observer("any", &[], &[("seen", "yes")])];
        let mut state = WorkflowState::lifecycle("s1");

        let before = HookEvent::new(EventKind::BeforeTool, "s1");
        evaluate_observers(&observers, &before, &mut state);
        assert!(state.variables.is_empty());

        let after = HookEvent::new(EventKind::AfterTool, "s1");
        evaluate_observers(&observers, &after, &mut state);
        assert_eq!(state.variables.get("seen"), Some(&json!("yes")));
    }

    #[test]
    fn test_unknown_criterion_never_matches() {
        let obs = observer("o", &[("file", "a.rs")], &[("x", "1")]);
        let event = HookEvent::tool_call(EventKind::AfterTool, "s1", "Edit", json!({}));
        assert!(!matches_event(&obs, &event));
    }

    #[test]
    fn test_failed_expression_leaves_variable() {
        let observers = vec![observer("o", &[], &[("x", "{{ 1 / 0 }}"), ("y", "ok")])];
        let mut state = WorkflowState::lifecycle("s1");
        state.set_variable("x", json!(5));
        let event = HookEvent::new(EventKind::AfterTool, "s1");

        evaluate_observers(&observers, &event, &mut state);
        assert_eq!(state.variables.get("x"), Some(&json!(5)));
        assert_eq!(state.variables.get("y"), Some(&json!("ok")));
    }
}
