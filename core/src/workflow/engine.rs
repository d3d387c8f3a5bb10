//! Workflow state machine
//!
//! Owns the per-session read-modify-write cycle: every public operation
//! takes the session's lock, loads the state, applies its change and saves
//! once. Failures are reported in the returned [`ToolResponse`] so callers
//! (agents over MCP, hooks, the daemon) always get an explanation they can
//! act on.

use super::actions::{execute_actions, TriggerResponse};
use super::definition::WorkflowDefinition;
use super::events::{EventKind, HookEvent};
use super::observers::evaluate_observers;
use super::state::{
    WorkflowState, ENDED_WORKFLOW, LIFECYCLE_WORKFLOW, SESSION_TASK_VARIABLE,
};
use crate::expression_eval::{evaluate_condition, EvalContext};
use crate::keyed_lock::KeyedLocks;
use crate::traits::{DefinitionLoader, StateStore};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Structured result of a workflow operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ToolResponse {
    pub fn success(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warning = Some(warning.into());
        self
    }
}

/// Result of routing one hook event through the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HookResponse {
    /// False when the event (a tool call) must not proceed
    pub allow: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub context: Vec<String>,
    pub messages: Vec<String>,
    pub observers_fired: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transitioned_to: Option<String>,
    pub errors: Vec<String>,
}

impl HookResponse {
    fn absorb(&mut self, triggers: TriggerResponse) {
        self.context.extend(triggers.context);
        self.messages.extend(triggers.messages);
        self.errors.extend(triggers.errors);
        if let Some(reason) = triggers.blocked {
            if self.allow {
                self.allow = false;
                self.reason = Some(reason);
            }
        }
    }
}

/// Options for [`WorkflowEngine::activate_workflow`].
#[derive(Debug, Clone, Default)]
pub struct Activation {
    pub step: Option<String>,
    pub variables: Map<String, Value>,
    /// Replace another active step workflow
    pub force: bool,
}

pub struct WorkflowEngine {
    store: Arc<dyn StateStore>,
    loader: Arc<dyn DefinitionLoader>,
    locks: KeyedLocks,
}

impl WorkflowEngine {
    pub fn new(store: Arc<dyn StateStore>, loader: Arc<dyn DefinitionLoader>) -> Self {
        Self {
            store,
            loader,
            locks: KeyedLocks::new(),
        }
    }

    pub fn loader(&self) -> &Arc<dyn DefinitionLoader> {
        &self.loader
    }

    async fn load_definition(&self, name: &str) -> Result<Arc<WorkflowDefinition>, String> {
        match self.loader.load_workflow(name).await {
            Ok(Some(def)) => Ok(def),
            Ok(None) => Err(format!("Workflow '{}' not found", name)),
            Err(e) => Err(format!("Failed to load workflow '{}': {}", name, e)),
        }
    }

    async fn save(&self, state: &mut WorkflowState) -> Result<(), String> {
        state.touch();
        self.store
            .save_state(state)
            .await
            .map_err(|e| format!("Failed to save workflow state: {}", e))
    }

    /// Current state of a session, if any.
    pub async fn get_state(&self, session_id: &str) -> ToolResponse {
        match self.store.get_state(session_id).await {
            Ok(Some(state)) => ToolResponse::success(json!(state)),
            Ok(None) => ToolResponse::failure(format!("No workflow state for session {}", session_id)),
            Err(e) => ToolResponse::failure(format!("Failed to load workflow state: {}", e)),
        }
    }

    /// Manually move a session to `to_step`.
    ///
    /// Steps that the current step reaches only through a guarded (`when`)
    /// transition cannot be requested manually.
    pub async fn request_transition(&self, session_id: &str, to_step: &str) -> ToolResponse {
        let _guard = self.locks.lock(session_id).await;

        let mut state = match self.store.get_state(session_id).await {
            Ok(Some(state)) => state,
            Ok(None) => {
                return ToolResponse::failure(format!(
                    "No workflow state for session {}; activate a workflow first",
                    session_id
                ))
            }
            Err(e) => return ToolResponse::failure(format!("Failed to load workflow state: {}", e)),
        };

        if state.is_placeholder() {
            return ToolResponse::failure(format!(
                "No step workflow is active for session {} (current: {})",
                session_id, state.workflow_name
            ));
        }

        let definition = match self.load_definition(&state.workflow_name).await {
            Ok(def) => def,
            Err(e) => return ToolResponse::failure(e),
        };

        let Some(target) = definition.step(to_step) else {
            let known: Vec<&str> = definition.steps.iter().map(|s| s.name.as_str()).collect();
            return ToolResponse::failure(format!(
                "Step '{}' does not exist in workflow '{}'. Available steps: {}",
                to_step,
                definition.name,
                known.join(", ")
            ));
        };

        if let Some(current) = definition.step(&state.step) {
            let guarded = current
                .transitions
                .iter()
                .find(|t| t.to == to_step && t.when.is_some());
            if let Some(transition) = guarded {
                let condition = transition.when.as_deref().unwrap_or_default();
                warn!(
                    session = %session_id,
                    from = %state.step,
                    to = %to_step,
                    "Rejected manual transition past a guarded edge"
                );
                return ToolResponse::failure(format!(
                    "Cannot manually transition from '{}' to '{}': that transition happens \
                     automatically once `{}` is true. Requesting it directly is workflow \
                     circumvention; satisfy the condition instead.",
                    state.step, to_step, condition
                ));
            }
        }

        let from = state.step.clone();
        state.enter_step(&target.name);
        let mut triggers = TriggerResponse::default();
        execute_actions(&definition.name, &target.on_enter, &mut state, &mut triggers);

        if let Err(e) = self.save(&mut state).await {
            return ToolResponse::failure(e);
        }

        info!(session = %session_id, workflow = %definition.name, %from, to = %to_step, "Step transition");
        ToolResponse::success(json!({
            "workflow": definition.name,
            "from": from,
            "to": to_step,
            "context": triggers.context,
            "messages": triggers.messages,
            "errors": triggers.errors,
        }))
    }

    /// Write a session variable.
    ///
    /// A session without state gets a placeholder (or `workflow`, when named).
    /// `session_task` cannot be reassigned while a step workflow is active.
    pub async fn set_variable(
        &self,
        session_id: &str,
        name: &str,
        value: Value,
        workflow: Option<&str>,
    ) -> ToolResponse {
        let _guard = self.locks.lock(session_id).await;

        let mut state = match self.store.get_state(session_id).await {
            Ok(Some(state)) => state,
            Ok(None) => match workflow {
                None => WorkflowState::lifecycle(session_id),
                Some(workflow_name) => match self.load_definition(workflow_name).await {
                    Ok(def) if def.is_lifecycle() => WorkflowState::lifecycle(session_id),
                    Ok(def) => {
                        let step = def.first_step().map(|s| s.name.as_str()).unwrap_or_default();
                        let mut state = WorkflowState::new(session_id, &def.name, step);
                        state.variables = def.variables.clone();
                        state
                    }
                    Err(e) => return ToolResponse::failure(e),
                },
            },
            Err(e) => return ToolResponse::failure(format!("Failed to load workflow state: {}", e)),
        };

        let mut warning = None;
        if name == SESSION_TASK_VARIABLE {
            if state.is_placeholder() {
                warning = Some(format!(
                    "Setting '{}' outside a step workflow is deprecated; activate a task workflow instead",
                    SESSION_TASK_VARIABLE
                ));
            } else if let Some(existing) = state.variable(SESSION_TASK_VARIABLE) {
                // Clearing counts as a change; only end_workflow releases the task
                if *existing != value {
                    return ToolResponse::failure(format!(
                        "Cannot change '{}' from {} to {} while workflow '{}' is active. \
                         End the active workflow first.",
                        SESSION_TASK_VARIABLE, existing, value, state.workflow_name
                    ));
                }
            }
        }

        state.set_variable(name, value.clone());
        if let Err(e) = self.save(&mut state).await {
            return ToolResponse::failure(e);
        }

        debug!(session = %session_id, variable = %name, "Variable set");
        let response = ToolResponse::success(json!({ "name": name, "value": value }));
        match warning {
            Some(w) => response.with_warning(w),
            None => response,
        }
    }

    /// Read one variable, or all of them when `name` is `None`.
    pub async fn get_variable(&self, session_id: &str, name: Option<&str>) -> ToolResponse {
        let state = match self.store.get_state(session_id).await {
            Ok(state) => state,
            Err(e) => return ToolResponse::failure(format!("Failed to load workflow state: {}", e)),
        };
        let variables = state.map(|s| s.variables).unwrap_or_default();

        match name {
            Some(name) => ToolResponse::success(json!({
                "name": name,
                "value": variables.get(name).cloned().unwrap_or(Value::Null),
            })),
            None => ToolResponse::success(json!({ "variables": variables })),
        }
    }

    /// Start a step workflow for the session, superseding its current state.
    pub async fn activate_workflow(
        &self,
        session_id: &str,
        workflow_name: &str,
        activation: Activation,
    ) -> ToolResponse {
        let _guard = self.locks.lock(session_id).await;

        let definition = match self.load_definition(workflow_name).await {
            Ok(def) => def,
            Err(e) => return ToolResponse::failure(e),
        };
        if definition.is_lifecycle() {
            return ToolResponse::failure(format!(
                "Workflow '{}' is a lifecycle workflow and is always active; it cannot be activated",
                workflow_name
            ));
        }

        let existing = match self.store.get_state(session_id).await {
            Ok(state) => state,
            Err(e) => return ToolResponse::failure(format!("Failed to load workflow state: {}", e)),
        };
        if let Some(existing) = &existing {
            if !existing.is_placeholder() && existing.workflow_name != workflow_name && !activation.force {
                return ToolResponse::failure(format!(
                    "Workflow '{}' is already active for this session (step '{}'). \
                     End it before activating '{}'.",
                    existing.workflow_name, existing.step, workflow_name
                ));
            }
        }

        let start = match &activation.step {
            Some(step) => match definition.step(step) {
                Some(s) => s,
                None => {
                    return ToolResponse::failure(format!(
                        "Step '{}' does not exist in workflow '{}'",
                        step, workflow_name
                    ))
                }
            },
            None => match definition.first_step() {
                Some(s) => s,
                None => return ToolResponse::failure(format!("Workflow '{}' has no steps", workflow_name)),
            },
        };

        let mut state = WorkflowState::new(session_id, &definition.name, &start.name);
        state.variables = definition.variables.clone();
        for (key, value) in activation.variables {
            state.variables.insert(key, value);
        }

        let mut triggers = TriggerResponse::default();
        execute_actions(&definition.name, &start.on_enter, &mut state, &mut triggers);

        if let Err(e) = self.save(&mut state).await {
            return ToolResponse::failure(e);
        }

        info!(session = %session_id, workflow = %definition.name, step = %start.name, "Workflow activated");
        ToolResponse::success(json!({
            "workflow": definition.name,
            "step": start.name,
            "superseded": existing.map(|s| s.workflow_name),
            "context": triggers.context,
            "messages": triggers.messages,
        }))
    }

    /// End the active step workflow, releasing `session_task`.
    pub async fn end_workflow(&self, session_id: &str) -> ToolResponse {
        let _guard = self.locks.lock(session_id).await;

        let mut state = match self.store.get_state(session_id).await {
            Ok(Some(state)) if !state.is_placeholder() => state,
            Ok(_) => {
                return ToolResponse::failure(format!(
                    "No step workflow is active for session {}",
                    session_id
                ))
            }
            Err(e) => return ToolResponse::failure(format!("Failed to load workflow state: {}", e)),
        };

        let ended = std::mem::replace(&mut state.workflow_name, ENDED_WORKFLOW.to_string());
        state.enter_step("");
        state.variables.remove(SESSION_TASK_VARIABLE);

        if let Err(e) = self.save(&mut state).await {
            return ToolResponse::failure(e);
        }

        info!(session = %session_id, workflow = %ended, "Workflow ended");
        ToolResponse::success(json!({ "ended": ended }))
    }

    /// Route a hook event: action counting, tool blocking, observers,
    /// automatic transitions, then triggers.
    pub async fn handle_event(&self, event: &HookEvent) -> HookResponse {
        let _guard = self.locks.lock(&event.session_id).await;
        let mut response = HookResponse {
            allow: true,
            ..Default::default()
        };

        let mut state = match self.store.get_state(&event.session_id).await {
            Ok(Some(state)) => state,
            Ok(None) => WorkflowState::lifecycle(&event.session_id),
            Err(e) => {
                response.errors.push(format!("Failed to load workflow state: {}", e));
                return response;
            }
        };

        let lifecycle = match self.loader.discover_lifecycle_workflows().await {
            Ok(defs) => defs,
            Err(e) => {
                response.errors.push(format!("Failed to discover lifecycle workflows: {}", e));
                Vec::new()
            }
        };
        let active = if state.is_placeholder() {
            None
        } else {
            match self.load_definition(&state.workflow_name).await {
                Ok(def) => Some(def),
                Err(e) => {
                    response.errors.push(e);
                    None
                }
            }
        };

        if event.kind == EventKind::AfterTool {
            state.record_action();
        }

        if event.kind == EventKind::BeforeTool {
            if let (Some(def), Some(tool)) = (&active, &event.tool) {
                let blocked = def.step(&state.step).and_then(|step| {
                    step.blocked_tools.iter().find(|b| {
                        b.as_str() == tool.raw_name() || Some(b.as_str()) == tool.mcp_tool()
                    })
                });
                if let Some(name) = blocked {
                    response.allow = false;
                    response.reason = Some(format!(
                        "Tool '{}' is blocked during step '{}' of workflow '{}'",
                        name, state.step, def.name
                    ));
                }
            }
        }

        for def in lifecycle.iter().chain(active.iter()) {
            let fired = evaluate_observers(&def.observers, event, &mut state);
            response.observers_fired.extend(fired);
        }

        if let Some(def) = &active {
            if let Some(to) = Self::automatic_transition(def, &state) {
                debug!(session = %state.session_id, from = %state.step, %to, "Automatic transition");
                state.enter_step(&to);
                if let Some(step) = def.step(&to) {
                    let mut triggers = TriggerResponse::default();
                    execute_actions(&def.name, &step.on_enter, &mut state, &mut triggers);
                    response.absorb(triggers);
                }
                response.transitioned_to = Some(to);
            }
        }

        let trigger_key = event.kind.trigger_key();
        let mut triggers = TriggerResponse::default();
        for def in lifecycle.iter().chain(active.iter()) {
            execute_actions(&def.name, def.triggers_for(&trigger_key), &mut state, &mut triggers);
        }
        response.absorb(triggers);

        if let Err(e) = self.save(&mut state).await {
            response.errors.push(e);
        }
        response
    }

    /// Run `event` triggers only: lifecycle workflows by ascending priority,
    /// then the active step workflow.
    pub async fn fire_lifecycle_trigger(&self, session_id: &str, event: EventKind) -> TriggerResponse {
        let _guard = self.locks.lock(session_id).await;
        let mut response = TriggerResponse::default();

        let mut state = match self.store.get_state(session_id).await {
            Ok(Some(state)) => state,
            Ok(None) => WorkflowState::lifecycle(session_id),
            Err(e) => {
                response.errors.push(format!("Failed to load workflow state: {}", e));
                return response;
            }
        };

        let mut definitions = match self.loader.discover_lifecycle_workflows().await {
            Ok(defs) => defs,
            Err(e) => {
                response.errors.push(format!("Failed to discover lifecycle workflows: {}", e));
                Vec::new()
            }
        };
        if !state.is_placeholder() {
            match self.load_definition(&state.workflow_name).await {
                Ok(def) => definitions.push(def),
                Err(e) => response.errors.push(e),
            }
        }

        let key = event.trigger_key();
        for def in &definitions {
            execute_actions(&def.name, def.triggers_for(&key), &mut state, &mut response);
        }

        if let Err(e) = self.save(&mut state).await {
            response.errors.push(e);
        }
        response
    }

    /// First guarded transition out of the current step whose condition holds.
    fn automatic_transition(def: &WorkflowDefinition, state: &WorkflowState) -> Option<String> {
        let step = def.step(&state.step)?;
        let ctx = EvalContext::from_variables(&state.variables);
        step.transitions.iter().find_map(|t| {
            let when = t.when.as_deref()?;
            match evaluate_condition(when, &ctx) {
                Ok(true) => Some(t.to.clone()),
                Ok(false) => None,
                Err(e) => {
                    warn!(workflow = %def.name, step = %step.name, error = %e, "Transition guard failed");
                    None
                }
            }
        })
    }
}

/// Names reserved for placeholder workflows.
pub fn reserved_workflow_names() -> [&'static str; 2] {
    [LIFECYCLE_WORKFLOW, ENDED_WORKFLOW]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definitions::FileDefinitionLoader;
    use crate::state_store::SqliteStateStore;

    async fn engine_with(yaml: &[&str]) -> WorkflowEngine {
        let store = SqliteStateStore::in_memory().await.unwrap();
        let loader = FileDefinitionLoader::in_memory();
        for source in yaml {
            loader
                .register_workflow(WorkflowDefinition::from_yaml(source).unwrap())
                .unwrap();
        }
        WorkflowEngine::new(Arc::new(store), Arc::new(loader))
    }

    const SIMPLE: &str = r#"
name: simple
type: task
steps:
  - name: start
    transitions:
      - to: finish
  - name: finish
"#;

    #[tokio::test]
    async fn test_transition_without_state_fails() {
        let engine = engine_with(&[SIMPLE]).await;
        let response = engine.request_transition("nobody", "finish").await;
        assert!(!response.ok);
        assert!(response.error.unwrap().contains("No workflow state"));
    }

    #[tokio::test]
    async fn test_unknown_step_names_available_steps() {
        let engine = engine_with(&[SIMPLE]).await;
        assert!(engine.activate_workflow("s1", "simple", Activation::default()).await.ok);
        let response = engine.request_transition("s1", "bogus").await;
        assert!(!response.ok);
        assert!(response.error.unwrap().contains("start, finish"));
    }

    #[tokio::test]
    async fn test_activate_requires_known_workflow() {
        let engine = engine_with(&[]).await;
        let response = engine.activate_workflow("s1", "ghost", Activation::default()).await;
        assert_eq!(response.error.as_deref(), Some("Workflow 'ghost' not found"));
    }

    #[tokio::test]
    async fn test_end_workflow_releases_session_task() {
        let engine = engine_with(&[SIMPLE]).await;
        engine.activate_workflow("s1", "simple", Activation::default()).await;
        engine.set_variable("s1", "session_task", json!("T-1"), None).await;

        let ended = engine.end_workflow("s1").await;
        assert!(ended.ok);

        let state = engine.get_state("s1").await.data.unwrap();
        assert_eq!(state["workflow_name"], json!(ENDED_WORKFLOW));
        assert!(state["variables"].get("session_task").is_none());

        assert!(!engine.end_workflow("s1").await.ok);
    }

    #[test]
    fn test_reserved_names() {
        assert!(reserved_workflow_names().contains(&"__ended__"));
    }
}
