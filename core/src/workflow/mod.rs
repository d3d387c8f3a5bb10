//! Session workflows: definitions, per-session state, observers, trigger
//! actions and the state machine that ties them together.

pub mod actions;
pub mod definition;
pub mod engine;
pub mod events;
pub mod observers;
pub mod state;

pub use actions::{execute_actions, TriggerResponse};
pub use definition::{
    Observer, StepDefinition, Transition, TriggerAction, WorkflowDefinition, WorkflowType,
};
pub use engine::{Activation, HookResponse, ToolResponse, WorkflowEngine};
pub use events::{EventKind, HookEvent, RawHookEvent, ToolInvocation};
pub use observers::{coerce_value, evaluate_observers};
pub use state::{Observation, WorkflowState, ENDED_WORKFLOW, LIFECYCLE_WORKFLOW, SESSION_TASK_VARIABLE};
