// Gantry: orchestration control plane for AI coding agents
// Core library providing workflows, pipelines, persistence and webhooks

pub mod config;
pub mod definitions;
pub mod errors;
pub mod expression_eval;
pub mod keyed_lock;
pub mod pipeline;
pub mod state_store;
pub mod traits;
pub mod webhooks;
pub mod workflow;

// Re-export commonly used types
pub use errors::{
    ConfigError, ConfigResult, DefinitionError, DefinitionResult, PipelineError, PipelineResult,
    StateStoreError, StateStoreResult, StepError, StepResult,
};

pub use traits::{DefinitionLoader, NoopNotifier, PipelineNotifier, StateStore, StepRunner};

pub use config::{
    ConfigManager, DefinitionsConfig, GantryConfig, LoggingConfig, PipelinesConfig, StorageConfig,
    WebhooksConfig,
};

pub use definitions::FileDefinitionLoader;
pub use state_store::SqliteStateStore;
pub use webhooks::{DeliveryOutcome, WebhookNotifier};

pub use workflow::{
    Activation, EventKind, HookEvent, HookResponse, ToolResponse, WorkflowDefinition,
    WorkflowEngine, WorkflowState,
};

pub use pipeline::{
    ExecutionRequest, ExecutionStatus, PipelineDefinition, PipelineExecution, PipelineExecutor,
    ProcessStepRunner, StepExecution, StepStatus,
};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
