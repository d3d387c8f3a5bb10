//! Declarative pipelines with approval gates.

pub mod definition;
pub mod execution;
pub mod executor;
pub mod legacy;
pub mod runner;

pub use definition::{
    ApprovalSpec, InputSpec, InputType, PipelineDefinition, PipelineStep, RetryPolicy,
    WebhookEndpoint, Webhooks,
};
pub use execution::{ExecutionPhase, ExecutionStatus, PipelineExecution, StepExecution, StepStatus};
pub use executor::{ExecutionRequest, PipelineExecutor};
pub use legacy::import_legacy_pipeline;
pub use runner::ProcessStepRunner;
