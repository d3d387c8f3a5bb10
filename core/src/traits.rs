/// Core trait definitions for the Gantry control plane.
use crate::errors::{DefinitionResult, StateStoreResult, StepResult};
use crate::pipeline::definition::PipelineDefinition;
use crate::pipeline::execution::{ExecutionStatus, PipelineExecution, StepExecution};
use crate::workflow::definition::WorkflowDefinition;
use crate::workflow::state::WorkflowState;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Persistence for workflow state and pipeline executions.
///
/// All mutation of these records goes through this trait. Implementations
/// enforce status monotonicity and the completed-needs-output invariant.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Initialize the store with schema and migrations.
    async fn initialize(&mut self) -> StateStoreResult<()>;

    async fn get_state(&self, session_id: &str) -> StateStoreResult<Option<WorkflowState>>;

    /// Insert or replace the session's state.
    async fn save_state(&self, state: &WorkflowState) -> StateStoreResult<()>;

    async fn create_execution(&self, execution: &PipelineExecution) -> StateStoreResult<()>;

    async fn get_execution(&self, execution_id: &str) -> StateStoreResult<Option<PipelineExecution>>;

    /// Write every mutable field of an existing execution.
    async fn update_execution(&self, execution: &PipelineExecution) -> StateStoreResult<()>;

    /// Load, move to `status` and save.
    async fn update_execution_status(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
    ) -> StateStoreResult<PipelineExecution> {
        let mut execution = self.get_execution(execution_id).await?.ok_or_else(|| {
            crate::errors::StateStoreError::NotFound(format!("execution {}", execution_id))
        })?;
        execution.status = status;
        execution.updated_at = chrono::Utc::now();
        if status.is_terminal() {
            execution.completed_at = Some(execution.updated_at);
            execution.resume_token = None;
        }
        self.update_execution(&execution).await?;
        Ok(execution)
    }

    async fn list_executions(
        &self,
        project_id: Option<&str>,
        status: Option<ExecutionStatus>,
        limit: usize,
    ) -> StateStoreResult<Vec<PipelineExecution>>;

    async fn get_execution_by_resume_token(
        &self,
        resume_token: &str,
    ) -> StateStoreResult<Option<PipelineExecution>>;

    async fn create_step_execution(&self, step: &StepExecution) -> StateStoreResult<()>;

    async fn update_step_execution(&self, step: &StepExecution) -> StateStoreResult<()>;

    async fn get_step_execution(
        &self,
        execution_id: &str,
        step_id: &str,
    ) -> StateStoreResult<Option<StepExecution>>;

    /// Steps of an execution in creation order.
    async fn list_step_executions(&self, execution_id: &str) -> StateStoreResult<Vec<StepExecution>>;

    async fn get_step_by_approval_token(
        &self,
        approval_token: &str,
    ) -> StateStoreResult<Option<StepExecution>>;
}

/// Source of workflow and pipeline definitions.
#[async_trait]
pub trait DefinitionLoader: Send + Sync {
    /// `Ok(None)` when no definition has that name.
    async fn load_workflow(&self, name: &str) -> DefinitionResult<Option<Arc<WorkflowDefinition>>>;

    /// Every lifecycle workflow, ascending by priority then name.
    async fn discover_lifecycle_workflows(&self) -> DefinitionResult<Vec<Arc<WorkflowDefinition>>>;

    async fn load_pipeline(&self, name: &str) -> DefinitionResult<Option<Arc<PipelineDefinition>>>;

    /// Forget cached definitions so the next lookup re-reads them.
    fn clear_cache(&self);
}

/// Executes pipeline step bodies.
#[async_trait]
pub trait StepRunner: Send + Sync {
    /// Run a shell command with `input` on stdin; returns stdout.
    async fn run_exec(&self, command: &str, input: Option<&str>, timeout: Duration) -> StepResult<String>;

    /// Send a prompt to the LLM; returns its reply.
    async fn run_prompt(&self, prompt: &str, input: Option<&str>, timeout: Duration) -> StepResult<String>;
}

/// Receives pipeline lifecycle notifications. Implementations never fail.
#[async_trait]
pub trait PipelineNotifier: Send + Sync {
    async fn notify_approval_pending(
        &self,
        execution: &PipelineExecution,
        pipeline: &PipelineDefinition,
        step_id: &str,
        approval_token: &str,
        message: Option<&str>,
    );

    async fn notify_complete(&self, execution: &PipelineExecution, pipeline: &PipelineDefinition);

    async fn notify_failure(
        &self,
        execution: &PipelineExecution,
        pipeline: &PipelineDefinition,
        error: &str,
    );
}

/// Notifier that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl PipelineNotifier for NoopNotifier {
    async fn notify_approval_pending(
        &self,
        _execution: &PipelineExecution,
        _pipeline: &PipelineDefinition,
        _step_id: &str,
        _approval_token: &str,
        _message: Option<&str>,
    ) {
    }

    async fn notify_complete(&self, _execution: &PipelineExecution, _pipeline: &PipelineDefinition) {}

    async fn notify_failure(
        &self,
        _execution: &PipelineExecution,
        _pipeline: &PipelineDefinition,
        _error: &str,
    ) {
    }
}
