//! Pipeline executor
//!
//! Runs a pipeline's steps in definition order against one
//! [`PipelineExecution`]. Every state change is written through the
//! [`StateStore`] before the notifier hears about it.
//!
//! An approval gate does not block: the step's body runs, its output is
//! held back behind an approval token, the execution gets a resume token,
//! and `execute` returns. Approving the step and calling `execute` again
//! with the same execution id picks up at the next step.

use super::definition::{parse_output_reference, PipelineDefinition, PipelineStep, StepBody};
use super::execution::{ExecutionStatus, PipelineExecution, StepExecution, StepStatus};
use crate::errors::{PipelineError, PipelineResult, StepError, StepResult};
use crate::expression_eval::{evaluate_condition, render_template, EvalContext};
use crate::keyed_lock::KeyedLocks;
use crate::traits::{DefinitionLoader, PipelineNotifier, StateStore, StepRunner};
use chrono::Utc;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default upper bound for a single step body.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(300);

/// Everything `execute_with` needs besides the pipeline itself.
#[derive(Debug, Clone, Default)]
pub struct ExecutionRequest {
    pub inputs: Map<String, Value>,
    pub project_id: String,
    /// Continue this execution instead of starting a new one
    pub execution_id: Option<String>,
    pub session_id: Option<String>,
    pub parent_execution_id: Option<String>,
}

/// Step body after template rendering.
enum PreparedBody {
    Exec(String),
    Prompt(String),
}

pub struct PipelineExecutor {
    store: Arc<dyn StateStore>,
    loader: Arc<dyn DefinitionLoader>,
    runner: Arc<dyn StepRunner>,
    notifier: Arc<dyn PipelineNotifier>,
    locks: KeyedLocks,
    step_timeout: Duration,
}

impl PipelineExecutor {
    pub fn new(
        store: Arc<dyn StateStore>,
        loader: Arc<dyn DefinitionLoader>,
        runner: Arc<dyn StepRunner>,
        notifier: Arc<dyn PipelineNotifier>,
    ) -> Self {
        Self {
            store,
            loader,
            runner,
            notifier,
            locks: KeyedLocks::new(),
            step_timeout: DEFAULT_STEP_TIMEOUT,
        }
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    async fn pipeline(&self, name: &str) -> PipelineResult<Arc<PipelineDefinition>> {
        self.loader
            .load_pipeline(name)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("pipeline '{}'", name)))
    }

    /// Start a new execution, or continue `execution_id`.
    pub async fn execute(
        &self,
        pipeline: &PipelineDefinition,
        inputs: Map<String, Value>,
        project_id: &str,
        execution_id: Option<&str>,
    ) -> PipelineResult<PipelineExecution> {
        self.execute_with(
            pipeline,
            ExecutionRequest {
                inputs,
                project_id: project_id.to_string(),
                execution_id: execution_id.map(str::to_string),
                ..Default::default()
            },
        )
        .await
    }

    /// Look a pipeline up by name and start it.
    pub async fn run(
        &self,
        pipeline_name: &str,
        request: ExecutionRequest,
    ) -> PipelineResult<PipelineExecution> {
        let pipeline = self.pipeline(pipeline_name).await?;
        self.execute_with(&pipeline, request).await
    }

    pub async fn execute_with(
        &self,
        pipeline: &PipelineDefinition,
        request: ExecutionRequest,
    ) -> PipelineResult<PipelineExecution> {
        let (execution, _guard) = match &request.execution_id {
            Some(id) => {
                let guard = self.locks.lock(id).await;
                let execution = self
                    .store
                    .get_execution(id)
                    .await?
                    .ok_or_else(|| PipelineError::NotFound(format!("execution {}", id)))?;
                if execution.pipeline_name != pipeline.name {
                    return Err(PipelineError::Validation(format!(
                        "execution {} belongs to pipeline '{}', not '{}'",
                        id, execution.pipeline_name, pipeline.name
                    )));
                }
                if execution.status.is_terminal() {
                    debug!("Execution {} already {}", id, execution.status);
                    return Ok(execution);
                }
                (execution, guard)
            }
            None => {
                let inputs = pipeline
                    .resolve_inputs(&request.inputs)
                    .map_err(PipelineError::Validation)?;
                let mut execution =
                    PipelineExecution::new(&pipeline.name, &request.project_id, &inputs);
                execution.session_id = request.session_id.clone();
                execution.parent_execution_id = request.parent_execution_id.clone();

                let guard = self.locks.lock(&execution.id).await;
                self.store.create_execution(&execution).await?;
                info!("Started pipeline '{}' as {}", pipeline.name, execution.id);
                (execution, guard)
            }
        };

        let execution = if execution.status == ExecutionStatus::Pending {
            self.store
                .update_execution_status(&execution.id, ExecutionStatus::Running)
                .await?
        } else {
            execution
        };

        self.run_steps(pipeline, execution).await
    }

    async fn run_steps(
        &self,
        pipeline: &PipelineDefinition,
        mut execution: PipelineExecution,
    ) -> PipelineResult<PipelineExecution> {
        let inputs = execution.inputs();
        let mut existing: HashMap<String, StepExecution> = self
            .store
            .list_step_executions(&execution.id)
            .await?
            .into_iter()
            .map(|s| (s.step_id.clone(), s))
            .collect();

        let mut outputs = Map::new();
        let mut step_view = Map::new();

        for step in &pipeline.steps {
            let mut record = match existing.remove(&step.id) {
                Some(record) => record,
                None => {
                    let record = StepExecution::new(&execution.id, &step.id);
                    self.store.create_step_execution(&record).await?;
                    record
                }
            };

            match record.status {
                StepStatus::Completed => {
                    let output = record.output.clone().unwrap_or_default();
                    step_view.insert(step.id.clone(), json!({ "output": output, "status": "completed" }));
                    outputs.insert(step.id.clone(), Value::String(output));
                    continue;
                }
                StepStatus::Skipped => {
                    step_view.insert(step.id.clone(), json!({ "output": null, "status": "skipped" }));
                    continue;
                }
                StepStatus::Failed => {
                    let error = record.error.clone().unwrap_or_else(|| "step failed".to_string());
                    return self.fail(execution, pipeline, &step.id, &error).await;
                }
                StepStatus::Running if record.awaiting_approval() => {
                    debug!("Execution {} still waiting on '{}'", execution.id, step.id);
                    return Ok(execution);
                }
                StepStatus::Running | StepStatus::Pending => {}
            }

            if execution.resume_token.take().is_some() {
                execution.updated_at = Utc::now();
                self.store.update_execution(&execution).await?;
                info!("Resumed execution {} at step '{}'", execution.id, step.id);
            }

            let ctx = step_context(&inputs, &step_view);

            if let Some(condition) = &step.condition {
                match evaluate_condition(condition, &ctx) {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!("Skipping step '{}': condition `{}` is false", step.id, condition);
                        record.status = StepStatus::Skipped;
                        record.completed_at = Some(Utc::now());
                        self.store.update_step_execution(&record).await?;
                        step_view.insert(step.id.clone(), json!({ "output": null, "status": "skipped" }));
                        continue;
                    }
                    Err(e) => {
                        let error = StepError::Template(format!("condition `{}`: {}", condition, e));
                        return self.fail_step(execution, pipeline, record, error).await;
                    }
                }
            }

            let (body, input) = match self.prepare(step, &ctx, &outputs) {
                Ok(prepared) => prepared,
                Err(error) => return self.fail_step(execution, pipeline, record, error).await,
            };

            record.status = StepStatus::Running;
            record.started_at = Some(Utc::now());
            record.input = input.clone();
            self.store.update_step_execution(&record).await?;

            debug!("Running step '{}' of {}", step.id, execution.id);
            let result = match &body {
                PreparedBody::Exec(command) => {
                    self.runner
                        .run_exec(command, input.as_deref(), self.step_timeout)
                        .await
                }
                PreparedBody::Prompt(prompt) => {
                    self.runner
                        .run_prompt(prompt, input.as_deref(), self.step_timeout)
                        .await
                }
            };

            let output = match result {
                Ok(output) => output,
                Err(error) => return self.fail_step(execution, pipeline, record, error).await,
            };

            if step.requires_approval() {
                return self.suspend(execution, pipeline, step, record, output).await;
            }

            record.status = StepStatus::Completed;
            record.output = Some(output.clone());
            record.completed_at = Some(Utc::now());
            self.store.update_step_execution(&record).await?;

            step_view.insert(step.id.clone(), json!({ "output": output, "status": "completed" }));
            outputs.insert(step.id.clone(), Value::String(output));
        }

        execution.outputs_json = Some(Value::Object(outputs).to_string());
        execution.updated_at = Utc::now();
        self.store.update_execution(&execution).await?;
        let execution = self
            .store
            .update_execution_status(&execution.id, ExecutionStatus::Completed)
            .await?;

        info!("Pipeline '{}' completed ({})", pipeline.name, execution.id);
        self.notifier.notify_complete(&execution, pipeline).await;
        Ok(execution)
    }

    /// Resolve the step's input and render its body.
    fn prepare(
        &self,
        step: &PipelineStep,
        ctx: &EvalContext,
        outputs: &Map<String, Value>,
    ) -> StepResult<(PreparedBody, Option<String>)> {
        let input = match step.input.as_deref() {
            None => None,
            Some(raw) => match parse_output_reference(raw) {
                Some(source) => match outputs.get(source) {
                    Some(Value::String(output)) => Some(output.clone()),
                    _ => {
                        return Err(StepError::Reference(format!(
                            "step '{}' reads ${}.output, but '{}' has not completed",
                            step.id, source, source
                        )))
                    }
                },
                None => Some(render(raw, ctx)?),
            },
        };

        let body = match step.body() {
            Some(StepBody::Exec(command)) => PreparedBody::Exec(render(command, ctx)?),
            Some(StepBody::Prompt(prompt)) => PreparedBody::Prompt(render(prompt, ctx)?),
            None => {
                return Err(StepError::Template(format!(
                    "step '{}' needs exactly one of exec or prompt",
                    step.id
                )))
            }
        };

        Ok((body, input))
    }

    async fn suspend(
        &self,
        mut execution: PipelineExecution,
        pipeline: &PipelineDefinition,
        step: &PipelineStep,
        mut record: StepExecution,
        output: String,
    ) -> PipelineResult<PipelineExecution> {
        let approval_token = Uuid::new_v4().to_string();
        record.output = Some(output);
        record.approval_token = Some(approval_token.clone());
        self.store.update_step_execution(&record).await?;

        execution.resume_token = Some(Uuid::new_v4().to_string());
        execution.updated_at = Utc::now();
        self.store.update_execution(&execution).await?;

        info!(
            "Execution {} waiting for approval of step '{}'",
            execution.id, step.id
        );
        let message = step.approval.as_ref().and_then(|a| a.message.as_deref());
        self.notifier
            .notify_approval_pending(&execution, pipeline, &step.id, &approval_token, message)
            .await;
        Ok(execution)
    }

    async fn fail_step(
        &self,
        execution: PipelineExecution,
        pipeline: &PipelineDefinition,
        mut record: StepExecution,
        error: StepError,
    ) -> PipelineResult<PipelineExecution> {
        let message = error.to_string();
        record.status = StepStatus::Failed;
        record.error = Some(message.clone());
        record.completed_at = Some(Utc::now());
        self.store.update_step_execution(&record).await?;
        self.fail(execution, pipeline, &record.step_id, &message).await
    }

    async fn fail(
        &self,
        execution: PipelineExecution,
        pipeline: &PipelineDefinition,
        step_id: &str,
        error: &str,
    ) -> PipelineResult<PipelineExecution> {
        warn!("Pipeline '{}' failed at step '{}': {}", pipeline.name, step_id, error);
        let execution = self
            .store
            .update_execution_status(&execution.id, ExecutionStatus::Failed)
            .await?;
        let error = format!("Step '{}' failed: {}", step_id, error);
        self.notifier.notify_failure(&execution, pipeline, &error).await;
        Ok(execution)
    }

    async fn step_for_token(&self, approval_token: &str) -> PipelineResult<StepExecution> {
        self.store
            .get_step_by_approval_token(approval_token)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("approval token {}", approval_token)))
    }

    /// Mark the gated step completed. Approving twice is a no-op.
    pub async fn approve(&self, approval_token: &str, approved_by: &str) -> PipelineResult<StepExecution> {
        let found = self.step_for_token(approval_token).await?;
        let _guard = self.locks.lock(&found.execution_id).await;
        let mut step = self.step_for_token(approval_token).await?;

        if step.status == StepStatus::Completed && step.approved_at.is_some() {
            return Ok(step);
        }
        if !step.awaiting_approval() {
            return Err(PipelineError::Validation(format!(
                "step '{}' is not awaiting approval (status {})",
                step.step_id, step.status
            )));
        }

        let now = Utc::now();
        step.status = StepStatus::Completed;
        step.approved_by = Some(approved_by.to_string());
        step.approved_at = Some(now);
        step.completed_at = Some(now);
        self.store.update_step_execution(&step).await?;

        info!("Step '{}' of {} approved by {}", step.step_id, step.execution_id, approved_by);
        Ok(step)
    }

    /// Fail the gated step and cancel its execution.
    pub async fn reject(&self, approval_token: &str, rejected_by: &str) -> PipelineResult<PipelineExecution> {
        let found = self.step_for_token(approval_token).await?;
        let _guard = self.locks.lock(&found.execution_id).await;
        let mut step = self.step_for_token(approval_token).await?;

        let execution = self
            .store
            .get_execution(&step.execution_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("execution {}", step.execution_id)))?;

        if step.status == StepStatus::Failed && execution.status == ExecutionStatus::Cancelled {
            return Ok(execution);
        }
        if !step.awaiting_approval() {
            return Err(PipelineError::Validation(format!(
                "step '{}' is not awaiting approval (status {})",
                step.step_id, step.status
            )));
        }

        let error = format!("Rejected by {}", rejected_by);
        step.status = StepStatus::Failed;
        step.error = Some(error.clone());
        step.completed_at = Some(Utc::now());
        self.store.update_step_execution(&step).await?;

        let execution = self
            .store
            .update_execution_status(&execution.id, ExecutionStatus::Cancelled)
            .await?;
        info!("Execution {} cancelled: step '{}' {}", execution.id, step.step_id, error.to_lowercase());

        let pipeline = self.pipeline(&execution.pipeline_name).await?;
        self.notifier
            .notify_failure(&execution, &pipeline, &format!("Step '{}' {}", step.step_id, error.to_lowercase()))
            .await;
        Ok(execution)
    }

    /// Continue the execution holding `resume_token`.
    pub async fn resume(&self, resume_token: &str) -> PipelineResult<PipelineExecution> {
        let execution = self
            .store
            .get_execution_by_resume_token(resume_token)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("resume token {}", resume_token)))?;
        let pipeline = self.pipeline(&execution.pipeline_name).await?;
        self.execute(&pipeline, Map::new(), &execution.project_id, Some(&execution.id))
            .await
    }

    /// Approve the gated step, then continue its execution.
    pub async fn approve_and_resume(
        &self,
        approval_token: &str,
        approved_by: &str,
    ) -> PipelineResult<PipelineExecution> {
        let step = self.approve(approval_token, approved_by).await?;
        let execution = self
            .store
            .get_execution(&step.execution_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("execution {}", step.execution_id)))?;
        let pipeline = self.pipeline(&execution.pipeline_name).await?;
        self.execute(&pipeline, Map::new(), &execution.project_id, Some(&execution.id))
            .await
    }

    pub async fn get_execution_with_steps(
        &self,
        execution_id: &str,
    ) -> PipelineResult<(PipelineExecution, Vec<StepExecution>)> {
        let execution = self
            .store
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("execution {}", execution_id)))?;
        let steps = self.store.list_step_executions(execution_id).await?;
        Ok((execution, steps))
    }

    pub async fn list_executions(
        &self,
        project_id: Option<&str>,
        status: Option<ExecutionStatus>,
        limit: usize,
    ) -> PipelineResult<Vec<PipelineExecution>> {
        Ok(self.store.list_executions(project_id, status, limit).await?)
    }
}

fn render(template: &str, ctx: &EvalContext) -> StepResult<String> {
    render_template(template, ctx).map_err(|e| StepError::Template(e.to_string()))
}

/// `inputs.*` and bare input names, plus `steps.<id>.output|status`.
fn step_context(inputs: &Map<String, Value>, steps: &Map<String, Value>) -> EvalContext {
    let mut ctx = EvalContext::new();
    for (name, value) in inputs {
        ctx.set(name, value.clone());
    }
    ctx.set_nested("inputs", Value::Object(inputs.clone()));
    ctx.set_nested("steps", Value::Object(steps.clone()));
    ctx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definitions::FileDefinitionLoader;
    use crate::state_store::SqliteStateStore;
    use crate::traits::NoopNotifier;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Echoes the command (and any input) instead of spawning processes.
    #[derive(Default)]
    struct ScriptedRunner {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl StepRunner for ScriptedRunner {
        async fn run_exec(&self, command: &str, input: Option<&str>, _timeout: Duration) -> StepResult<String> {
            self.calls.lock().push(command.to_string());
            if command == "fail" {
                return Err(StepError::NonZeroExit {
                    code: 1,
                    stderr: "boom".to_string(),
                });
            }
            Ok(match input {
                Some(input) => format!("{}|{}", command, input),
                None => command.to_string(),
            })
        }

        async fn run_prompt(&self, prompt: &str, _input: Option<&str>, _timeout: Duration) -> StepResult<String> {
            Ok(format!("llm:{}", prompt))
        }
    }

    async fn executor() -> (PipelineExecutor, Arc<ScriptedRunner>) {
        let store = Arc::new(SqliteStateStore::in_memory().await.unwrap());
        let runner = Arc::new(ScriptedRunner::default());
        let executor = PipelineExecutor::new(
            store,
            Arc::new(FileDefinitionLoader::in_memory()),
            runner.clone(),
            Arc::new(NoopNotifier),
        );
        (executor, runner)
    }

    fn pipeline(yaml: &str) -> PipelineDefinition {
        PipelineDefinition::from_yaml(yaml).unwrap()
    }

    #[tokio::test]
    async fn test_condition_false_skips_step() {
        let (executor, runner) = executor().await;
        let def = pipeline(
            r#"
name: cond
inputs:
  deploy: { type: boolean, default: false }
steps:
  - id: build
    exec: make
  - id: ship
    exec: deploy
    condition: "inputs.deploy"
"#,
        );
        let exec = executor.execute(&def, Map::new(), "proj", None).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert_eq!(*runner.calls.lock(), vec!["make".to_string()]);

        let (_, steps) = executor.get_execution_with_steps(&exec.id).await.unwrap();
        assert_eq!(steps[1].status, StepStatus::Skipped);
        assert_eq!(exec.outputs(), json!({ "build": "make" }));
    }

    #[tokio::test]
    async fn test_templates_render_inputs() {
        let (executor, runner) = executor().await;
        let def = pipeline(
            r#"
name: greet
inputs:
  who: { type: string }
steps:
  - id: hello
    exec: "echo {{ inputs.who }}"
"#,
        );
        let mut inputs = Map::new();
        inputs.insert("who".to_string(), json!("world"));
        executor.execute(&def, inputs, "proj", None).await.unwrap();
        assert_eq!(*runner.calls.lock(), vec!["echo world".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_input_creates_nothing() {
        let (executor, _) = executor().await;
        let def = pipeline(
            r#"
name: needs
inputs:
  target: { type: string }
steps:
  - id: a
    exec: ls
"#,
        );
        let err = executor.execute(&def, Map::new(), "proj", None).await.unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
        assert!(executor.list_executions(None, None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_step_failure_stops_pipeline() {
        let (executor, runner) = executor().await;
        let def = pipeline("name: f\nsteps:\n  - { id: a, exec: fail }\n  - { id: b, exec: never }\n");
        let exec = executor.execute(&def, Map::new(), "proj", None).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert!(exec.completed_at.is_some());
        assert_eq!(runner.calls.lock().len(), 1);

        let (_, steps) = executor.get_execution_with_steps(&exec.id).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert!(steps[0].error.as_deref().unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn test_prompt_step_uses_prompt_runner() {
        let (executor, _) = executor().await;
        let def = pipeline("name: p\nsteps:\n  - { id: ask, prompt: summarize }\n");
        let exec = executor.execute(&def, Map::new(), "proj", None).await.unwrap();
        assert_eq!(exec.outputs(), json!({ "ask": "llm:summarize" }));
    }

    #[tokio::test]
    async fn test_rerunning_terminal_execution_is_noop() {
        let (executor, runner) = executor().await;
        let def = pipeline("name: once\nsteps:\n  - { id: a, exec: ls }\n");
        let exec = executor.execute(&def, Map::new(), "proj", None).await.unwrap();
        let again = executor
            .execute(&def, Map::new(), "proj", Some(&exec.id))
            .await
            .unwrap();
        assert_eq!(again.status, ExecutionStatus::Completed);
        assert_eq!(runner.calls.lock().len(), 1);
    }
}
