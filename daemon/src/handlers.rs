/// RPC method handlers over the workflow engine and pipeline executor
use crate::config::DaemonConfig;
use crate::errors::{DaemonError, DaemonResult};
use crate::metrics::MetricsCollector;
use crate::types::*;
use gantry_core::pipeline::import_legacy_pipeline;
use gantry_core::workflow::RawHookEvent;
use gantry_core::{
    Activation, DefinitionLoader, ExecutionRequest, ExecutionStatus, FileDefinitionLoader,
    GantryConfig, PipelineExecution, PipelineExecutor, ProcessStepRunner, SqliteStateStore,
    StateStore, WebhookNotifier, WorkflowEngine,
};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Project id recorded on executions started without one
pub const DEFAULT_PROJECT_ID: &str = "default";

const DEFAULT_LIST_LIMIT: usize = 50;

/// RPC handlers
pub struct RpcHandlers {
    engine: WorkflowEngine,
    executor: PipelineExecutor,
    loader: Arc<FileDefinitionLoader>,
    metrics: Arc<MetricsCollector>,
}

fn parse_params<T: DeserializeOwned>(params: Value) -> DaemonResult<T> {
    serde_json::from_value(params).map_err(|e| DaemonError::InvalidParams(e.to_string()))
}

impl RpcHandlers {
    /// Wire the engine and executor over one store and loader
    pub fn new(
        store: Arc<dyn StateStore>,
        loader: Arc<FileDefinitionLoader>,
        config: &GantryConfig,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let mut runner = ProcessStepRunner::new()
            .with_prompt_command(config.pipelines.prompt_command.clone());
        if let Some(dir) = &config.pipelines.working_dir {
            runner = runner.with_working_dir(dir.clone());
        }
        let notifier = WebhookNotifier::new(&config.pipelines.base_url)
            .with_user_agent(&config.webhooks.user_agent);

        let engine = WorkflowEngine::new(store.clone(), loader.clone());
        let executor = PipelineExecutor::new(
            store,
            loader.clone(),
            Arc::new(runner),
            Arc::new(notifier),
        )
        .with_step_timeout(Duration::from_secs(config.pipelines.default_step_timeout_secs));

        RpcHandlers {
            engine,
            executor,
            loader,
            metrics,
        }
    }

    /// Open the configured database and definition directories
    pub async fn from_config(
        config: &DaemonConfig,
        metrics: Arc<MetricsCollector>,
    ) -> DaemonResult<Self> {
        let mut store = SqliteStateStore::new(&config.core.storage.database_path).await?;
        store.initialize().await?;
        info!(
            "State store ready at {}",
            config.core.storage.database_path.display()
        );

        let definitions = &config.core.definitions;
        let loader = Arc::new(FileDefinitionLoader::new(
            definitions.project_dir.clone(),
            definitions.global_dir.clone(),
        ));
        debug!("Definition search dirs: {:?}", loader.search_dirs());

        Ok(Self::new(Arc::new(store), loader, &config.core, metrics))
    }

    pub fn executor(&self) -> &PipelineExecutor {
        &self.executor
    }

    pub fn loader(&self) -> &Arc<FileDefinitionLoader> {
        &self.loader
    }

    /// Handle workflow.request_transition
    pub async fn handle_request_transition(&self, params: Value) -> DaemonResult<Value> {
        let p: TransitionParams = parse_params(params)?;
        let response = self.engine.request_transition(&p.session_id, &p.to_step).await;
        Ok(serde_json::to_value(response)?)
    }

    /// Handle workflow.set_variable
    pub async fn handle_set_variable(&self, params: Value) -> DaemonResult<Value> {
        let p: SetVariableParams = parse_params(params)?;
        let response = self
            .engine
            .set_variable(&p.session_id, &p.name, p.value, p.workflow.as_deref())
            .await;
        Ok(serde_json::to_value(response)?)
    }

    /// Handle workflow.get_variable
    pub async fn handle_get_variable(&self, params: Value) -> DaemonResult<Value> {
        let p: GetVariableParams = parse_params(params)?;
        let response = self
            .engine
            .get_variable(&p.session_id, p.name.as_deref())
            .await;
        Ok(serde_json::to_value(response)?)
    }

    /// Handle workflow.activate
    pub async fn handle_activate(&self, params: Value) -> DaemonResult<Value> {
        let p: ActivateParams = parse_params(params)?;
        let activation = Activation {
            step: p.step,
            variables: p.variables,
            force: p.force,
        };
        let response = self
            .engine
            .activate_workflow(&p.session_id, &p.workflow, activation)
            .await;
        Ok(serde_json::to_value(response)?)
    }

    /// Handle workflow.end
    pub async fn handle_end(&self, params: Value) -> DaemonResult<Value> {
        let p: SessionParams = parse_params(params)?;
        Ok(serde_json::to_value(self.engine.end_workflow(&p.session_id).await)?)
    }

    /// Handle workflow.state
    pub async fn handle_state(&self, params: Value) -> DaemonResult<Value> {
        let p: SessionParams = parse_params(params)?;
        Ok(serde_json::to_value(self.engine.get_state(&p.session_id).await)?)
    }

    /// Handle workflow.hook
    pub async fn handle_hook(&self, params: Value) -> DaemonResult<Value> {
        let raw: RawHookEvent = parse_params(params)?;
        let name = raw.event.clone();
        let event = raw
            .into_event()
            .ok_or_else(|| DaemonError::InvalidParams(format!("Unknown hook event '{}'", name)))?;

        self.metrics.record_hook_event(event.kind.as_str());
        let response = self.engine.handle_event(&event).await;
        if !response.allow {
            info!(
                "Denied {} for session {}: {}",
                event.kind,
                event.session_id,
                response.reason.as_deref().unwrap_or("")
            );
        }
        Ok(serde_json::to_value(response)?)
    }

    fn record_run(&self, execution: &PipelineExecution) {
        self.metrics.record_pipeline_run(execution.status.as_str());
    }

    /// Handle pipeline.run
    pub async fn handle_pipeline_run(&self, params: Value) -> DaemonResult<Value> {
        let p: RunPipelineParams = parse_params(params)?;

        let execution = match p.resume_token {
            Some(token) => self.executor.resume(&token).await?,
            None => {
                let request = ExecutionRequest {
                    inputs: p.inputs,
                    project_id: p
                        .project_id
                        .unwrap_or_else(|| DEFAULT_PROJECT_ID.to_string()),
                    execution_id: p.execution_id,
                    session_id: p.session_id,
                    parent_execution_id: None,
                };
                self.executor.run(&p.name, request).await?
            }
        };

        self.record_run(&execution);
        Ok(serde_json::to_value(execution)?)
    }

    /// Handle pipeline.get
    pub async fn handle_pipeline_get(&self, params: Value) -> DaemonResult<Value> {
        let p: GetExecutionParams = parse_params(params)?;
        self.execution_with_steps(&p.execution_id).await
    }

    pub async fn execution_with_steps(&self, execution_id: &str) -> DaemonResult<Value> {
        let (execution, steps) = self.executor.get_execution_with_steps(execution_id).await?;
        Ok(json!({
            "execution": execution,
            "steps": steps,
        }))
    }

    /// Handle pipeline.list
    pub async fn handle_pipeline_list(&self, params: Value) -> DaemonResult<Value> {
        let p: ListExecutionsParams = parse_params(params)?;
        let status = p
            .status
            .as_deref()
            .map(str::parse::<ExecutionStatus>)
            .transpose()
            .map_err(DaemonError::InvalidParams)?;

        let executions = self
            .executor
            .list_executions(
                p.project_id.as_deref(),
                status,
                p.limit.unwrap_or(DEFAULT_LIST_LIMIT),
            )
            .await?;
        Ok(json!({
            "count": executions.len(),
            "executions": executions,
        }))
    }

    /// Approve the gated step; continue the execution unless `resume` is false
    pub async fn approve(&self, token: &str, by: &str, resume: bool) -> DaemonResult<Value> {
        if resume {
            let execution = self.executor.approve_and_resume(token, by).await?;
            self.metrics.record_approval("approved");
            self.record_run(&execution);
            Ok(json!({ "execution": execution }))
        } else {
            let step = self.executor.approve(token, by).await?;
            self.metrics.record_approval("approved");
            Ok(json!({ "step": step }))
        }
    }

    pub async fn reject(&self, token: &str, by: &str) -> DaemonResult<Value> {
        let execution = self.executor.reject(token, by).await?;
        self.metrics.record_approval("rejected");
        self.record_run(&execution);
        Ok(json!({ "execution": execution }))
    }

    /// Handle pipeline.approve
    pub async fn handle_pipeline_approve(&self, params: Value) -> DaemonResult<Value> {
        let p: ApprovalParams = parse_params(params)?;
        let by = p.by.as_deref().unwrap_or("rpc");
        self.approve(&p.token, by, p.resume).await
    }

    /// Handle pipeline.reject
    pub async fn handle_pipeline_reject(&self, params: Value) -> DaemonResult<Value> {
        let p: ApprovalParams = parse_params(params)?;
        let by = p.by.as_deref().unwrap_or("rpc");
        self.reject(&p.token, by).await
    }

    /// Handle pipeline.import_legacy
    pub async fn handle_import_legacy(&self, params: Value) -> DaemonResult<Value> {
        let p: ImportLegacyParams = parse_params(params)?;
        let definition = import_legacy_pipeline(&p.source)?;

        if p.register {
            self.loader.register_pipeline(definition.clone())?;
            info!("Registered imported pipeline '{}'", definition.name);
        }
        Ok(json!({
            "registered": p.register,
            "pipeline": definition,
        }))
    }

    /// Handle definitions.reload
    pub async fn handle_definitions_reload(&self, _params: Value) -> DaemonResult<Value> {
        self.loader.clear_cache();
        info!("Definition cache cleared");
        Ok(json!({ "reloaded": true }))
    }

    /// Handle system.health
    pub async fn handle_system_health(&self, _params: Value) -> DaemonResult<Value> {
        let response = HealthResponse {
            status: "healthy".to_string(),
            version: crate::VERSION.to_string(),
            uptime_secs: self.metrics.uptime_secs(),
        };
        Ok(serde_json::to_value(response)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::PipelineDefinition;

    async fn handlers() -> RpcHandlers {
        let store = SqliteStateStore::in_memory().await.unwrap();
        let loader = Arc::new(FileDefinitionLoader::in_memory());
        loader
            .register_pipeline(
                PipelineDefinition::from_yaml("name: hello\nsteps:\n  - { id: a, exec: echo hi }\n")
                    .unwrap(),
            )
            .unwrap();
        RpcHandlers::new(
            Arc::new(store),
            loader,
            &GantryConfig::default(),
            Arc::new(MetricsCollector::new().unwrap()),
        )
    }

    #[tokio::test]
    async fn test_missing_field_is_invalid_params() {
        let handlers = handlers().await;
        let err = handlers
            .handle_request_transition(json!({"session_id": "s1"}))
            .await
            .unwrap_err();
        assert!(matches!(err, DaemonError::InvalidParams(_)));
    }

    #[tokio::test]
    async fn test_unknown_hook_event() {
        let handlers = handlers().await;
        let err = handlers
            .handle_hook(json!({"event": "lunch_break", "session_id": "s1"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("lunch_break"));
    }

    #[tokio::test]
    async fn test_run_records_metrics() {
        let handlers = handlers().await;
        let result = handlers
            .handle_pipeline_run(json!({"name": "hello"}))
            .await
            .unwrap();
        assert_eq!(result["status"], "completed");
        assert_eq!(result["project_id"], DEFAULT_PROJECT_ID);
        assert_eq!(
            handlers
                .metrics
                .pipeline_runs
                .with_label_values(&["completed"])
                .get(),
            1.0
        );
    }

    #[tokio::test]
    async fn test_list_rejects_unknown_status() {
        let handlers = handlers().await;
        let err = handlers
            .handle_pipeline_list(json!({"status": "sleeping"}))
            .await
            .unwrap_err();
        assert!(matches!(err, DaemonError::InvalidParams(_)));
    }
}
