//! JSON-RPC 2.0 dispatch onto [`RpcHandlers`]
use crate::errors::{DaemonError, DaemonResult};
use crate::handlers::RpcHandlers;
use crate::metrics::MetricsCollector;
use crate::types::*;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

/// Every method `process_request` dispatches
pub const METHODS: &[&str] = &[
    "workflow.request_transition",
    "workflow.set_variable",
    "workflow.get_variable",
    "workflow.activate",
    "workflow.end",
    "workflow.state",
    "workflow.hook",
    "pipeline.run",
    "pipeline.get",
    "pipeline.list",
    "pipeline.approve",
    "pipeline.reject",
    "pipeline.import_legacy",
    "definitions.reload",
    "system.health",
];

/// JSON-RPC Server
pub struct JsonRpcServer {
    handlers: Arc<RpcHandlers>,
    metrics: Arc<MetricsCollector>,
}

fn require(params: Option<Value>) -> DaemonResult<Value> {
    params.ok_or_else(|| DaemonError::InvalidParams("Missing params".to_string()))
}

fn or_empty(params: Option<Value>) -> Value {
    params.unwrap_or_else(|| Value::Object(Default::default()))
}

impl JsonRpcServer {
    pub fn new(handlers: Arc<RpcHandlers>, metrics: Arc<MetricsCollector>) -> Self {
        JsonRpcServer { handlers, metrics }
    }

    pub fn handlers(&self) -> &Arc<RpcHandlers> {
        &self.handlers
    }

    /// Answer one request. Failures become RPC errors carrying the
    /// request's id; they never abort the caller.
    pub async fn process_request(&self, request: RpcRequest) -> RpcResponse {
        let RpcRequest {
            jsonrpc,
            method,
            params,
            id,
        } = request;

        if jsonrpc != "2.0" {
            return RpcResponse::error(-32600, "Invalid Request".to_string(), id);
        }

        let started = Instant::now();
        let outcome = self.dispatch(&method, params).await;
        let elapsed = started.elapsed().as_secs_f64();
        self.metrics.record_request(elapsed);

        match outcome {
            Ok(result) => {
                debug!("{} answered in {:.3}s", method, elapsed);
                RpcResponse::success(result, id)
            }
            Err(e) => {
                self.metrics.record_error();
                if matches!(e, DaemonError::ServerError(_) | DaemonError::StateError(_)) {
                    error!("{} failed: {}", method, e);
                } else {
                    warn!("{} rejected: {}", method, e);
                }
                RpcResponse::error(e.code(), e.to_string(), id)
            }
        }
    }

    async fn dispatch(&self, method: &str, params: Option<Value>) -> DaemonResult<Value> {
        let h = &self.handlers;
        match method {
            "workflow.request_transition" => h.handle_request_transition(require(params)?).await,
            "workflow.set_variable" => h.handle_set_variable(require(params)?).await,
            "workflow.get_variable" => h.handle_get_variable(require(params)?).await,
            "workflow.activate" => h.handle_activate(require(params)?).await,
            "workflow.end" => h.handle_end(require(params)?).await,
            "workflow.state" => h.handle_state(require(params)?).await,
            "workflow.hook" => h.handle_hook(require(params)?).await,
            "pipeline.run" => h.handle_pipeline_run(require(params)?).await,
            "pipeline.get" => h.handle_pipeline_get(require(params)?).await,
            "pipeline.list" => h.handle_pipeline_list(or_empty(params)).await,
            "pipeline.approve" => h.handle_pipeline_approve(require(params)?).await,
            "pipeline.reject" => h.handle_pipeline_reject(require(params)?).await,
            "pipeline.import_legacy" => h.handle_import_legacy(require(params)?).await,
            "definitions.reload" => h.handle_definitions_reload(or_empty(params)).await,
            "system.health" => h.handle_system_health(or_empty(params)).await,
            _ => Err(DaemonError::MethodNotFound(method.to_string())),
        }
    }

    /// Batch members run one after another; responses keep request order
    pub async fn process_batch(&self, requests: Vec<RpcRequest>) -> Vec<RpcResponse> {
        let mut answered = Vec::new();
        for request in requests {
            answered.push(self.process_request(request).await);
        }
        answered
    }
}
