/// Type definitions for the Gantry daemon
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// JSON-RPC 2.0 Request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub id: Option<Value>,
}

impl RpcRequest {
    pub fn new(method: &str, params: Value, id: Value) -> Self {
        RpcRequest {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params: Some(params),
            id: Some(id),
        }
    }
}

/// JSON-RPC 2.0 Response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: Option<Value>,
}

/// JSON-RPC 2.0 Error
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcResponse {
    /// Create a successful response
    pub fn success(result: Value, id: Option<Value>) -> Self {
        RpcResponse {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    /// Create an error response
    pub fn error(code: i64, message: String, id: Option<Value>) -> Self {
        RpcResponse {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(RpcError {
                code,
                message,
                data: None,
            }),
            id,
        }
    }
}

/// `workflow.request_transition`
#[derive(Debug, Clone, Deserialize)]
pub struct TransitionParams {
    pub session_id: String,
    pub to_step: String,
}

/// `workflow.set_variable`
#[derive(Debug, Clone, Deserialize)]
pub struct SetVariableParams {
    pub session_id: String,
    pub name: String,
    pub value: Value,
    #[serde(default)]
    pub workflow: Option<String>,
}

/// `workflow.get_variable`; all variables when `name` is absent
#[derive(Debug, Clone, Deserialize)]
pub struct GetVariableParams {
    pub session_id: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// `workflow.activate`
#[derive(Debug, Clone, Deserialize)]
pub struct ActivateParams {
    pub session_id: String,
    pub workflow: String,
    #[serde(default)]
    pub step: Option<String>,
    #[serde(default)]
    pub variables: Map<String, Value>,
    #[serde(default)]
    pub force: bool,
}

/// `workflow.end` and `workflow.state`
#[derive(Debug, Clone, Deserialize)]
pub struct SessionParams {
    pub session_id: String,
}

/// `pipeline.run`
#[derive(Debug, Clone, Deserialize)]
pub struct RunPipelineParams {
    pub name: String,
    #[serde(default)]
    pub inputs: Map<String, Value>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Continue this execution instead of starting a new one
    #[serde(default)]
    pub execution_id: Option<String>,
    /// Resume the suspended execution holding this token
    #[serde(default)]
    pub resume_token: Option<String>,
}

/// `pipeline.get`
#[derive(Debug, Clone, Deserialize)]
pub struct GetExecutionParams {
    pub execution_id: String,
}

/// `pipeline.list`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListExecutionsParams {
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// `pipeline.approve` and `pipeline.reject`
#[derive(Debug, Clone, Deserialize)]
pub struct ApprovalParams {
    pub token: String,
    #[serde(default)]
    pub by: Option<String>,
    /// Approve only; continue the execution afterwards
    #[serde(default = "default_resume")]
    pub resume: bool,
}

fn default_resume() -> bool {
    true
}

/// `pipeline.import_legacy`
#[derive(Debug, Clone, Deserialize)]
pub struct ImportLegacyParams {
    pub source: String,
    /// Make the converted pipeline runnable by name
    #[serde(default)]
    pub register: bool,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
}
