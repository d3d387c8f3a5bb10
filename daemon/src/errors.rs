/// Error types for the Gantry daemon
use gantry_core::{ConfigError, DefinitionError, PipelineError, StateStoreError};
use serde_json::json;
use thiserror::Error;

/// Result type for daemon operations
pub type DaemonResult<T> = Result<T, DaemonError>;

/// Daemon error types
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// RPC method not found
    #[error("Method not found: {0}")]
    MethodNotFound(String),

    /// Malformed JSON-RPC envelope
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Missing or ill-typed method parameters
    #[error("Invalid params: {0}")]
    InvalidParams(String),

    /// Server error
    #[error("Server error: {0}")]
    ServerError(String),

    /// Execution, token or definition not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Pipeline request rejected or failed to start
    #[error("Pipeline error: {0}")]
    PipelineError(String),

    /// Definition could not be loaded or parsed
    #[error("Definition error: {0}")]
    DefinitionError(String),

    /// State store failure
    #[error("State error: {0}")]
    StateError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Metrics error
    #[error("Metrics error: {0}")]
    MetricsError(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl DaemonError {
    /// Convert to JSON-RPC error object
    pub fn to_rpc_error(&self) -> serde_json::Value {
        json!({
            "code": self.code(),
            "message": self.to_string()
        })
    }

    /// Get the error code for this error
    pub fn code(&self) -> i64 {
        match self {
            DaemonError::ConfigError(_) => -32600,
            DaemonError::MethodNotFound(_) => -32601,
            DaemonError::InvalidRequest(_) => -32600,
            DaemonError::InvalidParams(_) => -32602,
            DaemonError::ServerError(_) => -32603,
            DaemonError::NotFound(_) => -32002,
            DaemonError::PipelineError(_) => -32005,
            DaemonError::DefinitionError(_) => -32004,
            DaemonError::StateError(_) => -32006,
            DaemonError::SerializationError(_) => -32700,
            DaemonError::MetricsError(_) => -32008,
            DaemonError::IoError(_) => -32603,
        }
    }

    /// HTTP status used by the REST endpoints
    pub fn http_status(&self) -> u16 {
        match self {
            DaemonError::NotFound(_) => 404,
            DaemonError::InvalidParams(_)
            | DaemonError::InvalidRequest(_)
            | DaemonError::PipelineError(_) => 400,
            DaemonError::MethodNotFound(_) => 405,
            _ => 500,
        }
    }
}

impl From<serde_json::Error> for DaemonError {
    fn from(err: serde_json::Error) -> Self {
        DaemonError::SerializationError(err.to_string())
    }
}

impl From<prometheus::Error> for DaemonError {
    fn from(err: prometheus::Error) -> Self {
        DaemonError::MetricsError(err.to_string())
    }
}

impl From<ConfigError> for DaemonError {
    fn from(err: ConfigError) -> Self {
        DaemonError::ConfigError(err.to_string())
    }
}

impl From<StateStoreError> for DaemonError {
    fn from(err: StateStoreError) -> Self {
        match err {
            StateStoreError::NotFound(what) => DaemonError::NotFound(what),
            other => DaemonError::StateError(other.to_string()),
        }
    }
}

impl From<DefinitionError> for DaemonError {
    fn from(err: DefinitionError) -> Self {
        match err {
            DefinitionError::NotFound(name) => DaemonError::NotFound(name),
            other => DaemonError::DefinitionError(other.to_string()),
        }
    }
}

impl From<PipelineError> for DaemonError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::NotFound(what) => DaemonError::NotFound(what),
            PipelineError::Validation(msg) => DaemonError::PipelineError(msg),
            PipelineError::Store(e) => e.into(),
            PipelineError::Definition(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(DaemonError::MethodNotFound("x".to_string()).code(), -32601);
        assert_eq!(DaemonError::InvalidParams("x".to_string()).code(), -32602);

        let rpc = DaemonError::NotFound("execution 1".to_string()).to_rpc_error();
        assert_eq!(rpc["code"], -32002);
        assert_eq!(rpc["message"], "Not found: execution 1");
    }

    #[test]
    fn test_pipeline_error_mapping() {
        let err: DaemonError = PipelineError::NotFound("approval token t".to_string()).into();
        assert!(matches!(err, DaemonError::NotFound(_)));
        assert_eq!(err.http_status(), 404);

        let err: DaemonError = PipelineError::Validation("missing input".to_string()).into();
        assert_eq!(err.http_status(), 400);
    }
}
