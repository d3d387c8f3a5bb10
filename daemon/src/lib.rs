/// Gantry daemon: JSON-RPC 2.0 and REST front end for the control plane
/// Serves workflow tools, pipeline runs and approval links over HTTP
pub mod config;
pub mod errors;
pub mod handlers;
pub mod metrics;
pub mod rpc;
pub mod server;
pub mod types;

// Re-export commonly used types
pub use config::{DaemonConfig, ServerConfig};
pub use errors::{DaemonError, DaemonResult};
pub use handlers::RpcHandlers;
pub use metrics::MetricsCollector;
pub use rpc::JsonRpcServer;
pub use server::{handle_http_request, GantryServer, ServerState};
pub use types::{RpcError, RpcRequest, RpcResponse};

/// Daemon version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
