/// HTTP server: JSON-RPC endpoint plus approval REST routes
use crate::config::DaemonConfig;
use crate::errors::{DaemonError, DaemonResult};
use crate::handlers::RpcHandlers;
use crate::metrics::MetricsCollector;
use crate::rpc::{JsonRpcServer, METHODS};
use crate::types::*;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use url::form_urlencoded;

/// Shared by every connection
pub struct ServerState {
    rpc: Arc<JsonRpcServer>,
    metrics: Arc<MetricsCollector>,
    request_timeout: Duration,
    enable_metrics: bool,
}

impl ServerState {
    pub fn new(
        handlers: Arc<RpcHandlers>,
        metrics: Arc<MetricsCollector>,
        config: &DaemonConfig,
    ) -> Self {
        ServerState {
            rpc: Arc::new(JsonRpcServer::new(handlers, metrics.clone())),
            metrics,
            request_timeout: Duration::from_secs(config.server.request_timeout_secs),
            enable_metrics: config.server.enable_metrics,
        }
    }
}

/// Gantry HTTP server
pub struct GantryServer {
    config: DaemonConfig,
    state: Arc<ServerState>,
}

impl GantryServer {
    /// Open the store and definitions named by `config`
    pub async fn new(config: DaemonConfig) -> DaemonResult<Self> {
        config.validate()?;

        let metrics = Arc::new(MetricsCollector::new()?);
        let handlers = Arc::new(RpcHandlers::from_config(&config, metrics.clone()).await?);
        let state = Arc::new(ServerState::new(handlers, metrics, &config));

        Ok(GantryServer { config, state })
    }

    pub fn state(&self) -> Arc<ServerState> {
        self.state.clone()
    }

    /// Serve until `shutdown` resolves
    pub async fn run_until<F>(&self, shutdown: F) -> DaemonResult<()>
    where
        F: Future<Output = ()>,
    {
        let addr: std::net::SocketAddr = self
            .config
            .bind_addr()
            .parse()
            .map_err(|e| DaemonError::ServerError(format!("Invalid address: {}", e)))?;

        let state = self.state.clone();
        let make_svc = make_service_fn(move |_conn| {
            let state = state.clone();
            async move {
                Ok::<_, hyper::Error>(service_fn(move |req| {
                    let state = state.clone();
                    handle_http_request(req, state)
                }))
            }
        });

        let server = Server::try_bind(&addr)
            .map_err(|e| DaemonError::ServerError(format!("Failed to bind {}: {}", addr, e)))?
            .serve(make_svc);

        info!("Gantry daemon listening on http://{}", addr);

        server
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| DaemonError::ServerError(format!("HTTP server error: {}", e)))
    }
}

fn respond(status: StatusCode, content_type: &'static str, body: String) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn json_response(status: StatusCode, body: &Value) -> Response<Body> {
    respond(status, "application/json", body.to_string())
}

fn error_response(err: &DaemonError) -> Response<Body> {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    json_response(status, &json!({ "error": err.to_string() }))
}

fn parse_error(message: String) -> String {
    json!({
        "jsonrpc": "2.0",
        "error": { "code": -32700, "message": message },
        "id": Value::Null
    })
    .to_string()
}

/// Decoded `by=<name>` from the query string
fn actor_from_query(query: Option<&str>) -> Option<String> {
    form_urlencoded::parse(query?.as_bytes())
        .find(|(key, _)| key == "by")
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}

/// Approval tokens are generated UUIDs; anything else is never echoed back
fn is_token(candidate: &str) -> bool {
    !candidate.is_empty()
        && candidate
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Page behind a webhook link. Opening it changes nothing; the button
/// posts the decision back to the same URL.
fn confirmation_page(decision: &str, token: &str, by: Option<&str>) -> String {
    // Relative to /api/pipelines/{decision}/, so path prefixes survive a proxy
    let mut action = token.to_string();
    if let Some(by) = by {
        action.push('?');
        action.push_str(
            &form_urlencoded::Serializer::new(String::new())
                .append_pair("by", by)
                .finish(),
        );
    }
    format!(
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>Gantry {decision}</title></head>\n\
         <body><p>Confirm {decision} for approval token <code>{token}</code>.</p>\n\
         <form method=\"post\" action=\"{action}\"><button type=\"submit\">{decision}</button></form>\n\
         </body></html>\n"
    )
}

/// Route one HTTP request
pub async fn handle_http_request(
    req: Request<Body>,
    state: Arc<ServerState>,
) -> Result<Response<Body>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    let response = match (&method, segments.as_slice()) {
        (&Method::POST, ["rpc"]) => {
            let body = match tokio::time::timeout(
                state.request_timeout,
                hyper::body::to_bytes(req.into_body()),
            )
            .await
            {
                Ok(body) => body?,
                Err(_) => {
                    warn!("Timed out reading request body");
                    return Ok(respond(
                        StatusCode::REQUEST_TIMEOUT,
                        "text/plain",
                        "Request timeout".to_string(),
                    ));
                }
            };
            respond(StatusCode::OK, "application/json", handle_rpc_body(&body, &state).await)
        }
        (&Method::GET, []) => json_response(
            StatusCode::OK,
            &json!({
                "name": "Gantry daemon",
                "version": crate::VERSION,
                "methods": METHODS,
            }),
        ),
        (&Method::GET, ["health"]) => {
            match state.rpc.handlers().handle_system_health(Value::Null).await {
                Ok(body) => json_response(StatusCode::OK, &body),
                Err(e) => error_response(&e),
            }
        }
        (&Method::GET, ["metrics"]) if state.enable_metrics => match state.metrics.gather_metrics() {
            Ok(body) => respond(StatusCode::OK, "text/plain; version=0.0.4", body),
            Err(e) => {
                error!("Failed to gather metrics: {:?}", e);
                error_response(&e)
            }
        },
        (&Method::GET, ["api", "pipelines", decision @ ("approve" | "reject"), token]) => {
            if is_token(token) {
                let by = actor_from_query(req.uri().query());
                respond(
                    StatusCode::OK,
                    "text/html; charset=utf-8",
                    confirmation_page(decision, token, by.as_deref()),
                )
            } else {
                respond(StatusCode::NOT_FOUND, "text/plain", "Not found".to_string())
            }
        }
        (&Method::POST, ["api", "pipelines", decision @ ("approve" | "reject"), token]) => {
            let by = actor_from_query(req.uri().query()).unwrap_or_else(|| "webhook".to_string());
            let handlers = state.rpc.handlers();
            let result = if *decision == "approve" {
                handlers.approve(token, &by, true).await
            } else {
                handlers.reject(token, &by).await
            };
            match result {
                Ok(body) => json_response(StatusCode::OK, &body),
                Err(e) => {
                    warn!("Pipeline {} via HTTP failed: {}", decision, e);
                    error_response(&e)
                }
            }
        }
        (&Method::GET, ["api", "pipelines", "executions", id]) => {
            match state.rpc.handlers().execution_with_steps(id).await {
                Ok(body) => json_response(StatusCode::OK, &body),
                Err(e) => error_response(&e),
            }
        }
        (_, ["rpc"]) | (_, ["api", "pipelines", "approve" | "reject", _]) => respond(
            StatusCode::METHOD_NOT_ALLOWED,
            "text/plain",
            "Method not allowed".to_string(),
        ),
        _ => respond(StatusCode::NOT_FOUND, "text/plain", "Not found".to_string()),
    };

    Ok(response)
}

/// A single request or a batch
async fn handle_rpc_body(body: &[u8], state: &ServerState) -> String {
    let fallback = || {
        json!({
            "jsonrpc": "2.0",
            "error": { "code": -32603, "message": "Internal server error" },
            "id": Value::Null
        })
        .to_string()
    };

    match serde_json::from_slice::<RpcRequest>(body) {
        Ok(request) => {
            let response = state.rpc.process_request(request).await;
            serde_json::to_string(&response).unwrap_or_else(|_| fallback())
        }
        Err(_) => match serde_json::from_slice::<Vec<RpcRequest>>(body) {
            Ok(requests) => {
                let responses = state.rpc.process_batch(requests).await;
                serde_json::to_string(&responses).unwrap_or_else(|_| fallback())
            }
            Err(e) => parse_error(format!("Parse error: {}", e)),
        },
    }
}
