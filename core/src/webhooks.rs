//! Webhook delivery for pipeline lifecycle events.
//!
//! Delivery never fails from the caller's point of view: transport errors
//! and non-2xx responses are logged, retried when the endpoint carries a
//! retry policy, and otherwise dropped.

use crate::pipeline::definition::{PipelineDefinition, WebhookEndpoint};
use crate::pipeline::execution::PipelineExecution;
use crate::traits::PipelineNotifier;
use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default public address used to build approve/reject links.
pub const DEFAULT_BASE_URL: &str = "http://localhost:7777";

fn env_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").ok())
        .as_ref()
}

/// Replace `${VAR}` with the variable's value. Unset variables stay verbatim.
pub fn expand_env_vars(value: &str) -> String {
    let Some(pattern) = env_pattern() else {
        return value.to_string();
    };
    pattern
        .replace_all(value, |caps: &regex::Captures<'_>| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}

/// What happened to one notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryOutcome {
    pub delivered: bool,
    pub attempts: u32,
    /// Status of the last response, if any arrived
    pub status: Option<u16>,
    pub error: Option<String>,
}

pub fn approval_pending_payload(
    execution: &PipelineExecution,
    pipeline: &PipelineDefinition,
    step_id: &str,
    token: &str,
    message: Option<&str>,
    base_url: &str,
) -> Value {
    let base = base_url.trim_end_matches('/');
    json!({
        "event": "approval_pending",
        "execution_id": execution.id,
        "pipeline_name": pipeline.name,
        "step_id": step_id,
        "token": token,
        "message": message,
        "approve_url": format!("{}/api/pipelines/approve/{}", base, token),
        "reject_url": format!("{}/api/pipelines/reject/{}", base, token),
    })
}

pub fn complete_payload(execution: &PipelineExecution, pipeline: &PipelineDefinition) -> Value {
    json!({
        "event": "complete",
        "execution_id": execution.id,
        "pipeline_name": pipeline.name,
        "status": execution.status.as_str(),
        "outputs": execution.outputs(),
    })
}

pub fn failure_payload(
    execution: &PipelineExecution,
    pipeline: &PipelineDefinition,
    error: &str,
) -> Value {
    json!({
        "event": "failure",
        "execution_id": execution.id,
        "pipeline_name": pipeline.name,
        "status": execution.status.as_str(),
        "error": error,
    })
}

#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    base_url: String,
    user_agent: String,
}

impl Default for WebhookNotifier {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL)
    }
}

impl WebhookNotifier {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.to_string(),
            user_agent: format!("gantry/{}", crate::VERSION),
        }
    }

    pub fn with_user_agent(mut self, user_agent: &str) -> Self {
        self.user_agent = user_agent.to_string();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn attempt(&self, endpoint: &WebhookEndpoint, payload: &Value) -> Result<u16, String> {
        let method = reqwest::Method::from_bytes(endpoint.method.to_uppercase().as_bytes())
            .map_err(|e| format!("invalid method '{}': {}", endpoint.method, e))?;

        let mut request = self
            .client
            .request(method, &endpoint.url)
            .timeout(Duration::from_secs(endpoint.timeout_secs))
            .header(reqwest::header::USER_AGENT, &self.user_agent)
            .json(payload);
        for (name, value) in &endpoint.headers {
            request = request.header(name.as_str(), expand_env_vars(value));
        }

        let response = request.send().await.map_err(|e| e.to_string())?;
        Ok(response.status().as_u16())
    }

    /// Send `payload` to `endpoint`, retrying per its policy.
    pub async fn deliver(&self, endpoint: &WebhookEndpoint, payload: &Value) -> DeliveryOutcome {
        let max_attempts = endpoint
            .retry
            .as_ref()
            .map(|r| r.max_attempts.max(1))
            .unwrap_or(1);
        let mut outcome = DeliveryOutcome {
            delivered: false,
            attempts: 0,
            status: None,
            error: None,
        };

        for attempt in 1..=max_attempts {
            outcome.attempts = attempt;
            let retryable = match self.attempt(endpoint, payload).await {
                Ok(status) if (200..300).contains(&status) => {
                    outcome.delivered = true;
                    outcome.status = Some(status);
                    outcome.error = None;
                    debug!("Webhook {} accepted with {}", endpoint.url, status);
                    return outcome;
                }
                Ok(status) => {
                    outcome.status = Some(status);
                    outcome.error = Some(format!("HTTP {}", status));
                    endpoint
                        .retry
                        .as_ref()
                        .map(|r| r.should_retry_status(status))
                        .unwrap_or(false)
                }
                Err(e) => {
                    outcome.status = None;
                    outcome.error = Some(e);
                    true
                }
            };

            warn!(
                "Webhook {} attempt {}/{} failed: {}",
                endpoint.url,
                attempt,
                max_attempts,
                outcome.error.as_deref().unwrap_or_default()
            );

            if !retryable || attempt == max_attempts {
                break;
            }
            if let Some(policy) = &endpoint.retry {
                tokio::time::sleep(policy.backoff_for_attempt(attempt)).await;
            }
        }

        outcome
    }

    async fn send(&self, kind: &str, endpoint: Option<&WebhookEndpoint>, payload: Value) {
        let Some(endpoint) = endpoint else {
            debug!("No {} webhook configured", kind);
            return;
        };
        let outcome = self.deliver(endpoint, &payload).await;
        if outcome.delivered {
            info!("Delivered {} webhook to {}", kind, endpoint.url);
        } else {
            warn!(
                "Dropped {} webhook to {} after {} attempt(s)",
                kind, endpoint.url, outcome.attempts
            );
        }
    }
}

#[async_trait]
impl PipelineNotifier for WebhookNotifier {
    async fn notify_approval_pending(
        &self,
        execution: &PipelineExecution,
        pipeline: &PipelineDefinition,
        step_id: &str,
        approval_token: &str,
        message: Option<&str>,
    ) {
        let payload = approval_pending_payload(
            execution,
            pipeline,
            step_id,
            approval_token,
            message,
            &self.base_url,
        );
        self.send(
            "approval_pending",
            pipeline.webhooks.on_approval_pending.as_ref(),
            payload,
        )
        .await;
    }

    async fn notify_complete(&self, execution: &PipelineExecution, pipeline: &PipelineDefinition) {
        let payload = complete_payload(execution, pipeline);
        self.send("complete", pipeline.webhooks.on_complete.as_ref(), payload)
            .await;
    }

    async fn notify_failure(
        &self,
        execution: &PipelineExecution,
        pipeline: &PipelineDefinition,
        error: &str,
    ) {
        let payload = failure_payload(execution, pipeline, error);
        self.send("failure", pipeline.webhooks.on_failure.as_ref(), payload)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::definition::RetryPolicy;
    use serde_json::Map;

    fn fixtures() -> (PipelineExecution, PipelineDefinition) {
        let pipeline = PipelineDefinition::from_yaml("name: deploy\nsteps:\n  - { id: a, exec: ls }\n").unwrap();
        let execution = PipelineExecution::new("deploy", "proj", &Map::new());
        (execution, pipeline)
    }

    #[test]
    fn test_env_expansion() {
        std::env::set_var("GANTRY_WEBHOOK_TEST_TOKEN", "s3cret");
        assert_eq!(
            expand_env_vars("Bearer ${GANTRY_WEBHOOK_TEST_TOKEN}"),
            "Bearer s3cret"
        );
        assert_eq!(
            expand_env_vars("${GANTRY_WEBHOOK_TEST_UNSET_VAR}"),
            "${GANTRY_WEBHOOK_TEST_UNSET_VAR}"
        );
        assert_eq!(expand_env_vars("$NOT_BRACED"), "$NOT_BRACED");
    }

    #[test]
    fn test_approval_links() {
        let (execution, pipeline) = fixtures();
        let payload = approval_pending_payload(
            &execution,
            &pipeline,
            "a",
            "tok-1",
            Some("ship it?"),
            "https://ci.example.com/",
        );
        assert_eq!(payload["approve_url"], "https://ci.example.com/api/pipelines/approve/tok-1");
        assert_eq!(payload["reject_url"], "https://ci.example.com/api/pipelines/reject/tok-1");
        assert_eq!(payload["message"], "ship it?");
    }

    #[test]
    fn test_complete_payload_parses_outputs() {
        let (mut execution, pipeline) = fixtures();
        execution.outputs_json = Some(r#"{"a":"hello"}"#.to_string());
        let payload = complete_payload(&execution, &pipeline);
        assert_eq!(payload["outputs"]["a"], "hello");
        assert_eq!(payload["status"], "pending");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_swallowed() {
        let notifier = WebhookNotifier::default();
        let mut endpoint = WebhookEndpoint::new("http://127.0.0.1:9/hook");
        endpoint.timeout_secs = 1;
        endpoint.retry = Some(RetryPolicy {
            max_attempts: 2,
            backoff_secs: 0.0,
            retry_on_status: vec![],
        });

        let outcome = notifier.deliver(&endpoint, &json!({})).await;
        assert!(!outcome.delivered);
        assert_eq!(outcome.attempts, 2);
        assert!(outcome.error.is_some());
    }
}
