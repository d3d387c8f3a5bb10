/// Webhook delivery against a local HTTP receiver
use gantry_core::pipeline::{
    PipelineDefinition, PipelineExecutor, ProcessStepRunner, RetryPolicy, WebhookEndpoint,
};
use gantry_core::{ExecutionStatus, FileDefinitionLoader, SqliteStateStore, WebhookNotifier};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::Arc;

#[derive(Debug, Clone)]
struct Received {
    method: String,
    path: String,
    authorization: Option<String>,
    body: Value,
}

struct Receiver {
    url: String,
    received: Arc<Mutex<Vec<Received>>>,
}

impl Receiver {
    fn received(&self) -> Vec<Received> {
        self.received.lock().clone()
    }
}

/// Start a receiver answering with `statuses` in order, then 200.
fn spawn_receiver(statuses: Vec<u16>) -> Receiver {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let addr = listener.local_addr().unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    let queue = Arc::new(Mutex::new(VecDeque::from(statuses)));

    let log = received.clone();
    let make_svc = make_service_fn(move |_conn| {
        let log = log.clone();
        let queue = queue.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let log = log.clone();
                let queue = queue.clone();
                async move {
                    let method = req.method().to_string();
                    let path = req.uri().path().to_string();
                    let authorization = req
                        .headers()
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    let bytes = hyper::body::to_bytes(req.into_body()).await.unwrap();
                    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
                    log.lock().push(Received {
                        method,
                        path,
                        authorization,
                        body,
                    });

                    let status = queue.lock().pop_front().unwrap_or(200);
                    Ok::<_, Infallible>(
                        Response::builder()
                            .status(status)
                            .body(Body::empty())
                            .unwrap(),
                    )
                }
            }))
        }
    });

    let server = Server::from_tcp(listener).unwrap().serve(make_svc);
    tokio::spawn(server);

    Receiver {
        url: format!("http://{}", addr),
        received,
    }
}

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        backoff_secs: 0.01,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_retries_retryable_status_until_success() {
    let receiver = spawn_receiver(vec![503, 502]);
    let mut endpoint = WebhookEndpoint::new(&format!("{}/hook", receiver.url));
    endpoint.retry = Some(fast_retry(3));

    let outcome = WebhookNotifier::default()
        .deliver(&endpoint, &json!({"event": "complete"}))
        .await;
    assert!(outcome.delivered);
    assert_eq!(outcome.attempts, 3);
    assert_eq!(outcome.status, Some(200));
    assert_eq!(receiver.received().len(), 3);
}

#[tokio::test]
async fn test_without_policy_delivers_once() {
    let receiver = spawn_receiver(vec![503]);
    let endpoint = WebhookEndpoint::new(&format!("{}/hook", receiver.url));

    let outcome = WebhookNotifier::default().deliver(&endpoint, &json!({})).await;
    assert!(!outcome.delivered);
    assert_eq!(outcome.attempts, 1);
    assert_eq!(outcome.status, Some(503));
    assert_eq!(receiver.received().len(), 1);
}

#[tokio::test]
async fn test_non_retryable_status_stops_immediately() {
    let receiver = spawn_receiver(vec![400]);
    let mut endpoint = WebhookEndpoint::new(&format!("{}/hook", receiver.url));
    endpoint.retry = Some(fast_retry(5));

    let outcome = WebhookNotifier::default().deliver(&endpoint, &json!({})).await;
    assert!(!outcome.delivered);
    assert_eq!(outcome.attempts, 1);
}

#[tokio::test]
async fn test_attempts_capped_by_policy() {
    let receiver = spawn_receiver(vec![500, 500, 500, 500]);
    let mut endpoint = WebhookEndpoint::new(&format!("{}/hook", receiver.url));
    endpoint.retry = Some(fast_retry(2));

    let outcome = WebhookNotifier::default().deliver(&endpoint, &json!({})).await;
    assert!(!outcome.delivered);
    assert_eq!(outcome.attempts, 2);
    assert_eq!(receiver.received().len(), 2);
}

#[tokio::test]
async fn test_method_and_env_headers() {
    std::env::set_var("GANTRY_IT_WEBHOOK_SECRET", "hunter2");
    let receiver = spawn_receiver(vec![]);
    let mut endpoint = WebhookEndpoint::new(&format!("{}/notify", receiver.url));
    endpoint.method = "put".to_string();
    endpoint.headers.insert(
        "Authorization".to_string(),
        "Bearer ${GANTRY_IT_WEBHOOK_SECRET}".to_string(),
    );

    let outcome = WebhookNotifier::default()
        .deliver(&endpoint, &json!({"ok": true}))
        .await;
    assert!(outcome.delivered);

    let received = receiver.received();
    assert_eq!(received[0].method, "PUT");
    assert_eq!(received[0].path, "/notify");
    assert_eq!(received[0].authorization.as_deref(), Some("Bearer hunter2"));
    assert_eq!(received[0].body, json!({"ok": true}));
}

async fn executor_for(source: &str, base_url: &str) -> PipelineExecutor {
    let loader = FileDefinitionLoader::in_memory();
    loader
        .register_pipeline(PipelineDefinition::from_yaml(source).unwrap())
        .unwrap();
    PipelineExecutor::new(
        Arc::new(SqliteStateStore::in_memory().await.unwrap()),
        Arc::new(loader),
        Arc::new(ProcessStepRunner::new()),
        Arc::new(WebhookNotifier::new(base_url)),
    )
}

#[tokio::test]
async fn test_pipeline_lifecycle_webhooks() {
    let receiver = spawn_receiver(vec![]);
    let source = format!(
        r#"
name: release
steps:
  - id: build
    exec: echo hello
  - id: publish
    exec: echo published
    approval:
      required: true
      message: Publish?
webhooks:
  on_approval_pending:
    url: {url}/pending
  on_complete:
    url: {url}/complete
"#,
        url = receiver.url
    );
    let executor = executor_for(&source, "https://gantry.example.com").await;

    let paused = executor.run("release", Default::default()).await.unwrap();
    let pending = receiver.received();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].path, "/pending");
    let payload = &pending[0].body;
    assert_eq!(payload["execution_id"], json!(paused.id));
    assert_eq!(payload["pipeline_name"], "release");
    assert_eq!(payload["step_id"], "publish");
    assert_eq!(payload["message"], "Publish?");
    let token = payload["token"].as_str().unwrap().to_string();
    assert_eq!(
        payload["approve_url"],
        json!(format!("https://gantry.example.com/api/pipelines/approve/{}", token))
    );

    let finished = executor.approve_and_resume(&token, "ops").await.unwrap();
    assert_eq!(finished.status, ExecutionStatus::Completed);

    let received = receiver.received();
    assert_eq!(received.len(), 2);
    let complete = &received[1].body;
    assert_eq!(complete["status"], "completed");
    assert_eq!(complete["outputs"], json!({"build": "hello", "publish": "published"}));
}

#[tokio::test]
async fn test_failed_delivery_does_not_affect_execution() {
    let receiver = spawn_receiver(vec![500]);
    let source = format!(
        "name: flaky\nsteps:\n  - {{ id: a, exec: 'exit 1' }}\nwebhooks:\n  on_failure:\n    url: {}/failure\n",
        receiver.url
    );
    let executor = executor_for(&source, "http://localhost:7777").await;

    let execution = executor.run("flaky", Default::default()).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);

    let received = receiver.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].body["status"], "failed");
    assert!(received[0].body["error"].as_str().unwrap().contains("'a'"));
}
