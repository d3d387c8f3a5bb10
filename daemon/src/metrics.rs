//! Prometheus counters for the daemon, served as text on `/metrics`
use crate::errors::{DaemonError, DaemonResult};
use prometheus::core::Collector;
use prometheus::{Counter, CounterVec, Encoder, Histogram, HistogramOpts, Opts, Registry, TextEncoder};
use std::time::Instant;

pub struct MetricsCollector {
    registry: Registry,
    started: Instant,

    pub request_total: Counter,
    pub request_duration: Histogram,
    pub request_errors: Counter,

    /// Runs and resumes, labelled by the status they ended in
    pub pipeline_runs: CounterVec,
    pub approvals: CounterVec,
    pub hook_events: CounterVec,
}

/// Register `collector` and hand back a handle to it
fn register<C>(registry: &Registry, collector: C) -> DaemonResult<C>
where
    C: Collector + Clone + 'static,
{
    registry.register(Box::new(collector.clone()))?;
    Ok(collector)
}

fn labelled(name: &str, help: &str, label: &str) -> DaemonResult<CounterVec> {
    Ok(CounterVec::new(Opts::new(name, help), &[label])?)
}

impl MetricsCollector {
    pub fn new() -> DaemonResult<Self> {
        let registry = Registry::new();
        let request_total = register(
            &registry,
            Counter::new("gantry_requests_total", "JSON-RPC requests handled")?,
        )?;
        let request_errors = register(
            &registry,
            Counter::new(
                "gantry_request_errors_total",
                "JSON-RPC requests answered with an error",
            )?,
        )?;
        let request_duration = register(
            &registry,
            Histogram::with_opts(HistogramOpts::new(
                "gantry_request_duration_seconds",
                "Time spent dispatching one JSON-RPC request",
            ))?,
        )?;

        let pipeline_runs = register(
            &registry,
            labelled("gantry_pipeline_runs_total", "Pipeline runs by resulting status", "status")?,
        )?;
        let approvals = register(
            &registry,
            labelled("gantry_approvals_total", "Approval decisions", "decision")?,
        )?;
        let hook_events = register(
            &registry,
            labelled("gantry_hook_events_total", "Hook events by kind", "event")?,
        )?;

        Ok(Self {
            registry,
            started: Instant::now(),
            request_total,
            request_duration,
            request_errors,
            pipeline_runs,
            approvals,
            hook_events,
        })
    }

    pub fn record_request(&self, duration_secs: f64) {
        self.request_total.inc();
        self.request_duration.observe(duration_secs);
    }

    pub fn record_error(&self) {
        self.request_errors.inc();
    }

    pub fn record_pipeline_run(&self, status: &str) {
        self.pipeline_runs.with_label_values(&[status]).inc();
    }

    /// `decision` is "approved" or "rejected"
    pub fn record_approval(&self, decision: &str) {
        self.approvals.with_label_values(&[decision]).inc();
    }

    pub fn record_hook_event(&self, event: &str) {
        self.hook_events.with_label_values(&[event]).inc();
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    /// Text exposition format
    pub fn gather_metrics(&self) -> DaemonResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| DaemonError::MetricsError(e.to_string()))
    }
}
