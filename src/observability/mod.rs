//! Observability module for metrics and tracing.
//!
//! Provides OpenTelemetry integration for pipeline/step execution metrics,
//! distributed tracing, and operational visibility.

use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use std::sync::OnceLock;
use std::time::Instant;

/// Global metrics instance.
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Orchestrator metrics for pipeline runs, steps, tokens and cost.
pub struct Metrics {
    /// Total pipeline runs started.
    pub pipeline_runs_started: Counter<u64>,
    /// Total pipeline runs that completed with every step terminal-success.
    pub pipeline_runs_completed: Counter<u64>,
    /// Total pipeline runs halted by a fatal step error or exceeded budget.
    pub pipeline_runs_halted: Counter<u64>,
    /// Steps completed by terminal status (completed/failed/stopped), by agent key.
    pub steps_total: Counter<u64>,
    /// Step duration in seconds, by agent key.
    pub step_duration_seconds: Histogram<f64>,
    /// Total input+output tokens recorded, by provider/model.
    pub tokens_total: Counter<u64>,
    /// Total estimated cost in USD, by provider/model.
    pub cost_usd_total: Counter<u64>,
    /// Remediation cycles run.
    pub remediation_cycles: Counter<u64>,
}

impl Metrics {
    /// Create metrics from a meter.
    pub fn new(meter: &Meter) -> Self {
        Self {
            pipeline_runs_started: meter
                .u64_counter("swarmforge_pipeline_runs_started_total")
                .with_description("Total number of pipeline runs started")
                .with_unit("runs")
                .build(),
            pipeline_runs_completed: meter
                .u64_counter("swarmforge_pipeline_runs_completed_total")
                .with_description("Total number of pipeline runs that completed")
                .with_unit("runs")
                .build(),
            pipeline_runs_halted: meter
                .u64_counter("swarmforge_pipeline_runs_halted_total")
                .with_description("Total number of pipeline runs halted by a fatal error")
                .with_unit("runs")
                .build(),
            steps_total: meter
                .u64_counter("swarmforge_steps_total")
                .with_description("Total number of steps by terminal status")
                .with_unit("steps")
                .build(),
            step_duration_seconds: meter
                .f64_histogram("swarmforge_step_duration_seconds")
                .with_description("Duration of a single agent step")
                .with_unit("s")
                .build(),
            tokens_total: meter
                .u64_counter("swarmforge_tokens_total")
                .with_description("Total input+output tokens recorded")
                .with_unit("tokens")
                .build(),
            cost_usd_total: meter
                .u64_counter("swarmforge_cost_usd_micros_total")
                .with_description("Total estimated cost, in micro-USD (1e-6 USD)")
                .with_unit("usd_micros")
                .build(),
            remediation_cycles: meter
                .u64_counter("swarmforge_remediation_cycles_total")
                .with_description("Total number of remediation cycles run")
                .with_unit("cycles")
                .build(),
        }
    }

    /// Record a pipeline run starting.
    pub fn record_pipeline_started(&self) {
        self.pipeline_runs_started.add(1, &[]);
    }

    /// Record a pipeline run reaching a terminal state.
    pub fn record_pipeline_finished(&self, halted: bool) {
        if halted {
            self.pipeline_runs_halted.add(1, &[]);
        } else {
            self.pipeline_runs_completed.add(1, &[]);
        }
    }

    /// Record a step reaching a terminal status.
    pub fn record_step(&self, agent_key: &str, status: &str, duration: f64) {
        let attrs = &[
            KeyValue::new("agent_key", agent_key.to_string()),
            KeyValue::new("status", status.to_string()),
        ];
        self.steps_total.add(1, attrs);
        self.step_duration_seconds.record(duration, attrs);
    }

    /// Record token usage and cost for a finalized token record.
    pub fn record_tokens(&self, provider: &str, model: &str, total_tokens: u64, cost_usd: f64) {
        let attrs = &[
            KeyValue::new("provider", provider.to_string()),
            KeyValue::new("model", model.to_string()),
        ];
        self.tokens_total.add(total_tokens, attrs);
        self.cost_usd_total.add((cost_usd * 1_000_000.0).round() as u64, attrs);
    }

    /// Record a remediation cycle running.
    pub fn record_remediation_cycle(&self) {
        self.remediation_cycles.add(1, &[]);
    }
}

/// Configuration for observability.
#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    /// OTLP endpoint (e.g. "http://localhost:4317").
    pub otlp_endpoint: Option<String>,
    /// Service name for tracing.
    pub service_name: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
            service_name: "swarmforge".to_string(),
        }
    }
}

/// Initialize observability with optional OTLP export.
///
/// If `OTEL_EXPORTER_OTLP_ENDPOINT` is set, metrics are exported to that
/// endpoint. Otherwise metrics are still collected in-process but only
/// surfaced through logs.
pub fn init(config: ObservabilityConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let meter_provider = if let Some(endpoint) = &config.otlp_endpoint {
        use opentelemetry_otlp::WithExportConfig;
        use opentelemetry_sdk::metrics::PeriodicReader;
        use opentelemetry_sdk::runtime;

        let exporter = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()?;

        let reader = PeriodicReader::builder(exporter, runtime::Tokio)
            .with_interval(std::time::Duration::from_secs(30))
            .build();

        SdkMeterProvider::builder().with_reader(reader).build()
    } else {
        tracing::info!("OTEL_EXPORTER_OTLP_ENDPOINT not set, metrics will be logged only");
        SdkMeterProvider::builder().build()
    };

    let meter = meter_provider.meter("swarmforge");
    let metrics = Metrics::new(&meter);

    METRICS
        .set(metrics)
        .map_err(|_| "Metrics already initialized")?;

    tracing::info!(
        otlp_endpoint = ?config.otlp_endpoint,
        "Observability initialized"
    );

    Ok(())
}

/// Get the global metrics instance.
///
/// Returns `None` if `init()` has not been called yet; callers must
/// tolerate this (metrics recording is always best-effort).
pub fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

/// Helper to time a step and record metrics on completion.
pub struct StepTimer {
    agent_key: String,
    start: Instant,
}

impl StepTimer {
    /// Start timing a step.
    pub fn start(agent_key: &str) -> Self {
        Self {
            agent_key: agent_key.to_string(),
            start: Instant::now(),
        }
    }

    /// Record the step reaching a terminal status.
    pub fn finish(self, status: &str) {
        let duration = self.start.elapsed().as_secs_f64();
        if let Some(m) = metrics() {
            m.record_step(&self.agent_key, status, duration);
        }
        tracing::info!(
            agent_key = %self.agent_key,
            status = %status,
            duration_seconds = duration,
            "Step finished"
        );
    }

    /// Get elapsed duration without consuming the timer.
    pub fn elapsed(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}
