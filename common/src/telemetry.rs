// Telemetry module for structured logging, metrics, and tracing

use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    trace::{RandomIdGenerator, Sampler, TracerProvider},
    Resource,
};
use std::backtrace::Backtrace;
use std::net::SocketAddr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const SERVICE_NAME: &str = "job-orchestrator";

/// Initialize structured logging with JSON formatting and trace context
///
/// Log levels come from `RUST_LOG` when set, otherwise from `log_level`.
/// When `tracing_endpoint` is given, spans are also exported over OTLP.
pub fn init_logging(log_level: &str, tracing_endpoint: Option<&str>) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to create env filter: {}", e))?;

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_target(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_filter(env_filter);

    let registry = tracing_subscriber::registry().with(json_layer);

    if let Some(endpoint) = tracing_endpoint {
        let tracer = init_tracer(endpoint)?;
        let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        registry
            .with(telemetry_layer)
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    } else {
        registry
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    }

    tracing::info!(
        log_level = log_level,
        tracing_endpoint = tracing_endpoint,
        "Structured logging initialized with JSON formatting"
    );

    Ok(())
}

/// Initialize OpenTelemetry tracer with OTLP exporter
fn init_tracer(endpoint: &str) -> Result<opentelemetry_sdk::trace::Tracer> {
    use opentelemetry_sdk::runtime::Tokio;

    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint)
        .build_span_exporter()
        .map_err(|e| anyhow::anyhow!("Failed to build span exporter: {}", e))?;

    let tracer_provider = TracerProvider::builder()
        .with_batch_exporter(exporter, Tokio)
        .with_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(Sampler::AlwaysOn)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![
                    KeyValue::new("service.name", SERVICE_NAME),
                    KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                ])),
        )
        .build();

    global::set_tracer_provider(tracer_provider.clone());
    let tracer = tracer_provider.tracer(SERVICE_NAME);

    tracing::info!(endpoint = endpoint, "OpenTelemetry tracer initialized");
    Ok(tracer)
}

/// Flush remaining spans on shutdown
pub fn shutdown_tracer() {
    global::shutdown_tracer_provider();
}

/// Route panics through `tracing`, with a captured backtrace
///
/// Loop panics are caught and restarted by the supervisor; this hook makes
/// sure the stack of the original fault ends up in the structured log.
pub fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let backtrace = Backtrace::force_capture();
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_else(|| "unknown".to_string());
        tracing::error!(
            panic = %info,
            location = %location,
            backtrace = %backtrace,
            "Panic captured"
        );
    }));
}

/// Initialize Prometheus metrics exporter and describe the engine metrics
pub fn init_metrics(metrics_port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", metrics_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid metrics port: {}", e))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    describe_counter!("jobs_added_total", "Jobs inserted in the created state");
    describe_counter!("jobs_enqueued_total", "Jobs dispatched and moved to queued");
    describe_counter!(
        "job_enqueue_failures_total",
        "Dispatch attempts that failed and were left created"
    );
    describe_counter!("jobs_timed_out_total", "Jobs reclassified as timed out");
    describe_counter!("jobs_retried_total", "Jobs moved back to created for retry");
    describe_counter!("jobs_cleaned_total", "Rows deleted by the retention policy");
    describe_counter!(
        "scheduler_loop_restarts_total",
        "Control loop restarts after a panic"
    );
    describe_gauge!("jobs_in_flight", "Jobs queued or in progress at the last admission tick");

    tracing::info!(
        metrics_port = metrics_port,
        metrics_endpoint = format!("http://0.0.0.0:{}/metrics", metrics_port),
        "Prometheus metrics exporter initialized"
    );

    Ok(())
}

#[inline]
pub fn record_job_added(kind: &'static str) {
    counter!("jobs_added_total", "kind" => kind).increment(1);
}

#[inline]
pub fn record_jobs_enqueued(kind: &'static str, count: u64) {
    counter!("jobs_enqueued_total", "kind" => kind).increment(count);
}

#[inline]
pub fn record_enqueue_failure(kind: &'static str) {
    counter!("job_enqueue_failures_total", "kind" => kind).increment(1);
}

#[inline]
pub fn record_jobs_timed_out(kind: &'static str, count: u64) {
    counter!("jobs_timed_out_total", "kind" => kind).increment(count);
}

#[inline]
pub fn record_jobs_retried(kind: &'static str, count: u64) {
    counter!("jobs_retried_total", "kind" => kind).increment(count);
}

#[inline]
pub fn record_jobs_cleaned(kind: &'static str, count: u64) {
    counter!("jobs_cleaned_total", "kind" => kind).increment(count);
}

#[inline]
pub fn record_loop_restart(loop_name: &str) {
    counter!("scheduler_loop_restarts_total", "loop" => loop_name.to_string()).increment(1);
}

#[inline]
pub fn update_in_flight(kind: &'static str, in_flight: i64) {
    gauge!("jobs_in_flight", "kind" => kind).set(in_flight as f64);
}
