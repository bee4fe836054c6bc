//! Tracing subscriber setup, with optional OTLP export.
//!
//! Events always go to stderr so stdout stays free for command output.
//! With an OTLP endpoint, review spans and the `review-lease` meter are
//! exported as well.
//!
//! The library never installs a subscriber itself. Only the binary calls
//! [`init_telemetry`]; library users bring their own.

pub mod metrics;
pub mod review;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig as _;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use crate::error::{Error, Result};

const SCOPE: &str = "review-lease";

pub struct TelemetryConfig {
    /// OTLP gRPC endpoint, e.g. "http://localhost:4317". `None` means stderr only.
    pub endpoint: Option<String>,
    pub service_name: String,
    /// Filter directive used when `RUST_LOG` is unset.
    pub log_level: String,
}

impl TelemetryConfig {
    pub fn new(endpoint: Option<String>, log_level: impl Into<String>) -> Self {
        Self {
            endpoint,
            service_name: SCOPE.to_string(),
            log_level: log_level.into(),
        }
    }
}

/// Keeps the export pipelines alive. Dropping it flushes and shuts them down.
pub struct TelemetryGuard {
    export: Option<Exporters>,
}

struct Exporters {
    tracer: SdkTracerProvider,
    meter: SdkMeterProvider,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(export) = self.export.take() {
            let _ = export.meter.shutdown();
            let _ = export.tracer.shutdown();
        }
    }
}

/// Install the global subscriber. Fails if the log level does not parse,
/// an exporter cannot be built, or a subscriber is already installed.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard> {
    let stderr = tracing_subscriber::registry()
        .with(level_filter(&config.log_level)?)
        .with(tracing_subscriber::fmt::layer().compact().with_writer(std::io::stderr));

    let Some(endpoint) = config.endpoint.as_deref() else {
        stderr.try_init().map_err(subscriber_error)?;
        return Ok(TelemetryGuard { export: None });
    };

    let export = build_exporters(endpoint, &config.service_name)?;
    opentelemetry::global::set_meter_provider(export.meter.clone());
    stderr
        .with(tracing_opentelemetry::layer().with_tracer(export.tracer.tracer(SCOPE)))
        .try_init()
        .map_err(subscriber_error)?;

    Ok(TelemetryGuard { export: Some(export) })
}

fn level_filter(log_level: &str) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(log_level)
            .map_err(|e| Error::Config(format!("invalid log level {log_level:?}: {e}"))),
    }
}

fn build_exporters(endpoint: &str, service_name: &str) -> Result<Exporters> {
    let resource = opentelemetry_sdk::Resource::builder()
        .with_service_name(service_name.to_string())
        .build();

    let spans = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| exporter_error("span", e))?;
    let tracer = SdkTracerProvider::builder()
        .with_batch_exporter(spans)
        .with_resource(resource.clone())
        .build();

    let metrics = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| exporter_error("metric", e))?;
    let meter = SdkMeterProvider::builder()
        .with_periodic_exporter(metrics)
        .with_resource(resource)
        .build();

    Ok(Exporters { tracer, meter })
}

fn exporter_error(signal: &str, e: impl std::fmt::Display) -> Error {
    Error::Other(format!("OTLP {signal} exporter: {e}"))
}

fn subscriber_error(e: impl std::fmt::Display) -> Error {
    Error::Other(format!("tracing subscriber: {e}"))
}
