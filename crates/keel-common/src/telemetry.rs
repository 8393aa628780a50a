//! Logging and OpenTelemetry export for keel operators
//!
//! [`init_telemetry`] installs the global `tracing` subscriber once per
//! process: an [`EnvFilter`], one formatting layer ([`LogFormat`]) and, when
//! an OTLP endpoint is configured, a trace layer plus a periodic metrics push
//! for the instruments in [`crate::metrics`]. The returned
//! [`TelemetryGuard`] flushes both exporters on shutdown.
//!
//! ```ignore
//! let telemetry = init_telemetry(TelemetryConfig::for_service("route-operator"))?;
//! operator.start(shutdown).await?;
//! telemetry.shutdown();
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::{runtime, Resource};
use thiserror::Error;
use tracing::warn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Filter used when neither an explicit filter nor `RUST_LOG` is set
pub const DEFAULT_FILTER: &str = "info,keel=debug,kube=info,tower=warn,hyper=warn";

/// Push interval for OTLP metrics when none is configured
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(30);

/// Errors that can occur during telemetry initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Failed to initialize OpenTelemetry tracer
    #[error("failed to initialize tracer: {0}")]
    TracerInit(String),

    /// Failed to initialize OTLP metrics exporter
    #[error("failed to initialize metrics exporter: {0}")]
    MetricsInit(String),

    /// Failed to initialize tracing subscriber
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),

    /// Log filter directive did not parse
    #[error("invalid log filter {filter:?}: {reason}")]
    InvalidFilter {
        /// Directive as given
        filter: String,
        /// Parser message
        reason: String,
    },

    /// Unknown log format name
    #[error("unknown log format {0:?}, expected \"json\" or \"text\"")]
    UnknownLogFormat(String),
}

/// Shape of log lines on stdout
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per event with the current span, for log collectors
    #[default]
    Json,
    /// Human-readable lines, for local runs
    Text,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Json => "json",
            Self::Text => "text",
        })
    }
}

impl FromStr for LogFormat {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "text" | "plain" => Ok(Self::Text),
            _ => Err(TelemetryError::UnknownLogFormat(s.to_string())),
        }
    }
}

/// Configuration for telemetry initialization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Service name for traces and metrics (e.g., "route-operator")
    pub service_name: String,

    /// OTLP endpoint for trace and metric export (e.g., "http://otel-collector:4317").
    /// If None, nothing is exported and logs go to stdout only
    pub otlp_endpoint: Option<String>,

    /// Filter directives; overrides `RUST_LOG` when set
    pub log_filter: Option<String>,

    /// Log line format
    pub log_format: LogFormat,

    /// How often metrics are pushed to the OTLP endpoint
    pub metrics_interval: Duration,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "keel".to_string(),
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
            log_filter: None,
            log_format: LogFormat::default(),
            metrics_interval: DEFAULT_METRICS_INTERVAL,
        }
    }
}

impl TelemetryConfig {
    /// Config for a named operator, endpoint taken from the environment
    pub fn for_service(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    /// Resolve the log filter: explicit directives, then `RUST_LOG`, then
    /// [`DEFAULT_FILTER`]
    pub fn env_filter(&self) -> Result<EnvFilter, TelemetryError> {
        match &self.log_filter {
            Some(filter) => {
                EnvFilter::try_new(filter).map_err(|e| TelemetryError::InvalidFilter {
                    filter: filter.clone(),
                    reason: e.to_string(),
                })
            }
            None => Ok(EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))),
        }
    }
}

/// Exporters installed by [`init_telemetry`]
#[must_use = "dropping the guard without shutdown loses buffered spans and metrics"]
#[derive(Debug, Default)]
pub struct TelemetryGuard {
    tracer: Option<TracerProvider>,
    meter: Option<SdkMeterProvider>,
}

impl TelemetryGuard {
    /// Whether OTLP export is active
    pub fn is_exporting(&self) -> bool {
        self.tracer.is_some() || self.meter.is_some()
    }

    /// Flush and stop the exporters
    pub fn shutdown(self) {
        if let Some(tracer) = self.tracer {
            if let Err(e) = tracer.shutdown() {
                warn!(error = %e, "Failed to flush traces");
            }
        }
        if let Some(meter) = self.meter {
            if let Err(e) = meter.shutdown() {
                warn!(error = %e, "Failed to flush metrics");
            }
        }
    }
}

/// Install the global subscriber and, with an endpoint, the OTLP exporters.
///
/// Fails with [`TelemetryError::SubscriberInit`] if a subscriber is already
/// installed. Must run inside a Tokio runtime when exporting.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let env_filter = config.env_filter()?;

    global::set_text_map_propagator(TraceContextPropagator::new());

    let mut guard = TelemetryGuard::default();
    // Option<Layer> implements Layer, so absent layers compose as no-ops
    let otel_layer = match &config.otlp_endpoint {
        Some(endpoint) => {
            let resource = build_resource(&config.service_name);
            guard.meter = Some(init_otlp_metrics(
                endpoint,
                resource.clone(),
                config.metrics_interval,
            )?);
            let provider = init_otlp_tracer(endpoint, resource)?;
            let tracer = provider.tracer(config.service_name.clone());
            guard.tracer = Some(provider);
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    let json_layer = (config.log_format == LogFormat::Json).then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .with_file(false)
            .with_line_number(false)
    });
    let text_layer = (config.log_format == LogFormat::Text)
        .then(|| tracing_subscriber::fmt::layer().with_target(true));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(text_layer)
        .with(otel_layer)
        .try_init()
        .map_err(|e: tracing_subscriber::util::TryInitError| {
            TelemetryError::SubscriberInit(e.to_string())
        })?;

    Ok(guard)
}

/// Resource attributes: service identity plus the pod's downward-API env
fn build_resource(service_name: &str) -> Resource {
    let mut attributes = vec![
        KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_NAME,
            service_name.to_string(),
        ),
        KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
            env!("CARGO_PKG_VERSION"),
        ),
    ];
    for (var, key) in [
        ("POD_NAME", "k8s.pod.name"),
        ("POD_NAMESPACE", "k8s.namespace.name"),
        ("NODE_NAME", "k8s.node.name"),
    ] {
        if let Ok(value) = std::env::var(var) {
            attributes.push(KeyValue::new(key, value));
        }
    }
    Resource::new(attributes)
}

fn init_otlp_tracer(endpoint: &str, resource: Resource) -> Result<TracerProvider, TelemetryError> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::TracerInit(e.to_string()))?;

    let provider = TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_resource(resource)
        .build();
    global::set_tracer_provider(provider.clone());
    Ok(provider)
}

fn init_otlp_metrics(
    endpoint: &str,
    resource: Resource,
    interval: Duration,
) -> Result<SdkMeterProvider, TelemetryError> {
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;

    let reader = PeriodicReader::builder(exporter, runtime::Tokio)
        .with_interval(interval)
        .build();
    let provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(resource)
        .build();
    global::set_meter_provider(provider.clone());
    Ok(provider)
}
