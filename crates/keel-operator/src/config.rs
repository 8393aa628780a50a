//! Operator configuration
//!
//! [`OperatorConfig`] is a `clap::Args` struct so an operator binary can
//! flatten it into its own command line; every flag also reads an environment
//! variable for Deployment-style configuration. Logging and export settings
//! live in the flattened [`TelemetryArgs`].

use std::time::Duration;

use clap::Args;
use thiserror::Error;

use keel_common::status::{set_default_status_retry, StatusRetryConfig};
use keel_common::telemetry::{
    init_telemetry, LogFormat, TelemetryConfig, TelemetryError, TelemetryGuard,
};

/// Invalid operator configuration
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A setting that must be positive was zero
    #[error("{field} must be greater than zero")]
    Zero {
        /// Offending flag
        field: &'static str,
    },

    /// Requeue base delay larger than the cap
    #[error("requeue base delay ({base:?}) exceeds max delay ({max:?})")]
    RequeueRange {
        /// Configured base delay
        base: Duration,
        /// Configured cap
        max: Duration,
    },
}

/// Logging and OTLP export settings
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct TelemetryArgs {
    /// Service name reported on traces and metrics
    #[arg(long, env = "KEEL_SERVICE_NAME", default_value = "keel")]
    pub service_name: String,

    /// Log filter directives; overrides RUST_LOG
    #[arg(long, env = "KEEL_LOG_FILTER")]
    pub log_filter: Option<String>,

    /// Log line format: json or text
    #[arg(long, env = "KEEL_LOG_FORMAT", default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,

    /// OTLP collector endpoint; export is off when unset
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,

    /// Interval between OTLP metric pushes in seconds
    #[arg(long, env = "KEEL_METRICS_INTERVAL_SECS", default_value_t = 30)]
    pub metrics_interval_secs: u64,
}

impl Default for TelemetryArgs {
    fn default() -> Self {
        Self {
            service_name: "keel".to_string(),
            log_filter: None,
            log_format: LogFormat::Json,
            otlp_endpoint: None,
            metrics_interval_secs: 30,
        }
    }
}

impl TelemetryArgs {
    /// Settings for [`init_telemetry`]
    pub fn telemetry_config(&self) -> TelemetryConfig {
        TelemetryConfig {
            service_name: self.service_name.clone(),
            otlp_endpoint: self.otlp_endpoint.clone(),
            log_filter: self.log_filter.clone(),
            log_format: self.log_format,
            metrics_interval: Duration::from_secs(self.metrics_interval_secs),
        }
    }
}

/// Dispatch loop and status persistence settings
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct OperatorConfig {
    /// Number of concurrent workers pulling from the queue
    #[arg(long, env = "KEEL_WORKER_THREADS", default_value_t = 4)]
    pub worker_threads: usize,

    /// Default handler timeout in seconds, used when a handler sets none
    #[arg(long, env = "KEEL_HANDLER_TIMEOUT_SECS", default_value_t = 300)]
    pub handler_timeout_secs: u64,

    /// Attempts for a status get-mutate-update cycle
    #[arg(long, env = "KEEL_STATUS_RETRY_COUNT", default_value_t = 25)]
    pub status_retry_count: u32,

    /// Delay between status update attempts in milliseconds
    #[arg(long, env = "KEEL_STATUS_RETRY_DELAY_MS", default_value_t = 1000)]
    pub status_retry_delay_ms: u64,

    /// Timeout of each status get or update call in seconds
    #[arg(long, env = "KEEL_STATUS_UPDATE_TIMEOUT_SECS", default_value_t = 5)]
    pub status_update_timeout_secs: u64,

    /// First requeue delay after a failure in milliseconds
    #[arg(long, env = "KEEL_REQUEUE_BASE_DELAY_MS", default_value_t = 5)]
    pub requeue_base_delay_ms: u64,

    /// Cap on the requeue delay in seconds
    #[arg(long, env = "KEEL_REQUEUE_MAX_DELAY_SECS", default_value_t = 1000)]
    pub requeue_max_delay_secs: u64,

    /// Delay between pre-start hook attempts in seconds
    #[arg(long, env = "KEEL_PRESTART_RETRY_DELAY_SECS", default_value_t = 1)]
    pub prestart_retry_delay_secs: u64,

    /// Logging and export
    #[command(flatten)]
    pub telemetry: TelemetryArgs,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            handler_timeout_secs: 300,
            status_retry_count: 25,
            status_retry_delay_ms: 1000,
            status_update_timeout_secs: 5,
            requeue_base_delay_ms: 5,
            requeue_max_delay_secs: 1000,
            prestart_retry_delay_secs: 1,
            telemetry: TelemetryArgs::default(),
        }
    }
}

impl OperatorConfig {
    /// Reject settings the dispatch loop cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("worker_threads", self.worker_threads as u64),
            ("handler_timeout_secs", self.handler_timeout_secs),
            ("status_retry_count", self.status_retry_count as u64),
            ("status_update_timeout_secs", self.status_update_timeout_secs),
            ("requeue_max_delay_secs", self.requeue_max_delay_secs),
            ("metrics_interval_secs", self.telemetry.metrics_interval_secs),
        ];
        if let Some((field, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Zero { field });
        }

        if self.requeue_base_delay() > self.requeue_max_delay() {
            return Err(ConfigError::RequeueRange {
                base: self.requeue_base_delay(),
                max: self.requeue_max_delay(),
            });
        }
        Ok(())
    }

    /// Install the process-wide status retry defaults.
    ///
    /// Called by `Operator::new`.
    pub fn apply_globals(&self) {
        set_default_status_retry(self.status_retry());
    }

    /// Install logging and, with an endpoint, OTLP export.
    ///
    /// Call once from `main` before building the operator.
    pub fn init_telemetry(&self) -> Result<TelemetryGuard, TelemetryError> {
        init_telemetry(self.telemetry.telemetry_config())
    }

    /// Status retry settings derived from this config
    pub fn status_retry(&self) -> StatusRetryConfig {
        StatusRetryConfig {
            retry_count: self.status_retry_count,
            retry_delay: Duration::from_millis(self.status_retry_delay_ms),
            update_timeout: Duration::from_secs(self.status_update_timeout_secs),
        }
    }

    /// Timeout for handlers that do not set their own
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler_timeout_secs)
    }

    /// First requeue delay
    pub fn requeue_base_delay(&self) -> Duration {
        Duration::from_millis(self.requeue_base_delay_ms)
    }

    /// Requeue delay cap
    pub fn requeue_max_delay(&self) -> Duration {
        Duration::from_secs(self.requeue_max_delay_secs)
    }

    /// Wait between pre-start hook attempts
    pub fn prestart_retry_delay(&self) -> Duration {
        Duration::from_secs(self.prestart_retry_delay_secs)
    }
}
