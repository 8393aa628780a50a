//! Metrics registry for Keel observability
//!
//! Provides OpenTelemetry metrics for:
//! - Work item dispatch (processed, failed, dropped)
//! - Handler latency by outcome
//! - Status persistence conflicts

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;

use crate::error::ErrorKind;

/// Global meter for Keel metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("keel"));

// ============================================================================
// Dispatch Metrics
// ============================================================================

/// Counter of work items handed to a handler
///
/// Labels:
/// - `handler`: handler name
pub static ITEMS_PROCESSED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("keel_items_processed_total")
        .with_description("Total number of work items dispatched to a handler")
        .with_unit("{items}")
        .build()
});

/// Counter of handler failures that led to a requeue
///
/// Labels:
/// - `handler`: handler name
/// - `error_kind`: temporary, deadline, failure, panic
pub static ITEMS_FAILED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("keel_items_failed_total")
        .with_description("Total number of failed work item dispatches")
        .with_unit("{items}")
        .build()
});

/// Counter of work items no handler accepted
pub static ITEMS_DROPPED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("keel_items_dropped_total")
        .with_description("Total number of work items dropped without a handler")
        .with_unit("{items}")
        .build()
});

/// Histogram of handler execution time
///
/// Labels:
/// - `handler`: handler name
/// - `result`: success, error
pub static HANDLE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("keel_handle_duration_seconds")
        .with_description("Duration of handler invocations in seconds")
        .with_unit("s")
        .build()
});

// ============================================================================
// Status Persistence Metrics
// ============================================================================

/// Counter of failed status attempts (get, update or timeout), retried or abandoned
pub static STATUS_UPDATE_RETRIES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("keel_status_update_retries_total")
        .with_description("Total number of failed status update attempts")
        .with_unit("{attempts}")
        .build()
});

// ============================================================================
// Metric Recording Helpers
// ============================================================================

/// Label value used for failures caused by a handler panic
pub const PANIC_LABEL: &str = "panic";

/// Time one handler invocation
pub struct HandleTimer {
    handler: String,
    start: std::time::Instant,
}

impl HandleTimer {
    /// Start timing an invocation and count it as processed
    pub fn start(handler: impl Into<String>) -> Self {
        let handler = handler.into();
        ITEMS_PROCESSED.add(1, &[KeyValue::new("handler", handler.clone())]);
        Self {
            handler,
            start: std::time::Instant::now(),
        }
    }

    /// Record successful completion, including benign stop and reconcile signals
    pub fn success(self) {
        HANDLE_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[
                KeyValue::new("handler", self.handler),
                KeyValue::new("result", "success"),
            ],
        );
    }

    /// Record a failure that will be retried
    pub fn error(self, error_kind: &str) {
        HANDLE_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[
                KeyValue::new("handler", self.handler.clone()),
                KeyValue::new("result", "error"),
            ],
        );
        ITEMS_FAILED.add(
            1,
            &[
                KeyValue::new("handler", self.handler),
                KeyValue::new("error_kind", error_kind.to_string()),
            ],
        );
    }

    /// Record a failure classified by error kind
    pub fn error_kind(self, kind: ErrorKind) {
        self.error(kind.as_str())
    }
}

/// Count a failure outside a timed handler call, such as a panic while routing
pub fn record_item_failed(handler: &str, error_kind: &str) {
    ITEMS_FAILED.add(
        1,
        &[
            KeyValue::new("handler", handler.to_string()),
            KeyValue::new("error_kind", error_kind.to_string()),
        ],
    );
}

/// Count a work item no handler accepted
pub fn record_item_dropped() {
    ITEMS_DROPPED.add(1, &[]);
}

/// Count one failed status attempt, whether the get, the update or a timeout failed
pub fn record_status_retry() {
    STATUS_UPDATE_RETRIES.add(1, &[]);
}
