//! Prometheus metrics.
//!
//! # Standard Metrics
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `remote_hmac_batches_total` | Counter | `outcome` | Batches processed |
//! | `remote_hmac_batch_failures_total` | Counter | `category` | Failed batches by fault |
//! | `remote_hmac_rows_total` | Counter | - | Rows received in decodable batches |
//! | `remote_hmac_batch_duration_seconds` | Histogram | `outcome` | Batch latency |
//! | `remote_hmac_http_responses_total` | Counter | `status` | HTTP responses sent |
//! | `remote_hmac_in_flight_requests` | Gauge | - | Requests being processed |
//!
//! The recorder is installed without its own listener; the server renders
//! it on an internal endpoint through [`render_metrics`].

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::error::TelemetryError;
use crate::TelemetryResult;

/// Global metrics handle for rendering.
static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metrics configuration.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Whether metrics are enabled.
    pub enabled: bool,

    /// Service name, attached as a global `service` label.
    pub service_name: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            service_name: "remote-hmac".to_string(),
        }
    }
}

/// Outcome label of a processed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcomeLabel {
    /// Replies were returned.
    Success,
    /// An `errorMessage` was returned.
    Failure,
}

impl BatchOutcomeLabel {
    /// Label value.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

/// Initializes the metrics subsystem.
///
/// Calling it again after a successful install is a no-op.
///
/// # Errors
///
/// Returns `TelemetryError::MetricsInit` if the recorder cannot be installed.
pub fn init_metrics(config: &MetricsConfig) -> TelemetryResult<()> {
    if !config.enabled || METRICS_HANDLE.get().is_some() {
        return Ok(());
    }

    let handle = PrometheusBuilder::new()
        .add_global_label("service", config.service_name.clone())
        .install_recorder()
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;

    let _ = METRICS_HANDLE.set(handle);

    register_metric_descriptions();

    Ok(())
}

/// Renders metrics in Prometheus text format.
///
/// Returns `None` if metrics are not initialized.
#[must_use]
pub fn render_metrics() -> Option<String> {
    METRICS_HANDLE.get().map(PrometheusHandle::render)
}

fn register_metric_descriptions() {
    describe_counter!(
        "remote_hmac_batches_total",
        "Total number of batches processed, by outcome"
    );
    describe_counter!(
        "remote_hmac_batch_failures_total",
        "Total number of failed batches, by fault category"
    );
    describe_counter!(
        "remote_hmac_rows_total",
        "Total number of rows received in decodable batches"
    );
    describe_histogram!(
        "remote_hmac_batch_duration_seconds",
        "Batch processing duration in seconds"
    );
    describe_counter!(
        "remote_hmac_http_responses_total",
        "Total number of HTTP responses, by status code"
    );
    describe_gauge!(
        "remote_hmac_in_flight_requests",
        "Number of HTTP requests currently being processed"
    );
}

/// Records a processed batch.
///
/// `fault` is the batch fault category when the batch failed.
pub fn record_batch(rows: usize, fault: Option<&'static str>, duration: Duration) {
    let outcome = if fault.is_some() {
        BatchOutcomeLabel::Failure
    } else {
        BatchOutcomeLabel::Success
    };

    counter!("remote_hmac_batches_total", "outcome" => outcome.as_str()).increment(1);
    counter!("remote_hmac_rows_total").increment(rows as u64);
    histogram!("remote_hmac_batch_duration_seconds", "outcome" => outcome.as_str())
        .record(duration.as_secs_f64());

    if let Some(category) = fault {
        counter!("remote_hmac_batch_failures_total", "category" => category).increment(1);
    }
}

/// Records an HTTP response status.
pub fn record_response(status_code: u16) {
    counter!("remote_hmac_http_responses_total", "status" => status_code.to_string()).increment(1);
}

/// Guard that tracks an in-flight request and decrements the gauge on drop.
pub struct InFlightGuard {
    _private: (),
}

impl InFlightGuard {
    /// Creates a new guard and increments the in-flight gauge.
    #[must_use]
    pub fn new() -> Self {
        gauge!("remote_hmac_in_flight_requests").increment(1.0);
        Self { _private: () }
    }
}

impl Default for InFlightGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        gauge!("remote_hmac_in_flight_requests").decrement(1.0);
    }
}
