//! Prometheus Metrics Module
//!
//! Exposes application metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Observations**: Prices emitted by the source and delivered to consumers
//! - **Polling**: Live page poll outcomes and durations
//! - **Subscriptions**: Tracked symbols and attached consumers
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::application::ports::SourceKind;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if the recorder cannot be installed.
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let builder = PrometheusBuilder::new();
            let handle = builder
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            register_metrics();
            handle
        })
        .clone()
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Observation counters
    describe_counter!(
        "ticker_stream_observations_emitted_total",
        "Total prices emitted by the price source"
    );
    describe_counter!(
        "ticker_stream_observations_delivered_total",
        "Total observations pulled by stream consumers"
    );

    // Poll counters
    describe_counter!(
        "ticker_stream_extraction_misses_total",
        "Total live polls that found no parsable price"
    );
    describe_counter!(
        "ticker_stream_poll_errors_total",
        "Total live polls that failed to fetch the page"
    );

    // Subscription gauges
    describe_gauge!(
        "ticker_stream_tracked_symbols",
        "Number of symbols tracked at the price source"
    );
    describe_gauge!(
        "ticker_stream_active_consumers",
        "Number of attached stream consumers"
    );

    // Latency histograms
    describe_histogram!(
        "ticker_stream_poll_duration_seconds",
        "Time to fetch and extract one live page poll"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Metric labels for poll failures.
#[derive(Debug, Clone, Copy)]
pub enum PollErrorKind {
    /// The request could not be sent or timed out.
    Request,
    /// The page answered with a non-success status.
    Status,
    /// The response body could not be read.
    Body,
}

impl PollErrorKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Status => "status",
            Self::Body => "body",
        }
    }
}

/// Record a price emitted by the source.
pub fn record_observation_emitted(source: SourceKind) {
    counter!(
        "ticker_stream_observations_emitted_total",
        "source" => source.as_str()
    )
    .increment(1);
}

/// Record an observation pulled by a stream consumer.
pub fn record_observation_delivered() {
    counter!("ticker_stream_observations_delivered_total").increment(1);
}

/// Record a live poll that found no parsable price.
pub fn record_extraction_miss() {
    counter!("ticker_stream_extraction_misses_total").increment(1);
}

/// Record a live poll that failed to fetch the page.
pub fn record_poll_error(kind: PollErrorKind) {
    counter!(
        "ticker_stream_poll_errors_total",
        "error_type" => kind.as_str()
    )
    .increment(1);
}

/// Record the duration of one live poll.
pub fn record_poll_duration(duration: Duration) {
    histogram!("ticker_stream_poll_duration_seconds").record(duration.as_secs_f64());
}

/// Update the tracked symbol count.
#[allow(clippy::cast_precision_loss)]
pub fn set_tracked_symbols(count: usize) {
    gauge!("ticker_stream_tracked_symbols").set(count as f64);
}

/// Update the attached consumer count.
#[allow(clippy::cast_precision_loss)]
pub fn set_active_consumers(count: usize) {
    gauge!("ticker_stream_active_consumers").set(count as f64);
}

// =============================================================================
// Tests
// =============================================================================
