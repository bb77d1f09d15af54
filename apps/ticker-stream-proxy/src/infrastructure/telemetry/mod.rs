//! Logging and Tracing
//!
//! Installs the process-wide `tracing` subscriber: an `EnvFilter` seeded with
//! quiet defaults for the HTTP client and HTML parsing stacks, a fmt layer, and
//! an optional OTLP exporter. Hub operations open spans carrying the raw
//! symbol, and each live poller runs inside a `live_poller{symbol}` span, so a
//! single ticker can be followed from subscribe through every poll.
//!
//! # Environment Variables
//!
//! - `OTEL_ENABLED`: true | 1 | yes | on exports spans (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: http://localhost:4318)
//! - `OTEL_SERVICE_NAME`: Service name for traces (default: ticker-stream-proxy)
//! - `RUST_LOG`: extra filter directives, applied before the defaults below

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::infrastructure::config::parse_flag;

const DEFAULT_SERVICE_NAME: &str = "ticker-stream-proxy";
const DEFAULT_OTLP_ENDPOINT: &str = "http://localhost:4318";

/// Filter defaults: this crate at info, page scraping internals kept quiet.
const DEFAULT_DIRECTIVES: &[&str] = &[
    "ticker_stream_proxy=info",
    "reqwest=warn",
    "hyper=warn",
    "hyper_util=warn",
    "html5ever=error",
    "selectors=warn",
];

/// Where and whether spans are exported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetrySettings {
    /// Export spans over OTLP in addition to local logs.
    pub export_enabled: bool,
    /// OTLP exporter endpoint.
    pub otlp_endpoint: String,
    /// Service name attached to exported spans.
    pub service_name: String,
}

impl TelemetrySettings {
    /// Read settings from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings from an arbitrary key lookup.
    #[must_use]
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_blank = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Self {
            export_enabled: non_blank("OTEL_ENABLED").is_none_or(|v| parse_flag(&v)),
            otlp_endpoint: non_blank("OTEL_EXPORTER_OTLP_ENDPOINT")
                .unwrap_or_else(|| DEFAULT_OTLP_ENDPOINT.to_string()),
            service_name: non_blank("OTEL_SERVICE_NAME")
                .unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string()),
        }
    }
}

/// Flushes exported spans when dropped.
pub struct TelemetryGuard {
    tracer_provider: Option<SdkTracerProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.tracer_provider.take()
            && let Err(e) = provider.shutdown()
        {
            eprintln!("Failed to flush OpenTelemetry spans: {e}");
        }
    }
}

/// Initialize logging from the environment.
///
/// Keep the returned guard alive for the process lifetime.
#[must_use]
pub fn init() -> TelemetryGuard {
    init_with_settings(&TelemetrySettings::from_env())
}

/// Initialize logging with explicit settings.
///
/// An exporter that cannot be built is reported and skipped; local logging
/// still starts.
#[must_use]
pub fn init_with_settings(settings: &TelemetrySettings) -> TelemetryGuard {
    let (tracer_provider, export_error) = if settings.export_enabled {
        match build_tracer_provider(settings) {
            Ok(provider) => (Some(provider), None),
            Err(e) => (None, Some(e)),
        }
    } else {
        (None, None)
    };

    let otel_layer = tracer_provider.as_ref().map(|provider| {
        tracing_opentelemetry::layer().with_tracer(provider.tracer(settings.service_name.clone()))
    });

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt_layer)
        .with(otel_layer)
        .init();

    match export_error {
        Some(e) => tracing::warn!(
            endpoint = %settings.otlp_endpoint,
            error = %e,
            "OTLP exporter unavailable, logging locally only"
        ),
        None if tracer_provider.is_some() => tracing::debug!(
            endpoint = %settings.otlp_endpoint,
            service = %settings.service_name,
            "Exporting spans over OTLP"
        ),
        None => {}
    }

    TelemetryGuard { tracer_provider }
}

fn env_filter() -> EnvFilter {
    DEFAULT_DIRECTIVES
        .iter()
        .filter_map(|raw| raw.parse::<Directive>().ok())
        .fold(EnvFilter::from_default_env(), EnvFilter::add_directive)
}

fn build_tracer_provider(
    settings: &TelemetrySettings,
) -> Result<SdkTracerProvider, opentelemetry_otlp::ExporterBuildError> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&settings.otlp_endpoint)
        .build()?;

    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(
            opentelemetry_sdk::Resource::builder()
                .with_service_name(settings.service_name.clone())
                .build(),
        )
        .build())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn settings(vars: &[(&str, &str)]) -> TelemetrySettings {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        TelemetrySettings::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_export_under_crate_name() {
        let settings = settings(&[]);

        assert!(settings.export_enabled);
        assert_eq!(settings.otlp_endpoint, DEFAULT_OTLP_ENDPOINT);
        assert_eq!(settings.service_name, env!("CARGO_PKG_NAME"));
    }

    #[test]
    fn export_follows_flag() {
        assert!(!settings(&[("OTEL_ENABLED", "false")]).export_enabled);
        assert!(!settings(&[("OTEL_ENABLED", "0")]).export_enabled);
        assert!(settings(&[("OTEL_ENABLED", "on")]).export_enabled);
    }

    #[test]
    fn blank_values_fall_back() {
        let settings = settings(&[("OTEL_SERVICE_NAME", "  "), ("OTEL_ENABLED", "")]);

        assert!(settings.export_enabled);
        assert_eq!(settings.service_name, DEFAULT_SERVICE_NAME);
    }

    #[test]
    fn default_directives_parse() {
        for raw in DEFAULT_DIRECTIVES {
            assert!(raw.parse::<Directive>().is_ok(), "{raw}");
        }
    }
}
