//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer, plus the HTTP surfaces that expose them.

/// Configuration loaded from the environment.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Price API: subscribe, unsubscribe, and server-sent price streams.
pub mod http;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Price source adapters (simulated walk, live page scraper).
pub mod source;

/// Logging and OpenTelemetry tracing integration.
pub mod telemetry;
