//! Domain Layer - Core price streaming types and subscription state.
//!
//! This layer contains the canonical symbol, the price observation, and the
//! registry of attached consumers. Nothing here knows about price sources,
//! HTTP, or process configuration.

/// Price observation types (symbols, observations, the observation clock).
pub mod streaming;

/// Consumer tracking and fan-out per symbol.
pub mod subscription;
