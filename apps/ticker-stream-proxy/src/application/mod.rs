//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the broadcast hub, the consumer streams, the boundary
//! service, and the port interfaces the price sources implement.

/// Port interfaces for price sources and their sink.
pub mod ports;

/// Application services for fan-out and the request boundary.
pub mod services;
