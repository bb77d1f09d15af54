#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements,
        clippy::cast_possible_truncation
    )
)]

//! Ticker Stream Proxy - Price Observation Multiplexer
//!
//! Tracks a dynamic set of instrument symbols against one price source and
//! fans every observation out to any number of independent consumers. A
//! symbol is tracked at the source exactly while at least one consumer
//! streams it.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Core types with no I/O
//!   - `streaming`: Symbols, observations, the observation clock
//!   - `subscription`: Per-symbol consumer sets and delivery
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: The price source and price sink interfaces
//!   - `services`: Broadcast hub, price streams, boundary operations
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `source`: Simulated random walk and live page scraper
//!   - `http`: Subscribe/unsubscribe API and server-sent price streams
//!   - `config`: Environment configuration
//!   - `health`: Health check and metrics endpoint
//!
//! # Data Flow
//!
//! ```text
//!                  ┌──────────────┐     ┌──────────────┐
//! Price Source ───►│ Subscription │────►│ PriceStream  │──► Consumer 1
//! (simulated or    │   Registry   │────►│ PriceStream  │──► Consumer 2
//!  live scraper)   └──────────────┘────►│ PriceStream  │──► Consumer N
//!        ▲                              └──────────────┘
//!        └──── add/remove ticker ─── Broadcast Hub
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core streaming types with no external dependencies.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::streaming::{ObservationClock, PriceObservation, Symbol, SymbolError};
pub use domain::subscription::{ConsumerId, SubscriptionRegistry, SubscriptionStats};

// Ports
pub use application::ports::{PriceSink, PriceSource, SourceError, SourceKind};

// Services
pub use application::services::{
    BroadcastHub, HubError, HubStats, PriceService, PriceStream, SharedBroadcastHub,
    StreamCancel, StreamPricesRequest, SubscribeRequest, SubscribeResponse, UnsubscribeRequest,
    UnsubscribeResponse,
};

// Price sources
pub use infrastructure::source::{LiveSource, PriceExtractor, SimulatedSource, build_source};

// Infrastructure config
pub use infrastructure::config::{
    ConfigError, LiveSettings, ServerSettings, SimulatedSettings, StreamConfig,
};

// Servers
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};
pub use infrastructure::http::{ApiServer, ApiServerError, PriceUpdate};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryGuard, TelemetrySettings, init as init_telemetry};
