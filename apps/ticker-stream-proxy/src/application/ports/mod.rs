//! Port Interfaces
//!
//! Defines the interfaces (ports) between the broadcast hub and the price
//! sources, following the Hexagonal Architecture pattern. These are the
//! contracts that infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - `PriceSource`: Tracks symbols and produces price observations
//!
//! ## Driver Ports (Inbound)
//!
//! - `PriceSink`: Where a price source emits `(symbol, price)` pairs

use std::fmt;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::streaming::Symbol;
use crate::domain::subscription::SubscriptionRegistry;

// =============================================================================
// Source Kind
// =============================================================================

/// Which price source variant is active for the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Random-walk generator with no external I/O.
    Simulated,
    /// Scraper polling a live quote page per symbol.
    Live,
}

impl SourceKind {
    /// Get the kind as a label string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Simulated => "simulated",
            Self::Live => "live",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Price source error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    /// The source's shared resource could not be acquired.
    #[error("price source initialization failed: {0}")]
    Initialization(String),

    /// The symbol's page could not be loaded.
    #[error("failed to load page for {symbol}: {reason}")]
    PageLoad {
        /// Symbol whose page failed to load.
        symbol: Symbol,
        /// Underlying failure.
        reason: String,
    },
}

// =============================================================================
// Ports
// =============================================================================

/// Receives every `(symbol, price)` pair a price source produces.
///
/// Called synchronously from the source's polling task; implementations must
/// not block or perform I/O.
pub trait PriceSink: Send + Sync {
    /// Publish one price for a symbol.
    fn publish(&self, symbol: &Symbol, price: Decimal);
}

impl PriceSink for SubscriptionRegistry {
    fn publish(&self, symbol: &Symbol, price: Decimal) {
        Self::publish(self, symbol, price);
    }
}

/// Port for a process-wide price source.
///
/// A symbol is tracked from a successful `add_ticker` until `remove_ticker`
/// or `shutdown`. While tracked, observations flow to the source's sink.
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Which variant this source is.
    fn kind(&self) -> SourceKind;

    /// Start tracking a symbol, emitting one price immediately (best-effort).
    ///
    /// Idempotent: adding an already tracked symbol succeeds without effect.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] on unrecoverable initialization failure. A
    /// failed call leaves no per-symbol state behind.
    async fn add_ticker(&self, symbol: &Symbol) -> Result<(), SourceError>;

    /// Stop tracking a symbol and release its resources.
    ///
    /// Idempotent. After return no further prices are produced for the symbol
    /// except one already in flight.
    fn remove_ticker(&self, symbol: &Symbol);

    /// Stop tracking every symbol and release shared resources. Idempotent.
    fn shutdown(&self);

    /// Whether the symbol is currently tracked.
    fn is_tracking(&self, symbol: &Symbol) -> bool;

    /// All currently tracked symbols.
    fn tracked_symbols(&self) -> Vec<Symbol>;

    /// Tracked symbols whose recent polls keep failing.
    fn stale_symbols(&self) -> Vec<Symbol> {
        Vec::new()
    }
}
