//! Price Streaming Types
//!
//! Core domain types for price observations: the canonical symbol, the
//! immutable observation produced for every price tick, and the clock that
//! stamps observations at fan-out time.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// =============================================================================
// Symbol
// =============================================================================

/// Errors produced when normalizing a raw symbol string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SymbolError {
    /// The symbol was empty after trimming.
    #[error("symbol cannot be empty")]
    Empty,

    /// The symbol contains a character that cannot appear in an instrument id.
    #[error("symbol {symbol:?} contains invalid character {character:?}")]
    InvalidCharacter {
        /// The offending (already upper-cased) symbol.
        symbol: String,
        /// The first invalid character.
        character: char,
    },
}

/// Canonical, upper-case instrument identifier (e.g. `BTCUSD`).
///
/// Used as the join key between source tracking state and hub subscription
/// state, so every comparison happens on the normalized form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(String);

impl Symbol {
    /// Normalize a raw symbol: trim, upper-case, and validate.
    ///
    /// # Errors
    ///
    /// Returns [`SymbolError`] if the symbol is empty or contains characters
    /// outside `[A-Z0-9.:_!-]`.
    pub fn parse(raw: &str) -> Result<Self, SymbolError> {
        let normalized = raw.trim().to_uppercase();
        if normalized.is_empty() {
            return Err(SymbolError::Empty);
        }

        if let Some(character) = normalized.chars().find(|c| !is_symbol_char(*c)) {
            return Err(SymbolError::InvalidCharacter {
                symbol: normalized,
                character,
            });
        }

        Ok(Self(normalized))
    }

    /// Get the symbol string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume and return the inner string.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

const fn is_symbol_char(c: char) -> bool {
    c.is_ascii_uppercase() || c.is_ascii_digit() || matches!(c, '.' | ':' | '_' | '!' | '-')
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Symbol {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// =============================================================================
// Price Observation
// =============================================================================

/// A single price data point for one symbol.
///
/// Immutable once created; every consumer attached to the symbol receives a
/// clone of the same observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceObservation {
    /// Instrument the price belongs to.
    pub symbol: Symbol,
    /// Observed price (strictly positive).
    pub price: Decimal,
    /// Wall-clock time of fan-out in epoch milliseconds, never decreasing.
    pub observed_at_millis: i64,
}

impl PriceObservation {
    /// Create a new observation.
    #[must_use]
    pub const fn new(symbol: Symbol, price: Decimal, observed_at_millis: i64) -> Self {
        Self {
            symbol,
            price,
            observed_at_millis,
        }
    }
}

// =============================================================================
// Observation Clock
// =============================================================================

/// Wall clock that never runs backwards.
///
/// Readings are clamped to the largest value handed out so far, so a wall
/// clock step backwards (NTP adjustment) cannot reorder observations.
#[derive(Debug, Default)]
pub struct ObservationClock {
    last_millis: AtomicI64,
}

impl ObservationClock {
    /// Create a new clock.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            last_millis: AtomicI64::new(0),
        }
    }

    /// Current time in epoch milliseconds, clamped to be non-decreasing.
    pub fn now_millis(&self) -> i64 {
        self.observe(Utc::now().timestamp_millis())
    }

    fn observe(&self, wall_millis: i64) -> i64 {
        let previous = self.last_millis.fetch_max(wall_millis, Ordering::AcqRel);
        previous.max(wall_millis)
    }
}

// =============================================================================
// Tests
// =============================================================================
