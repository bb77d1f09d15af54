//! Price Source Adapters
//!
//! Implementations of the [`PriceSource`] port:
//! - [`SimulatedSource`]: random walk, no external I/O
//! - [`LiveSource`]: scrapes a quote page per symbol
//!
//! Exactly one variant is selected for the process at startup.

pub mod extract;
pub mod live;
pub mod simulated;

use std::sync::Arc;

pub use extract::{
    ExtractionStrategy, NumericScanStrategy, PriceExtractor, SelectorStrategy, parse_price_text,
};
pub use live::{LiveSource, PageSession, PollStatsSnapshot};
pub use simulated::{SimulatedSource, next_walk_price};

use crate::application::ports::{PriceSink, PriceSource, SourceKind};
use crate::infrastructure::config::StreamConfig;

/// Build the configured price source, emitting into `sink`.
#[must_use]
pub fn build_source(config: &StreamConfig, sink: Arc<dyn PriceSink>) -> Arc<dyn PriceSource> {
    match config.source {
        SourceKind::Simulated => Arc::new(SimulatedSource::new(
            sink,
            config.simulated.tick_interval,
        )),
        SourceKind::Live => Arc::new(LiveSource::new(sink, config.live.clone())),
    }
}
