//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `BroadcastHub`: Multiplexes the price source into per-consumer streams
//! - `PriceStream`: One consumer's pull-based observation sequence
//! - `PriceService`: Subscribe / Unsubscribe / StreamPrices boundary

mod hub;
mod price_service;
mod stream;

pub use hub::{BroadcastHub, HubError, HubStats, SharedBroadcastHub};
pub use price_service::{
    PriceService, StreamPricesRequest, SubscribeRequest, SubscribeResponse, UnsubscribeRequest,
    UnsubscribeResponse,
};
pub use stream::{PriceStream, StreamCancel};
