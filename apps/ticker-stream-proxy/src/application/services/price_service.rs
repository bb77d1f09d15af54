//! Price Service
//!
//! The inbound boundary: `Subscribe`, `Unsubscribe`, and `StreamPrices`.
//! Subscribe and Unsubscribe never fail past this boundary; they report the
//! outcome inline in their response.

use serde::{Deserialize, Serialize};

use super::hub::{HubError, SharedBroadcastHub};
use super::stream::PriceStream;

// =============================================================================
// Requests / Responses
// =============================================================================

/// Subscribe request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    /// Raw ticker, normalized by the service.
    pub ticker: String,
}

/// Subscribe response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeResponse {
    /// Whether the source can track the ticker.
    pub success: bool,
    /// Human-readable outcome.
    pub message: String,
}

/// Unsubscribe request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsubscribeRequest {
    /// Raw ticker, normalized by the service.
    pub ticker: String,
}

/// Unsubscribe response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsubscribeResponse {
    /// Whether the ticker was unsubscribed.
    pub success: bool,
    /// Human-readable outcome.
    pub message: String,
}

/// Stream prices request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamPricesRequest {
    /// Raw ticker, normalized by the service.
    pub ticker: String,
}

/// Ticker as shown in messages: the normalized form when the raw input is
/// unusable as a symbol.
fn display_ticker(raw: &str) -> String {
    raw.trim().to_uppercase()
}

// =============================================================================
// Price Service
// =============================================================================

/// Boundary operations over the broadcast hub.
#[derive(Debug, Clone)]
pub struct PriceService {
    hub: SharedBroadcastHub,
}

impl PriceService {
    /// Create a service over a hub.
    #[must_use]
    pub const fn new(hub: SharedBroadcastHub) -> Self {
        Self { hub }
    }

    /// The underlying hub.
    #[must_use]
    pub const fn hub(&self) -> &SharedBroadcastHub {
        &self.hub
    }

    /// Check that a ticker can be tracked.
    pub async fn subscribe(&self, request: SubscribeRequest) -> SubscribeResponse {
        tracing::info!(ticker = %request.ticker, "Subscribe request");

        match self.hub.ensure_available(&request.ticker).await {
            Ok(symbol) => SubscribeResponse {
                success: true,
                message: format!("Subscribed to {symbol}"),
            },
            Err(e) => {
                let ticker = display_ticker(&request.ticker);
                tracing::warn!(ticker = %ticker, error = %e, "Subscribe failed");
                SubscribeResponse {
                    success: false,
                    message: format!("Failed to subscribe to {ticker}: {e}"),
                }
            }
        }
    }

    /// End every stream of a ticker and stop tracking it.
    pub async fn unsubscribe(&self, request: UnsubscribeRequest) -> UnsubscribeResponse {
        tracing::info!(ticker = %request.ticker, "Unsubscribe request");

        match self.hub.unsubscribe(&request.ticker).await {
            Ok((symbol, _ended)) => UnsubscribeResponse {
                success: true,
                message: format!("Unsubscribed from {symbol}"),
            },
            Err(e) => {
                let ticker = display_ticker(&request.ticker);
                tracing::warn!(ticker = %ticker, error = %e, "Unsubscribe failed");
                UnsubscribeResponse {
                    success: false,
                    message: format!("Failed to unsubscribe from {ticker}: {e}"),
                }
            }
        }
    }

    /// Open a price stream for a ticker.
    ///
    /// # Errors
    ///
    /// Returns [`HubError`] if the ticker is invalid, the hub is shut down,
    /// or the source cannot track the ticker.
    pub async fn stream_prices(&self, request: StreamPricesRequest) -> Result<PriceStream, HubError> {
        tracing::info!(ticker = %request.ticker, "Starting price stream");
        self.hub.subscribe_and_stream(&request.ticker).await
    }
}
