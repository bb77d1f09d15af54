//! Price API Server
//!
//! Thin HTTP adapter over [`PriceService`].
//!
//! # Endpoints
//!
//! - `POST /api/subscribe` - `{ "ticker": "..." }` → `{ "success", "message" }`
//! - `POST /api/unsubscribe` - `{ "ticker": "..." }` → `{ "success", "message" }`
//! - `GET /api/prices/{ticker}` - server-sent events, one `price` event per
//!   observation: `{ "ticker", "price", "timestamp" }`
//!
//! Closing the event stream drops the consumer's [`PriceStream`], which
//! detaches it from the hub.

use std::convert::Infallible;
use std::net::SocketAddr;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::{
    HubError, PriceService, PriceStream, StreamPricesRequest, SubscribeRequest, SubscribeResponse,
    UnsubscribeRequest, UnsubscribeResponse,
};
use crate::domain::streaming::PriceObservation;

// =============================================================================
// Wire Types
// =============================================================================

/// One price event as sent to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceUpdate {
    /// Normalized ticker.
    pub ticker: String,
    /// Price as a JSON number.
    pub price: f64,
    /// Observation time in epoch milliseconds.
    pub timestamp: i64,
}

impl From<&PriceObservation> for PriceUpdate {
    fn from(observation: &PriceObservation) -> Self {
        Self {
            ticker: observation.symbol.as_str().to_string(),
            price: decimal_to_f64(observation.price),
            timestamp: observation.observed_at_millis,
        }
    }
}

/// Error body for a stream that could not be opened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Error description.
    pub error: String,
}

fn decimal_to_f64(d: Decimal) -> f64 {
    use rust_decimal::prelude::ToPrimitive;
    d.to_f64().unwrap_or(0.0)
}

struct StreamError(HubError);

impl IntoResponse for StreamError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            HubError::InvalidSymbol(_) => StatusCode::BAD_REQUEST,
            HubError::Source(_) => StatusCode::BAD_GATEWAY,
            HubError::ShutDown => StatusCode::SERVICE_UNAVAILABLE,
        };
        let body = ErrorBody {
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

// =============================================================================
// Router
// =============================================================================

/// Build the API router.
pub fn router(service: PriceService) -> Router {
    Router::new()
        .route("/api/subscribe", post(subscribe_handler))
        .route("/api/unsubscribe", post(unsubscribe_handler))
        .route("/api/prices/{ticker}", get(stream_prices_handler))
        .with_state(service)
}

async fn subscribe_handler(
    State(service): State<PriceService>,
    Json(request): Json<SubscribeRequest>,
) -> Json<SubscribeResponse> {
    Json(service.subscribe(request).await)
}

async fn unsubscribe_handler(
    State(service): State<PriceService>,
    Json(request): Json<UnsubscribeRequest>,
) -> Json<UnsubscribeResponse> {
    Json(service.unsubscribe(request).await)
}

async fn stream_prices_handler(
    State(service): State<PriceService>,
    Path(ticker): Path<String>,
) -> Result<impl IntoResponse, StreamError> {
    let stream = service
        .stream_prices(StreamPricesRequest { ticker })
        .await
        .map_err(StreamError)?;

    Ok(Sse::new(price_events(stream)).keep_alive(KeepAlive::default()))
}

fn price_events(
    stream: PriceStream,
) -> impl futures::Stream<Item = Result<Event, Infallible>> + Send + 'static {
    stream.filter_map(|observation| async move {
        match Event::default()
            .event("price")
            .json_data(PriceUpdate::from(&observation))
        {
            Ok(event) => Some(Ok(event)),
            Err(e) => {
                tracing::warn!(symbol = %observation.symbol, error = %e, "Failed to encode price event");
                None
            }
        }
    })
}

// =============================================================================
// API Server
// =============================================================================

/// Price API HTTP server.
pub struct ApiServer {
    port: u16,
    service: PriceService,
    cancel: CancellationToken,
}

impl ApiServer {
    /// Create a new API server.
    #[must_use]
    pub const fn new(port: u16, service: PriceService, cancel: CancellationToken) -> Self {
        Self {
            port,
            service,
            cancel,
        }
    }

    /// Run the API server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `ApiServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), ApiServerError> {
        let app = router(self.service);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ApiServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Price API listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| ApiServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Price API stopped");
        Ok(())
    }
}

/// API server errors.
#[derive(Debug, thiserror::Error)]
pub enum ApiServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::{Body, to_bytes};
    use axum::http::{Request, header};
    use tower::ServiceExt;

    use super::*;
    use crate::application::ports::PriceSink;
    use crate::application::services::BroadcastHub;
    use crate::domain::streaming::Symbol;
    use crate::domain::subscription::SubscriptionRegistry;
    use crate::infrastructure::source::SimulatedSource;

    fn service() -> PriceService {
        let registry = Arc::new(SubscriptionRegistry::new());
        let sink: Arc<dyn PriceSink> = registry.clone();
        let source = Arc::new(SimulatedSource::with_seed(sink, Duration::from_millis(20), 3));
        PriceService::new(BroadcastHub::new_shared(registry, source))
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn price_update_from_observation() {
        let observation = PriceObservation::new(
            Symbol::parse("BTCUSD").unwrap(),
            Decimal::new(6_712_345, 2),
            1_700_000_000_000,
        );

        let update = PriceUpdate::from(&observation);

        assert_eq!(update.ticker, "BTCUSD");
        assert!((update.price - 67_123.45).abs() < 1e-9);
        assert_eq!(update.timestamp, 1_700_000_000_000);
    }

    #[tokio::test]
    async fn subscribe_endpoint() {
        let app = router(service());

        let response = app
            .oneshot(post_json("/api/subscribe", r#"{"ticker":"btcusd"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["message"], "Subscribed to BTCUSD");
    }

    #[tokio::test]
    async fn unsubscribe_endpoint() {
        let app = router(service());

        let response = app
            .oneshot(post_json("/api/unsubscribe", r#"{"ticker":"btcusd"}"#))
            .await
            .unwrap();

        let json = json_body(response).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["message"], "Unsubscribed from BTCUSD");
    }

    #[tokio::test]
    async fn stream_endpoint_sends_price_events() {
        let service = service();
        let hub = Arc::clone(service.hub());
        let app = router(service);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/prices/btcusd")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/event-stream"
        );

        let mut body = response.into_body().into_data_stream();
        let chunk = tokio::time::timeout(Duration::from_secs(2), body.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let frame = String::from_utf8(chunk.to_vec()).unwrap();
        assert!(frame.contains("event: price"), "{frame}");
        let data = frame
            .lines()
            .find_map(|line| line.strip_prefix("data: "))
            .unwrap();
        let update: PriceUpdate = serde_json::from_str(data).unwrap();
        assert_eq!(update.ticker, "BTCUSD");
        assert!(update.price > 0.0);

        assert_eq!(hub.stats().consumers, 1);
        drop(body);
        assert_eq!(hub.stats().consumers, 0);
        assert!(hub.stats().tracked_symbols.is_empty());
    }

    #[tokio::test]
    async fn stream_endpoint_rejects_invalid_ticker() {
        let app = router(service());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/prices/btc%20usd")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = json_body(response).await;
        assert!(json["error"].as_str().unwrap().contains("invalid symbol"));
    }

    #[tokio::test]
    async fn stream_endpoint_unavailable_after_shutdown() {
        let service = service();
        service.hub().shutdown();
        let app = router(service);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/prices/btcusd")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
