//! Ticker Stream Proxy Binary
//!
//! Starts the price API and health servers over the configured price source.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin ticker-stream-proxy
//! ```
//!
//! # Environment Variables
//!
//! - `USE_SIMULATED_SOURCE`: true | 1 | yes | on selects the simulated source
//!   (default: live)
//! - `TICKER_STREAM_HTTP_PORT`: Price API port (default: 8080)
//! - `TICKER_STREAM_HEALTH_PORT`: Health check HTTP port (default: 8082)
//! - `SIMULATED_TICK_INTERVAL_MS`: Simulated tick interval (default: 1500)
//! - `LIVE_PAGE_URL_TEMPLATE`: Quote page URL with a `{symbol}` placeholder
//! - `LIVE_POLL_INTERVAL_MS`: Live poll interval (default: 2000)
//! - `LIVE_SETTLE_DELAY_MS`: Wait after page load before polling (default: 2000)
//! - `LIVE_PAGE_TIMEOUT_SECS`: Page request timeout (default: 30)
//! - `LIVE_USER_AGENT`: User agent for page requests
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4318>)
//! - `OTEL_SERVICE_NAME`: Service name (default: ticker-stream-proxy)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio_util::sync::CancellationToken;

use ticker_stream_proxy::infrastructure::telemetry;
use ticker_stream_proxy::{
    ApiServer, BroadcastHub, HealthServer, HealthServerState, PriceService, PriceSink,
    StreamConfig, SubscriptionRegistry, build_source, init_metrics,
};

/// Grace period for servers to drain after shutdown is signalled.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();

    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting Ticker Stream Proxy");

    let _metrics_handle = init_metrics();

    let config = StreamConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    // The registry is both the source's sink and the hub's consumer store.
    let registry = Arc::new(SubscriptionRegistry::new());
    let sink: Arc<dyn PriceSink> = Arc::clone(&registry) as Arc<dyn PriceSink>;
    let source = build_source(&config, sink);
    let hub = BroadcastHub::new_shared(registry, source);
    let service = PriceService::new(Arc::clone(&hub));

    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        Arc::clone(&hub),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );
    let api_server = ApiServer::new(config.server.http_port, service, shutdown_token.clone());

    let health_task = tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    let api_token = shutdown_token.clone();
    let api_task = tokio::spawn(async move {
        if let Err(e) = api_server.run().await {
            tracing::error!(error = %e, "Price API error");
            api_token.cancel();
        }
    });

    tracing::info!("Ticker stream proxy ready");

    await_shutdown(shutdown_token).await;

    // Ends every open stream, which lets the SSE responses complete.
    hub.shutdown();

    let drain = async {
        let _ = api_task.await;
        let _ = health_task.await;
    };
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, drain).await.is_err() {
        tracing::warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Servers did not stop in time"
        );
    }

    tracing::info!("Ticker stream proxy stopped");
    Ok(())
}

/// Log the parsed configuration.
fn log_config(config: &StreamConfig) {
    tracing::info!(
        source = config.source.as_str(),
        http_port = config.server.http_port,
        health_port = config.server.health_port,
        "Configuration loaded"
    );
    tracing::debug!(
        tick_interval_ms = config.simulated.tick_interval.as_millis(),
        page_url_template = %config.live.page_url_template,
        poll_interval_ms = config.live.poll_interval.as_millis(),
        settle_delay_ms = config.live.settle_delay.as_millis(),
        "Source settings"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT) or an internal cancel.
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
        () = shutdown_token.cancelled() => {
            tracing::warn!("Server failure, initiating shutdown");
        }
    }

    shutdown_token.cancel();
}
