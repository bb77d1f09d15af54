//! Live Price Source
//!
//! Polls a quote page per tracked symbol and extracts the last price from it.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   one shared client    ┌──────────────────────┐
//! │  LiveSource  │ ─────────────────────► │ PageSession (BTCUSD) │──┐
//! │              │                        ├──────────────────────┤  │ reload + extract
//! │ tracked map  │ ─────────────────────► │ PageSession (ETHUSD) │──┤ every poll
//! └──────────────┘                        └──────────────────────┘  │
//!        ▲                                                         ▼
//!        └──────────────────── PriceSink::publish ◄──────── PriceExtractor
//! ```
//!
//! The HTTP client is built lazily on the first `add_ticker` and dropped on
//! `shutdown`. Each symbol polls on its own task, so a slow or failing page
//! never delays another symbol.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use reqwest::header::{ACCEPT_LANGUAGE, HeaderMap, HeaderValue};
use rust_decimal::Decimal;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::extract::PriceExtractor;
use crate::application::ports::{PriceSink, PriceSource, SourceError, SourceKind};
use crate::domain::streaming::Symbol;
use crate::infrastructure::config::LiveSettings;
use crate::infrastructure::metrics::{self, PollErrorKind};

/// Consecutive failed polls after which a symbol is reported stale.
pub const STALE_AFTER_FAILURES: u64 = 5;

// =============================================================================
// Page Session
// =============================================================================

/// Failure to fetch a page.
#[derive(Debug, thiserror::Error)]
pub enum PageError {
    /// The request could not be sent or timed out.
    #[error("request failed: {0}")]
    Request(#[source] reqwest::Error),

    /// The page answered with a non-success status.
    #[error("HTTP {0}")]
    Status(reqwest::StatusCode),

    /// The body could not be read.
    #[error("failed to read body: {0}")]
    Body(#[source] reqwest::Error),
}

impl PageError {
    const fn kind(&self) -> PollErrorKind {
        match self {
            Self::Request(_) => PollErrorKind::Request,
            Self::Status(_) => PollErrorKind::Status,
            Self::Body(_) => PollErrorKind::Body,
        }
    }
}

/// Outcome of a single poll.
#[derive(Debug)]
pub enum PollOutcome {
    /// A price was found.
    Price(Decimal),
    /// The page loaded but held no parsable price.
    Miss,
    /// The page could not be fetched.
    Failed(PageError),
}

/// A symbol's dedicated page, reloaded on every poll.
#[derive(Debug, Clone)]
pub struct PageSession {
    symbol: Symbol,
    url: String,
    client: Client,
}

impl PageSession {
    /// Bind a page session to a symbol's URL.
    #[must_use]
    pub const fn new(symbol: Symbol, url: String, client: Client) -> Self {
        Self {
            symbol,
            url,
            client,
        }
    }

    /// The page URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Fetch the page body.
    ///
    /// # Errors
    ///
    /// Returns [`PageError`] if the request fails or the status is not 2xx.
    pub async fn load(&self) -> Result<String, PageError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(PageError::Request)?;

        let status = response.status();
        if !status.is_success() {
            return Err(PageError::Status(status));
        }

        response.text().await.map_err(PageError::Body)
    }

    /// Reload the page and extract its price.
    pub async fn poll(&self, extractor: &PriceExtractor) -> PollOutcome {
        match self.load().await {
            // Html is not Send; parse and extract without crossing an await.
            Ok(body) => extractor
                .extract_price_from_body(&body)
                .map_or(PollOutcome::Miss, PollOutcome::Price),
            Err(e) => PollOutcome::Failed(e),
        }
    }
}

// =============================================================================
// Poll Statistics
// =============================================================================

/// Per-symbol poll counters.
#[derive(Debug, Default)]
pub struct PollStats {
    polls: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
    consecutive_failures: AtomicU64,
}

impl PollStats {
    fn record(&self, outcome: &PollOutcome) {
        self.polls.fetch_add(1, Ordering::Relaxed);
        match outcome {
            PollOutcome::Price(_) => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
                return;
            }
            PollOutcome::Miss => self.misses.fetch_add(1, Ordering::Relaxed),
            PollOutcome::Failed(_) => self.errors.fetch_add(1, Ordering::Relaxed),
        };
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Whether recent polls keep failing.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.consecutive_failures.load(Ordering::Relaxed) >= STALE_AFTER_FAILURES
    }

    /// Get a snapshot of the counters.
    #[must_use]
    pub fn snapshot(&self) -> PollStatsSnapshot {
        PollStatsSnapshot {
            polls: self.polls.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of a symbol's poll counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollStatsSnapshot {
    /// Polls completed.
    pub polls: u64,
    /// Polls that found no price.
    pub misses: u64,
    /// Polls that failed to fetch the page.
    pub errors: u64,
    /// Failed polls since the last success.
    pub consecutive_failures: u64,
}

// =============================================================================
// Live Source
// =============================================================================

struct TrackingEntry {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    stats: Arc<PollStats>,
}

impl TrackingEntry {
    fn stop(self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

#[derive(Default)]
struct LiveState {
    client: Option<Client>,
    next_load_id: u64,
    /// Symbols with an initial page load in flight, keyed to the load's id.
    /// `remove_ticker` and `shutdown` drop entries so the load is discarded.
    loading: HashMap<Symbol, u64>,
    tracked: HashMap<Symbol, TrackingEntry>,
}

/// A symbol's claim on `LiveState::loading` for one `add_ticker` call.
///
/// Dropping the reservation releases the claim, so an `add_ticker` future
/// cancelled mid-load does not leave the symbol marked as loading.
struct LoadReservation<'a> {
    state: &'a Mutex<LiveState>,
    symbol: Symbol,
    load_id: u64,
    completed: bool,
}

impl LoadReservation<'_> {
    /// Release the claim under an already held lock.
    ///
    /// Returns false if the claim was withdrawn while loading.
    fn complete(mut self, state: &mut LiveState) -> bool {
        self.completed = true;
        release(state, &self.symbol, self.load_id)
    }
}

impl Drop for LoadReservation<'_> {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        let mut state = self.state.lock();
        if release(&mut state, &self.symbol, self.load_id) {
            tracing::debug!(symbol = %self.symbol, "Page load abandoned");
        }
    }
}

/// Remove a loading claim if it still belongs to `load_id`.
fn release(state: &mut LiveState, symbol: &Symbol, load_id: u64) -> bool {
    if state.loading.get(symbol) == Some(&load_id) {
        state.loading.remove(symbol);
        true
    } else {
        false
    }
}

/// Price source that scrapes a live quote page per symbol.
pub struct LiveSource {
    sink: Arc<dyn PriceSink>,
    settings: LiveSettings,
    extractor: Arc<PriceExtractor>,
    state: Mutex<LiveState>,
}

impl LiveSource {
    /// Create a live source with the default extraction chain.
    #[must_use]
    pub fn new(sink: Arc<dyn PriceSink>, settings: LiveSettings) -> Self {
        Self::with_extractor(sink, settings, PriceExtractor::default_chain())
    }

    /// Create a live source with a custom extraction chain.
    #[must_use]
    pub fn with_extractor(
        sink: Arc<dyn PriceSink>,
        settings: LiveSettings,
        extractor: PriceExtractor,
    ) -> Self {
        Self {
            sink,
            settings,
            extractor: Arc::new(extractor),
            state: Mutex::new(LiveState::default()),
        }
    }

    /// Poll counters for a tracked symbol.
    #[must_use]
    pub fn poll_stats(&self, symbol: &Symbol) -> Option<PollStatsSnapshot> {
        self.state
            .lock()
            .tracked
            .get(symbol)
            .map(|entry| entry.stats.snapshot())
    }

    /// Whether the shared client is currently held.
    #[must_use]
    pub fn has_client(&self) -> bool {
        self.state.lock().client.is_some()
    }

    fn build_client(&self) -> Result<Client, SourceError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));

        Client::builder()
            .user_agent(self.settings.user_agent.as_str())
            .default_headers(headers)
            .timeout(self.settings.page_timeout)
            .build()
            .map_err(|e| SourceError::Initialization(format!("failed to create HTTP client: {e}")))
    }

    /// Reserve a symbol for loading, acquiring the shared client if needed.
    ///
    /// Returns `None` when the symbol is already tracked or loading.
    fn begin_load(
        &self,
        symbol: &Symbol,
    ) -> Result<Option<(Client, LoadReservation<'_>)>, SourceError> {
        let mut state = self.state.lock();
        if state.tracked.contains_key(symbol) || state.loading.contains_key(symbol) {
            return Ok(None);
        }

        let client = match &state.client {
            Some(client) => client.clone(),
            None => {
                let client = self.build_client()?;
                tracing::info!("Live source HTTP client created");
                state.client = Some(client.clone());
                client
            }
        };

        state.next_load_id += 1;
        let load_id = state.next_load_id;
        state.loading.insert(symbol.clone(), load_id);
        Ok(Some((
            client,
            LoadReservation {
                state: &self.state,
                symbol: symbol.clone(),
                load_id,
                completed: false,
            },
        )))
    }
}

impl std::fmt::Debug for LiveSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveSource")
            .field("page_url_template", &self.settings.page_url_template)
            .field("tracked", &self.tracked_symbols())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl PriceSource for LiveSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Live
    }

    async fn add_ticker(&self, symbol: &Symbol) -> Result<(), SourceError> {
        let Some((client, reservation)) = self.begin_load(symbol)? else {
            tracing::debug!(symbol = %symbol, "Symbol already tracked");
            return Ok(());
        };

        let session = PageSession::new(symbol.clone(), self.settings.page_url(symbol), client);
        tracing::info!(symbol = %symbol, url = %session.url(), "Loading quote page");

        if let Err(e) = session.load().await {
            drop(reservation);
            tracing::warn!(symbol = %symbol, error = %e, "Failed to load quote page");
            return Err(SourceError::PageLoad {
                symbol: symbol.clone(),
                reason: e.to_string(),
            });
        }

        if !self.settings.settle_delay.is_zero() {
            tokio::time::sleep(self.settings.settle_delay).await;
        }

        let mut state = self.state.lock();
        if !reservation.complete(&mut state) {
            tracing::info!(symbol = %symbol, "Symbol removed while loading, discarding page");
            return Ok(());
        }

        let cancel = CancellationToken::new();
        let stats = Arc::new(PollStats::default());
        let task = tokio::spawn(
            run_poller(
                session,
                Arc::clone(&self.extractor),
                Arc::clone(&self.sink),
                Arc::clone(&stats),
                self.settings.poll_interval,
                cancel.clone(),
            )
            .instrument(tracing::info_span!("live_poller", symbol = %symbol)),
        );
        state.tracked.insert(
            symbol.clone(),
            TrackingEntry {
                cancel,
                task,
                stats,
            },
        );

        tracing::info!(symbol = %symbol, "Live source tracking symbol");
        Ok(())
    }

    fn remove_ticker(&self, symbol: &Symbol) {
        let entry = {
            let mut state = self.state.lock();
            state.loading.remove(symbol);
            state.tracked.remove(symbol)
        };
        if let Some(entry) = entry {
            entry.stop();
            tracing::info!(symbol = %symbol, "Live source stopped tracking symbol");
        }
    }

    fn shutdown(&self) {
        let (entries, had_client): (Vec<_>, bool) = {
            let mut state = self.state.lock();
            state.loading.clear();
            let had_client = state.client.take().is_some();
            (state.tracked.drain().map(|(_, e)| e).collect(), had_client)
        };
        let stopped = entries.len();
        entries.into_iter().for_each(TrackingEntry::stop);
        if had_client || stopped > 0 {
            tracing::info!(stopped, "Live source shut down");
        }
    }

    fn is_tracking(&self, symbol: &Symbol) -> bool {
        self.state.lock().tracked.contains_key(symbol)
    }

    fn tracked_symbols(&self) -> Vec<Symbol> {
        let mut symbols: Vec<_> = self.state.lock().tracked.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    fn stale_symbols(&self) -> Vec<Symbol> {
        let mut symbols: Vec<_> = self
            .state
            .lock()
            .tracked
            .iter()
            .filter(|(_, entry)| entry.stats.is_stale())
            .map(|(symbol, _)| symbol.clone())
            .collect();
        symbols.sort();
        symbols
    }
}

async fn run_poller(
    session: PageSession,
    extractor: Arc<PriceExtractor>,
    sink: Arc<dyn PriceSink>,
    stats: Arc<PollStats>,
    poll_interval: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(poll_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let started = Instant::now();
        let outcome = tokio::select! {
            () = cancel.cancelled() => break,
            outcome = session.poll(&extractor) => outcome,
        };
        metrics::record_poll_duration(started.elapsed());
        stats.record(&outcome);

        match outcome {
            PollOutcome::Price(price) => {
                if cancel.is_cancelled() {
                    break;
                }
                tracing::debug!(symbol = %session.symbol, price = %price, "Live price");
                metrics::record_observation_emitted(SourceKind::Live);
                sink.publish(&session.symbol, price);
            }
            PollOutcome::Miss => {
                tracing::debug!(symbol = %session.symbol, "No price found on page");
                metrics::record_extraction_miss();
            }
            PollOutcome::Failed(e) => {
                tracing::warn!(symbol = %session.symbol, error = %e, "Poll failed");
                metrics::record_poll_error(e.kind());
            }
        }
    }
}
