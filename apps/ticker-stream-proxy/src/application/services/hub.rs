//! Broadcast Hub
//!
//! Owns the subscription registry and the price source, and translates
//! consumer-count transitions into source tracking calls.
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────────────┐
//!   PriceSource ─────► │ SubscriptionRegistry │ ──► PriceStream (consumer 1)
//!   (publish)          │   per-symbol sets    │ ──► PriceStream (consumer 2)
//!        ▲             └──────────────────────┘ ──► ...
//!        │ add_ticker / remove_ticker                 │
//!        └──────────────── BroadcastHub ◄─────────────┘ detach
//! ```
//!
//! A symbol is tracked at the source exactly while its set is non-empty.
//! Operations on one symbol are serialized by a per-symbol async lock so a
//! slow page load never blocks other symbols.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use super::stream::PriceStream;
use crate::application::ports::{PriceSource, SourceError, SourceKind};
use crate::domain::streaming::{Symbol, SymbolError};
use crate::domain::subscription::{ConsumerId, SubscriptionRegistry};
use crate::infrastructure::metrics;

// =============================================================================
// Errors
// =============================================================================

/// Broadcast hub error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    /// The requested symbol could not be normalized.
    #[error("invalid symbol: {0}")]
    InvalidSymbol(#[from] SymbolError),

    /// The price source failed to start tracking the symbol.
    #[error(transparent)]
    Source(#[from] SourceError),

    /// The hub no longer accepts subscriptions.
    #[error("broadcast hub is shut down")]
    ShutDown,
}

// =============================================================================
// Statistics
// =============================================================================

/// Hub statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HubStats {
    /// Active price source variant.
    pub source: SourceKind,
    /// Symbols tracked at the source.
    pub tracked_symbols: Vec<Symbol>,
    /// Tracked symbols whose polls keep failing.
    pub stale_symbols: Vec<Symbol>,
    /// Number of symbols with consumers.
    pub subscribed_symbols: usize,
    /// Number of attached consumers.
    pub consumers: usize,
}

// =============================================================================
// Broadcast Hub
// =============================================================================

/// Multiplexes one price source into per-consumer streams.
pub struct BroadcastHub {
    registry: Arc<SubscriptionRegistry>,
    source: Arc<dyn PriceSource>,
    symbol_locks: Mutex<HashMap<Symbol, Arc<AsyncMutex<()>>>>,
    closed: AtomicBool,
}

/// Shared reference to the broadcast hub.
pub type SharedBroadcastHub = Arc<BroadcastHub>;

impl BroadcastHub {
    /// Create a hub over a source that publishes into `registry`.
    #[must_use]
    pub fn new(registry: Arc<SubscriptionRegistry>, source: Arc<dyn PriceSource>) -> Self {
        Self {
            registry,
            source,
            symbol_locks: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Create a new shared hub.
    #[must_use]
    pub fn new_shared(
        registry: Arc<SubscriptionRegistry>,
        source: Arc<dyn PriceSource>,
    ) -> SharedBroadcastHub {
        Arc::new(Self::new(registry, source))
    }

    /// The subscription registry.
    #[must_use]
    pub const fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// The price source.
    #[must_use]
    pub const fn source(&self) -> &Arc<dyn PriceSource> {
        &self.source
    }

    /// Whether the hub has been shut down.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Attach a new consumer to a symbol and return its stream.
    ///
    /// The first consumer of a symbol starts tracking at the source.
    ///
    /// # Errors
    ///
    /// Returns [`HubError`] if the symbol is invalid, the hub is shut down, or
    /// the source cannot track the symbol. A failed call leaves no consumer
    /// and no tracking state behind.
    #[tracing::instrument(skip(self))]
    pub async fn subscribe_and_stream(&self, raw_symbol: &str) -> Result<PriceStream, HubError> {
        let symbol = Symbol::parse(raw_symbol)?;
        self.ensure_open()?;

        self.with_symbol_lock(&symbol, || async {
            self.ensure_open()?;

            let consumer_id = new_consumer_id();
            let attachment = self.registry.attach(&symbol, consumer_id);
            let first = attachment.first_for_symbol;
            // Built before add_ticker so an error or a dropped future detaches.
            let stream = PriceStream::new(
                symbol.clone(),
                consumer_id,
                attachment,
                Arc::clone(&self.registry),
                Arc::clone(&self.source),
            );

            if first {
                if let Err(e) = self.source.add_ticker(&symbol).await {
                    tracing::warn!(symbol = %symbol, error = %e, "Failed to start tracking symbol");
                    drop(stream);
                    return Err(e.into());
                }
            }

            tracing::info!(symbol = %symbol, consumer_id, first, "Consumer attached");
            self.refresh_gauges();
            Ok::<_, HubError>(stream)
        })
        .await
    }

    /// Check that the source can track a symbol, without attaching a consumer.
    ///
    /// If the symbol already has consumers this succeeds immediately.
    /// Otherwise the source starts tracking and, since nobody is attached,
    /// tracking is released again.
    ///
    /// # Errors
    ///
    /// Returns [`HubError`] if the symbol is invalid, the hub is shut down, or
    /// the source cannot track the symbol.
    #[tracing::instrument(skip(self))]
    pub async fn ensure_available(&self, raw_symbol: &str) -> Result<Symbol, HubError> {
        let symbol = Symbol::parse(raw_symbol)?;
        self.ensure_open()?;

        self.with_symbol_lock(&symbol, || async {
            if self.registry.is_active(&symbol) {
                return Ok(());
            }

            self.source.add_ticker(&symbol).await?;
            let source = &self.source;
            self.registry
                .release_if_idle(&symbol, |idle| source.remove_ticker(idle));
            Ok::<(), SourceError>(())
        })
        .await?;

        Ok(symbol)
    }

    /// End every consumer of a symbol and stop tracking it.
    ///
    /// Returns the symbol and the number of consumers ended.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::InvalidSymbol`] if the symbol is invalid.
    #[tracing::instrument(skip(self))]
    pub async fn unsubscribe(&self, raw_symbol: &str) -> Result<(Symbol, usize), HubError> {
        let symbol = Symbol::parse(raw_symbol)?;

        let ended = self
            .with_symbol_lock(&symbol, || async {
                let source = &self.source;
                self.registry
                    .remove_symbol(&symbol, |removed| source.remove_ticker(removed))
            })
            .await;

        tracing::info!(symbol = %symbol, ended, "Unsubscribed symbol");
        self.refresh_gauges();
        Ok((symbol, ended))
    }

    /// End every consumer, stop the source, and reject later subscriptions.
    ///
    /// Idempotent.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let source = &self.source;
        let ended = self
            .registry
            .remove_all(|symbol| source.remove_ticker(symbol));
        self.source.shutdown();

        tracing::info!(ended, "Broadcast hub shut down");
        self.refresh_gauges();
    }

    /// Get hub statistics.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        let subscriptions = self.registry.stats();
        HubStats {
            source: self.source.kind(),
            tracked_symbols: self.source.tracked_symbols(),
            stale_symbols: self.source.stale_symbols(),
            subscribed_symbols: subscriptions.symbol_count,
            consumers: subscriptions.consumer_count,
        }
    }

    fn ensure_open(&self) -> Result<(), HubError> {
        if self.is_shut_down() {
            Err(HubError::ShutDown)
        } else {
            Ok(())
        }
    }

    fn refresh_gauges(&self) {
        metrics::set_active_consumers(self.registry.stats().consumer_count);
        metrics::set_tracked_symbols(self.source.tracked_symbols().len());
    }

    /// Run `op` while holding the symbol's lifecycle lock.
    async fn with_symbol_lock<F, Fut, T>(&self, symbol: &Symbol, op: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let lock = Arc::clone(self.symbol_locks.lock().entry(symbol.clone()).or_default());

        let result = {
            let _guard = lock.lock().await;
            op().await
        };

        // Prune the entry once no other caller holds or waits on it.
        let mut locks = self.symbol_locks.lock();
        let idle = locks
            .get(symbol)
            .is_some_and(|existing| Arc::ptr_eq(existing, &lock) && Arc::strong_count(&lock) == 2);
        if idle {
            locks.remove(symbol);
        }

        result
    }
}

impl std::fmt::Debug for BroadcastHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastHub")
            .field("source", &self.source.kind())
            .field("closed", &self.is_shut_down())
            .field("subscriptions", &self.registry.stats())
            .finish_non_exhaustive()
    }
}

fn new_consumer_id() -> ConsumerId {
    Uuid::new_v4().as_u64_pair().0
}

// =============================================================================
// Tests
// =============================================================================
