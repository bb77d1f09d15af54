//! Subscription Registry
//!
//! Domain state for tracking which consumers are attached to which symbol,
//! and the fan-out of observations into each consumer's pending queue.
//!
//! # Design
//!
//! The registry tracks:
//! - Per symbol, the set of attached consumers
//! - Per consumer, an unbounded queue sender and a cancellation token
//!
//! Attach and detach take the outer write lock. Fan-out takes the outer read
//! lock plus the symbol's own mutex, so enqueueing an observation is mutually
//! exclusive with removing the consumer it is destined for, and observations
//! for one symbol are stamped and enqueued in a single total order.

use std::collections::HashMap;

use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::domain::streaming::{ObservationClock, PriceObservation, Symbol};

// =============================================================================
// Types
// =============================================================================

/// Unique identifier for a consumer (one open price stream).
pub type ConsumerId = u64;

/// What a newly attached consumer receives.
#[derive(Debug)]
pub struct Attachment {
    /// Receiving end of the consumer's pending queue.
    pub receiver: mpsc::UnboundedReceiver<PriceObservation>,
    /// Cancelled when the consumer is detached from either side.
    pub cancel: CancellationToken,
    /// Whether this consumer created the symbol's subscription set.
    pub first_for_symbol: bool,
}

/// Result of detaching a single consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachOutcome {
    /// The consumer was not attached (already detached or never attached).
    NotAttached,
    /// The consumer was removed; other consumers remain on the symbol.
    Remaining(usize),
    /// The consumer was the last one; the symbol's set was removed.
    LastConsumer,
}

#[derive(Debug)]
struct ConsumerSlot {
    tx: mpsc::UnboundedSender<PriceObservation>,
    cancel: CancellationToken,
}

impl ConsumerSlot {
    /// Mark the consumer cancelled and drop its sender, waking a suspended pull.
    fn close(self) {
        self.cancel.cancel();
    }
}

#[derive(Debug, Default)]
struct SymbolSubscribers {
    consumers: Mutex<HashMap<ConsumerId, ConsumerSlot>>,
}

// =============================================================================
// Subscription Registry
// =============================================================================

/// Tracks attached consumers per symbol and fans observations out to them.
///
/// # Example
///
/// ```rust
/// use rust_decimal::Decimal;
/// use ticker_stream_proxy::domain::streaming::Symbol;
/// use ticker_stream_proxy::domain::subscription::{DetachOutcome, SubscriptionRegistry};
///
/// let registry = SubscriptionRegistry::new();
/// let btc = Symbol::parse("btcusd").unwrap();
///
/// let mut first = registry.attach(&btc, 1);
/// assert!(first.first_for_symbol);
///
/// let second = registry.attach(&btc, 2);
/// assert!(!second.first_for_symbol);
///
/// assert_eq!(registry.publish(&btc, Decimal::new(6500012, 2)), 2);
/// assert_eq!(first.receiver.try_recv().unwrap().price, Decimal::new(6500012, 2));
///
/// assert_eq!(registry.detach(&btc, 1, |_| {}), DetachOutcome::Remaining(1));
/// assert_eq!(registry.detach(&btc, 2, |_| {}), DetachOutcome::LastConsumer);
/// assert!(!registry.is_active(&btc));
/// ```
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    symbols: RwLock<HashMap<Symbol, SymbolSubscribers>>,
    clock: ObservationClock,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a consumer to a symbol, creating the symbol's set if needed.
    pub fn attach(&self, symbol: &Symbol, consumer: ConsumerId) -> Attachment {
        let (tx, receiver) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let mut symbols = self.symbols.write();
        let first_for_symbol = !symbols.contains_key(symbol);
        let subscribers = symbols.entry(symbol.clone()).or_default();

        let slot = ConsumerSlot {
            tx,
            cancel: cancel.clone(),
        };
        if let Some(replaced) = subscribers.consumers.get_mut().insert(consumer, slot) {
            replaced.close();
        }

        Attachment {
            receiver,
            cancel,
            first_for_symbol,
        }
    }

    /// Detach one consumer from a symbol.
    ///
    /// When the consumer was the last one, the symbol's set is removed and
    /// `on_last` runs while the write lock is still held, so no concurrent
    /// attach can observe the symbol between removal and `on_last`.
    pub fn detach(
        &self,
        symbol: &Symbol,
        consumer: ConsumerId,
        on_last: impl FnOnce(&Symbol),
    ) -> DetachOutcome {
        let mut symbols = self.symbols.write();
        let Some(subscribers) = symbols.get_mut(symbol) else {
            return DetachOutcome::NotAttached;
        };

        let consumers = subscribers.consumers.get_mut();
        let Some(slot) = consumers.remove(&consumer) else {
            return DetachOutcome::NotAttached;
        };
        slot.close();

        let remaining = consumers.len();
        if remaining > 0 {
            return DetachOutcome::Remaining(remaining);
        }

        symbols.remove(symbol);
        on_last(symbol);
        DetachOutcome::LastConsumer
    }

    /// Remove a symbol's whole set, ending every consumer attached to it.
    ///
    /// `on_removed` always runs (under the write lock), even when the symbol
    /// had no set. Returns the number of consumers that were ended.
    pub fn remove_symbol(&self, symbol: &Symbol, on_removed: impl FnOnce(&Symbol)) -> usize {
        let mut symbols = self.symbols.write();
        let ended = symbols
            .remove(symbol)
            .map_or(0, |subscribers| close_all(subscribers));
        on_removed(symbol);
        ended
    }

    /// Run `on_idle` if the symbol has no consumers.
    ///
    /// The check and the callback happen under the write lock, so no consumer
    /// can attach in between. Returns whether `on_idle` ran.
    pub fn release_if_idle(&self, symbol: &Symbol, on_idle: impl FnOnce(&Symbol)) -> bool {
        let symbols = self.symbols.write();
        if symbols.contains_key(symbol) {
            return false;
        }
        on_idle(symbol);
        true
    }

    /// Remove every symbol's set, calling `on_removed` for each symbol.
    ///
    /// Returns the number of consumers that were ended.
    pub fn remove_all(&self, mut on_removed: impl FnMut(&Symbol)) -> usize {
        let mut symbols = self.symbols.write();
        let mut ended = 0;
        for (symbol, subscribers) in symbols.drain() {
            ended += close_all(subscribers);
            on_removed(&symbol);
        }
        ended
    }

    /// Fan a price out to every consumer attached to `symbol`.
    ///
    /// The observation is stamped with the current (non-decreasing) time.
    /// Returns the number of consumers the observation was enqueued for.
    pub fn publish(&self, symbol: &Symbol, price: Decimal) -> usize {
        let symbols = self.symbols.read();
        let Some(subscribers) = symbols.get(symbol) else {
            return 0;
        };

        let consumers = subscribers.consumers.lock();
        if consumers.is_empty() {
            return 0;
        }

        let observation = PriceObservation::new(symbol.clone(), price, self.clock.now_millis());
        consumers
            .values()
            .filter(|slot| !slot.cancel.is_cancelled())
            .filter(|slot| slot.tx.send(observation.clone()).is_ok())
            .count()
    }

    /// Number of consumers attached to a symbol.
    #[must_use]
    pub fn consumer_count(&self, symbol: &Symbol) -> usize {
        self.symbols
            .read()
            .get(symbol)
            .map_or(0, |subscribers| subscribers.consumers.lock().len())
    }

    /// Whether a symbol has a subscription set.
    #[must_use]
    pub fn is_active(&self, symbol: &Symbol) -> bool {
        self.symbols.read().contains_key(symbol)
    }

    /// All symbols with at least one attached consumer.
    #[must_use]
    pub fn active_symbols(&self) -> Vec<Symbol> {
        let mut active: Vec<_> = self.symbols.read().keys().cloned().collect();
        active.sort();
        active
    }

    /// Get overall statistics.
    #[must_use]
    pub fn stats(&self) -> SubscriptionStats {
        let symbols = self.symbols.read();
        SubscriptionStats {
            symbol_count: symbols.len(),
            consumer_count: symbols
                .values()
                .map(|subscribers| subscribers.consumers.lock().len())
                .sum(),
        }
    }
}

fn close_all(subscribers: SymbolSubscribers) -> usize {
    let consumers = subscribers.consumers.into_inner();
    let ended = consumers.len();
    consumers.into_values().for_each(ConsumerSlot::close);
    ended
}

// =============================================================================
// Statistics
// =============================================================================

/// Subscription statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    /// Number of symbols with at least one consumer.
    pub symbol_count: usize,
    /// Number of attached consumers across all symbols.
    pub consumer_count: usize,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn sym(raw: &str) -> Symbol {
        Symbol::parse(raw).unwrap()
    }

    #[test]
    fn first_attach_creates_set() {
        let registry = SubscriptionRegistry::new();

        let attachment = registry.attach(&sym("AAPL"), 1);

        assert!(attachment.first_for_symbol);
        assert!(registry.is_active(&sym("AAPL")));
        assert_eq!(registry.consumer_count(&sym("AAPL")), 1);
    }

    #[test]
    fn second_attach_joins_existing_set() {
        let registry = SubscriptionRegistry::new();

        let _first = registry.attach(&sym("AAPL"), 1);
        let second = registry.attach(&sym("AAPL"), 2);

        assert!(!second.first_for_symbol);
        assert_eq!(registry.consumer_count(&sym("AAPL")), 2);
    }

    #[test]
    fn publish_reaches_every_consumer_of_symbol() {
        let registry = SubscriptionRegistry::new();
        let mut a = registry.attach(&sym("AAPL"), 1);
        let mut b = registry.attach(&sym("AAPL"), 2);
        let mut other = registry.attach(&sym("MSFT"), 3);

        let delivered = registry.publish(&sym("AAPL"), Decimal::new(15000, 2));

        assert_eq!(delivered, 2);
        assert_eq!(a.receiver.try_recv().unwrap().price, Decimal::new(15000, 2));
        assert_eq!(b.receiver.try_recv().unwrap().price, Decimal::new(15000, 2));
        assert!(other.receiver.try_recv().is_err());
    }

    #[test]
    fn publish_without_consumers_is_dropped() {
        let registry = SubscriptionRegistry::new();
        assert_eq!(registry.publish(&sym("AAPL"), Decimal::ONE), 0);
    }

    #[test]
    fn publish_preserves_arrival_order_and_timestamps() {
        let registry = SubscriptionRegistry::new();
        let mut a = registry.attach(&sym("AAPL"), 1);

        for cents in 1..=50 {
            registry.publish(&sym("AAPL"), Decimal::new(cents, 2));
        }

        let mut last_millis = i64::MIN;
        for cents in 1..=50 {
            let observation = a.receiver.try_recv().unwrap();
            assert_eq!(observation.price, Decimal::new(cents, 2));
            assert!(observation.observed_at_millis >= last_millis);
            last_millis = observation.observed_at_millis;
        }
    }

    #[test]
    fn detach_last_consumer_runs_callback_once() {
        let registry = SubscriptionRegistry::new();
        let calls = AtomicUsize::new(0);
        let _a = registry.attach(&sym("AAPL"), 1);
        let _b = registry.attach(&sym("AAPL"), 2);

        let outcome = registry.detach(&sym("AAPL"), 1, |_| {
            calls.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(outcome, DetachOutcome::Remaining(1));
        assert_eq!(calls.load(Ordering::Relaxed), 0);

        let outcome = registry.detach(&sym("AAPL"), 2, |_| {
            calls.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(outcome, DetachOutcome::LastConsumer);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert!(!registry.is_active(&sym("AAPL")));
    }

    #[test]
    fn detach_twice_is_noop() {
        let registry = SubscriptionRegistry::new();
        let _a = registry.attach(&sym("AAPL"), 1);

        assert_eq!(
            registry.detach(&sym("AAPL"), 1, |_| {}),
            DetachOutcome::LastConsumer
        );
        assert_eq!(
            registry.detach(&sym("AAPL"), 1, |_| panic!("must not run")),
            DetachOutcome::NotAttached
        );
    }

    #[test]
    fn detach_cancels_and_closes_consumer_queue() {
        let registry = SubscriptionRegistry::new();
        let mut a = registry.attach(&sym("AAPL"), 1);

        registry.detach(&sym("AAPL"), 1, |_| {});

        assert!(a.cancel.is_cancelled());
        assert!(matches!(
            a.receiver.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn no_delivery_after_detach() {
        let registry = SubscriptionRegistry::new();
        let mut a = registry.attach(&sym("AAPL"), 1);
        let _b = registry.attach(&sym("AAPL"), 2);

        registry.detach(&sym("AAPL"), 1, |_| {});
        let delivered = registry.publish(&sym("AAPL"), Decimal::ONE);

        assert_eq!(delivered, 1);
        assert!(a.receiver.try_recv().is_err());
    }

    #[test]
    fn remove_symbol_ends_all_consumers() {
        let registry = SubscriptionRegistry::new();
        let a = registry.attach(&sym("AAPL"), 1);
        let b = registry.attach(&sym("AAPL"), 2);
        let other = registry.attach(&sym("MSFT"), 3);
        let mut removed = Vec::new();

        let ended = registry.remove_symbol(&sym("AAPL"), |s| removed.push(s.clone()));

        assert_eq!(ended, 2);
        assert_eq!(removed, vec![sym("AAPL")]);
        assert!(a.cancel.is_cancelled());
        assert!(b.cancel.is_cancelled());
        assert!(!other.cancel.is_cancelled());
        assert!(registry.is_active(&sym("MSFT")));
    }

    #[test]
    fn remove_unknown_symbol_still_runs_callback() {
        let registry = SubscriptionRegistry::new();
        let mut called = false;

        let ended = registry.remove_symbol(&sym("AAPL"), |_| called = true);

        assert_eq!(ended, 0);
        assert!(called);
    }

    #[test]
    fn release_if_idle_only_runs_without_consumers() {
        let registry = SubscriptionRegistry::new();

        assert!(registry.release_if_idle(&sym("AAPL"), |_| {}));

        let _a = registry.attach(&sym("AAPL"), 1);
        assert!(!registry.release_if_idle(&sym("AAPL"), |_| panic!("must not run")));
    }

    #[test]
    fn remove_all_clears_registry() {
        let registry = SubscriptionRegistry::new();
        let _a = registry.attach(&sym("AAPL"), 1);
        let _b = registry.attach(&sym("MSFT"), 2);
        let _c = registry.attach(&sym("MSFT"), 3);
        let mut removed = Vec::new();

        let ended = registry.remove_all(|s| removed.push(s.clone()));
        removed.sort();

        assert_eq!(ended, 3);
        assert_eq!(removed, vec![sym("AAPL"), sym("MSFT")]);
        assert_eq!(registry.stats(), SubscriptionStats::default());
    }

    #[test]
    fn stats_are_accurate() {
        let registry = SubscriptionRegistry::new();
        let _a = registry.attach(&sym("AAPL"), 1);
        let _b = registry.attach(&sym("AAPL"), 2);
        let _c = registry.attach(&sym("MSFT"), 3);

        let stats = registry.stats();

        assert_eq!(stats.symbol_count, 2);
        assert_eq!(stats.consumer_count, 3);
        assert_eq!(registry.active_symbols(), vec![sym("AAPL"), sym("MSFT")]);
    }

    #[test]
    fn thread_safety_concurrent_attach_detach() {
        use std::sync::Arc;
        use std::thread;

        let registry = Arc::new(SubscriptionRegistry::new());
        let last_calls = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];

        for i in 0..10u64 {
            let registry = Arc::clone(&registry);
            let last_calls = Arc::clone(&last_calls);
            handles.push(thread::spawn(move || {
                let _attachment = registry.attach(&sym("SHARED"), i);
                registry.publish(&sym("SHARED"), Decimal::ONE);
                registry.detach(&sym("SHARED"), i, |_| {
                    last_calls.fetch_add(1, Ordering::Relaxed);
                });
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert!(!registry.is_active(&sym("SHARED")));
        // Every emptying of the set is paired with exactly one callback.
        assert!(last_calls.load(Ordering::Relaxed) >= 1);
        assert_eq!(registry.stats(), SubscriptionStats::default());
    }
}
