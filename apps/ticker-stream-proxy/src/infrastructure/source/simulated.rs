//! Simulated Price Source
//!
//! Random-walk price generator with no external I/O. Each tracked symbol
//! gets its own ticker task; base prices survive remove/add of a symbol and
//! are only forgotten on shutdown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::{Decimal, RoundingStrategy};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{PriceSink, PriceSource, SourceError, SourceKind};
use crate::domain::streaming::Symbol;
use crate::infrastructure::metrics;

/// Lowest price the walk can reach.
pub const MIN_PRICE: Decimal = Decimal::from_parts(1, 0, 0, false, 2);

/// Seed range in cents: [100.00, 50100.00).
const SEED_CENTS_LOW: i64 = 10_000;
const SEED_CENTS_HIGH: i64 = 5_010_000;

/// Largest relative step, in units of 1e-8 (1%).
const MAX_CHANGE_UNITS: i64 = 1_000_000;
const CHANGE_SCALE: u32 = 8;

/// Compute the next random-walk price.
///
/// `change` is the relative step (within `[-0.01, 0.01]`). The absolute step
/// is truncated toward zero to cents, so the result never moves by more than
/// 1% of `previous`, and it never drops below [`MIN_PRICE`].
#[must_use]
pub fn next_walk_price(previous: Decimal, change: Decimal) -> Decimal {
    let delta = (previous * change).round_dp_with_strategy(2, RoundingStrategy::ToZero);
    (previous + delta).max(MIN_PRICE)
}

struct TrackingEntry {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl TrackingEntry {
    fn stop(self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

struct WalkState {
    rng: StdRng,
    last_prices: HashMap<Symbol, Decimal>,
    tracked: HashMap<Symbol, TrackingEntry>,
}

impl WalkState {
    fn seed_price(&mut self) -> Decimal {
        Decimal::new(self.rng.random_range(SEED_CENTS_LOW..SEED_CENTS_HIGH), 2)
    }

    fn step(&mut self, symbol: &Symbol) -> Decimal {
        let change = Decimal::new(
            self.rng.random_range(-MAX_CHANGE_UNITS..=MAX_CHANGE_UNITS),
            CHANGE_SCALE,
        );
        let previous = match self.last_prices.get(symbol) {
            Some(price) => *price,
            None => self.seed_price(),
        };
        let next = next_walk_price(previous, change);
        self.last_prices.insert(symbol.clone(), next);
        next
    }
}

/// Random-walk price source.
pub struct SimulatedSource {
    sink: Arc<dyn PriceSink>,
    tick_interval: Duration,
    state: Arc<Mutex<WalkState>>,
}

impl SimulatedSource {
    /// Create a source seeded from the operating system.
    #[must_use]
    pub fn new(sink: Arc<dyn PriceSink>, tick_interval: Duration) -> Self {
        Self::with_rng(sink, tick_interval, StdRng::from_os_rng())
    }

    /// Create a deterministic source from a fixed seed.
    #[must_use]
    pub fn with_seed(sink: Arc<dyn PriceSink>, tick_interval: Duration, seed: u64) -> Self {
        Self::with_rng(sink, tick_interval, StdRng::seed_from_u64(seed))
    }

    fn with_rng(sink: Arc<dyn PriceSink>, tick_interval: Duration, rng: StdRng) -> Self {
        Self {
            sink,
            tick_interval,
            state: Arc::new(Mutex::new(WalkState {
                rng,
                last_prices: HashMap::new(),
                tracked: HashMap::new(),
            })),
        }
    }

    /// Last emitted price for a symbol, if any.
    #[must_use]
    pub fn last_price(&self, symbol: &Symbol) -> Option<Decimal> {
        self.state.lock().last_prices.get(symbol).copied()
    }

    fn emit(sink: &dyn PriceSink, symbol: &Symbol, price: Decimal) {
        tracing::trace!(symbol = %symbol, price = %price, "Simulated tick");
        metrics::record_observation_emitted(SourceKind::Simulated);
        sink.publish(symbol, price);
    }
}

impl std::fmt::Debug for SimulatedSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedSource")
            .field("tick_interval", &self.tick_interval)
            .field("tracked", &self.tracked_symbols())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl PriceSource for SimulatedSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Simulated
    }

    async fn add_ticker(&self, symbol: &Symbol) -> Result<(), SourceError> {
        let first_price = {
            let mut state = self.state.lock();
            if state.tracked.contains_key(symbol) {
                return Ok(());
            }

            let first_price = state.step(symbol);
            let cancel = CancellationToken::new();
            let task = tokio::spawn(run_ticker(
                symbol.clone(),
                self.tick_interval,
                Arc::clone(&self.state),
                Arc::clone(&self.sink),
                cancel.clone(),
            ));
            state
                .tracked
                .insert(symbol.clone(), TrackingEntry { cancel, task });
            first_price
        };

        tracing::info!(symbol = %symbol, "Simulated source tracking symbol");
        Self::emit(self.sink.as_ref(), symbol, first_price);
        Ok(())
    }

    fn remove_ticker(&self, symbol: &Symbol) {
        let entry = self.state.lock().tracked.remove(symbol);
        if let Some(entry) = entry {
            entry.stop();
            tracing::info!(symbol = %symbol, "Simulated source stopped tracking symbol");
        }
    }

    fn shutdown(&self) {
        let entries: Vec<_> = {
            let mut state = self.state.lock();
            state.last_prices.clear();
            state.tracked.drain().map(|(_, entry)| entry).collect()
        };
        let stopped = entries.len();
        entries.into_iter().for_each(TrackingEntry::stop);
        tracing::info!(stopped, "Simulated source shut down");
    }

    fn is_tracking(&self, symbol: &Symbol) -> bool {
        self.state.lock().tracked.contains_key(symbol)
    }

    fn tracked_symbols(&self) -> Vec<Symbol> {
        let mut symbols: Vec<_> = self.state.lock().tracked.keys().cloned().collect();
        symbols.sort();
        symbols
    }
}

async fn run_ticker(
    symbol: Symbol,
    tick_interval: Duration,
    state: Arc<Mutex<WalkState>>,
    sink: Arc<dyn PriceSink>,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(tick_interval);
    // The first tick completes immediately; add_ticker already emitted.
    interval.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                let price = {
                    let mut state = state.lock();
                    if cancel.is_cancelled() {
                        break;
                    }
                    state.step(&symbol)
                };
                SimulatedSource::emit(sink.as_ref(), &symbol, price);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        prices: Mutex<Vec<(Symbol, Decimal)>>,
    }

    impl RecordingSink {
        fn prices_for(&self, symbol: &Symbol) -> Vec<Decimal> {
            self.prices
                .lock()
                .iter()
                .filter(|(s, _)| s == symbol)
                .map(|(_, p)| *p)
                .collect()
        }
    }

    impl PriceSink for RecordingSink {
        fn publish(&self, symbol: &Symbol, price: Decimal) {
            self.prices.lock().push((symbol.clone(), price));
        }
    }

    fn sym(raw: &str) -> Symbol {
        Symbol::parse(raw).unwrap()
    }

    fn source(sink: &Arc<RecordingSink>, tick: Duration) -> SimulatedSource {
        let sink: Arc<dyn PriceSink> = sink.clone();
        SimulatedSource::with_seed(sink, tick, 7)
    }

    #[test]
    fn walk_truncates_delta_to_cents() {
        // 100.00 * 0.0099999 = 0.99999 -> 0.99
        let next = next_walk_price(Decimal::new(10000, 2), Decimal::new(99_999, 7));
        assert_eq!(next, Decimal::new(10099, 2));

        let next = next_walk_price(Decimal::new(10000, 2), Decimal::new(-99_999, 7));
        assert_eq!(next, Decimal::new(9901, 2));
    }

    #[test]
    fn walk_never_drops_below_minimum() {
        assert_eq!(
            next_walk_price(MIN_PRICE, Decimal::new(-1, 2)),
            MIN_PRICE
        );
    }

    proptest! {
        #[test]
        fn walk_stays_within_one_percent(
            cents in 1i64..10_000_000,
            units in -MAX_CHANGE_UNITS..=MAX_CHANGE_UNITS,
        ) {
            let previous = Decimal::new(cents, 2);
            let next = next_walk_price(previous, Decimal::new(units, CHANGE_SCALE));

            prop_assert!(next >= MIN_PRICE);
            prop_assert!((next - previous).abs() <= previous / Decimal::ONE_HUNDRED);
            prop_assert!(next.scale() <= 2);
        }

        #[test]
        fn seeded_walk_sequence_stays_bounded(seed in any::<u64>(), ticks in 1usize..200) {
            let mut state = WalkState {
                rng: StdRng::seed_from_u64(seed),
                last_prices: HashMap::new(),
                tracked: HashMap::new(),
            };
            let symbol = Symbol::parse("SIM").unwrap();

            let mut previous = state.step(&symbol);
            for _ in 0..ticks {
                let next = state.step(&symbol);
                prop_assert!(next >= MIN_PRICE);
                prop_assert!((next - previous).abs() <= previous / Decimal::ONE_HUNDRED);
                previous = next;
            }
        }
    }

    #[test]
    fn seed_lies_in_range() {
        let mut state = WalkState {
            rng: StdRng::seed_from_u64(1),
            last_prices: HashMap::new(),
            tracked: HashMap::new(),
        };
        for _ in 0..1_000 {
            let seed = state.seed_price();
            assert!(seed >= Decimal::new(100, 0));
            assert!(seed < Decimal::new(50_100, 0));
        }
    }

    #[tokio::test]
    async fn add_emits_immediately() {
        let sink = Arc::new(RecordingSink::default());
        let source = source(&sink, Duration::from_secs(60));

        source.add_ticker(&sym("BTCUSD")).await.unwrap();

        assert!(source.is_tracking(&sym("BTCUSD")));
        assert_eq!(sink.prices_for(&sym("BTCUSD")).len(), 1);
        source.shutdown();
    }

    #[tokio::test]
    async fn add_is_idempotent() {
        let sink = Arc::new(RecordingSink::default());
        let source = source(&sink, Duration::from_secs(60));

        source.add_ticker(&sym("BTCUSD")).await.unwrap();
        source.add_ticker(&sym("BTCUSD")).await.unwrap();

        assert_eq!(source.tracked_symbols(), vec![sym("BTCUSD")]);
        assert_eq!(sink.prices_for(&sym("BTCUSD")).len(), 1);
        source.shutdown();
    }

    #[tokio::test]
    async fn ticks_keep_emitting_within_bounds() {
        let sink = Arc::new(RecordingSink::default());
        let source = source(&sink, Duration::from_millis(10));

        source.add_ticker(&sym("ETHUSD")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        source.shutdown();

        let prices = sink.prices_for(&sym("ETHUSD"));
        assert!(prices.len() >= 3, "got {} prices", prices.len());
        for pair in prices.windows(2) {
            assert!((pair[1] - pair[0]).abs() <= pair[0] / Decimal::ONE_HUNDRED);
        }
    }

    #[tokio::test]
    async fn remove_stops_emission() {
        let sink = Arc::new(RecordingSink::default());
        let source = source(&sink, Duration::from_millis(10));

        source.add_ticker(&sym("ETHUSD")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        source.remove_ticker(&sym("ETHUSD"));
        let emitted = sink.prices_for(&sym("ETHUSD")).len();
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(!source.is_tracking(&sym("ETHUSD")));
        assert_eq!(sink.prices_for(&sym("ETHUSD")).len(), emitted);
    }

    #[tokio::test]
    async fn remove_untracked_is_noop() {
        let sink = Arc::new(RecordingSink::default());
        let source = source(&sink, Duration::from_secs(60));

        source.remove_ticker(&sym("NOPE"));
        source.remove_ticker(&sym("NOPE"));

        assert!(source.tracked_symbols().is_empty());
    }

    #[tokio::test]
    async fn base_price_survives_remove_and_readd() {
        let sink = Arc::new(RecordingSink::default());
        let source = source(&sink, Duration::from_secs(60));

        source.add_ticker(&sym("AAPL")).await.unwrap();
        let before = source.last_price(&sym("AAPL")).unwrap();
        source.remove_ticker(&sym("AAPL"));
        source.add_ticker(&sym("AAPL")).await.unwrap();

        let resumed = sink.prices_for(&sym("AAPL"))[1];
        assert!((resumed - before).abs() <= before / Decimal::ONE_HUNDRED);
        source.shutdown();
    }

    #[tokio::test]
    async fn shutdown_clears_everything_and_is_idempotent() {
        let sink = Arc::new(RecordingSink::default());
        let source = source(&sink, Duration::from_secs(60));

        source.add_ticker(&sym("AAPL")).await.unwrap();
        source.add_ticker(&sym("MSFT")).await.unwrap();
        source.shutdown();
        source.shutdown();

        assert!(source.tracked_symbols().is_empty());
        assert!(source.last_price(&sym("AAPL")).is_none());
    }

    #[tokio::test]
    async fn kind_is_simulated() {
        let sink = Arc::new(RecordingSink::default());
        let source = source(&sink, Duration::from_secs(60));
        assert_eq!(source.kind(), SourceKind::Simulated);
        assert!(source.stale_symbols().is_empty());
    }
}
