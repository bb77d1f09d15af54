//! Subscription Management Integration Tests
//!
//! Tests how consumer attach/detach drives tracking at the price source.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use mockall::mock;
use mockall::predicate::always;
use rust_decimal::Decimal;

use ticker_stream_proxy::{
    BroadcastHub, HubError, PriceSource, SharedBroadcastHub, SourceError, SourceKind,
    SubscriptionRegistry, Symbol,
};

mock! {
    pub Source {}

    #[async_trait]
    impl PriceSource for Source {
        fn kind(&self) -> SourceKind;
        async fn add_ticker(&self, symbol: &Symbol) -> Result<(), SourceError>;
        fn remove_ticker(&self, symbol: &Symbol);
        fn shutdown(&self);
        fn is_tracking(&self, symbol: &Symbol) -> bool;
        fn tracked_symbols(&self) -> Vec<Symbol>;
        fn stale_symbols(&self) -> Vec<Symbol>;
    }
}

fn symbol(raw: &str) -> Symbol {
    Symbol::parse(raw).unwrap()
}

/// A mock with the read-only calls stubbed out.
fn base_mock() -> MockSource {
    let mut source = MockSource::new();
    source.expect_kind().return_const(SourceKind::Simulated);
    source.expect_tracked_symbols().returning(Vec::new);
    source.expect_stale_symbols().returning(Vec::new);
    source
}

fn hub_with(source: MockSource) -> (SharedBroadcastHub, Arc<SubscriptionRegistry>) {
    let registry = Arc::new(SubscriptionRegistry::new());
    let hub = BroadcastHub::new_shared(Arc::clone(&registry), Arc::new(source));
    (hub, registry)
}

#[tokio::test]
async fn first_consumer_adds_and_last_consumer_removes() {
    let mut source = base_mock();
    source
        .expect_add_ticker()
        .withf(|s: &Symbol| s.as_str() == "AAPL")
        .times(1)
        .returning(|_| Ok(()));
    source
        .expect_remove_ticker()
        .withf(|s: &Symbol| s.as_str() == "AAPL")
        .times(1)
        .return_const(());

    let (hub, registry) = hub_with(source);

    let first = hub.subscribe_and_stream("aapl").await.unwrap();
    let second = hub.subscribe_and_stream("AAPL").await.unwrap();
    assert_eq!(registry.consumer_count(&symbol("AAPL")), 2);

    drop(first);
    assert_eq!(registry.consumer_count(&symbol("AAPL")), 1);

    drop(second);
    assert!(!registry.is_active(&symbol("AAPL")));
}

#[tokio::test]
async fn failed_tracking_leaves_no_consumer() {
    let mut source = base_mock();
    source.expect_add_ticker().times(1).returning(|s| {
        Err(SourceError::PageLoad {
            symbol: s.clone(),
            reason: "connection refused".to_string(),
        })
    });
    // Releasing the half-attached consumer is idempotent at the source.
    source
        .expect_remove_ticker()
        .with(always())
        .times(..=1)
        .return_const(());

    let (hub, registry) = hub_with(source);

    let err = hub.subscribe_and_stream("MSFT").await.unwrap_err();

    assert!(matches!(
        err,
        HubError::Source(SourceError::PageLoad { ref symbol, .. }) if symbol.as_str() == "MSFT"
    ));
    assert!(registry.active_symbols().is_empty());
    assert_eq!(registry.stats().consumer_count, 0);
}

#[tokio::test]
async fn probe_releases_tracking_when_nobody_streams() {
    let mut source = base_mock();
    source.expect_add_ticker().times(1).returning(|_| Ok(()));
    source.expect_remove_ticker().times(1).return_const(());

    let (hub, registry) = hub_with(source);

    let probed = hub.ensure_available(" nvda ").await.unwrap();

    assert_eq!(probed, symbol("NVDA"));
    assert!(!registry.is_active(&probed));
}

#[tokio::test]
async fn failed_probe_does_not_release() {
    let mut source = base_mock();
    source
        .expect_add_ticker()
        .times(1)
        .returning(|_| Err(SourceError::Initialization("no browser".to_string())));
    source.expect_remove_ticker().never();

    let (hub, _registry) = hub_with(source);

    let err = hub.ensure_available("TSLA").await.unwrap_err();
    assert_eq!(
        err,
        HubError::Source(SourceError::Initialization("no browser".to_string()))
    );
}

#[tokio::test]
async fn probe_with_consumers_leaves_source_alone() {
    let mut source = base_mock();
    source.expect_add_ticker().times(1).returning(|_| Ok(()));
    source.expect_remove_ticker().times(1).return_const(());

    let (hub, registry) = hub_with(source);

    let stream = hub.subscribe_and_stream("AMD").await.unwrap();
    hub.ensure_available("AMD").await.unwrap();
    assert!(registry.is_active(&symbol("AMD")));

    drop(stream);
}

#[tokio::test]
async fn unsubscribe_ends_every_stream_of_a_symbol() {
    let mut source = base_mock();
    source.expect_add_ticker().times(2).returning(|_| Ok(()));
    source
        .expect_remove_ticker()
        .withf(|s: &Symbol| s.as_str() == "ETHUSD")
        .times(1)
        .return_const(());
    source
        .expect_remove_ticker()
        .withf(|s: &Symbol| s.as_str() == "BTCUSD")
        .times(1)
        .return_const(());

    let (hub, registry) = hub_with(source);

    let mut eth_a = hub.subscribe_and_stream("ETHUSD").await.unwrap();
    let mut eth_b = hub.subscribe_and_stream("ETHUSD").await.unwrap();
    let btc = hub.subscribe_and_stream("BTCUSD").await.unwrap();

    let (unsubscribed, ended) = hub.unsubscribe("ethusd").await.unwrap();

    assert_eq!(unsubscribed, symbol("ETHUSD"));
    assert_eq!(ended, 2);
    assert!(eth_a.next().await.is_none());
    assert!(eth_b.next().await.is_none());
    assert!(registry.is_active(&symbol("BTCUSD")));

    drop(btc);
}

#[tokio::test]
async fn published_prices_reach_each_consumer_in_order() {
    let mut source = base_mock();
    source.expect_add_ticker().returning(|_| Ok(()));
    source.expect_remove_ticker().return_const(());

    let (hub, registry) = hub_with(source);
    let btc = symbol("BTCUSD");

    let mut a = hub.subscribe_and_stream("BTCUSD").await.unwrap();
    let mut b = hub.subscribe_and_stream("BTCUSD").await.unwrap();

    for cents in [6_700_000_i64, 6_700_150, 6_699_900] {
        registry.publish(&btc, Decimal::new(cents, 2));
    }

    for stream in [&mut a, &mut b] {
        let prices: Vec<Decimal> = (&mut *stream)
            .take(3)
            .map(|observation| observation.price)
            .collect()
            .await;
        assert_eq!(
            prices,
            vec![
                Decimal::new(6_700_000, 2),
                Decimal::new(6_700_150, 2),
                Decimal::new(6_699_900, 2),
            ]
        );
    }
}

#[tokio::test]
async fn shutdown_stops_source_and_rejects_new_consumers() {
    let mut source = base_mock();
    source.expect_add_ticker().times(1).returning(|_| Ok(()));
    source.expect_remove_ticker().times(1).return_const(());
    source.expect_shutdown().times(1).return_const(());

    let (hub, _registry) = hub_with(source);

    let mut stream = hub.subscribe_and_stream("SPY").await.unwrap();

    hub.shutdown();
    hub.shutdown();

    assert!(stream.next().await.is_none());
    assert_eq!(
        hub.subscribe_and_stream("SPY").await.unwrap_err(),
        HubError::ShutDown
    );
}
