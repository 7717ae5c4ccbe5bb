//! Duplicate-signal suppression through the dispatcher fingerprint cache.

mod common;

use common::{build_harness, default_harness, init_tracing, make_signal, test_dispatcher_config};
use std::time::Duration;
use tradeengine::application::aggregator::{AggregatorConfig, Verdict};
use tradeengine::application::dispatcher::{Dispatcher, DispatcherConfig};

#[tokio::test]
async fn test_identical_signal_rejected_within_ttl() {
    init_tracing();
    let harness = default_harness();

    let signal = make_signal("dup-detect", "BTCUSDT", "buy", 0.85);

    let first = harness.dispatcher.dispatch(&signal).await;
    assert_eq!(first.status, Verdict::Executed, "{:?}", first.reason);

    let second = harness.dispatcher.dispatch(&signal).await;
    assert_eq!(second.status, Verdict::Duplicate);
    assert!(second.duplicate_age_seconds.is_some());

    // Only one order reached the venue
    assert_eq!(harness.fake.executed_orders().await.len(), 1);

    let rendered = harness.metrics.render();
    assert!(rendered.contains("tradeengine_signals_duplicate_total"));
}

#[tokio::test]
async fn test_duplicate_detection_expires_with_ttl() {
    init_tracing();
    let harness = build_harness(
        DispatcherConfig {
            signal_cache_ttl: Duration::from_millis(80),
            signal_cache_cleanup_interval: Duration::from_millis(40),
            ..test_dispatcher_config()
        },
        AggregatorConfig::default(),
    );

    let signal = make_signal("dup-ttl", "BTCUSDT", "buy", 0.85);

    let first = harness.dispatcher.dispatch(&signal).await;
    assert_eq!(first.status, Verdict::Executed);

    tokio::time::sleep(Duration::from_millis(120)).await;

    // Past the TTL the same fingerprint dispatches again
    let replay = harness.dispatcher.dispatch(&signal).await;
    assert_ne!(replay.status, Verdict::Duplicate);
}

#[tokio::test]
async fn test_different_signals_are_not_deduped() {
    init_tracing();
    let harness = default_harness();

    let buy_btc = make_signal("strategy-a", "BTCUSDT", "buy", 0.85);
    let buy_eth = make_signal("strategy-a", "ETHUSDT", "buy", 0.85);
    let other_strategy = make_signal("strategy-b", "SOLUSDT", "buy", 0.85);

    assert_eq!(
        harness.dispatcher.dispatch(&buy_btc).await.status,
        Verdict::Executed
    );
    assert_eq!(
        harness.dispatcher.dispatch(&buy_eth).await.status,
        Verdict::Executed
    );
    assert_eq!(
        harness.dispatcher.dispatch(&other_strategy).await.status,
        Verdict::Executed
    );

    assert_eq!(harness.fake.executed_orders().await.len(), 3);
}

#[tokio::test]
async fn test_cache_cleanup_evicts_expired_fingerprints() {
    init_tracing();
    let harness = build_harness(
        DispatcherConfig {
            signal_cache_ttl: Duration::from_millis(50),
            signal_cache_cleanup_interval: Duration::from_millis(10),
            ..test_dispatcher_config()
        },
        AggregatorConfig::default(),
    );

    harness
        .dispatcher
        .dispatch(&make_signal("sweep-a", "BTCUSDT", "buy", 0.85))
        .await;
    harness
        .dispatcher
        .dispatch(&make_signal("sweep-b", "ETHUSDT", "buy", 0.85))
        .await;
    assert_eq!(harness.dispatcher.cached_fingerprint_count().await, 2);

    tokio::time::sleep(Duration::from_millis(80)).await;
    harness.dispatcher.cleanup_signal_cache().await;
    assert_eq!(harness.dispatcher.cached_fingerprint_count().await, 0);
}

#[tokio::test]
async fn test_fingerprint_is_stable_across_pods() {
    // Two dispatchers (pods) must agree on the fingerprint of one signal
    let signal = make_signal("pod-test", "BTCUSDT", "buy", 0.85);
    assert_eq!(
        Dispatcher::signal_fingerprint(&signal),
        Dispatcher::signal_fingerprint(&signal.clone())
    );
}
