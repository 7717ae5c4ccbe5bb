//! Leverage robustness during dispatch: open-position rejections must
//! not block execution.

mod common;

use common::{default_harness, init_tracing, make_signal};
use rust_decimal_macros::dec;
use tradeengine::application::aggregator::Verdict;
use tradeengine::domain::errors::VENUE_CODE_LEVERAGE_UNCHANGED;
use tradeengine::domain::order::PositionSide;
use tradeengine::domain::trading_config::ParameterPatch;

#[tokio::test]
async fn test_leverage_rejection_does_not_block_trade() {
    init_tracing();
    let harness = default_harness();
    harness.fake.set_price("BTCUSDT", dec!(50000)).await;
    harness
        .fake
        .set_leverage_error(VENUE_CODE_LEVERAGE_UNCHANGED, "Leverage not changed")
        .await;

    let signal = make_signal("momentum", "BTCUSDT", "buy", 0.85);
    let outcome = harness.dispatcher.dispatch(&signal).await;

    // Execution continued on existing leverage
    assert_eq!(outcome.status, Verdict::Executed, "{:?}", outcome.reason);
    assert_eq!(harness.fake.executed_orders().await.len(), 1);

    // The status ledger recorded the failed sync
    let status = harness
        .leverage
        .get_leverage_status("BTCUSDT")
        .await
        .unwrap();
    assert!(!status.last_sync_success);
    assert!(!status.last_sync_error.as_deref().unwrap_or("").is_empty());
}

#[tokio::test]
async fn test_dispatch_uses_resolved_leverage() {
    init_tracing();
    let harness = default_harness();
    harness.fake.set_price("BTCUSDT", dec!(50000)).await;

    // Symbol-side config raises leverage for BTCUSDT longs
    let (ok, _, errors) = harness
        .resolver
        .set_config(
            ParameterPatch {
                leverage: Some(20),
                ..Default::default()
            },
            "test",
            Some("BTCUSDT"),
            Some(PositionSide::Long),
            None,
            false,
        )
        .await;
    assert!(ok, "{:?}", errors);

    let signal = make_signal("momentum", "BTCUSDT", "buy", 0.85);
    assert_eq!(
        harness.dispatcher.dispatch(&signal).await.status,
        Verdict::Executed
    );

    assert_eq!(
        harness.fake.leverage_calls().await,
        vec![("BTCUSDT".to_string(), 20)]
    );
}
