//! Multi-strategy contribution accounting on one exchange position.

mod common;

use common::{default_harness, init_tracing, make_signal};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tradeengine::application::aggregator::Verdict;
use tradeengine::domain::position::ContributionStatus;

#[tokio::test]
async fn test_weighted_average_contribution_flow() {
    init_tracing();
    let harness = default_harness();

    // Strategy A buys 0.001 at 50000
    harness.fake.set_price("BTCUSDT", dec!(50000)).await;
    let mut first = make_signal("strategy_a", "BTCUSDT", "buy", 0.85);
    first.quantity = Some(dec!(0.001));
    assert_eq!(
        harness.dispatcher.dispatch(&first).await.status,
        Verdict::Executed
    );

    // Strategy B adds 0.002 at 51000
    harness.fake.set_price("BTCUSDT", dec!(51000)).await;
    let mut second = make_signal("strategy_b", "BTCUSDT", "buy", 0.9);
    second.quantity = Some(dec!(0.002));
    assert_eq!(
        harness.dispatcher.dispatch(&second).await.status,
        Verdict::Executed
    );

    let exchange = harness
        .ledger
        .get_exchange_position("BTCUSDT_LONG")
        .await
        .unwrap();
    assert_eq!(exchange.current_quantity, dec!(0.003));
    assert_eq!(exchange.total_contributions, 2);
    assert_eq!(exchange.contributing_strategies.len(), 2);

    // (0.001·50000 + 0.002·51000) / 0.003 ≈ 50666.67
    let expected = (dec!(0.001) * dec!(50000) + dec!(0.002) * dec!(51000)) / dec!(0.003);
    assert!((exchange.weighted_avg_price - expected).abs() < dec!(0.01));

    // Contribution conservation: open contribution quantities sum to the
    // aggregate quantity
    let open_sum: Decimal = harness
        .ledger
        .get_contributions("BTCUSDT_LONG")
        .await
        .iter()
        .filter(|c| c.status == ContributionStatus::Active)
        .map(|c| c.contribution_quantity)
        .sum();
    assert_eq!(open_sum, exchange.current_quantity);
}

#[tokio::test]
async fn test_close_with_cleanup_settles_all_strategies() {
    init_tracing();
    let harness = default_harness();
    harness.fake.set_price("BTCUSDT", dec!(50000)).await;

    for strategy in ["strategy_a", "strategy_b"] {
        let mut signal = make_signal(strategy, "BTCUSDT", "buy", 0.85);
        signal.take_profit_pct = Some(0.04);
        signal.stop_loss_pct = Some(0.02);
        assert_eq!(
            harness.dispatcher.dispatch(&signal).await.status,
            Verdict::Executed
        );
    }

    let exchange = harness
        .ledger
        .get_exchange_position("BTCUSDT_LONG")
        .await
        .unwrap();
    assert_eq!(exchange.current_quantity, dec!(0.002));
    assert_eq!(harness.oco.active_pairs("BTCUSDT_LONG").await.len(), 2);

    // Manual close tears down OCO pairs and closes both strategy legs
    harness.fake.set_price("BTCUSDT", dec!(50500)).await;
    let closed = harness
        .dispatcher
        .close_position_with_cleanup(
            "BTCUSDT_LONG",
            "BTCUSDT",
            tradeengine::domain::order::PositionSide::Long,
            dec!(0.002),
            tradeengine::domain::position::CloseReason::Manual,
        )
        .await
        .unwrap();
    assert_eq!(closed, 2);

    assert!(harness.oco.active_pairs("BTCUSDT_LONG").await.is_empty());

    let exchange = harness
        .ledger
        .get_exchange_position("BTCUSDT_LONG")
        .await
        .unwrap();
    assert_eq!(
        exchange.status,
        tradeengine::domain::position::PositionStatus::Closed
    );

    // Each leg realized (50500 - 50000) * 0.001 = 0.5
    assert_eq!(harness.guard.daily_realized_pnl().await, dec!(1.0));
}

#[tokio::test]
async fn test_close_action_signal_flattens_symbol() {
    init_tracing();
    let harness = default_harness();
    harness.fake.set_price("BTCUSDT", dec!(50000)).await;

    let buy = make_signal("strategy_a", "BTCUSDT", "buy", 0.85);
    assert_eq!(
        harness.dispatcher.dispatch(&buy).await.status,
        Verdict::Executed
    );

    let close = make_signal("strategy_a", "BTCUSDT", "close", 0.9);
    let outcome = harness.dispatcher.dispatch(&close).await;
    assert_eq!(outcome.status, Verdict::Executed, "{:?}", outcome.reason);

    let exchange = harness
        .ledger
        .get_exchange_position("BTCUSDT_LONG")
        .await
        .unwrap();
    assert_eq!(
        exchange.status,
        tradeengine::domain::position::PositionStatus::Closed
    );
}
