//! Configuration hierarchy resolution end-to-end (S6-style scenario).

mod common;

use std::sync::Arc;
use std::time::Duration;

use tradeengine::application::config_resolver::ConfigResolver;
use tradeengine::domain::order::PositionSide;
use tradeengine::domain::ports::DataManager;
use tradeengine::domain::trading_config::{ParameterPatch, TradingParameters};
use tradeengine::infrastructure::mock::InMemoryDataManager;
use tradeengine::infrastructure::persistence::SqliteDocumentStore;

async fn seed_hierarchy(resolver: &ConfigResolver) {
    // global = {leverage: 10}
    resolver
        .set_config(
            ParameterPatch {
                leverage: Some(10),
                ..Default::default()
            },
            "ops",
            None,
            None,
            None,
            false,
        )
        .await;
    // symbol BTCUSDT = {leverage: 15}
    resolver
        .set_config(
            ParameterPatch {
                leverage: Some(15),
                ..Default::default()
            },
            "ops",
            Some("BTCUSDT"),
            None,
            None,
            false,
        )
        .await;
    // symbol-side BTCUSDT/LONG = {stop_loss_pct: 0.015}
    resolver
        .set_config(
            ParameterPatch {
                stop_loss_pct: Some(0.015),
                ..Default::default()
            },
            "ops",
            Some("BTCUSDT"),
            Some(PositionSide::Long),
            None,
            false,
        )
        .await;
}

fn assert_resolution(resolved: &TradingParameters) {
    // Symbol layer wins on leverage, side layer wins on stop loss,
    // untouched keys come from defaults.
    assert_eq!(resolved.leverage, 15);
    assert_eq!(resolved.stop_loss_pct, 0.015);
    assert_eq!(
        resolved.take_profit_pct,
        TradingParameters::default().take_profit_pct
    );
}

#[tokio::test]
async fn test_hierarchy_with_in_memory_store() {
    let resolver = ConfigResolver::new(
        Arc::new(InMemoryDataManager::new()),
        Duration::from_secs(60),
    );
    seed_hierarchy(&resolver).await;

    let resolved = resolver
        .get_config(Some("BTCUSDT"), Some(PositionSide::Long))
        .await;
    assert_resolution(&resolved);

    // A different symbol only sees defaults + global
    let other = resolver
        .get_config(Some("ETHUSDT"), Some(PositionSide::Long))
        .await;
    assert_eq!(other.leverage, 10);
    assert_eq!(other.stop_loss_pct, TradingParameters::default().stop_loss_pct);

    // SHORT side skips the LONG-scoped override
    let short = resolver
        .get_config(Some("BTCUSDT"), Some(PositionSide::Short))
        .await;
    assert_eq!(short.leverage, 15);
    assert_eq!(short.stop_loss_pct, TradingParameters::default().stop_loss_pct);
}

#[tokio::test]
async fn test_hierarchy_survives_sqlite_round_trip() {
    let store = SqliteDocumentStore::new("sqlite::memory:").await.unwrap();
    let data: Arc<dyn DataManager> = Arc::new(store);
    let resolver = ConfigResolver::new(data, Duration::from_secs(60));
    seed_hierarchy(&resolver).await;

    let resolved = resolver
        .get_config(Some("BTCUSDT"), Some(PositionSide::Long))
        .await;
    assert_resolution(&resolved);

    // Versions and the audit trail persisted
    let trail = resolver.audit_trail(10).await.unwrap();
    assert_eq!(trail.len(), 3);
}

#[tokio::test]
async fn test_cache_serves_until_invalidated() {
    let resolver = ConfigResolver::new(
        Arc::new(InMemoryDataManager::new()),
        Duration::from_secs(60),
    );
    seed_hierarchy(&resolver).await;

    let warm = resolver.get_config(Some("BTCUSDT"), None).await;
    assert_eq!(warm.leverage, 15);

    resolver
        .set_config(
            ParameterPatch {
                leverage: Some(25),
                ..Default::default()
            },
            "ops",
            Some("BTCUSDT"),
            None,
            None,
            false,
        )
        .await;

    // set_config invalidated the entry, so the new layer shows through
    let updated = resolver.get_config(Some("BTCUSDT"), None).await;
    assert_eq!(updated.leverage, 25);
}
