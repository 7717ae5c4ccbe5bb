//! Shared test harness: a fully-wired dispatcher over fakes.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use prometheus::Registry;
use tokio::sync::mpsc;

use tradeengine::application::aggregator::{AggregatorConfig, SignalAggregator};
use tradeengine::application::config_resolver::ConfigResolver;
use tradeengine::application::dispatcher::{Dispatcher, DispatcherConfig};
use tradeengine::application::guard::{PositionGuard, RiskLimits};
use tradeengine::application::ledger::StrategyPositionLedger;
use tradeengine::application::leverage::LeverageManager;
use tradeengine::application::oco::{OcoConfig, OcoManager};
use tradeengine::application::orders::{OrderManager, OrderManagerConfig};
use tradeengine::domain::events::PositionCloseEvent;
use tradeengine::domain::signal::Signal;
use tradeengine::infrastructure::locks::PassthroughLock;
use tradeengine::infrastructure::mock::{
    FakeExchange, InMemoryDataManager, ThresholdOracle, ThresholdSignalModel,
};
use tradeengine::infrastructure::observability::Metrics;

pub struct Harness {
    pub fake: Arc<FakeExchange>,
    pub data: Arc<InMemoryDataManager>,
    pub metrics: Arc<Metrics>,
    pub guard: Arc<PositionGuard>,
    pub aggregator: Arc<SignalAggregator>,
    pub resolver: Arc<ConfigResolver>,
    pub leverage: Arc<LeverageManager>,
    pub ledger: Arc<StrategyPositionLedger>,
    pub oco: Arc<OcoManager>,
    pub orders: Arc<OrderManager>,
    pub dispatcher: Arc<Dispatcher>,
    pub close_rx: Option<mpsc::Receiver<PositionCloseEvent>>,
}

pub fn test_dispatcher_config() -> DispatcherConfig {
    DispatcherConfig {
        signal_cache_ttl: Duration::from_secs(60),
        signal_cache_cleanup_interval: Duration::from_secs(30),
        accumulation_cooldown: None,
        lock_ttl: Duration::from_secs(10),
        venue_retry_attempts: 2,
        venue_retry_base_delay: Duration::from_millis(5),
        simulate: false,
    }
}

pub fn build_harness(
    dispatcher_config: DispatcherConfig,
    aggregator_config: AggregatorConfig,
) -> Harness {
    let fake = Arc::new(FakeExchange::new());
    let data = Arc::new(InMemoryDataManager::new());
    let metrics = Arc::new(Metrics::new(Registry::new()).unwrap());

    let guard = Arc::new(PositionGuard::new(RiskLimits::default()));
    let aggregator = Arc::new(SignalAggregator::new(
        aggregator_config,
        guard.clone(),
        Arc::new(ThresholdSignalModel::default()),
        Arc::new(ThresholdOracle::default()),
    ));
    let resolver = Arc::new(ConfigResolver::new(data.clone(), Duration::from_secs(60)));
    let leverage = Arc::new(LeverageManager::new(fake.clone(), data.clone()));
    let ledger = Arc::new(StrategyPositionLedger::new(data.clone(), metrics.clone()));

    let (close_tx, close_rx) = mpsc::channel(64);
    let oco = Arc::new(OcoManager::new(
        fake.clone(),
        close_tx,
        OcoConfig {
            poll_interval: Duration::from_millis(20),
            error_backoff: Duration::from_millis(20),
        },
    ));
    let orders = Arc::new(OrderManager::new(
        fake.clone(),
        OrderManagerConfig {
            price_monitoring_interval: Duration::from_millis(10),
            conditional_timeout: Duration::from_secs(5),
            price_cache_ttl: Duration::from_millis(50),
        },
    ));

    let dispatcher = Arc::new(Dispatcher::new(
        aggregator.clone(),
        guard.clone(),
        resolver.clone(),
        leverage.clone(),
        ledger.clone(),
        oco.clone(),
        orders.clone(),
        fake.clone(),
        Arc::new(PassthroughLock),
        metrics.clone(),
        dispatcher_config,
    ));

    Harness {
        fake,
        data,
        metrics,
        guard,
        aggregator,
        resolver,
        leverage,
        ledger,
        oco,
        orders,
        dispatcher,
        close_rx: Some(close_rx),
    }
}

pub fn default_harness() -> Harness {
    build_harness(test_dispatcher_config(), AggregatorConfig::default())
}

/// A deterministic-mode buy/sell signal with a fixed timestamp.
pub fn make_signal(strategy: &str, symbol: &str, action: &str, confidence: f64) -> Signal {
    serde_json::from_value(serde_json::json!({
        "strategy_id": strategy,
        "symbol": symbol,
        "action": action,
        "confidence": confidence,
        "strength": "strong",
        "timeframe": "1h",
        "strategy_mode": "deterministic",
        "current_price": "50000",
        "quantity": "0.001",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
    .unwrap()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_test_writer()
        .try_init();
}
