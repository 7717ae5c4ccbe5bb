//! Process wiring: builds every component once, starts the background
//! loops, and tears them down in order on shutdown.
//!
//! There are no global singletons; the engine owns the component graph
//! and hands out `Arc` references.

use std::sync::Arc;

use anyhow::{Context, Result};
use prometheus::Registry;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::application::aggregator::{AggregatorConfig, SignalAggregator};
use crate::application::config_resolver::ConfigResolver;
use crate::application::dispatcher::{DispatchOutcome, Dispatcher, DispatcherConfig};
use crate::application::guard::{PositionGuard, RiskLimits};
use crate::application::ledger::StrategyPositionLedger;
use crate::application::leverage::LeverageManager;
use crate::application::oco::{OcoConfig, OcoManager};
use crate::application::orders::{OrderManager, OrderManagerConfig};
use crate::config::{EngineConfig, Mode};
use crate::domain::ports::{DataManager, DistributedLock, Exchange};
use crate::domain::signal::Signal;
use crate::infrastructure::binance::BinanceFuturesExchange;
use crate::infrastructure::locks::{LeaseLock, PassthroughLock};
use crate::infrastructure::mock::{
    FakeExchange, InMemoryDataManager, ThresholdOracle, ThresholdSignalModel,
};
use crate::infrastructure::observability::Metrics;
use crate::infrastructure::persistence::SqliteDocumentStore;

pub struct TradingEngine {
    pub dispatcher: Arc<Dispatcher>,
    pub aggregator: Arc<SignalAggregator>,
    pub config_resolver: Arc<ConfigResolver>,
    pub leverage: Arc<LeverageManager>,
    pub ledger: Arc<StrategyPositionLedger>,
    pub oco: Arc<OcoManager>,
    pub orders: Arc<OrderManager>,
    pub metrics: Arc<Metrics>,
    close_loop: Option<JoinHandle<()>>,
}

impl TradingEngine {
    /// Construct the component graph for the configured mode.
    pub async fn build(config: EngineConfig) -> Result<Self> {
        let metrics = Arc::new(Metrics::new(Registry::new()).context("metrics registry")?);

        let (exchange, data, lock): (
            Arc<dyn Exchange>,
            Arc<dyn DataManager>,
            Arc<dyn DistributedLock>,
        ) = match config.mode {
            Mode::Mock => {
                info!("Engine in MOCK mode: fake exchange, in-memory store");
                (
                    Arc::new(FakeExchange::new()),
                    Arc::new(InMemoryDataManager::new()),
                    Arc::new(PassthroughLock),
                )
            }
            Mode::Live => {
                let store = SqliteDocumentStore::new(&config.database_url)
                    .await
                    .context("document store")?;
                let data: Arc<dyn DataManager> = Arc::new(store);
                (
                    Arc::new(BinanceFuturesExchange::new(
                        config.binance_api_key.clone(),
                        config.binance_api_secret.clone(),
                        config.binance_base_url.clone(),
                    )),
                    data.clone(),
                    Arc::new(LeaseLock::new(data)),
                )
            }
        };

        let guard = Arc::new(PositionGuard::new(RiskLimits {
            max_position_size_pct: config.max_position_size_pct,
            max_daily_loss_pct: config.max_daily_loss_pct,
            max_portfolio_exposure_pct: config.max_portfolio_exposure_pct,
            portfolio_value: config.portfolio_value,
            enabled: config.risk_enabled,
        }));

        let aggregator = Arc::new(SignalAggregator::new(
            AggregatorConfig {
                max_signal_age_seconds: config.max_signal_age_seconds,
                conflict_policy: config.conflict_policy,
                timeframe_policy: config.timeframe_policy,
                deterministic_enabled: config.deterministic_enabled,
                ml_light_enabled: config.ml_light_enabled,
                llm_reasoning_enabled: config.llm_reasoning_enabled,
                signal_retention_seconds: config.signal_retention_seconds,
            },
            guard.clone(),
            Arc::new(ThresholdSignalModel::default()),
            Arc::new(ThresholdOracle::default()),
        ));

        let config_resolver = Arc::new(ConfigResolver::new(data.clone(), config.config_cache_ttl));
        let leverage = Arc::new(LeverageManager::new(exchange.clone(), data.clone()));
        let ledger = Arc::new(StrategyPositionLedger::new(data.clone(), metrics.clone()));

        let (close_tx, close_rx) = mpsc::channel(256);
        let oco = Arc::new(OcoManager::new(
            exchange.clone(),
            close_tx,
            OcoConfig {
                poll_interval: config.oco_poll_interval,
                error_backoff: config.oco_error_backoff,
            },
        ));

        let orders = Arc::new(OrderManager::new(
            exchange.clone(),
            OrderManagerConfig {
                price_monitoring_interval: config.price_monitoring_interval,
                conditional_timeout: config.conditional_order_timeout,
                price_cache_ttl: std::time::Duration::from_secs(30),
            },
        ));

        let dispatcher = Arc::new(Dispatcher::new(
            aggregator.clone(),
            guard.clone(),
            config_resolver.clone(),
            leverage.clone(),
            ledger.clone(),
            oco.clone(),
            orders.clone(),
            exchange.clone(),
            lock,
            metrics.clone(),
            DispatcherConfig {
                signal_cache_ttl: config.signal_cache_ttl,
                signal_cache_cleanup_interval: config.signal_cache_cleanup_interval,
                accumulation_cooldown: config.accumulation_cooldown,
                lock_ttl: config.lock_ttl,
                venue_retry_attempts: config.venue_retry_attempts,
                venue_retry_base_delay: config.venue_retry_base_delay,
                simulate: config.simulate,
            },
        ));

        let mut engine = Self {
            dispatcher,
            aggregator,
            config_resolver,
            leverage,
            ledger,
            oco,
            orders,
            metrics,
            close_loop: None,
        };

        engine.start(&exchange).await?;
        engine.close_loop = Some(engine.dispatcher.spawn_close_event_loop(close_rx));
        Ok(engine)
    }

    async fn start(&mut self, exchange: &Arc<dyn Exchange>) -> Result<()> {
        self.config_resolver.start().await?;

        if let Err(e) = exchange.set_position_mode(true).await {
            warn!("Could not enable hedge position mode: {}", e);
        }

        match self.leverage.sync_all_leverage().await {
            Ok(summary) if summary.total > 0 => {
                info!(
                    "Startup leverage sync: {}/{} symbols synced",
                    summary.synced, summary.total
                );
            }
            Ok(_) => {}
            Err(e) => warn!("Startup leverage sync failed: {}", e),
        }

        info!("Trading engine started");
        Ok(())
    }

    pub async fn dispatch(&self, signal: &Signal) -> DispatchOutcome {
        self.dispatcher.dispatch(signal).await
    }

    /// Stop monitors and sweepers, then drop external connections.
    pub async fn shutdown(&mut self) {
        self.oco.shutdown().await;
        self.orders.shutdown().await;
        self.config_resolver.stop().await;
        if let Some(handle) = self.close_loop.take() {
            handle.abort();
        }
        info!("Trading engine stopped");
    }
}
