//! Signal dispatcher: converts approved signals into risk-checked,
//! leader-gated exchange orders and keeps the position ledger and OCO
//! manager in sync.
//!
//! Ordering guarantee: for a given (symbol, position side), risk check,
//! leverage sync, order submission, ledger update and OCO arming happen
//! under one distributed-lock critical section. Non-leader pods
//! short-circuit instead of waiting.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::application::aggregator::{OrderParams, SignalAggregator, Verdict};
use crate::application::config_resolver::ConfigResolver;
use crate::application::guard::PositionGuard;
use crate::application::ledger::StrategyPositionLedger;
use crate::application::leverage::LeverageManager;
use crate::application::oco::{OcoManager, OcoPlacement};
use crate::application::orders::OrderManager;
use crate::domain::errors::VenueError;
use crate::domain::events::PositionCloseEvent;
use crate::domain::order::{
    ExecutionReport, Order, OrderSide, OrderType, PositionSide,
};
use crate::domain::position::{CloseReason, exchange_position_key};
use crate::domain::ports::{DistributedLock, Exchange};
use crate::domain::signal::{Signal, SignalAction};
use crate::infrastructure::observability::Metrics;

const EXCHANGE_LABEL: &str = "binance";
/// Fallback notional when the venue minimum cannot be computed.
const FALLBACK_NOTIONAL_USD: u32 = 10;
/// Last-resort order size when no price is available either.
const FALLBACK_AMOUNT: &str = "0.001";

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Fingerprint cache TTL for duplicate suppression
    pub signal_cache_ttl: Duration,
    /// Cadence of opportunistic cache cleanup
    pub signal_cache_cleanup_interval: Duration,
    /// Minimum spacing between same-(symbol, side) entries; None disables
    pub accumulation_cooldown: Option<Duration>,
    /// Lease TTL for the per-(symbol, side) execution lock
    pub lock_ttl: Duration,
    /// Bounded retries for transient venue failures
    pub venue_retry_attempts: u32,
    pub venue_retry_base_delay: Duration,
    /// Mark outbound orders as simulated
    pub simulate: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            signal_cache_ttl: Duration::from_secs(60),
            signal_cache_cleanup_interval: Duration::from_secs(30),
            accumulation_cooldown: Some(Duration::from_secs(60)),
            lock_ttl: Duration::from_secs(30),
            venue_retry_attempts: 3,
            venue_retry_base_delay: Duration::from_millis(250),
            simulate: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchOutcome {
    pub status: Verdict,
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicate_age_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy_position_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sl_order_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tp_order_id: Option<String>,
}

impl DispatchOutcome {
    fn status_only(status: Verdict, reason: Option<String>) -> Self {
        Self {
            status,
            reason,
            duplicate_age_seconds: None,
            execution: None,
            strategy_position_id: None,
            sl_order_id: None,
            tp_order_id: None,
        }
    }

    fn rejected(reason: impl Into<String>) -> Self {
        Self::status_only(Verdict::Rejected, Some(reason.into()))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub exchange_reachable: bool,
    pub active_oco_pairs: usize,
    pub open_strategy_positions: usize,
    pub cached_fingerprints: usize,
}

pub struct Dispatcher {
    aggregator: Arc<SignalAggregator>,
    guard: Arc<PositionGuard>,
    config_resolver: Arc<ConfigResolver>,
    leverage: Arc<LeverageManager>,
    ledger: Arc<StrategyPositionLedger>,
    oco: Arc<OcoManager>,
    orders: Arc<OrderManager>,
    exchange: Arc<dyn Exchange>,
    lock: Arc<dyn DistributedLock>,
    metrics: Arc<Metrics>,
    config: DispatcherConfig,
    signal_cache: Mutex<HashMap<String, Instant>>,
    last_cache_cleanup: Mutex<Instant>,
    last_accumulation: Mutex<HashMap<String, Instant>>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        aggregator: Arc<SignalAggregator>,
        guard: Arc<PositionGuard>,
        config_resolver: Arc<ConfigResolver>,
        leverage: Arc<LeverageManager>,
        ledger: Arc<StrategyPositionLedger>,
        oco: Arc<OcoManager>,
        orders: Arc<OrderManager>,
        exchange: Arc<dyn Exchange>,
        lock: Arc<dyn DistributedLock>,
        metrics: Arc<Metrics>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            aggregator,
            guard,
            config_resolver,
            leverage,
            ledger,
            oco,
            orders,
            exchange,
            lock,
            metrics,
            config,
            signal_cache: Mutex::new(HashMap::new()),
            last_cache_cleanup: Mutex::new(Instant::now()),
            last_accumulation: Mutex::new(HashMap::new()),
        }
    }

    /// Stable fingerprint for duplicate detection. Hashing must match
    /// across pods so the duplicate metric is meaningful fleet-wide.
    pub fn signal_fingerprint(signal: &Signal) -> String {
        let mut hasher = Sha256::new();
        hasher.update(signal.strategy_id.as_bytes());
        hasher.update(b":");
        hasher.update(signal.symbol.as_bytes());
        hasher.update(b":");
        hasher.update(signal.action.to_string().as_bytes());
        hasher.update(b":");
        hasher.update(signal.timestamp.timestamp().to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Full signal → order pipeline.
    pub async fn dispatch(&self, signal: &Signal) -> DispatchOutcome {
        let action = signal.action.to_string();
        self.metrics
            .inc_signal_received(&signal.strategy_id, &signal.symbol, &action);

        // 1. Duplicate suppression
        let fingerprint = Self::signal_fingerprint(signal);
        {
            let mut cache = self.signal_cache.lock().await;
            if let Some(first_seen) = cache.get(&fingerprint) {
                if first_seen.elapsed() < self.config.signal_cache_ttl {
                    let age = first_seen.elapsed().as_secs();
                    self.metrics.inc_signal_duplicate(
                        &signal.strategy_id,
                        &signal.symbol,
                        &action,
                    );
                    info!(
                        "Duplicate signal suppressed for {} {} (age {}s)",
                        signal.symbol, action, age
                    );
                    return DispatchOutcome {
                        status: Verdict::Duplicate,
                        reason: Some("Duplicate signal within cache TTL".to_string()),
                        duplicate_age_seconds: Some(age),
                        execution: None,
                        strategy_position_id: None,
                        sl_order_id: None,
                        tp_order_id: None,
                    };
                }
                cache.remove(&fingerprint);
            }
            cache.insert(fingerprint, Instant::now());
        }
        self.maybe_cleanup_signal_cache().await;

        // 2. Arbitration
        let outcome = self.aggregator.process_signal(signal).await;
        if outcome.status != Verdict::Executed {
            return DispatchOutcome::status_only(outcome.status, outcome.reason);
        }
        let params = outcome
            .order_params
            .expect("executed outcome carries order params");

        match params.action {
            SignalAction::Hold => {
                return DispatchOutcome::rejected("Hold action produces no order");
            }
            SignalAction::Close => {
                return self.close_symbol_positions(signal).await;
            }
            SignalAction::Buy | SignalAction::Sell => {}
        }

        let position_side = match params.action {
            SignalAction::Sell => PositionSide::Short,
            _ => PositionSide::Long,
        };
        let position_key = exchange_position_key(&signal.symbol, position_side);

        // 3. Accumulation cooldown, applied after arbitration: a signal
        // that wins its conflict can still be rejected here.
        if let Some(cooldown) = self.config.accumulation_cooldown {
            let accumulation = self.last_accumulation.lock().await;
            if let Some(last) = accumulation.get(&position_key)
                && last.elapsed() < cooldown
            {
                return DispatchOutcome::rejected(format!(
                    "accumulation_cooldown: last entry on {} was {}s ago",
                    position_key,
                    last.elapsed().as_secs()
                ));
            }
        }

        // 4. Order construction
        let order = match self.signal_to_order(signal, &params, position_side).await {
            Ok(order) => order,
            Err(e) => {
                error!("Failed to build order for {}: {}", signal.symbol, e);
                return DispatchOutcome::status_only(Verdict::Error, Some(e.to_string()));
            }
        };

        // 5. Leader-gated execution
        let lock_key = format!("{}:{}", signal.symbol, position_side);
        let lease = match self.lock.acquire(&lock_key, self.config.lock_ttl).await {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                return DispatchOutcome::rejected(format!(
                    "Execution lock {} held by another pod",
                    lock_key
                ));
            }
            Err(e) => {
                error!("Lock service failure for {}: {}", lock_key, e);
                return DispatchOutcome::status_only(Verdict::Error, Some(e.to_string()));
            }
        };

        let result = self
            .execute_under_lock(signal, order, position_side, &position_key)
            .await;

        if let Err(e) = self.lock.release(lease).await {
            warn!("Failed to release lock {}: {}", lock_key, e);
        }

        result
    }

    async fn execute_under_lock(
        &self,
        signal: &Signal,
        order: Order,
        position_side: PositionSide,
        position_key: &str,
    ) -> DispatchOutcome {
        let notional = order.notional(signal.current_price);

        // Pre-trade risk
        match self.guard.check_order(&signal.symbol, notional).await {
            Ok(()) => {
                self.metrics
                    .inc_risk_check("pre_trade", "pass", EXCHANGE_LABEL);
            }
            Err(violation) => {
                self.metrics
                    .inc_risk_check("pre_trade", "fail", EXCHANGE_LABEL);
                self.metrics.inc_risk_rejection(
                    violation.reason_label(),
                    &signal.symbol,
                    EXCHANGE_LABEL,
                );
                return DispatchOutcome::rejected(violation.to_string());
            }
        }

        // Leverage sync is best-effort; failures are recorded and the
        // trade proceeds on existing leverage.
        let resolved = self
            .config_resolver
            .get_config(Some(&signal.symbol), Some(position_side))
            .await;
        self.leverage
            .ensure_leverage(&signal.symbol, resolved.leverage)
            .await;

        // Submit
        let order_type_label = order.order_type.to_string();
        let side_label = order.side.to_string();
        let started = Instant::now();
        let report = match self.execute_with_retry(&order).await {
            Ok(report) => report,
            Err(e) => {
                self.metrics.inc_order_failure(
                    &signal.symbol,
                    &order_type_label,
                    venue_failure_label(&e),
                    EXCHANGE_LABEL,
                );
                return DispatchOutcome::status_only(Verdict::Error, Some(e.to_string()));
            }
        };
        self.metrics
            .order_execution_latency_seconds
            .observe(started.elapsed().as_secs_f64());

        self.orders.track_order(&order, &report).await;

        if report.is_filled() {
            self.metrics.inc_order_executed(
                &order_type_label,
                &side_label,
                &signal.symbol,
                EXCHANGE_LABEL,
            );
            info!(
                "Order filled for {} {} {} @ {:?}",
                signal.symbol, side_label, order.amount, report.fill_price
            );
        } else if report.status == crate::domain::order::OrderStatus::Pending {
            // Resting order; position accounting happens on fill.
            return DispatchOutcome {
                status: Verdict::Executed,
                reason: Some("Order resting on venue".to_string()),
                duplicate_age_seconds: None,
                execution: Some(report),
                strategy_position_id: None,
                sl_order_id: None,
                tp_order_id: None,
            };
        } else {
            self.metrics.inc_order_failure(
                &signal.symbol,
                &order_type_label,
                "venue_rejected",
                EXCHANGE_LABEL,
            );
            return DispatchOutcome::rejected(format!(
                "Venue rejected order: {:?}",
                report.error
            ));
        }

        // Ledger update
        let strategy_position_id = match self
            .ledger
            .create_strategy_position(signal, &order, &report)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                error!("Ledger update failed after fill: {}", e);
                return DispatchOutcome::status_only(Verdict::Error, Some(e.to_string()));
            }
        };

        let fill_price = report.fill_price.unwrap_or(signal.current_price);
        let fill_amount = report.amount.unwrap_or(order.amount);
        self.guard
            .add_exposure(position_key, fill_amount * fill_price)
            .await;
        self.last_accumulation
            .lock()
            .await
            .insert(position_key.to_string(), Instant::now());

        // Arm protective orders
        let (sl_order_id, tp_order_id) = if !order.reduce_only {
            self.arm_protection(signal, &report, &strategy_position_id, position_side)
                .await
        } else {
            (None, None)
        };

        DispatchOutcome {
            status: Verdict::Executed,
            reason: Some("Order executed".to_string()),
            duplicate_age_seconds: None,
            execution: Some(report),
            strategy_position_id: Some(strategy_position_id),
            sl_order_id,
            tp_order_id,
        }
    }

    /// Place OCO when both SL and TP are requested, a lone protective
    /// order when only one is.
    async fn arm_protection(
        &self,
        signal: &Signal,
        report: &ExecutionReport,
        strategy_position_id: &str,
        position_side: PositionSide,
    ) -> (Option<String>, Option<String>) {
        let Some(position) = self.ledger.get_strategy_position(strategy_position_id).await
        else {
            return (None, None);
        };

        match (position.stop_loss_price, position.take_profit_price) {
            (Some(sl_price), Some(tp_price)) => {
                match self
                    .oco
                    .place_oco_orders(
                        &report.order_id,
                        &signal.symbol,
                        position_side,
                        position.entry_quantity,
                        position.entry_price,
                        sl_price,
                        tp_price,
                        Some(strategy_position_id.to_string()),
                    )
                    .await
                {
                    Ok(OcoPlacement {
                        sl_order_id,
                        tp_order_id,
                    }) => {
                        self.ledger
                            .set_protective_order_ids(
                                strategy_position_id,
                                Some(sl_order_id.clone()),
                                Some(tp_order_id.clone()),
                            )
                            .await;
                        (Some(sl_order_id), Some(tp_order_id))
                    }
                    Err(e) => {
                        error!(
                            "OCO placement failed for {}: {}",
                            strategy_position_id, e
                        );
                        (None, None)
                    }
                }
            }
            (Some(sl_price), None) => {
                let id = self
                    .place_lone_protective(signal, position_side, position.entry_quantity, OrderType::Stop, sl_price)
                    .await;
                self.ledger
                    .set_protective_order_ids(strategy_position_id, id.clone(), None)
                    .await;
                (id, None)
            }
            (None, Some(tp_price)) => {
                let id = self
                    .place_lone_protective(signal, position_side, position.entry_quantity, OrderType::TakeProfit, tp_price)
                    .await;
                self.ledger
                    .set_protective_order_ids(strategy_position_id, None, id.clone())
                    .await;
                (None, id)
            }
            (None, None) => (None, None),
        }
    }

    async fn place_lone_protective(
        &self,
        signal: &Signal,
        position_side: PositionSide,
        quantity: Decimal,
        order_type: OrderType,
        trigger_price: Decimal,
    ) -> Option<String> {
        let mut order = Order::new(
            signal.symbol.as_str(),
            position_side.closing_order_side(),
            order_type,
            quantity,
            position_side,
        );
        order.reduce_only = true;
        order.target_price = Some(trigger_price);
        match order_type {
            OrderType::Stop => order.stop_loss = Some(trigger_price),
            OrderType::TakeProfit => order.take_profit = Some(trigger_price),
            _ => {}
        }
        order.simulate = self.config.simulate;

        match self.exchange.execute(&order).await {
            Ok(report) => {
                self.orders.track_order(&order, &report).await;
                Some(report.order_id)
            }
            Err(e) => {
                warn!(
                    "Lone {} placement failed for {}: {}",
                    order_type, signal.symbol, e
                );
                None
            }
        }
    }

    /// Execute a pre-built order directly (manual/ops path). Runs the
    /// risk gate and bounded retries, then tracks the result; no signal
    /// bookkeeping or OCO arming happens here.
    pub async fn execute_order(&self, order: &Order) -> DispatchOutcome {
        let price = match order.target_price {
            Some(price) => price,
            None => match self.exchange.get_symbol_price(&order.symbol).await {
                Ok(price) => price,
                Err(e) => {
                    return DispatchOutcome::status_only(Verdict::Error, Some(e.to_string()));
                }
            },
        };

        // Reduce-only orders shrink exposure and skip the sizing gate.
        if !order.reduce_only {
            if let Err(violation) = self
                .guard
                .check_order(&order.symbol, order.notional(price))
                .await
            {
                self.metrics
                    .inc_risk_check("pre_trade", "fail", EXCHANGE_LABEL);
                self.metrics.inc_risk_rejection(
                    violation.reason_label(),
                    &order.symbol,
                    EXCHANGE_LABEL,
                );
                return DispatchOutcome::rejected(violation.to_string());
            }
            self.metrics
                .inc_risk_check("pre_trade", "pass", EXCHANGE_LABEL);
        }

        let started = Instant::now();
        match self.execute_with_retry(order).await {
            Ok(report) => {
                self.metrics
                    .order_execution_latency_seconds
                    .observe(started.elapsed().as_secs_f64());
                if report.is_filled() {
                    self.metrics.inc_order_executed(
                        &order.order_type.to_string(),
                        &order.side.to_string(),
                        &order.symbol,
                        EXCHANGE_LABEL,
                    );
                }
                self.orders.track_order(order, &report).await;
                DispatchOutcome {
                    status: Verdict::Executed,
                    reason: None,
                    duplicate_age_seconds: None,
                    execution: Some(report),
                    strategy_position_id: None,
                    sl_order_id: None,
                    tp_order_id: None,
                }
            }
            Err(e) => {
                self.metrics.inc_order_failure(
                    &order.symbol,
                    &order.order_type.to_string(),
                    venue_failure_label(&e),
                    EXCHANGE_LABEL,
                );
                DispatchOutcome::status_only(Verdict::Error, Some(e.to_string()))
            }
        }
    }

    /// A close action tears down every open exchange position on the
    /// symbol, both sides.
    async fn close_symbol_positions(&self, signal: &Signal) -> DispatchOutcome {
        let mut closed = 0usize;
        for side in [PositionSide::Long, PositionSide::Short] {
            let key = exchange_position_key(&signal.symbol, side);
            if let Some(position) = self.ledger.get_exchange_position(&key).await
                && position.current_quantity > Decimal::ZERO
            {
                match self
                    .close_position_with_cleanup(
                        &key,
                        &signal.symbol,
                        side,
                        position.current_quantity,
                        CloseReason::SignalClose,
                    )
                    .await
                {
                    Ok(n) => closed += n,
                    Err(e) => {
                        error!("Close failed for {}: {}", key, e);
                        return DispatchOutcome::status_only(
                            Verdict::Error,
                            Some(e.to_string()),
                        );
                    }
                }
            }
        }
        DispatchOutcome::status_only(
            Verdict::Executed,
            Some(format!("Closed {} strategy positions", closed)),
        )
    }

    /// Cancel the OCO pairs on the exchange position, flatten it with a
    /// reduce-only market order, then close the owning strategy
    /// positions. Returns how many strategy positions were closed.
    pub async fn close_position_with_cleanup(
        &self,
        position_key: &str,
        symbol: &str,
        side: PositionSide,
        quantity: Decimal,
        reason: CloseReason,
    ) -> Result<usize> {
        let cancelled = self.oco.cancel_pairs_for_key(position_key).await;
        if cancelled > 0 {
            info!(
                "Cancelled {} OCO pairs before closing {}",
                cancelled, position_key
            );
        }

        let mut close_order = Order::new(
            symbol,
            side.closing_order_side(),
            OrderType::Market,
            quantity,
            side,
        );
        close_order.reduce_only = true;
        close_order.simulate = self.config.simulate;

        let report = self.execute_with_retry(&close_order).await?;
        self.orders.track_order(&close_order, &report).await;
        let exit_price = match report.fill_price {
            Some(price) => price,
            None => self.exchange.get_symbol_price(symbol).await?,
        };

        let open_positions = self.ledger.open_positions_for_key(position_key).await;
        let mut closed = 0usize;
        for position in open_positions {
            match self
                .ledger
                .close_strategy_position(
                    &position.strategy_position_id,
                    exit_price,
                    None,
                    reason,
                    Some(report.order_id.clone()),
                )
                .await
            {
                Ok(summary) => {
                    self.guard.record_realized_pnl(summary.realized_pnl).await;
                    self.guard
                        .release_exposure(
                            position_key,
                            position.entry_quantity * position.entry_price,
                        )
                        .await;
                    closed += 1;
                }
                Err(e) => error!(
                    "Failed closing strategy position {}: {}",
                    position.strategy_position_id, e
                ),
            }
        }
        self.publish_daily_pnl().await;

        Ok(closed)
    }

    /// Consume close events from the OCO monitor and apply them to the
    /// ledger. Spawned once at engine start.
    pub fn spawn_close_event_loop(
        self: &Arc<Self>,
        mut rx: mpsc::Receiver<PositionCloseEvent>,
    ) -> JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(strategy_position_id) = event.strategy_position_id.clone() else {
                    warn!(
                        "Close event for {} has no strategy position; skipped",
                        event.position_id
                    );
                    continue;
                };
                match dispatcher
                    .ledger
                    .close_strategy_position(
                        &strategy_position_id,
                        event.exit_price,
                        Some(event.quantity),
                        event.close_reason,
                        event.exit_order_id.clone(),
                    )
                    .await
                {
                    Ok(summary) => {
                        dispatcher
                            .guard
                            .record_realized_pnl(summary.realized_pnl)
                            .await;
                        dispatcher
                            .guard
                            .release_exposure(
                                &exchange_position_key(&event.symbol, event.position_side),
                                event.quantity * summary.entry_price,
                            )
                            .await;
                        dispatcher.publish_daily_pnl().await;
                        info!(
                            "Applied {} close for {} (PnL ${:.2})",
                            event.close_reason, strategy_position_id, summary.realized_pnl
                        );
                    }
                    Err(e) => error!(
                        "Failed to apply close event for {}: {}",
                        strategy_position_id, e
                    ),
                }
            }
            info!("Close-event loop finished: channel closed");
        })
    }

    async fn publish_daily_pnl(&self) {
        let pnl = self.guard.daily_realized_pnl().await;
        self.metrics
            .daily_pnl_usd
            .with_label_values(&[EXCHANGE_LABEL])
            .set(pnl.to_f64().unwrap_or(0.0));
    }

    async fn execute_with_retry(&self, order: &Order) -> Result<ExecutionReport, VenueError> {
        let mut attempt = 0u32;
        loop {
            match self.exchange.execute(order).await {
                Ok(report) => return Ok(report),
                Err(e) if e.is_retryable() && attempt < self.config.venue_retry_attempts => {
                    attempt += 1;
                    let delay = self.config.venue_retry_base_delay * 2u32.pow(attempt - 1);
                    warn!(
                        "Transient venue error on {} (attempt {}): {}; retrying in {:?}",
                        order.symbol, attempt, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn signal_to_order(
        &self,
        signal: &Signal,
        params: &OrderParams,
        position_side: PositionSide,
    ) -> Result<Order> {
        let side = match params.action {
            SignalAction::Sell => OrderSide::Sell,
            _ => OrderSide::Buy,
        };

        let amount = self.calculate_order_amount(signal).await;
        if amount <= Decimal::ZERO {
            anyhow::bail!("Computed order amount is zero for {}", signal.symbol);
        }

        let mut order = Order::new(signal.symbol.as_str(), side, params.order_type, amount, position_side);
        order.time_in_force = params.time_in_force;
        order.simulate = self.config.simulate;
        order.strategy_id = Some(signal.strategy_id.clone());
        order.signal_id = signal.signal_id.clone();
        if params.order_type != OrderType::Market {
            order.target_price = signal.target_price.or(Some(signal.current_price));
        }
        Ok(order)
    }

    /// Order amount ladder: signal quantity clamped up to the venue
    /// minimum, else a ~10 USD notional at current price, else a fixed
    /// floor.
    async fn calculate_order_amount(&self, signal: &Signal) -> Decimal {
        let venue_minimum = match self.exchange.get_symbol_info(&signal.symbol).await {
            Ok(info) => {
                let price = if signal.current_price > Decimal::ZERO {
                    signal.current_price
                } else {
                    Decimal::ONE
                };
                let notional_min = round_up_to_step(info.min_notional / price, info.step_size);
                Some(notional_min.max(info.min_qty))
            }
            Err(e) => {
                warn!(
                    "Symbol info unavailable for {}: {}; using notional fallback",
                    signal.symbol, e
                );
                None
            }
        };

        match (signal.quantity.filter(|q| *q > Decimal::ZERO), venue_minimum) {
            (Some(quantity), Some(minimum)) => quantity.max(minimum),
            (None, Some(minimum)) => minimum,
            (Some(quantity), None) => quantity,
            (None, None) => {
                if signal.current_price > Decimal::ZERO {
                    Decimal::from(FALLBACK_NOTIONAL_USD) / signal.current_price
                } else {
                    FALLBACK_AMOUNT.parse().expect("static literal parses")
                }
            }
        }
    }

    async fn maybe_cleanup_signal_cache(&self) {
        let mut last_cleanup = self.last_cache_cleanup.lock().await;
        if last_cleanup.elapsed() < self.config.signal_cache_cleanup_interval {
            return;
        }
        *last_cleanup = Instant::now();
        drop(last_cleanup);

        self.cleanup_signal_cache().await;
    }

    /// Drop expired fingerprints. Also called directly by tests.
    pub async fn cleanup_signal_cache(&self) {
        let ttl = self.config.signal_cache_ttl;
        let mut cache = self.signal_cache.lock().await;
        let before = cache.len();
        cache.retain(|_, first_seen| first_seen.elapsed() < ttl);
        if before > cache.len() {
            info!("Signal cache cleanup evicted {} entries", before - cache.len());
        }
    }

    pub async fn cached_fingerprint_count(&self) -> usize {
        self.signal_cache.lock().await.len()
    }

    pub async fn health_check(&self) -> HealthReport {
        let exchange_reachable = self.exchange.ping().await.is_ok();
        HealthReport {
            status: if exchange_reachable { "healthy" } else { "degraded" },
            exchange_reachable,
            active_oco_pairs: self.oco.active_pair_count().await,
            open_strategy_positions: self.ledger.open_position_count().await,
            cached_fingerprints: self.cached_fingerprint_count().await,
        }
    }
}

fn venue_failure_label(error: &VenueError) -> &'static str {
    match error {
        VenueError::Timeout(_) => "timeout",
        VenueError::Connection(_) => "connection",
        VenueError::RateLimited { .. } => "rate_limited",
        VenueError::Business { .. } => "venue_business",
        VenueError::Protocol(_) => "protocol",
    }
}

/// Round `value` up to the next multiple of `step`.
fn round_up_to_step(value: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return value;
    }
    (value / step).ceil() * step
}
