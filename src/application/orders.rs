//! Order tracking and client-side conditional execution.
//!
//! Three bags: working orders, conditional (client-triggered) orders and
//! terminal history. Each conditional order gets its own monitor task
//! polling the price until the trigger condition is met or the timeout
//! elapses.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::domain::order::{
    ExecutionReport, Order, OrderStatus, TriggerDirection,
};
use crate::domain::ports::Exchange;

#[derive(Debug, Clone)]
pub struct OrderManagerConfig {
    /// Cadence of conditional-order price checks
    pub price_monitoring_interval: Duration,
    /// Default lifetime of a conditional order
    pub conditional_timeout: Duration,
    /// Freshness window for the last-price cache
    pub price_cache_ttl: Duration,
}

impl Default for OrderManagerConfig {
    fn default() -> Self {
        Self {
            price_monitoring_interval: Duration::from_secs(1),
            conditional_timeout: Duration::from_secs(3600),
            price_cache_ttl: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TrackedOrder {
    pub order_id: String,
    pub order: Order,
    pub status: OrderStatus,
    pub tracked_at: DateTime<Utc>,
    pub execution: Option<ExecutionReport>,
    pub terminal_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderSummary {
    pub active_orders: usize,
    pub conditional_orders: usize,
    pub total_orders: usize,
    pub status_distribution: HashMap<String, usize>,
}

type Bag = Arc<RwLock<HashMap<String, TrackedOrder>>>;
type History = Arc<RwLock<Vec<TrackedOrder>>>;

pub struct OrderManager {
    exchange: Arc<dyn Exchange>,
    config: OrderManagerConfig,
    active: Bag,
    conditional: Bag,
    history: History,
    price_cache: Arc<RwLock<HashMap<String, (Decimal, Instant)>>>,
    monitors: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl OrderManager {
    pub fn new(exchange: Arc<dyn Exchange>, config: OrderManagerConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            exchange,
            config,
            active: Arc::new(RwLock::new(HashMap::new())),
            conditional: Arc::new(RwLock::new(HashMap::new())),
            history: Arc::new(RwLock::new(Vec::new())),
            price_cache: Arc::new(RwLock::new(HashMap::new())),
            monitors: Mutex::new(Vec::new()),
            shutdown_tx,
        }
    }

    /// Route a submitted order into the right bag and, for conditional
    /// types, start its monitor.
    pub async fn track_order(&self, order: &Order, report: &ExecutionReport) {
        let order_id = if report.order_id.is_empty() {
            order.order_id.clone()
        } else {
            report.order_id.clone()
        };

        let tracked = TrackedOrder {
            order_id: order_id.clone(),
            order: order.clone(),
            status: report.status,
            tracked_at: Utc::now(),
            execution: Some(report.clone()),
            terminal_at: None,
        };

        if order.order_type.is_conditional() {
            self.setup_conditional_order(tracked).await;
            return;
        }

        if report.status.is_working() {
            self.active.write().await.insert(order_id, tracked);
        } else {
            self.history.write().await.push(tracked);
        }
    }

    async fn setup_conditional_order(&self, tracked: TrackedOrder) {
        let Some(trigger_price) = tracked.order.conditional_price else {
            warn!(
                "Conditional order {} has no trigger price; moved to history",
                tracked.order_id
            );
            let mut dead = tracked;
            dead.status = OrderStatus::Rejected;
            dead.terminal_at = Some(Utc::now());
            self.history.write().await.push(dead);
            return;
        };
        let direction = tracked
            .order
            .conditional_direction
            .unwrap_or(TriggerDirection::Above);
        let timeout = tracked
            .order
            .conditional_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.config.conditional_timeout);

        let order_id = tracked.order_id.clone();
        let symbol = tracked.order.symbol.clone();
        self.conditional
            .write()
            .await
            .insert(order_id.clone(), tracked);

        info!(
            "Monitoring conditional order {} for {} ({} {})",
            order_id,
            symbol,
            match direction {
                TriggerDirection::Above => "above",
                TriggerDirection::Below => "below",
            },
            trigger_price
        );

        let conditional = self.conditional.clone();
        let history = self.history.clone();
        let price_cache = self.price_cache.clone();
        let exchange = self.exchange.clone();
        let interval = self.config.price_monitoring_interval;
        let cache_ttl = self.config.price_cache_ttl;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            let deadline = Instant::now() + timeout;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        if Instant::now() >= deadline {
                            Self::finish_conditional(
                                &conditional, &history, &order_id, OrderStatus::Timeout,
                            )
                            .await;
                            info!("Conditional order {} timed out", order_id);
                            break;
                        }

                        let price = match Self::cached_price(
                            &price_cache, &exchange, &symbol, cache_ttl,
                        )
                        .await
                        {
                            Ok(price) => price,
                            Err(e) => {
                                error!(
                                    "Price check failed for conditional {}: {}",
                                    order_id, e
                                );
                                continue;
                            }
                        };

                        let triggered = match direction {
                            TriggerDirection::Above => price >= trigger_price,
                            TriggerDirection::Below => price <= trigger_price,
                        };
                        if triggered {
                            Self::finish_conditional(
                                &conditional, &history, &order_id, OrderStatus::Filled,
                            )
                            .await;
                            info!(
                                "Conditional order {} triggered at {}",
                                order_id, price
                            );
                            break;
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        self.monitors.lock().await.push(handle);
    }

    async fn finish_conditional(
        conditional: &Bag,
        history: &History,
        order_id: &str,
        status: OrderStatus,
    ) {
        if let Some(mut tracked) = conditional.write().await.remove(order_id) {
            tracked.status = status;
            tracked.terminal_at = Some(Utc::now());
            history.write().await.push(tracked);
        }
    }

    async fn cached_price(
        cache: &Arc<RwLock<HashMap<String, (Decimal, Instant)>>>,
        exchange: &Arc<dyn Exchange>,
        symbol: &str,
        ttl: Duration,
    ) -> anyhow::Result<Decimal> {
        if let Some((price, at)) = cache.read().await.get(symbol)
            && at.elapsed() < ttl
        {
            return Ok(*price);
        }

        let price = exchange.get_symbol_price(symbol).await?;
        cache
            .write()
            .await
            .insert(symbol.to_string(), (price, Instant::now()));
        Ok(price)
    }

    /// Cached last price, fetching when stale.
    pub async fn get_current_price(&self, symbol: &str) -> anyhow::Result<Decimal> {
        Self::cached_price(
            &self.price_cache,
            &self.exchange,
            symbol,
            self.config.price_cache_ttl,
        )
        .await
    }

    pub async fn get_order(&self, order_id: &str) -> Option<TrackedOrder> {
        if let Some(order) = self.active.read().await.get(order_id) {
            return Some(order.clone());
        }
        if let Some(order) = self.conditional.read().await.get(order_id) {
            return Some(order.clone());
        }
        self.history
            .read()
            .await
            .iter()
            .find(|o| o.order_id == order_id)
            .cloned()
    }

    pub async fn get_active_orders(&self) -> Vec<TrackedOrder> {
        self.active.read().await.values().cloned().collect()
    }

    pub async fn get_conditional_orders(&self) -> Vec<TrackedOrder> {
        self.conditional.read().await.values().cloned().collect()
    }

    pub async fn get_order_history(&self) -> Vec<TrackedOrder> {
        self.history.read().await.clone()
    }

    /// Remove from whichever bag owns the order and record the terminal
    /// state in history.
    pub async fn cancel_order(&self, order_id: &str) -> bool {
        let removed = {
            let mut active = self.active.write().await;
            active.remove(order_id)
        };
        let removed = match removed {
            Some(order) => Some(order),
            None => self.conditional.write().await.remove(order_id),
        };

        match removed {
            Some(mut tracked) => {
                tracked.status = OrderStatus::Cancelled;
                tracked.terminal_at = Some(Utc::now());
                self.history.write().await.push(tracked);
                info!("Order {} cancelled", order_id);
                true
            }
            None => {
                debug!("Cancel requested for unknown order {}", order_id);
                false
            }
        }
    }

    pub async fn get_order_summary(&self) -> OrderSummary {
        let history = self.history.read().await;
        let mut status_distribution: HashMap<String, usize> = HashMap::new();
        for order in history.iter() {
            *status_distribution
                .entry(order.status.to_string())
                .or_default() += 1;
        }

        OrderSummary {
            active_orders: self.active.read().await.len(),
            conditional_orders: self.conditional.read().await.len(),
            total_orders: history.len(),
            status_distribution,
        }
    }

    /// Cancel all conditional monitors. Idempotent.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let mut monitors = self.monitors.lock().await;
        for handle in monitors.drain(..) {
            if let Err(e) = handle.await {
                error!("Conditional monitor failed on shutdown: {}", e);
            }
        }
    }
}
