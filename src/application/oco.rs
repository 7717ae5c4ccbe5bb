//! OCO (one-cancels-the-other) manager.
//!
//! The venue has no native OCO for futures, so stop-loss and take-profit
//! are placed as two independent reduce-only orders and a background
//! monitor infers fills from the open-orders listing: when exactly one
//! leg disappears, the sibling is cancelled and a close event is emitted
//! for the ledger. Multiple pairs on one exchange position key are the
//! normal multi-strategy case.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::domain::errors::OcoError;
use crate::domain::events::PositionCloseEvent;
use crate::domain::order::{Order, OrderType, PositionSide};
use crate::domain::position::{CloseReason, exchange_position_key};
use crate::domain::ports::Exchange;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OcoStatus {
    Active,
    Cancelled,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcoPair {
    pub position_id: String,
    pub strategy_position_id: Option<String>,
    pub symbol: String,
    pub position_side: PositionSide,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub stop_loss_price: Decimal,
    pub take_profit_price: Decimal,
    pub sl_order_id: String,
    pub tp_order_id: String,
    pub status: OcoStatus,
}

#[derive(Debug, Clone)]
pub struct OcoPlacement {
    pub sl_order_id: String,
    pub tp_order_id: String,
}

#[derive(Debug, Clone)]
pub struct OcoConfig {
    pub poll_interval: Duration,
    pub error_backoff: Duration,
}

impl Default for OcoConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            error_backoff: Duration::from_secs(5),
        }
    }
}

type PairMap = HashMap<String, Vec<OcoPair>>;

pub struct OcoManager {
    exchange: Arc<dyn Exchange>,
    pairs: Arc<RwLock<PairMap>>,
    close_tx: mpsc::Sender<PositionCloseEvent>,
    config: OcoConfig,
    monitor: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl OcoManager {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        close_tx: mpsc::Sender<PositionCloseEvent>,
        config: OcoConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            exchange,
            pairs: Arc::new(RwLock::new(HashMap::new())),
            close_tx,
            config,
            monitor: Mutex::new(None),
            shutdown_tx,
        }
    }

    /// Place the SL+TP pair for one strategy position slice.
    ///
    /// Atomicity: if the TP leg fails after the SL leg was accepted, the
    /// SL leg is cancelled before the error is returned, so the venue
    /// never holds half a pair.
    #[allow(clippy::too_many_arguments)]
    pub async fn place_oco_orders(
        &self,
        position_id: &str,
        symbol: &str,
        position_side: PositionSide,
        quantity: Decimal,
        entry_price: Decimal,
        stop_loss_price: Decimal,
        take_profit_price: Decimal,
        strategy_position_id: Option<String>,
    ) -> Result<OcoPlacement, OcoError> {
        let prices_valid = match position_side {
            PositionSide::Long => {
                stop_loss_price < entry_price && entry_price < take_profit_price
            }
            PositionSide::Short => {
                take_profit_price < entry_price && entry_price < stop_loss_price
            }
        };
        if !prices_valid {
            return Err(OcoError::InvalidPrices {
                position_side: position_side.to_string(),
                stop_loss: stop_loss_price,
                entry: entry_price,
                take_profit: take_profit_price,
            });
        }

        info!(
            "Placing OCO pair for {} {}: qty {}, SL {}, TP {}",
            symbol, position_side, quantity, stop_loss_price, take_profit_price
        );

        let closing_side = position_side.closing_order_side();

        let mut sl_order = Order::new(symbol, closing_side, OrderType::Stop, quantity, position_side);
        sl_order.stop_loss = Some(stop_loss_price);
        sl_order.target_price = Some(stop_loss_price);
        sl_order.reduce_only = true;

        let mut tp_order = Order::new(
            symbol,
            closing_side,
            OrderType::TakeProfit,
            quantity,
            position_side,
        );
        tp_order.take_profit = Some(take_profit_price);
        tp_order.target_price = Some(take_profit_price);
        tp_order.reduce_only = true;

        let sl_report = self.exchange.execute(&sl_order).await.map_err(|e| {
            OcoError::PlacementFailed {
                symbol: symbol.to_string(),
                reason: format!("stop-loss leg: {}", e),
            }
        })?;

        let tp_report = match self.exchange.execute(&tp_order).await {
            Ok(report) => report,
            Err(e) => {
                warn!(
                    "TP leg failed after SL was placed for {}; rolling back SL {}",
                    symbol, sl_report.order_id
                );
                if let Err(cancel_err) = self
                    .exchange
                    .cancel_order(symbol, &sl_report.order_id)
                    .await
                {
                    error!(
                        "Failed to roll back SL leg {} for {}: {}",
                        sl_report.order_id, symbol, cancel_err
                    );
                }
                return Err(OcoError::PlacementFailed {
                    symbol: symbol.to_string(),
                    reason: format!("take-profit leg: {}", e),
                });
            }
        };

        let pair = OcoPair {
            position_id: position_id.to_string(),
            strategy_position_id,
            symbol: symbol.to_string(),
            position_side,
            quantity,
            entry_price,
            stop_loss_price,
            take_profit_price,
            sl_order_id: sl_report.order_id.clone(),
            tp_order_id: tp_report.order_id.clone(),
            status: OcoStatus::Active,
        };

        let position_key = exchange_position_key(symbol, position_side);
        self.pairs
            .write()
            .await
            .entry(position_key)
            .or_default()
            .push(pair);

        self.ensure_monitor_running().await;

        info!(
            "OCO pair placed for {}: SL {} / TP {}",
            position_id, sl_report.order_id, tp_report.order_id
        );

        Ok(OcoPlacement {
            sl_order_id: sl_report.order_id,
            tp_order_id: tp_report.order_id,
        })
    }

    /// Cancel both legs of the pair owned by `position_id`.
    pub async fn cancel_oco_pair(&self, position_id: &str) -> Result<(), OcoError> {
        let (symbol, order_ids) = {
            let pairs = self.pairs.read().await;
            let Some(pair) = pairs
                .values()
                .flatten()
                .find(|p| p.position_id == position_id && p.status == OcoStatus::Active)
            else {
                return Err(OcoError::PairNotFound {
                    position_id: position_id.to_string(),
                });
            };
            (
                pair.symbol.clone(),
                vec![pair.sl_order_id.clone(), pair.tp_order_id.clone()],
            )
        };

        let results = self.exchange.batch_cancel(&symbol, &order_ids).await;
        for result in &results {
            if let Err(e) = result {
                warn!("OCO cancel leg failed for {}: {}", position_id, e);
            }
        }

        let mut pairs = self.pairs.write().await;
        for pair in pairs.values_mut().flatten() {
            if pair.position_id == position_id {
                pair.status = OcoStatus::Cancelled;
            }
        }
        info!("OCO pair cancelled for {}", position_id);
        Ok(())
    }

    /// Cancel every active pair projecting onto one exchange position.
    /// Used by manual close-with-cleanup.
    pub async fn cancel_pairs_for_key(&self, position_key: &str) -> usize {
        let targets: Vec<(String, Vec<String>, String)> = {
            let pairs = self.pairs.read().await;
            pairs
                .get(position_key)
                .map(|list| {
                    list.iter()
                        .filter(|p| p.status == OcoStatus::Active)
                        .map(|p| {
                            (
                                p.symbol.clone(),
                                vec![p.sl_order_id.clone(), p.tp_order_id.clone()],
                                p.position_id.clone(),
                            )
                        })
                        .collect()
                })
                .unwrap_or_default()
        };

        let cancels = targets
            .iter()
            .map(|(symbol, order_ids, _)| self.exchange.batch_cancel(symbol, order_ids));
        for results in futures::future::join_all(cancels).await {
            for result in results {
                if let Err(e) = result {
                    warn!("Cleanup cancel failed on {}: {}", position_key, e);
                }
            }
        }

        let mut pairs = self.pairs.write().await;
        if let Some(list) = pairs.get_mut(position_key) {
            for pair in list.iter_mut().filter(|p| p.status == OcoStatus::Active) {
                pair.status = OcoStatus::Cancelled;
            }
        }
        targets.len()
    }

    /// Cancel the surviving leg once the sibling filled.
    pub async fn cancel_other_order(
        &self,
        position_id: &str,
        filled_order_id: &str,
    ) -> Result<(), OcoError> {
        let (symbol, order_to_cancel) = {
            let pairs = self.pairs.read().await;
            let Some(pair) = pairs
                .values()
                .flatten()
                .find(|p| p.position_id == position_id)
            else {
                return Err(OcoError::PairNotFound {
                    position_id: position_id.to_string(),
                });
            };
            let other = if filled_order_id == pair.sl_order_id {
                pair.tp_order_id.clone()
            } else {
                pair.sl_order_id.clone()
            };
            (pair.symbol.clone(), other)
        };

        if let Err(e) = self.exchange.cancel_order(&symbol, &order_to_cancel).await {
            warn!(
                "Failed to cancel sibling order {} for {}: {}",
                order_to_cancel, position_id, e
            );
        }

        let mut pairs = self.pairs.write().await;
        for pair in pairs.values_mut().flatten() {
            if pair.position_id == position_id {
                pair.status = OcoStatus::Completed;
            }
        }
        Ok(())
    }

    pub async fn active_pairs(&self, position_key: &str) -> Vec<OcoPair> {
        self.pairs
            .read()
            .await
            .get(position_key)
            .map(|list| {
                list.iter()
                    .filter(|p| p.status == OcoStatus::Active)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn active_pair_count(&self) -> usize {
        self.pairs
            .read()
            .await
            .values()
            .flatten()
            .filter(|p| p.status == OcoStatus::Active)
            .count()
    }

    /// Start the monitor task if it is not already running.
    async fn ensure_monitor_running(&self) {
        let mut monitor = self.monitor.lock().await;
        if monitor.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let exchange = self.exchange.clone();
        let pairs = self.pairs.clone();
        let close_tx = self.close_tx.clone();
        let config = self.config.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        *monitor = Some(tokio::spawn(async move {
            info!("OCO monitor started");
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(config.poll_interval) => {
                        match Self::monitor_pass(&exchange, &pairs, &close_tx).await {
                            Ok(remaining) => {
                                if remaining == 0 {
                                    info!("OCO monitor stopping: no active pairs");
                                    break;
                                }
                            }
                            Err(e) => {
                                error!("OCO monitor pass failed: {}; backing off", e);
                                tokio::time::sleep(config.error_backoff).await;
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            info!("OCO monitor shut down");
                            break;
                        }
                    }
                }
            }
        }));
    }

    /// One inspection sweep. Returns the number of still-active pairs.
    /// Exposed so tests can drive the monitor deterministically.
    pub async fn run_monitor_pass(&self) -> anyhow::Result<usize> {
        Self::monitor_pass(&self.exchange, &self.pairs, &self.close_tx).await
    }

    async fn monitor_pass(
        exchange: &Arc<dyn Exchange>,
        pairs: &Arc<RwLock<PairMap>>,
        close_tx: &mpsc::Sender<PositionCloseEvent>,
    ) -> anyhow::Result<usize> {
        let symbols: HashSet<String> = {
            let pairs = pairs.read().await;
            pairs
                .values()
                .flatten()
                .filter(|p| p.status == OcoStatus::Active)
                .map(|p| p.symbol.clone())
                .collect()
        };

        for symbol in symbols {
            let open_ids: HashSet<String> = exchange
                .get_open_orders(&symbol)
                .await?
                .into_iter()
                .map(|o| o.order_id)
                .collect();

            let candidates: Vec<OcoPair> = {
                let pairs = pairs.read().await;
                pairs
                    .values()
                    .flatten()
                    .filter(|p| p.status == OcoStatus::Active && p.symbol == symbol)
                    .cloned()
                    .collect()
            };

            for pair in candidates {
                let sl_exists = open_ids.contains(&pair.sl_order_id);
                let tp_exists = open_ids.contains(&pair.tp_order_id);

                let (filled_order_id, remaining_order_id, exit_price, close_reason) =
                    match (sl_exists, tp_exists) {
                        (true, true) => continue,
                        (false, true) => (
                            pair.sl_order_id.clone(),
                            Some(pair.tp_order_id.clone()),
                            pair.stop_loss_price,
                            CloseReason::StopLoss,
                        ),
                        (true, false) => (
                            pair.tp_order_id.clone(),
                            Some(pair.sl_order_id.clone()),
                            pair.take_profit_price,
                            CloseReason::TakeProfit,
                        ),
                        (false, false) => {
                            // Both gone: externally cancelled or already handled.
                            info!("OCO pair {} completed externally", pair.position_id);
                            Self::mark_completed(pairs, &pair.position_id).await;
                            continue;
                        }
                    };

                info!(
                    "OCO triggered for {}: {} filled at ~{}",
                    pair.position_id, close_reason, exit_price
                );

                if let Some(remaining) = remaining_order_id {
                    if let Err(e) = exchange.cancel_order(&symbol, &remaining).await {
                        warn!(
                            "Failed to cancel sibling {} of pair {}: {}",
                            remaining, pair.position_id, e
                        );
                    }
                }

                Self::mark_completed(pairs, &pair.position_id).await;

                let event = PositionCloseEvent {
                    strategy_position_id: pair.strategy_position_id.clone(),
                    position_id: pair.position_id.clone(),
                    symbol: pair.symbol.clone(),
                    position_side: pair.position_side,
                    quantity: pair.quantity,
                    exit_price,
                    close_reason,
                    exit_order_id: Some(filled_order_id),
                };
                if let Err(e) = close_tx.send(event).await {
                    error!("Close-event channel dropped: {}", e);
                }
            }
        }

        // Prune settled pairs
        let mut pairs = pairs.write().await;
        for list in pairs.values_mut() {
            list.retain(|p| p.status == OcoStatus::Active);
        }
        pairs.retain(|_, list| !list.is_empty());

        Ok(pairs.values().flatten().count())
    }

    async fn mark_completed(pairs: &Arc<RwLock<PairMap>>, position_id: &str) {
        let mut pairs = pairs.write().await;
        for pair in pairs.values_mut().flatten() {
            if pair.position_id == position_id {
                pair.status = OcoStatus::Completed;
            }
        }
    }

    /// Cancel the monitor task. Idempotent.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.monitor.lock().await.take() {
            if let Err(e) = handle.await {
                error!("OCO monitor task failed on shutdown: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::order::OrderSide;
    use crate::infrastructure::mock::FakeExchange;
    use rust_decimal_macros::dec;

    fn setup() -> (
        Arc<FakeExchange>,
        OcoManager,
        mpsc::Receiver<PositionCloseEvent>,
    ) {
        let fake = Arc::new(FakeExchange::new());
        let (close_tx, close_rx) = mpsc::channel(16);
        let manager = OcoManager::new(fake.clone(), close_tx, OcoConfig::default());
        (fake, manager, close_rx)
    }

    async fn place_long(
        manager: &OcoManager,
        position_id: &str,
        strategy_position_id: Option<String>,
    ) -> OcoPlacement {
        manager
            .place_oco_orders(
                position_id,
                "BTCUSDT",
                PositionSide::Long,
                dec!(0.001),
                dec!(50000),
                dec!(49000),
                dec!(52000),
                strategy_position_id,
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_long_pair_sides_and_flags() {
        let (fake, manager, _rx) = setup();
        place_long(&manager, "pos-1", None).await;

        let orders = fake.executed_orders().await;
        assert_eq!(orders.len(), 2);
        for order in &orders {
            assert_eq!(order.side, OrderSide::Sell);
            assert!(order.reduce_only);
            assert_eq!(order.amount, dec!(0.001));
        }
        assert_eq!(orders[0].order_type, OrderType::Stop);
        assert_eq!(orders[1].order_type, OrderType::TakeProfit);

        assert_eq!(manager.active_pairs("BTCUSDT_LONG").await.len(), 1);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_short_pair_sides_are_buy() {
        let (fake, manager, _rx) = setup();
        manager
            .place_oco_orders(
                "pos-s",
                "BTCUSDT",
                PositionSide::Short,
                dec!(0.002),
                dec!(50000),
                dec!(51000),
                dec!(48000),
                None,
            )
            .await
            .unwrap();

        for order in fake.executed_orders().await {
            assert_eq!(order.side, OrderSide::Buy);
            assert!(order.reduce_only);
        }
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_price_invariant_rejected() {
        let (_fake, manager, _rx) = setup();
        // SL above entry on a LONG is invalid
        let err = manager
            .place_oco_orders(
                "pos-bad",
                "BTCUSDT",
                PositionSide::Long,
                dec!(0.001),
                dec!(50000),
                dec!(51000),
                dec!(52000),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OcoError::InvalidPrices { .. }));
    }

    #[tokio::test]
    async fn test_partial_placement_rolls_back_sl() {
        let (fake, manager, _rx) = setup();
        fake.fail_order_types(vec![OrderType::TakeProfit]).await;

        let err = manager
            .place_oco_orders(
                "pos-2",
                "BTCUSDT",
                PositionSide::Long,
                dec!(0.001),
                dec!(50000),
                dec!(49000),
                dec!(52000),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OcoError::PlacementFailed { .. }));

        // SL leg was cancelled; nothing rests on the venue
        assert_eq!(fake.open_order_count("BTCUSDT").await, 0);
        assert_eq!(fake.cancelled_orders().await.len(), 1);
        assert_eq!(manager.active_pair_count().await, 0);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_tp_fill_cancels_sl_and_emits_close() {
        let (fake, manager, mut rx) = setup();
        let placement = place_long(&manager, "pos-3", Some("sp-3".to_string())).await;

        // Venue fills the TP: it vanishes from the open-orders listing
        fake.remove_open_order("BTCUSDT", &placement.tp_order_id)
            .await;

        let remaining = manager.run_monitor_pass().await.unwrap();
        assert_eq!(remaining, 0);

        // Sibling SL was cancelled
        let cancelled = fake.cancelled_orders().await;
        assert!(cancelled.iter().any(|(_, id)| *id == placement.sl_order_id));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.strategy_position_id.as_deref(), Some("sp-3"));
        assert_eq!(event.close_reason, CloseReason::TakeProfit);
        assert_eq!(event.exit_price, dec!(52000));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_sl_fill_emits_stop_loss_close() {
        let (fake, manager, mut rx) = setup();
        let placement = place_long(&manager, "pos-4", Some("sp-4".to_string())).await;

        fake.remove_open_order("BTCUSDT", &placement.sl_order_id)
            .await;
        manager.run_monitor_pass().await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.close_reason, CloseReason::StopLoss);
        assert_eq!(event.exit_price, dec!(49000));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_multi_strategy_pair_isolation() {
        let (fake, manager, mut rx) = setup();
        let placement_a = place_long(&manager, "pos-a", Some("sp-a".to_string())).await;
        let _placement_b = place_long(&manager, "pos-b", Some("sp-b".to_string())).await;
        assert_eq!(manager.active_pairs("BTCUSDT_LONG").await.len(), 2);

        // Strategy A's TP fills; B must stay armed
        fake.remove_open_order("BTCUSDT", &placement_a.tp_order_id)
            .await;
        let remaining = manager.run_monitor_pass().await.unwrap();
        assert_eq!(remaining, 1);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.strategy_position_id.as_deref(), Some("sp-a"));
        assert_eq!(event.close_reason, CloseReason::TakeProfit);

        let still_active = manager.active_pairs("BTCUSDT_LONG").await;
        assert_eq!(still_active.len(), 1);
        assert_eq!(still_active[0].position_id, "pos-b");
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_both_legs_gone_completes_without_event() {
        let (fake, manager, mut rx) = setup();
        let placement = place_long(&manager, "pos-5", None).await;

        fake.remove_open_order("BTCUSDT", &placement.sl_order_id)
            .await;
        fake.remove_open_order("BTCUSDT", &placement.tp_order_id)
            .await;

        let remaining = manager.run_monitor_pass().await.unwrap();
        assert_eq!(remaining, 0);
        assert!(rx.try_recv().is_err());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_oco_pair_batch_cancels() {
        let (fake, manager, _rx) = setup();
        let placement = place_long(&manager, "pos-6", None).await;

        manager.cancel_oco_pair("pos-6").await.unwrap();
        let cancelled = fake.cancelled_orders().await;
        assert_eq!(cancelled.len(), 2);
        assert!(cancelled.iter().any(|(_, id)| *id == placement.sl_order_id));
        assert!(cancelled.iter().any(|(_, id)| *id == placement.tp_order_id));
        assert_eq!(manager.active_pair_count().await, 0);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_monitor_loop_detects_fill_end_to_end() {
        let fake = Arc::new(FakeExchange::new());
        let (close_tx, mut close_rx) = mpsc::channel(16);
        let manager = OcoManager::new(
            fake.clone(),
            close_tx,
            OcoConfig {
                poll_interval: Duration::from_millis(10),
                error_backoff: Duration::from_millis(10),
            },
        );

        let placement = place_long(&manager, "pos-7", Some("sp-7".to_string())).await;
        fake.remove_open_order("BTCUSDT", &placement.tp_order_id)
            .await;

        let event = tokio::time::timeout(Duration::from_secs(2), close_rx.recv())
            .await
            .expect("monitor should emit within the timeout")
            .unwrap();
        assert_eq!(event.close_reason, CloseReason::TakeProfit);
        manager.shutdown().await;
    }
}
