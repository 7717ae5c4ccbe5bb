//! Strategy position ledger.
//!
//! Owns every mutation of strategy positions, aggregated exchange
//! positions and their contribution links. Invariant maintained here:
//! the sum of open contribution quantities on an exchange position
//! always equals that position's current quantity.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::{Result, bail};
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::domain::order::{ExecutionReport, Order, PositionSide};
use crate::domain::position::{
    ClosedPosition, CloseReason, ContributionStatus, ExchangePosition, PositionContribution,
    PositionStatus, StrategyPosition, exchange_position_key,
};
use crate::domain::ports::DataManager;
use crate::domain::signal::Signal;
use crate::infrastructure::observability::Metrics;

const STRATEGY_POSITIONS: &str = "strategy_positions";
const EXCHANGE_POSITIONS: &str = "exchange_positions";
const CONTRIBUTIONS: &str = "position_contributions";
const EXCHANGE_LABEL: &str = "binance";

pub struct StrategyPositionLedger {
    data: Arc<dyn DataManager>,
    metrics: Arc<Metrics>,
    strategy_positions: RwLock<HashMap<String, StrategyPosition>>,
    exchange_positions: RwLock<HashMap<String, ExchangePosition>>,
    contributions: RwLock<HashMap<String, Vec<PositionContribution>>>,
}

impl StrategyPositionLedger {
    pub fn new(data: Arc<dyn DataManager>, metrics: Arc<Metrics>) -> Self {
        Self {
            data,
            metrics,
            strategy_positions: RwLock::new(HashMap::new()),
            exchange_positions: RwLock::new(HashMap::new()),
            contributions: RwLock::new(HashMap::new()),
        }
    }

    /// Record a fill as a new strategy position, fold it into the
    /// aggregated exchange position and append a contribution.
    pub async fn create_strategy_position(
        &self,
        signal: &Signal,
        order: &Order,
        execution: &ExecutionReport,
    ) -> Result<String> {
        let strategy_position_id = Uuid::new_v4().to_string();
        let position_side = signal.position_side();

        let entry_price = execution.fill_price.unwrap_or(signal.current_price);
        let entry_quantity = execution.amount.unwrap_or(order.amount);
        if entry_quantity <= Decimal::ZERO {
            bail!("Fill for {} has no quantity", signal.symbol);
        }

        let take_profit_price = signal.take_profit_pct.map(|pct| {
            let pct = Decimal::try_from(pct).unwrap_or_default();
            match position_side {
                PositionSide::Long => entry_price * (Decimal::ONE + pct),
                PositionSide::Short => entry_price * (Decimal::ONE - pct),
            }
        });
        let stop_loss_price = signal.stop_loss_pct.map(|pct| {
            let pct = Decimal::try_from(pct).unwrap_or_default();
            match position_side {
                PositionSide::Long => entry_price * (Decimal::ONE - pct),
                PositionSide::Short => entry_price * (Decimal::ONE + pct),
            }
        });

        let position_key = exchange_position_key(&signal.symbol, position_side);

        let position = StrategyPosition {
            strategy_position_id: strategy_position_id.clone(),
            strategy_id: signal.strategy_id.clone(),
            signal_id: signal.signal_id.clone(),
            symbol: signal.symbol.clone(),
            side: position_side,
            entry_quantity,
            entry_price,
            entry_time: Utc::now(),
            entry_order_id: Some(execution.order_id.clone()),
            take_profit_price,
            stop_loss_price,
            tp_order_id: None,
            sl_order_id: None,
            status: PositionStatus::Open,
            exchange_position_key: position_key.clone(),
            exit_quantity: None,
            exit_price: None,
            exit_time: None,
            exit_order_id: None,
            close_reason: None,
            realized_pnl: None,
            realized_pnl_pct: None,
        };

        self.strategy_positions
            .write()
            .await
            .insert(strategy_position_id.clone(), position.clone());
        self.persist(STRATEGY_POSITIONS, json!({"strategy_position_id": &strategy_position_id}), &position)
            .await;

        // Update the aggregated exchange position
        let (qty_before, sequence) = {
            let mut positions = self.exchange_positions.write().await;
            let entry = positions.entry(position_key.clone()).or_insert_with(|| {
                ExchangePosition {
                    exchange_position_key: position_key.clone(),
                    symbol: signal.symbol.clone(),
                    side: position_side,
                    current_quantity: Decimal::ZERO,
                    weighted_avg_price: entry_price,
                    contributing_strategies: BTreeSet::new(),
                    total_contributions: 0,
                    first_entry_time: Utc::now(),
                    last_update_time: Utc::now(),
                    status: PositionStatus::Open,
                }
            });
            let qty_before = entry.current_quantity;
            entry.status = PositionStatus::Open;
            entry.absorb(entry_quantity, entry_price, &signal.strategy_id);
            self.metrics.set_position_size(
                &signal.symbol,
                &position_side.to_string(),
                EXCHANGE_LABEL,
                entry.current_quantity.to_f64().unwrap_or(0.0),
            );
            let snapshot = entry.clone();
            drop(positions);
            self.persist(
                EXCHANGE_POSITIONS,
                json!({"exchange_position_key": &position_key}),
                &snapshot,
            )
            .await;
            (qty_before, snapshot.total_contributions)
        };

        let contribution = PositionContribution {
            contribution_id: Uuid::new_v4().to_string(),
            strategy_position_id: strategy_position_id.clone(),
            exchange_position_key: position_key.clone(),
            strategy_id: signal.strategy_id.clone(),
            symbol: signal.symbol.clone(),
            position_side,
            contribution_quantity: entry_quantity,
            contribution_entry_price: entry_price,
            contribution_time: Utc::now(),
            position_sequence: sequence,
            exchange_quantity_before: qty_before,
            exchange_quantity_after: qty_before + entry_quantity,
            status: ContributionStatus::Active,
            exit_time: None,
            exit_price: None,
            contribution_pnl: None,
            contribution_pnl_pct: None,
            close_reason: None,
        };
        self.contributions
            .write()
            .await
            .entry(position_key.clone())
            .or_default()
            .push(contribution.clone());
        self.persist(
            CONTRIBUTIONS,
            json!({"contribution_id": &contribution.contribution_id}),
            &contribution,
        )
        .await;

        info!(
            "Created strategy position {} for {}: {} {} {} @ {}",
            strategy_position_id,
            signal.strategy_id,
            signal.symbol,
            position_side,
            entry_quantity,
            entry_price
        );

        Ok(strategy_position_id)
    }

    /// Close (part of) a strategy position, settle its contribution and
    /// reduce the aggregated exchange position.
    pub async fn close_strategy_position(
        &self,
        strategy_position_id: &str,
        exit_price: Decimal,
        exit_quantity: Option<Decimal>,
        close_reason: CloseReason,
        exit_order_id: Option<String>,
    ) -> Result<ClosedPosition> {
        let mut positions = self.strategy_positions.write().await;
        let Some(position) = positions.get_mut(strategy_position_id) else {
            warn!("Strategy position {} not found", strategy_position_id);
            bail!("Strategy position {} not found", strategy_position_id);
        };

        let exit_quantity = exit_quantity.unwrap_or(position.entry_quantity);
        let pnl = position.pnl_for_exit(exit_price, exit_quantity);
        let pnl_pct = if position.entry_price > Decimal::ZERO && exit_quantity > Decimal::ZERO {
            pnl / (position.entry_price * exit_quantity) * Decimal::from(100)
        } else {
            Decimal::ZERO
        };

        position.status = if exit_quantity >= position.entry_quantity {
            PositionStatus::Closed
        } else {
            PositionStatus::Partial
        };
        position.exit_quantity = Some(exit_quantity);
        position.exit_price = Some(exit_price);
        position.exit_time = Some(Utc::now());
        position.exit_order_id = exit_order_id;
        position.close_reason = Some(close_reason);
        position.realized_pnl = Some(pnl);
        position.realized_pnl_pct = Some(pnl_pct);

        let closed = ClosedPosition {
            strategy_position_id: strategy_position_id.to_string(),
            strategy_id: position.strategy_id.clone(),
            symbol: position.symbol.clone(),
            side: position.side,
            close_reason,
            entry_price: position.entry_price,
            exit_price,
            quantity: exit_quantity,
            realized_pnl: pnl,
            realized_pnl_pct: pnl_pct,
        };
        let position_key = position.exchange_position_key.clone();
        let snapshot = position.clone();
        drop(positions);

        self.persist(
            STRATEGY_POSITIONS,
            json!({"strategy_position_id": strategy_position_id}),
            &snapshot,
        )
        .await;

        // Settle the contribution
        {
            let mut contributions = self.contributions.write().await;
            if let Some(list) = contributions.get_mut(&position_key)
                && let Some(contribution) = list
                    .iter_mut()
                    .find(|c| c.strategy_position_id == strategy_position_id)
            {
                contribution.status = ContributionStatus::Closed;
                contribution.exit_time = Some(Utc::now());
                contribution.exit_price = Some(exit_price);
                contribution.contribution_pnl = Some(pnl);
                contribution.contribution_pnl_pct = Some(pnl_pct);
                contribution.close_reason = Some(close_reason);
                let snapshot = contribution.clone();
                drop(contributions);
                self.persist(
                    CONTRIBUTIONS,
                    json!({"contribution_id": &snapshot.contribution_id}),
                    &snapshot,
                )
                .await;
            }
        }

        // Reduce the aggregated position
        {
            let mut positions = self.exchange_positions.write().await;
            if let Some(exchange_position) = positions.get_mut(&position_key) {
                exchange_position.reduce(exit_quantity);
                self.metrics.set_position_size(
                    &closed.symbol,
                    &closed.side.to_string(),
                    EXCHANGE_LABEL,
                    exchange_position
                        .current_quantity
                        .max(Decimal::ZERO)
                        .to_f64()
                        .unwrap_or(0.0),
                );
                if exchange_position.status == PositionStatus::Closed {
                    info!("Exchange position {} fully closed", position_key);
                }
                let snapshot = exchange_position.clone();
                drop(positions);
                self.persist(
                    EXCHANGE_POSITIONS,
                    json!({"exchange_position_key": &position_key}),
                    &snapshot,
                )
                .await;
            } else {
                warn!("Exchange position {} not found", position_key);
            }
        }

        info!(
            "Closed strategy position {}: {} at {}, PnL: ${:.2} ({:.2}%)",
            strategy_position_id, close_reason, exit_price, pnl, pnl_pct
        );

        Ok(closed)
    }

    async fn persist<T: serde::Serialize>(
        &self,
        collection: &str,
        filter: serde_json::Value,
        record: &T,
    ) {
        match serde_json::to_value(record) {
            Ok(doc) => {
                if let Err(e) = self.data.upsert_one(collection, filter, doc).await {
                    error!("Failed to persist {} record: {}", collection, e);
                }
            }
            Err(e) => error!("Failed to serialize {} record: {}", collection, e),
        }
    }

    /// Record the venue ids of the protective orders armed for a
    /// position. `None` leaves the existing value untouched.
    pub async fn set_protective_order_ids(
        &self,
        strategy_position_id: &str,
        sl_order_id: Option<String>,
        tp_order_id: Option<String>,
    ) {
        let snapshot = {
            let mut positions = self.strategy_positions.write().await;
            let Some(position) = positions.get_mut(strategy_position_id) else {
                warn!(
                    "Cannot record protective orders: {} not found",
                    strategy_position_id
                );
                return;
            };
            if sl_order_id.is_some() {
                position.sl_order_id = sl_order_id;
            }
            if tp_order_id.is_some() {
                position.tp_order_id = tp_order_id;
            }
            position.clone()
        };
        self.persist(
            STRATEGY_POSITIONS,
            json!({"strategy_position_id": strategy_position_id}),
            &snapshot,
        )
        .await;
    }

    pub async fn get_strategy_position(&self, id: &str) -> Option<StrategyPosition> {
        self.strategy_positions.read().await.get(id).cloned()
    }

    pub async fn get_positions_by_strategy(&self, strategy_id: &str) -> Vec<StrategyPosition> {
        self.strategy_positions
            .read()
            .await
            .values()
            .filter(|p| p.strategy_id == strategy_id)
            .cloned()
            .collect()
    }

    pub async fn get_exchange_position(&self, position_key: &str) -> Option<ExchangePosition> {
        self.exchange_positions.read().await.get(position_key).cloned()
    }

    pub async fn get_contributions(&self, position_key: &str) -> Vec<PositionContribution> {
        self.contributions
            .read()
            .await
            .get(position_key)
            .cloned()
            .unwrap_or_default()
    }

    /// Open strategy positions projecting onto one exchange position.
    pub async fn open_positions_for_key(&self, position_key: &str) -> Vec<StrategyPosition> {
        self.strategy_positions
            .read()
            .await
            .values()
            .filter(|p| p.exchange_position_key == position_key && p.is_open())
            .cloned()
            .collect()
    }

    pub async fn open_position_count(&self) -> usize {
        self.strategy_positions
            .read()
            .await
            .values()
            .filter(|p| p.is_open())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::order::{OrderSide, OrderStatus, OrderType};
    use crate::infrastructure::mock::InMemoryDataManager;
    use rust_decimal_macros::dec;

    fn ledger() -> StrategyPositionLedger {
        StrategyPositionLedger::new(
            Arc::new(InMemoryDataManager::new()),
            Arc::new(Metrics::default()),
        )
    }

    fn signal(strategy: &str, action: &str, tp: Option<f64>, sl: Option<f64>) -> Signal {
        let mut signal: Signal = serde_json::from_value(serde_json::json!({
            "strategy_id": strategy,
            "symbol": "BTCUSDT",
            "action": action,
            "confidence": 0.85,
            "timeframe": "1h",
            "current_price": "50000"
        }))
        .unwrap();
        signal.take_profit_pct = tp;
        signal.stop_loss_pct = sl;
        signal
    }

    fn fill(price: Decimal, amount: Decimal) -> (Order, ExecutionReport) {
        let order = Order::new(
            "BTCUSDT",
            OrderSide::Buy,
            OrderType::Market,
            amount,
            PositionSide::Long,
        );
        let report = ExecutionReport {
            status: OrderStatus::Filled,
            order_id: "venue-1".to_string(),
            fill_price: Some(price),
            amount: Some(amount),
            commission: None,
            error: None,
            simulated: false,
        };
        (order, report)
    }

    #[tokio::test]
    async fn test_create_sets_tp_sl_prices_long() {
        let ledger = ledger();
        let signal = signal("momentum", "buy", Some(0.04), Some(0.02));
        let (order, report) = fill(dec!(50000), dec!(0.001));

        let id = ledger
            .create_strategy_position(&signal, &order, &report)
            .await
            .unwrap();
        let position = ledger.get_strategy_position(&id).await.unwrap();

        assert_eq!(position.take_profit_price, Some(dec!(52000)));
        assert_eq!(position.stop_loss_price, Some(dec!(49000)));
        assert_eq!(position.exchange_position_key, "BTCUSDT_LONG");
    }

    #[tokio::test]
    async fn test_create_sets_tp_sl_prices_short() {
        let ledger = ledger();
        let signal = signal("momentum", "sell", Some(0.04), Some(0.02));
        let (order, report) = fill(dec!(50000), dec!(0.001));

        let id = ledger
            .create_strategy_position(&signal, &order, &report)
            .await
            .unwrap();
        let position = ledger.get_strategy_position(&id).await.unwrap();

        assert_eq!(position.side, PositionSide::Short);
        assert_eq!(position.take_profit_price, Some(dec!(48000)));
        assert_eq!(position.stop_loss_price, Some(dec!(51000)));
    }

    #[tokio::test]
    async fn test_weighted_average_across_strategies() {
        let ledger = ledger();

        let (order_a, report_a) = fill(dec!(50000), dec!(0.001));
        ledger
            .create_strategy_position(&signal("strategy_a", "buy", None, None), &order_a, &report_a)
            .await
            .unwrap();

        let (order_b, report_b) = fill(dec!(51000), dec!(0.002));
        ledger
            .create_strategy_position(&signal("strategy_b", "buy", None, None), &order_b, &report_b)
            .await
            .unwrap();

        let exchange = ledger.get_exchange_position("BTCUSDT_LONG").await.unwrap();
        assert_eq!(exchange.current_quantity, dec!(0.003));
        let expected = (dec!(0.001) * dec!(50000) + dec!(0.002) * dec!(51000)) / dec!(0.003);
        assert!((exchange.weighted_avg_price - expected).abs() < dec!(0.01));
        assert_eq!(exchange.total_contributions, 2);
        assert_eq!(exchange.contributing_strategies.len(), 2);

        let contributions = ledger.get_contributions("BTCUSDT_LONG").await;
        assert_eq!(contributions.len(), 2);
        assert_eq!(contributions[0].position_sequence, 1);
        assert_eq!(contributions[1].position_sequence, 2);
        assert_eq!(contributions[1].exchange_quantity_before, dec!(0.001));
        assert_eq!(contributions[1].exchange_quantity_after, dec!(0.003));
    }

    #[tokio::test]
    async fn test_contribution_conservation_invariant() {
        let ledger = ledger();
        let (order_a, report_a) = fill(dec!(50000), dec!(0.001));
        let id_a = ledger
            .create_strategy_position(&signal("strategy_a", "buy", None, None), &order_a, &report_a)
            .await
            .unwrap();
        let (order_b, report_b) = fill(dec!(51000), dec!(0.002));
        ledger
            .create_strategy_position(&signal("strategy_b", "buy", None, None), &order_b, &report_b)
            .await
            .unwrap();

        // Sum of open contributions equals aggregate quantity
        let open_sum: Decimal = ledger
            .get_contributions("BTCUSDT_LONG")
            .await
            .iter()
            .filter(|c| c.status == ContributionStatus::Active)
            .map(|c| c.contribution_quantity)
            .sum();
        let exchange = ledger.get_exchange_position("BTCUSDT_LONG").await.unwrap();
        assert_eq!(open_sum, exchange.current_quantity);

        // Close one, invariant still holds
        ledger
            .close_strategy_position(&id_a, dec!(52000), None, CloseReason::TakeProfit, None)
            .await
            .unwrap();

        let open_sum: Decimal = ledger
            .get_contributions("BTCUSDT_LONG")
            .await
            .iter()
            .filter(|c| c.status == ContributionStatus::Active)
            .map(|c| c.contribution_quantity)
            .sum();
        let exchange = ledger.get_exchange_position("BTCUSDT_LONG").await.unwrap();
        assert_eq!(open_sum, exchange.current_quantity);
        assert_eq!(exchange.current_quantity, dec!(0.002));
        assert_eq!(exchange.status, PositionStatus::Open);
    }

    #[tokio::test]
    async fn test_close_computes_pnl_and_closes_exchange_position() {
        let ledger = ledger();
        let (order, report) = fill(dec!(50000), dec!(0.01));
        let id = ledger
            .create_strategy_position(&signal("momentum", "buy", None, None), &order, &report)
            .await
            .unwrap();

        let closed = ledger
            .close_strategy_position(&id, dec!(52000), None, CloseReason::TakeProfit, None)
            .await
            .unwrap();

        assert_eq!(closed.realized_pnl, dec!(20));
        assert_eq!(closed.realized_pnl_pct, dec!(4));
        assert_eq!(closed.close_reason, CloseReason::TakeProfit);

        let exchange = ledger.get_exchange_position("BTCUSDT_LONG").await.unwrap();
        assert_eq!(exchange.status, PositionStatus::Closed);

        let position = ledger.get_strategy_position(&id).await.unwrap();
        assert_eq!(position.status, PositionStatus::Closed);
    }

    #[tokio::test]
    async fn test_partial_close_leaves_position_partial() {
        let ledger = ledger();
        let (order, report) = fill(dec!(50000), dec!(0.01));
        let id = ledger
            .create_strategy_position(&signal("momentum", "buy", None, None), &order, &report)
            .await
            .unwrap();

        ledger
            .close_strategy_position(
                &id,
                dec!(51000),
                Some(dec!(0.004)),
                CloseReason::Manual,
                None,
            )
            .await
            .unwrap();

        let position = ledger.get_strategy_position(&id).await.unwrap();
        assert_eq!(position.status, PositionStatus::Partial);

        let exchange = ledger.get_exchange_position("BTCUSDT_LONG").await.unwrap();
        assert_eq!(exchange.current_quantity, dec!(0.006));
    }

    #[tokio::test]
    async fn test_close_unknown_position_errors() {
        let ledger = ledger();
        assert!(
            ledger
                .close_strategy_position("missing", dec!(1), None, CloseReason::Manual, None)
                .await
                .is_err()
        );
    }
}
