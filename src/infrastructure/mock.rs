//! In-process fakes for the exchange, data manager and model/oracle
//! ports. Used by unit and integration tests and by simulation runs; kept
//! out of `#[cfg(test)]` so the `tests/` directory can reach them.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::domain::errors::VenueError;
use crate::domain::order::{
    ExecutionReport, OpenOrder, Order, OrderStatus, OrderType, SymbolInfo,
};
use crate::domain::ports::{
    DataManager, Exchange, ModelFeatures, ModelPrediction, ReasoningContext, ReasoningOracle,
    ReasoningVerdict, SignalModel, SortOrder,
};

/// Scriptable exchange fake.
///
/// Market orders fill at the configured symbol price; resting order types
/// (stop / take-profit / limit) are acknowledged as pending and appear in
/// the open-orders listing until a test removes them to simulate a fill.
pub struct FakeExchange {
    prices: RwLock<HashMap<String, Decimal>>,
    symbol_info: RwLock<HashMap<String, SymbolInfo>>,
    open_orders: RwLock<HashMap<String, Vec<OpenOrder>>>,
    executed: RwLock<Vec<Order>>,
    cancelled: RwLock<Vec<(String, String)>>,
    leverage_calls: RwLock<Vec<(String, u32)>>,
    fail_order_types: RwLock<Vec<OrderType>>,
    fail_next_executes: AtomicUsize,
    fail_next_transient: AtomicUsize,
    leverage_error: RwLock<Option<(i64, String)>>,
    order_seq: AtomicUsize,
}

impl FakeExchange {
    pub fn new() -> Self {
        Self {
            prices: RwLock::new(HashMap::new()),
            symbol_info: RwLock::new(HashMap::new()),
            open_orders: RwLock::new(HashMap::new()),
            executed: RwLock::new(Vec::new()),
            cancelled: RwLock::new(Vec::new()),
            leverage_calls: RwLock::new(Vec::new()),
            fail_order_types: RwLock::new(Vec::new()),
            fail_next_executes: AtomicUsize::new(0),
            fail_next_transient: AtomicUsize::new(0),
            leverage_error: RwLock::new(None),
            order_seq: AtomicUsize::new(1),
        }
    }

    pub async fn set_price(&self, symbol: &str, price: Decimal) {
        self.prices.write().await.insert(symbol.to_string(), price);
    }

    pub async fn set_symbol_info(&self, info: SymbolInfo) {
        self.symbol_info
            .write()
            .await
            .insert(info.symbol.clone(), info);
    }

    /// Fail every subsequent `execute` for the given order types.
    pub async fn fail_order_types(&self, types: Vec<OrderType>) {
        *self.fail_order_types.write().await = types;
    }

    /// Fail the next `n` calls to `execute` with a business rejection.
    pub fn fail_next_executes(&self, n: usize) {
        self.fail_next_executes.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` calls to `execute` with a transient
    /// (retryable) connection error.
    pub fn fail_next_transient(&self, n: usize) {
        self.fail_next_transient.store(n, Ordering::SeqCst);
    }

    /// Make `change_leverage` return the given venue error code.
    pub async fn set_leverage_error(&self, code: i64, message: &str) {
        *self.leverage_error.write().await = Some((code, message.to_string()));
    }

    pub async fn executed_orders(&self) -> Vec<Order> {
        self.executed.read().await.clone()
    }

    pub async fn cancelled_orders(&self) -> Vec<(String, String)> {
        self.cancelled.read().await.clone()
    }

    pub async fn leverage_calls(&self) -> Vec<(String, u32)> {
        self.leverage_calls.read().await.clone()
    }

    /// Simulate a venue-side fill by dropping the order from the listing.
    pub async fn remove_open_order(&self, symbol: &str, order_id: &str) {
        if let Some(orders) = self.open_orders.write().await.get_mut(symbol) {
            orders.retain(|o| o.order_id != order_id);
        }
    }

    pub async fn open_order_count(&self, symbol: &str) -> usize {
        self.open_orders
            .read()
            .await
            .get(symbol)
            .map_or(0, |o| o.len())
    }

    async fn price_for(&self, symbol: &str) -> Decimal {
        self.prices
            .read()
            .await
            .get(symbol)
            .copied()
            .unwrap_or_else(|| Decimal::from(50_000))
    }

    fn next_order_id(&self) -> String {
        format!("fake-{}", self.order_seq.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for FakeExchange {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Exchange for FakeExchange {
    async fn execute(&self, order: &Order) -> Result<ExecutionReport, VenueError> {
        if self
            .fail_next_executes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(VenueError::Business {
                code: -2019,
                message: "Margin is insufficient".to_string(),
            });
        }

        if self
            .fail_next_transient
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(VenueError::Connection("connection reset by peer".to_string()));
        }

        if self.fail_order_types.read().await.contains(&order.order_type) {
            return Err(VenueError::Business {
                code: -4016,
                message: format!("Rejected {} order", order.order_type),
            });
        }

        let order_id = self.next_order_id();
        self.executed.write().await.push(order.clone());

        match order.order_type {
            OrderType::Market => {
                let fill_price = self.price_for(&order.symbol).await;
                Ok(ExecutionReport {
                    status: OrderStatus::Filled,
                    order_id,
                    fill_price: Some(fill_price),
                    amount: Some(order.amount),
                    commission: Some(Decimal::ZERO),
                    error: None,
                    simulated: false,
                })
            }
            _ => {
                let stop_price = order.stop_loss.or(order.take_profit).or(order.target_price);
                self.open_orders
                    .write()
                    .await
                    .entry(order.symbol.clone())
                    .or_default()
                    .push(OpenOrder {
                        order_id: order_id.clone(),
                        order_type: order.order_type,
                        side: order.side,
                        position_side: order.position_side,
                        stop_price,
                        quantity: order.amount,
                        reduce_only: order.reduce_only,
                        status: OrderStatus::Pending,
                    });
                Ok(ExecutionReport {
                    status: OrderStatus::Pending,
                    order_id,
                    fill_price: None,
                    amount: Some(order.amount),
                    commission: None,
                    error: None,
                    simulated: false,
                })
            }
        }
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), VenueError> {
        self.cancelled
            .write()
            .await
            .push((symbol.to_string(), order_id.to_string()));
        self.remove_open_order(symbol, order_id).await;
        Ok(())
    }

    async fn batch_cancel(
        &self,
        symbol: &str,
        order_ids: &[String],
    ) -> Vec<Result<(), VenueError>> {
        let mut results = Vec::with_capacity(order_ids.len());
        for order_id in order_ids {
            results.push(self.cancel_order(symbol, order_id).await);
        }
        results
    }

    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, VenueError> {
        Ok(self
            .open_orders
            .read()
            .await
            .get(symbol)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_symbol_price(&self, symbol: &str) -> Result<Decimal, VenueError> {
        Ok(self.price_for(symbol).await)
    }

    async fn get_symbol_info(&self, symbol: &str) -> Result<SymbolInfo, VenueError> {
        Ok(self
            .symbol_info
            .read()
            .await
            .get(symbol)
            .cloned()
            .unwrap_or_else(|| SymbolInfo {
                symbol: symbol.to_string(),
                min_notional: Decimal::from(5),
                min_qty: Decimal::new(1, 3),
                step_size: Decimal::new(1, 3),
                tick_size: Decimal::new(1, 2),
                multiplier_up: Decimal::new(105, 2),
                multiplier_down: Decimal::new(95, 2),
            }))
    }

    async fn change_leverage(&self, symbol: &str, leverage: u32) -> Result<(), VenueError> {
        self.leverage_calls
            .write()
            .await
            .push((symbol.to_string(), leverage));
        if let Some((code, message)) = self.leverage_error.read().await.clone() {
            return Err(VenueError::Business { code, message });
        }
        Ok(())
    }

    async fn set_position_mode(&self, _hedge: bool) -> Result<(), VenueError> {
        Ok(())
    }

    async fn ping(&self) -> Result<(), VenueError> {
        Ok(())
    }
}

/// In-memory document store with subset-match filters.
pub struct InMemoryDataManager {
    collections: RwLock<HashMap<String, Vec<Value>>>,
}

fn matches_filter(document: &Value, filter: &Value) -> bool {
    match filter.as_object() {
        Some(fields) => fields.iter().all(|(key, expected)| &document[key] == expected),
        None => true,
    }
}

impl InMemoryDataManager {
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
        }
    }

    pub async fn count(&self, collection: &str) -> usize {
        self.collections
            .read()
            .await
            .get(collection)
            .map_or(0, |docs| docs.len())
    }
}

impl Default for InMemoryDataManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataManager for InMemoryDataManager {
    async fn query(
        &self,
        collection: &str,
        filter: Value,
        sort: Option<(String, SortOrder)>,
        limit: Option<usize>,
    ) -> Result<Vec<Value>> {
        let collections = self.collections.read().await;
        let mut results: Vec<Value> = collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .filter(|doc| matches_filter(doc, &filter))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if let Some((field, order)) = sort {
            results.sort_by(|a, b| {
                let left = a[&field].to_string();
                let right = b[&field].to_string();
                match order {
                    SortOrder::Ascending => left.cmp(&right),
                    SortOrder::Descending => right.cmp(&left),
                }
            });
        }

        if let Some(limit) = limit {
            results.truncate(limit);
        }

        Ok(results)
    }

    async fn insert_one(&self, collection: &str, document: Value) -> Result<()> {
        self.collections
            .write()
            .await
            .entry(collection.to_string())
            .or_default()
            .push(document);
        Ok(())
    }

    async fn update_one(&self, collection: &str, filter: Value, document: Value) -> Result<bool> {
        let mut collections = self.collections.write().await;
        if let Some(docs) = collections.get_mut(collection)
            && let Some(existing) = docs.iter_mut().find(|doc| matches_filter(doc, &filter))
        {
            *existing = document;
            return Ok(true);
        }
        Ok(false)
    }

    async fn upsert_one(&self, collection: &str, filter: Value, document: Value) -> Result<()> {
        if !self
            .update_one(collection, filter, document.clone())
            .await?
        {
            self.insert_one(collection, document).await?;
        }
        Ok(())
    }

    async fn delete_one(&self, collection: &str, filter: Value) -> Result<bool> {
        let mut collections = self.collections.write().await;
        if let Some(docs) = collections.get_mut(collection)
            && let Some(index) = docs.iter().position(|doc| matches_filter(doc, &filter))
        {
            docs.remove(index);
            return Ok(true);
        }
        Ok(false)
    }

    async fn health(&self) -> Result<()> {
        Ok(())
    }
}

/// Model that echoes the feature confidence, bullish above a threshold.
/// Mirrors the behavior the ML-light mode ships with until a real model
/// is wired in.
pub struct ThresholdSignalModel {
    pub bullish_above: f64,
}

impl Default for ThresholdSignalModel {
    fn default() -> Self {
        Self { bullish_above: 0.6 }
    }
}

#[async_trait]
impl SignalModel for ThresholdSignalModel {
    async fn predict(&self, features: &ModelFeatures) -> Result<ModelPrediction> {
        Ok(ModelPrediction {
            bullish: features.confidence > self.bullish_above,
            confidence: features.confidence,
        })
    }
}

/// Oracle that approves any signal above a confidence bar.
pub struct ThresholdOracle {
    pub approve_above: f64,
}

impl Default for ThresholdOracle {
    fn default() -> Self {
        Self { approve_above: 0.7 }
    }
}

#[async_trait]
impl ReasoningOracle for ThresholdOracle {
    async fn evaluate(&self, context: &ReasoningContext) -> Result<ReasoningVerdict> {
        let approved = context.confidence > self.approve_above;
        Ok(ReasoningVerdict {
            approved,
            confidence: context.confidence,
            reasoning: format!(
                "Signal confidence is {:.2}, which is {} for execution",
                context.confidence,
                if approved { "sufficient" } else { "insufficient" }
            ),
        })
    }
}

/// Build an `Arc<dyn Exchange>` and keep a typed handle for scripting.
pub fn shared_fake_exchange() -> (Arc<FakeExchange>, Arc<dyn Exchange>) {
    let fake = Arc::new(FakeExchange::new());
    let port: Arc<dyn Exchange> = fake.clone();
    (fake, port)
}
