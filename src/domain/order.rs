//! Order contract and exchange-facing result shapes.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Hedge-mode position side. LONG and SHORT on the same symbol are two
/// independent positions, never netted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// Order side that reduces a position on this side.
    pub fn closing_order_side(&self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Sell,
            PositionSide::Short => OrderSide::Buy,
        }
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionSide::Long => write!(f, "LONG"),
            PositionSide::Short => write!(f, "SHORT"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopLimit,
    TakeProfit,
    TakeProfitLimit,
    ConditionalLimit,
    ConditionalStop,
}

impl OrderType {
    /// Conditional orders are triggered client-side by the order manager.
    pub fn is_conditional(&self) -> bool {
        matches!(self, OrderType::ConditionalLimit | OrderType::ConditionalStop)
    }
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderType::Market => "market",
            OrderType::Limit => "limit",
            OrderType::Stop => "stop",
            OrderType::StopLimit => "stop_limit",
            OrderType::TakeProfit => "take_profit",
            OrderType::TakeProfitLimit => "take_profit_limit",
            OrderType::ConditionalLimit => "conditional_limit",
            OrderType::ConditionalStop => "conditional_stop",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    #[default]
    Gtc,
    Ioc,
    Fok,
    Gtx,
}

impl fmt::Display for TimeInForce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeInForce::Gtc => write!(f, "GTC"),
            TimeInForce::Ioc => write!(f, "IOC"),
            TimeInForce::Fok => write!(f, "FOK"),
            TimeInForce::Gtx => write!(f, "GTX"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Partial,
    Filled,
    Rejected,
    Cancelled,
    Failed,
    Error,
    Timeout,
}

impl OrderStatus {
    /// Orders in these states remain in the active bag.
    pub fn is_working(&self) -> bool {
        matches!(self, OrderStatus::Pending | OrderStatus::Partial)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Partial => "partial",
            OrderStatus::Filled => "filled",
            OrderStatus::Rejected => "rejected",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Failed => "failed",
            OrderStatus::Error => "error",
            OrderStatus::Timeout => "timeout",
        };
        write!(f, "{}", s)
    }
}

/// Direction for client-side conditional triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerDirection {
    Above,
    Below,
}

/// A trade order. Mutable status; everything else is fixed at creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub amount: Decimal,
    #[serde(default)]
    pub target_price: Option<Decimal>,
    #[serde(default)]
    pub stop_loss: Option<Decimal>,
    #[serde(default)]
    pub take_profit: Option<Decimal>,
    #[serde(default)]
    pub time_in_force: TimeInForce,
    pub position_side: PositionSide,
    #[serde(default)]
    pub reduce_only: bool,
    #[serde(default)]
    pub simulate: bool,
    #[serde(default)]
    pub strategy_id: Option<String>,
    #[serde(default)]
    pub signal_id: Option<String>,
    #[serde(default)]
    pub conditional_price: Option<Decimal>,
    #[serde(default)]
    pub conditional_direction: Option<TriggerDirection>,
    #[serde(default)]
    pub conditional_timeout_secs: Option<u64>,
    pub created_at: DateTime<Utc>,
}

impl Order {
    pub fn new(
        symbol: impl Into<String>,
        side: OrderSide,
        order_type: OrderType,
        amount: Decimal,
        position_side: PositionSide,
    ) -> Self {
        Self {
            order_id: Uuid::new_v4().to_string(),
            symbol: symbol.into(),
            side,
            order_type,
            amount,
            target_price: None,
            stop_loss: None,
            take_profit: None,
            time_in_force: TimeInForce::Gtc,
            position_side,
            reduce_only: false,
            simulate: false,
            strategy_id: None,
            signal_id: None,
            conditional_price: None,
            conditional_direction: None,
            conditional_timeout_secs: None,
            created_at: Utc::now(),
        }
    }

    /// Notional value at the given price.
    pub fn notional(&self, price: Decimal) -> Decimal {
        self.amount * price
    }
}

/// Result of submitting an order to the exchange capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub status: OrderStatus,
    pub order_id: String,
    #[serde(default)]
    pub fill_price: Option<Decimal>,
    #[serde(default)]
    pub amount: Option<Decimal>,
    #[serde(default)]
    pub commission: Option<Decimal>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub simulated: bool,
}

impl ExecutionReport {
    pub fn is_filled(&self) -> bool {
        matches!(self.status, OrderStatus::Filled | OrderStatus::Partial)
    }
}

/// An open order as reported by the venue's open-orders listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenOrder {
    pub order_id: String,
    pub order_type: OrderType,
    pub side: OrderSide,
    pub position_side: PositionSide,
    #[serde(default)]
    pub stop_price: Option<Decimal>,
    pub quantity: Decimal,
    pub reduce_only: bool,
    pub status: OrderStatus,
}

/// Venue trading filters for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub symbol: String,
    pub min_notional: Decimal,
    pub min_qty: Decimal,
    pub step_size: Decimal,
    pub tick_size: Decimal,
    pub multiplier_up: Decimal,
    pub multiplier_down: Decimal,
}
