//! Virtual strategy positions, aggregated exchange positions and the
//! contribution records linking the two.
//!
//! A strategy position is what one strategy "thinks" it owns; several of
//! them can project onto the same physical exchange position (keyed by
//! `{symbol}_{side}`). Contributions carry the attribution needed to pay
//! P&L back to the right strategy.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::order::PositionSide;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Open,
    Partial,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    TakeProfit,
    StopLoss,
    Manual,
    SignalClose,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::TakeProfit => "take_profit",
            CloseReason::StopLoss => "stop_loss",
            CloseReason::Manual => "manual",
            CloseReason::SignalClose => "signal_close",
        };
        write!(f, "{}", s)
    }
}

/// Key under which LONG and SHORT positions of a symbol are aggregated.
pub fn exchange_position_key(symbol: &str, side: PositionSide) -> String {
    format!("{}_{}", symbol, side)
}

/// One strategy's virtual position, closed independently of its siblings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyPosition {
    pub strategy_position_id: String,
    pub strategy_id: String,
    pub signal_id: Option<String>,
    pub symbol: String,
    pub side: PositionSide,
    pub entry_quantity: Decimal,
    pub entry_price: Decimal,
    pub entry_time: DateTime<Utc>,
    pub entry_order_id: Option<String>,
    pub take_profit_price: Option<Decimal>,
    pub stop_loss_price: Option<Decimal>,
    pub tp_order_id: Option<String>,
    pub sl_order_id: Option<String>,
    pub status: PositionStatus,
    pub exchange_position_key: String,
    pub exit_quantity: Option<Decimal>,
    pub exit_price: Option<Decimal>,
    pub exit_time: Option<DateTime<Utc>>,
    pub exit_order_id: Option<String>,
    pub close_reason: Option<CloseReason>,
    pub realized_pnl: Option<Decimal>,
    pub realized_pnl_pct: Option<Decimal>,
}

impl StrategyPosition {
    pub fn is_open(&self) -> bool {
        matches!(self.status, PositionStatus::Open | PositionStatus::Partial)
    }

    /// Realized P&L for exiting `quantity` at `exit_price`.
    /// LONG: (exit - entry) * q; SHORT mirrored.
    pub fn pnl_for_exit(&self, exit_price: Decimal, quantity: Decimal) -> Decimal {
        match self.side {
            PositionSide::Long => (exit_price - self.entry_price) * quantity,
            PositionSide::Short => (self.entry_price - exit_price) * quantity,
        }
    }
}

/// The aggregated physical position on the venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub exchange_position_key: String,
    pub symbol: String,
    pub side: PositionSide,
    pub current_quantity: Decimal,
    pub weighted_avg_price: Decimal,
    pub contributing_strategies: BTreeSet<String>,
    pub total_contributions: u64,
    pub first_entry_time: DateTime<Utc>,
    pub last_update_time: DateTime<Utc>,
    pub status: PositionStatus,
}

impl ExchangePosition {
    /// Fold a new fill into the contribution-weighted average price.
    pub fn absorb(&mut self, quantity: Decimal, price: Decimal, strategy_id: &str) {
        let old_quantity = self.current_quantity;
        let new_quantity = old_quantity + quantity;
        if new_quantity > Decimal::ZERO {
            self.weighted_avg_price =
                (old_quantity * self.weighted_avg_price + quantity * price) / new_quantity;
        }
        self.current_quantity = new_quantity;
        self.total_contributions += 1;
        self.contributing_strategies.insert(strategy_id.to_string());
        self.last_update_time = Utc::now();
    }

    /// Subtract closed quantity; flips to closed at zero.
    pub fn reduce(&mut self, quantity: Decimal) {
        self.current_quantity -= quantity;
        self.last_update_time = Utc::now();
        if self.current_quantity <= Decimal::ZERO {
            self.status = PositionStatus::Closed;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContributionStatus {
    Active,
    Closed,
}

/// Links one strategy position to its slice of an exchange position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionContribution {
    pub contribution_id: String,
    pub strategy_position_id: String,
    pub exchange_position_key: String,
    pub strategy_id: String,
    pub symbol: String,
    pub position_side: PositionSide,
    pub contribution_quantity: Decimal,
    pub contribution_entry_price: Decimal,
    pub contribution_time: DateTime<Utc>,
    pub position_sequence: u64,
    pub exchange_quantity_before: Decimal,
    pub exchange_quantity_after: Decimal,
    pub status: ContributionStatus,
    pub exit_time: Option<DateTime<Utc>>,
    pub exit_price: Option<Decimal>,
    pub contribution_pnl: Option<Decimal>,
    pub contribution_pnl_pct: Option<Decimal>,
    pub close_reason: Option<CloseReason>,
}

/// Summary returned when a strategy position closes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedPosition {
    pub strategy_position_id: String,
    pub strategy_id: String,
    pub symbol: String,
    pub side: PositionSide,
    pub close_reason: CloseReason,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub quantity: Decimal,
    pub realized_pnl: Decimal,
    pub realized_pnl_pct: Decimal,
}
