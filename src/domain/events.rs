//! Close events emitted by the OCO monitor.
//!
//! The monitor never calls the position ledger directly; it publishes
//! events on a channel and the dispatcher's consumer loop applies them.
//! This keeps the dispatcher / OCO manager / ledger dependency graph
//! acyclic.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::order::PositionSide;
use crate::domain::position::CloseReason;

/// Emitted when the monitor infers that one leg of an OCO pair filled,
/// or when a manual close tears a position down.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionCloseEvent {
    /// Strategy position to close; `None` when the pair predates
    /// per-strategy tracking.
    pub strategy_position_id: Option<String>,
    pub position_id: String,
    pub symbol: String,
    pub position_side: PositionSide,
    pub quantity: Decimal,
    pub exit_price: Decimal,
    pub close_reason: CloseReason,
    pub exit_order_id: Option<String>,
}
