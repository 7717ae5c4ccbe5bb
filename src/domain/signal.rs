//! Inbound trading signal contract.
//!
//! Signals arrive as JSON from the strategy fleet. Timestamps are accepted
//! as ISO-8601 strings, epoch seconds (integer or float) or epoch
//! milliseconds; anything unparseable falls back to "now" so a sloppy
//! producer cannot stall the pipeline.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::errors::SignalError;
use crate::domain::order::{OrderType, PositionSide, TimeInForce};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalAction {
    Buy,
    Sell,
    Hold,
    Close,
}

impl SignalAction {
    /// Directional value used by weighted-average conflict resolution.
    pub fn direction_value(&self) -> f64 {
        match self {
            SignalAction::Buy => 1.0,
            SignalAction::Sell => -1.0,
            SignalAction::Hold | SignalAction::Close => 0.0,
        }
    }

    pub fn is_entry(&self) -> bool {
        matches!(self, SignalAction::Buy | SignalAction::Sell)
    }
}

impl fmt::Display for SignalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalAction::Buy => write!(f, "buy"),
            SignalAction::Sell => write!(f, "sell"),
            SignalAction::Hold => write!(f, "hold"),
            SignalAction::Close => write!(f, "close"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalStrength {
    Weak,
    Medium,
    Strong,
    Extreme,
}

impl SignalStrength {
    pub fn multiplier(&self) -> f64 {
        match self {
            SignalStrength::Weak => 0.5,
            SignalStrength::Medium => 1.0,
            SignalStrength::Strong => 1.5,
            SignalStrength::Extreme => 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyMode {
    Deterministic,
    MlLight,
    LlmReasoning,
}

impl StrategyMode {
    /// Multiplier applied to the base strength score.
    pub fn strength_multiplier(&self) -> f64 {
        match self {
            StrategyMode::Deterministic => 1.0,
            StrategyMode::MlLight => 1.2,
            StrategyMode::LlmReasoning => 1.5,
        }
    }

    /// Multiplier applied to the timeframe-weighted score.
    pub fn timeframe_multiplier(&self) -> f64 {
        match self {
            StrategyMode::Deterministic => 1.0,
            StrategyMode::MlLight => 1.1,
            StrategyMode::LlmReasoning => 1.3,
        }
    }
}

impl fmt::Display for StrategyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyMode::Deterministic => write!(f, "deterministic"),
            StrategyMode::MlLight => write!(f, "ml_light"),
            StrategyMode::LlmReasoning => write!(f, "llm_reasoning"),
        }
    }
}

/// Candle timeframe. Variants are declared in ascending order so the
/// derived `Ord` matches the explicit rank table used by arbitration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TimeFrame {
    #[serde(rename = "tick")]
    Tick,
    #[serde(rename = "1m")]
    Min1,
    #[serde(rename = "3m")]
    Min3,
    #[serde(rename = "5m")]
    Min5,
    #[serde(rename = "15m")]
    Min15,
    #[serde(rename = "30m")]
    Min30,
    #[serde(rename = "1h")]
    Hour1,
    #[serde(rename = "2h")]
    Hour2,
    #[serde(rename = "4h")]
    Hour4,
    #[serde(rename = "6h")]
    Hour6,
    #[serde(rename = "8h")]
    Hour8,
    #[serde(rename = "12h")]
    Hour12,
    #[serde(rename = "1d")]
    Day1,
    #[serde(rename = "3d")]
    Day3,
    #[serde(rename = "1w")]
    Week1,
    #[serde(rename = "1mo")]
    Month1,
}

impl TimeFrame {
    /// Explicit numeric rank (tick=1 .. 1mo=16). Arbitration compares
    /// ranks, not identifier order.
    pub fn rank(&self) -> u8 {
        match self {
            TimeFrame::Tick => 1,
            TimeFrame::Min1 => 2,
            TimeFrame::Min3 => 3,
            TimeFrame::Min5 => 4,
            TimeFrame::Min15 => 5,
            TimeFrame::Min30 => 6,
            TimeFrame::Hour1 => 7,
            TimeFrame::Hour2 => 8,
            TimeFrame::Hour4 => 9,
            TimeFrame::Hour6 => 10,
            TimeFrame::Hour8 => 11,
            TimeFrame::Hour12 => 12,
            TimeFrame::Day1 => 13,
            TimeFrame::Day3 => 14,
            TimeFrame::Week1 => 15,
            TimeFrame::Month1 => 16,
        }
    }

    /// Monotone-increasing weight for timeframe-weighted scoring.
    pub fn weight(&self) -> f64 {
        match self {
            TimeFrame::Tick => 0.5,
            TimeFrame::Min1 => 0.6,
            TimeFrame::Min3 => 0.7,
            TimeFrame::Min5 => 0.8,
            TimeFrame::Min15 => 0.9,
            TimeFrame::Min30 => 1.0,
            TimeFrame::Hour1 => 1.1,
            TimeFrame::Hour2 => 1.2,
            TimeFrame::Hour4 => 1.3,
            TimeFrame::Hour6 => 1.4,
            TimeFrame::Hour8 => 1.5,
            TimeFrame::Hour12 => 1.6,
            TimeFrame::Day1 => 1.8,
            TimeFrame::Day3 => 2.0,
            TimeFrame::Week1 => 2.2,
            TimeFrame::Month1 => 2.5,
        }
    }
}

impl fmt::Display for TimeFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TimeFrame::Tick => "tick",
            TimeFrame::Min1 => "1m",
            TimeFrame::Min3 => "3m",
            TimeFrame::Min5 => "5m",
            TimeFrame::Min15 => "15m",
            TimeFrame::Min30 => "30m",
            TimeFrame::Hour1 => "1h",
            TimeFrame::Hour2 => "2h",
            TimeFrame::Hour4 => "4h",
            TimeFrame::Hour6 => "6h",
            TimeFrame::Hour8 => "8h",
            TimeFrame::Hour12 => "12h",
            TimeFrame::Day1 => "1d",
            TimeFrame::Day3 => "3d",
            TimeFrame::Week1 => "1w",
            TimeFrame::Month1 => "1mo",
        };
        write!(f, "{}", s)
    }
}

/// A trading signal published by one strategy. Immutable once published.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    #[serde(default)]
    pub signal_id: Option<String>,
    pub strategy_id: String,
    pub symbol: String,
    pub action: SignalAction,
    pub confidence: f64,
    #[serde(default = "default_strength")]
    pub strength: SignalStrength,
    pub timeframe: TimeFrame,
    #[serde(default = "default_mode")]
    pub strategy_mode: StrategyMode,
    #[serde(default = "default_order_type")]
    pub order_type: OrderType,
    #[serde(default)]
    pub time_in_force: TimeInForce,
    pub current_price: Decimal,
    #[serde(default)]
    pub target_price: Option<Decimal>,
    #[serde(default)]
    pub quantity: Option<Decimal>,
    #[serde(default)]
    pub position_size_pct: Option<f64>,
    #[serde(default)]
    pub stop_loss_pct: Option<f64>,
    #[serde(default)]
    pub take_profit_pct: Option<f64>,
    #[serde(default)]
    pub model_confidence: Option<f64>,
    #[serde(default)]
    pub indicators: BTreeMap<String, f64>,
    #[serde(default)]
    pub rationale: Option<String>,
    #[serde(default = "Utc::now", with = "flexible_timestamp")]
    pub timestamp: DateTime<Utc>,
}

fn default_strength() -> SignalStrength {
    SignalStrength::Medium
}

fn default_mode() -> StrategyMode {
    StrategyMode::Deterministic
}

fn default_order_type() -> OrderType {
    OrderType::Market
}

impl Signal {
    /// Range-check confidence and percentage fields.
    pub fn validate(&self) -> Result<(), SignalError> {
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(SignalError::ConfidenceOutOfRange(self.confidence));
        }
        let pct_fields = [
            ("position_size_pct", self.position_size_pct),
            ("stop_loss_pct", self.stop_loss_pct),
            ("take_profit_pct", self.take_profit_pct),
            ("model_confidence", self.model_confidence),
        ];
        for (field, value) in pct_fields {
            if let Some(v) = value
                && !(0.0..=1.0).contains(&v)
            {
                return Err(SignalError::PercentageOutOfRange { field, value: v });
            }
        }
        Ok(())
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.timestamp
    }

    pub fn is_expired(&self, max_age_seconds: i64) -> bool {
        self.age(Utc::now()).num_seconds() > max_age_seconds
    }

    /// Hedge-mode position side implied by the action.
    pub fn position_side(&self) -> PositionSide {
        match self.action {
            SignalAction::Sell => PositionSide::Short,
            _ => PositionSide::Long,
        }
    }

    /// Key under which approved signals are stored by the aggregator.
    pub fn store_key(&self) -> String {
        format!(
            "{}_{}_{}",
            self.strategy_id,
            self.symbol,
            self.timestamp.to_rfc3339()
        )
    }
}

/// Lenient timestamp (de)serialization for the signal bus.
pub mod flexible_timestamp {
    use chrono::{DateTime, TimeZone, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&ts.to_rfc3339())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Integer(i64),
            Float(f64),
            Other(serde_json::Value),
        }

        let parsed = match Raw::deserialize(deserializer)? {
            Raw::Text(s) => DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .ok(),
            Raw::Integer(secs) => from_epoch(secs),
            Raw::Float(secs) => {
                let millis = (secs * 1000.0) as i64;
                Utc.timestamp_millis_opt(millis).single()
            }
            Raw::Other(_) => None,
        };

        Ok(parsed.unwrap_or_else(Utc::now))
    }

    // Values past ~2286 in seconds are assumed to be milliseconds.
    fn from_epoch(value: i64) -> Option<DateTime<Utc>> {
        if value > 10_000_000_000 {
            Utc.timestamp_millis_opt(value).single()
        } else {
            Utc.timestamp_opt(value, 0).single()
        }
    }
}
