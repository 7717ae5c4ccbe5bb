//! Runtime trading configuration: layered parameters, audit records and
//! per-symbol leverage status.
//!
//! Parameters use an enumerated set of known keys plus a typed overflow
//! map for strategy-defined extras; validation happens at the boundary.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::errors::ConfigError;
use crate::domain::order::PositionSide;

pub const MIN_LEVERAGE: u32 = 1;
pub const MAX_LEVERAGE: u32 = 125;

/// Fully-resolved trading parameters after layering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingParameters {
    pub leverage: u32,
    pub position_size_pct: f64,
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Default for TradingParameters {
    /// Built-in defaults, the bottom layer of every resolution.
    fn default() -> Self {
        Self {
            leverage: 5,
            position_size_pct: 0.1,
            stop_loss_pct: 0.02,
            take_profit_pct: 0.05,
            extra: BTreeMap::new(),
        }
    }
}

impl TradingParameters {
    /// Apply a partial layer; later layers override earlier keys.
    pub fn apply(&mut self, patch: &ParameterPatch) {
        if let Some(leverage) = patch.leverage {
            self.leverage = leverage;
        }
        if let Some(pct) = patch.position_size_pct {
            self.position_size_pct = pct;
        }
        if let Some(pct) = patch.stop_loss_pct {
            self.stop_loss_pct = pct;
        }
        if let Some(pct) = patch.take_profit_pct {
            self.take_profit_pct = pct;
        }
        for (key, value) in &patch.extra {
            self.extra.insert(key.clone(), value.clone());
        }
    }
}

/// Partial parameter set as stored per scope layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leverage: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_size_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit_pct: Option<f64>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ParameterPatch {
    /// Boundary validation. Returns every violation, not just the first.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        if let Some(leverage) = self.leverage
            && !(MIN_LEVERAGE..=MAX_LEVERAGE).contains(&leverage)
        {
            errors.push(ConfigError::InvalidParameter {
                key: "leverage".to_string(),
                reason: format!(
                    "must be between {} and {}, got {}",
                    MIN_LEVERAGE, MAX_LEVERAGE, leverage
                ),
            });
        }

        let pct_fields = [
            ("position_size_pct", self.position_size_pct),
            ("stop_loss_pct", self.stop_loss_pct),
            ("take_profit_pct", self.take_profit_pct),
        ];
        for (key, value) in pct_fields {
            if let Some(v) = value
                && !(0.0..=1.0).contains(&v)
            {
                errors.push(ConfigError::InvalidParameter {
                    key: key.to_string(),
                    reason: format!("must be between 0 and 1, got {}", v),
                });
            }
        }

        errors
    }

    pub fn is_empty(&self) -> bool {
        self.leverage.is_none()
            && self.position_size_pct.is_none()
            && self.stop_loss_pct.is_none()
            && self.take_profit_pct.is_none()
            && self.extra.is_empty()
    }
}

/// Scope of one stored configuration layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "scope")]
pub enum ConfigScope {
    Global,
    Symbol { symbol: String },
    SymbolSide { symbol: String, side: PositionSide },
}

impl ConfigScope {
    pub fn new(symbol: Option<&str>, side: Option<PositionSide>) -> Self {
        match (symbol, side) {
            (Some(symbol), Some(side)) => ConfigScope::SymbolSide {
                symbol: symbol.to_string(),
                side,
            },
            (Some(symbol), None) => ConfigScope::Symbol {
                symbol: symbol.to_string(),
            },
            _ => ConfigScope::Global,
        }
    }

    pub fn collection(&self) -> &'static str {
        match self {
            ConfigScope::Global => "trading_configs_global",
            ConfigScope::Symbol { .. } => "trading_configs_symbol",
            ConfigScope::SymbolSide { .. } => "trading_configs_symbol_side",
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ConfigScope::Global => "global",
            ConfigScope::Symbol { .. } => "symbol",
            ConfigScope::SymbolSide { .. } => "symbol_side",
        }
    }
}

impl fmt::Display for ConfigScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigScope::Global => write!(f, "global"),
            ConfigScope::Symbol { symbol } => write!(f, "{}", symbol),
            ConfigScope::SymbolSide { symbol, side } => write!(f, "{}:{}", symbol, side),
        }
    }
}

/// One stored configuration layer with monotonically increasing version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    #[serde(flatten)]
    pub scope: ConfigScope,
    pub parameters: ParameterPatch,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditAction {
    Create,
    Update,
    Delete,
}

/// Append-only audit record emitted on every configuration mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfigAudit {
    pub audit_id: String,
    #[serde(flatten)]
    pub scope: ConfigScope,
    pub action: AuditAction,
    pub parameters_before: Option<ParameterPatch>,
    pub parameters_after: Option<ParameterPatch>,
    pub version_before: Option<u64>,
    pub version_after: Option<u64>,
    pub changed_by: String,
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl TradingConfigAudit {
    pub fn change_summary(&self) -> String {
        let action = match self.action {
            AuditAction::Create => "CREATE",
            AuditAction::Update => "UPDATE",
            AuditAction::Delete => "DELETE",
        };
        format!("{} {} by {}", action, self.scope, self.changed_by)
    }
}

/// Configured-vs-actual leverage tracking for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeverageStatus {
    pub symbol: String,
    pub configured_leverage: u32,
    pub actual_leverage: Option<u32>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_sync_success: bool,
    pub last_sync_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl LeverageStatus {
    pub fn is_synced(&self) -> bool {
        self.actual_leverage == Some(self.configured_leverage)
    }

    pub fn needs_sync(&self) -> bool {
        !self.is_synced()
    }
}
