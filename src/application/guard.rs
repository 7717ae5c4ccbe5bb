//! Pre-trade risk guard.
//!
//! Three checks per candidate order: position-size percentage, daily
//! realized loss, and total portfolio exposure. The dispatcher runs the
//! full set under the per-(symbol, side) lock; the aggregator runs the
//! portfolio-level subset before arbitration.

use std::collections::HashMap;

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use tokio::sync::RwLock;
use tracing::warn;

use crate::domain::errors::RiskViolation;
use crate::domain::signal::Signal;

#[derive(Debug, Clone)]
pub struct RiskLimits {
    /// Maximum position size as fraction of portfolio (0..1)
    pub max_position_size_pct: f64,
    /// Maximum daily realized loss as fraction of portfolio (0..1)
    pub max_daily_loss_pct: f64,
    /// Maximum total notional as fraction of portfolio (0..1)
    pub max_portfolio_exposure_pct: f64,
    /// Reference portfolio value in USD
    pub portfolio_value: Decimal,
    pub enabled: bool,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_position_size_pct: 0.1,
            max_daily_loss_pct: 0.05,
            max_portfolio_exposure_pct: 0.8,
            portfolio_value: Decimal::from(10_000),
            enabled: true,
        }
    }
}

#[derive(Debug, Default)]
struct GuardState {
    daily_realized_pnl: Decimal,
    /// Open notional per exchange position key
    open_notional: HashMap<String, Decimal>,
}

pub struct PositionGuard {
    limits: RiskLimits,
    state: RwLock<GuardState>,
}

impl PositionGuard {
    pub fn new(limits: RiskLimits) -> Self {
        Self {
            limits,
            state: RwLock::new(GuardState::default()),
        }
    }

    /// Portfolio-level gate run before arbitration: daily loss and the
    /// signal's requested position size.
    pub async fn check_signal(&self, signal: &Signal) -> Result<(), RiskViolation> {
        if !self.limits.enabled {
            return Ok(());
        }

        self.check_daily_loss().await?;

        if let Some(requested) = signal.position_size_pct
            && requested > self.limits.max_position_size_pct
        {
            warn!(
                "Signal {} requests {:.1}% of portfolio, limit is {:.1}%",
                signal.strategy_id,
                requested * 100.0,
                self.limits.max_position_size_pct * 100.0
            );
            return Err(RiskViolation::PositionSizeLimit {
                symbol: signal.symbol.clone(),
                requested_pct: requested * 100.0,
                max_pct: self.limits.max_position_size_pct * 100.0,
            });
        }

        Ok(())
    }

    /// Full pre-trade gate run under the execution lock.
    pub async fn check_order(
        &self,
        symbol: &str,
        notional: Decimal,
    ) -> Result<(), RiskViolation> {
        if !self.limits.enabled {
            return Ok(());
        }

        self.check_daily_loss().await?;

        let portfolio = self.limits.portfolio_value;
        if portfolio > Decimal::ZERO {
            let requested_pct = (notional / portfolio).to_f64().unwrap_or(f64::MAX);
            if requested_pct > self.limits.max_position_size_pct {
                return Err(RiskViolation::PositionSizeLimit {
                    symbol: symbol.to_string(),
                    requested_pct: requested_pct * 100.0,
                    max_pct: self.limits.max_position_size_pct * 100.0,
                });
            }

            let state = self.state.read().await;
            let current: Decimal = state.open_notional.values().copied().sum();
            let exposure_pct = ((current + notional) / portfolio)
                .to_f64()
                .unwrap_or(f64::MAX);
            if exposure_pct > self.limits.max_portfolio_exposure_pct {
                return Err(RiskViolation::PortfolioExposureLimit {
                    symbol: symbol.to_string(),
                    exposure_pct: exposure_pct * 100.0,
                    max_pct: self.limits.max_portfolio_exposure_pct * 100.0,
                });
            }
        }

        Ok(())
    }

    async fn check_daily_loss(&self) -> Result<(), RiskViolation> {
        let state = self.state.read().await;
        let max_loss = self.limits.portfolio_value
            * Decimal::try_from(self.limits.max_daily_loss_pct).unwrap_or_default();
        if state.daily_realized_pnl < -max_loss {
            return Err(RiskViolation::DailyLossLimit {
                daily_pnl: state.daily_realized_pnl,
                limit_pct: self.limits.max_daily_loss_pct * 100.0,
            });
        }
        Ok(())
    }

    /// Fold realized P&L into the daily total.
    pub async fn record_realized_pnl(&self, pnl: Decimal) {
        let mut state = self.state.write().await;
        state.daily_realized_pnl += pnl;
    }

    pub async fn daily_realized_pnl(&self) -> Decimal {
        self.state.read().await.daily_realized_pnl
    }

    /// Track notional added by a fill.
    pub async fn add_exposure(&self, position_key: &str, notional: Decimal) {
        let mut state = self.state.write().await;
        *state
            .open_notional
            .entry(position_key.to_string())
            .or_default() += notional;
    }

    /// Release notional when a position (partially) closes.
    pub async fn release_exposure(&self, position_key: &str, notional: Decimal) {
        let mut state = self.state.write().await;
        if let Some(current) = state.open_notional.get_mut(position_key) {
            *current -= notional;
            if *current <= Decimal::ZERO {
                state.open_notional.remove(position_key);
            }
        }
    }

    /// Reset at the day boundary.
    pub async fn reset_daily(&self) {
        let mut state = self.state.write().await;
        state.daily_realized_pnl = Decimal::ZERO;
    }
}
