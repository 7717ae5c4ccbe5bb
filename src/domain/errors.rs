use rust_decimal::Decimal;
use thiserror::Error;

/// Binance error code returned when leverage cannot be changed while a
/// position is open. Downgraded to a warning by the leverage manager.
pub const VENUE_CODE_LEVERAGE_UNCHANGED: i64 = -4028;

/// Errors raised while validating inbound signals
#[derive(Debug, Error)]
pub enum SignalError {
    #[error("Signal confidence must be between 0 and 1, got {0}")]
    ConfidenceOutOfRange(f64),

    #[error("Signal {field} must be between 0 and 1, got {value}")]
    PercentageOutOfRange { field: &'static str, value: f64 },

    #[error("Signal for {symbol} expired: age {age_seconds}s > max {max_seconds}s")]
    Expired {
        symbol: String,
        age_seconds: i64,
        max_seconds: i64,
    },
}

/// Errors related to pre-trade risk limit violations
#[derive(Debug, Error)]
pub enum RiskViolation {
    #[error("Position size limit exceeded for {symbol}: {requested_pct:.2}% > {max_pct:.2}%")]
    PositionSizeLimit {
        symbol: String,
        requested_pct: f64,
        max_pct: f64,
    },

    #[error("Daily loss limit breached: ${daily_pnl} below -{limit_pct:.2}% of portfolio")]
    DailyLossLimit { daily_pnl: Decimal, limit_pct: f64 },

    #[error(
        "Portfolio exposure limit exceeded: {exposure_pct:.2}% > {max_pct:.2}% (adding {symbol})"
    )]
    PortfolioExposureLimit {
        symbol: String,
        exposure_pct: f64,
        max_pct: f64,
    },
}

impl RiskViolation {
    /// Short label used for the `reason` metric dimension.
    pub fn reason_label(&self) -> &'static str {
        match self {
            RiskViolation::PositionSizeLimit { .. } => "position_size_limit",
            RiskViolation::DailyLossLimit { .. } => "daily_loss_limit",
            RiskViolation::PortfolioExposureLimit { .. } => "portfolio_exposure_limit",
        }
    }
}

/// Errors returned by the exchange capability
#[derive(Debug, Error)]
pub enum VenueError {
    #[error("Venue request timed out after {0}ms")]
    Timeout(u64),

    #[error("Venue connection error: {0}")]
    Connection(String),

    #[error("Venue rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Venue rejected request (code {code}): {message}")]
    Business { code: i64, message: String },

    #[error("Malformed venue response: {0}")]
    Protocol(String),
}

impl VenueError {
    /// Transient failures are retried with backoff; business rejections are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            VenueError::Timeout(_) | VenueError::Connection(_) | VenueError::RateLimited { .. }
        )
    }

    /// The "leverage not changed (open position)" rejection, which is
    /// tolerated during order execution.
    pub fn is_leverage_unchanged(&self) -> bool {
        matches!(self, VenueError::Business { code, .. } if *code == VENUE_CODE_LEVERAGE_UNCHANGED)
    }
}

/// Errors raised by the runtime configuration resolver
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid parameter {key}: {reason}")]
    InvalidParameter { key: String, reason: String },

    #[error("Failed to persist configuration: {0}")]
    PersistenceFailed(String),
}

/// Errors raised while placing or managing OCO pairs
#[derive(Debug, Error)]
pub enum OcoError {
    #[error(
        "Invalid OCO prices for {position_side} position: sl={stop_loss}, entry={entry}, tp={take_profit}"
    )]
    InvalidPrices {
        position_side: String,
        stop_loss: Decimal,
        entry: Decimal,
        take_profit: Decimal,
    },

    #[error("OCO leg placement failed for {symbol}: {reason}")]
    PlacementFailed { symbol: String, reason: String },

    #[error("No OCO pair found for position {position_id}")]
    PairNotFound { position_id: String },
}
