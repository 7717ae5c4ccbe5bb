use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use rust_decimal::Decimal;

use crate::application::aggregator::ConflictPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Mock,
    Live,
}

impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mock" => Ok(Mode::Mock),
            "live" => Ok(Mode::Live),
            _ => anyhow::bail!("Invalid MODE: {}. Must be 'mock' or 'live'", s),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub mode: Mode,
    pub symbols: Vec<String>,
    // Venue
    pub binance_api_key: String,
    pub binance_api_secret: String,
    pub binance_base_url: String,
    pub simulate: bool,
    // Persistence
    pub database_url: String,
    // Config resolver
    pub config_cache_ttl: Duration,
    // Signal handling
    pub max_signal_age_seconds: i64,
    pub conflict_policy: ConflictPolicy,
    pub timeframe_policy: Option<ConflictPolicy>,
    pub deterministic_enabled: bool,
    pub ml_light_enabled: bool,
    pub llm_reasoning_enabled: bool,
    pub signal_retention_seconds: i64,
    // Dispatcher
    pub signal_cache_ttl: Duration,
    pub signal_cache_cleanup_interval: Duration,
    pub accumulation_cooldown: Option<Duration>,
    pub lock_ttl: Duration,
    pub venue_retry_attempts: u32,
    pub venue_retry_base_delay: Duration,
    // Risk
    pub risk_enabled: bool,
    pub max_position_size_pct: f64,
    pub max_daily_loss_pct: f64,
    pub max_portfolio_exposure_pct: f64,
    pub portfolio_value: Decimal,
    // OCO monitor
    pub oco_poll_interval: Duration,
    pub oco_error_backoff: Duration,
    // Conditional orders
    pub price_monitoring_interval: Duration,
    pub conditional_order_timeout: Duration,
}

fn env_parse<T: FromStr>(key: &str, default: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse::<T>()
        .with_context(|| format!("Failed to parse {}", key))
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        let mode = Mode::from_str(&env::var("MODE").unwrap_or_else(|_| "mock".to_string()))?;

        let symbols: Vec<String> = env::var("SYMBOLS")
            .unwrap_or_else(|_| "BTCUSDT".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let binance_api_key = env::var("BINANCE_API_KEY").unwrap_or_default();
        let binance_api_secret = env::var("BINANCE_API_SECRET").unwrap_or_default();
        let binance_base_url = env::var("BINANCE_BASE_URL")
            .unwrap_or_else(|_| "https://fapi.binance.com".to_string());
        let simulate = env_parse::<bool>("SIMULATION_ENABLED", "true")?;

        let database_url = env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://data/tradeengine.db".to_string());

        let config_cache_ttl = Duration::from_secs(env_parse("CONFIG_CACHE_TTL_SECONDS", "60")?);

        let max_signal_age_seconds = env_parse("MAX_SIGNAL_AGE_SECONDS", "300")?;
        let conflict_policy = ConflictPolicy::from_str(
            &env::var("SIGNAL_CONFLICT_RESOLUTION")
                .unwrap_or_else(|_| "strongest_wins".to_string()),
        )?;
        let timeframe_policy = match env::var("TIMEFRAME_CONFLICT_RESOLUTION") {
            Ok(raw) if !raw.is_empty() => Some(ConflictPolicy::from_str(&raw)?),
            _ => None,
        };
        let deterministic_enabled = env_parse("DETERMINISTIC_MODE_ENABLED", "true")?;
        let ml_light_enabled = env_parse("ML_LIGHT_MODE_ENABLED", "true")?;
        let llm_reasoning_enabled = env_parse("LLM_REASONING_MODE_ENABLED", "true")?;
        let signal_retention_seconds = env_parse("SIGNAL_RETENTION_SECONDS", "3600")?;

        let signal_cache_ttl = Duration::from_secs(env_parse("SIGNAL_CACHE_TTL_SECONDS", "60")?);
        let signal_cache_cleanup_interval =
            Duration::from_secs(env_parse("SIGNAL_CACHE_CLEANUP_SECONDS", "30")?);
        let cooldown_secs: u64 = env_parse("ACCUMULATION_COOLDOWN_SECONDS", "60")?;
        let accumulation_cooldown = if cooldown_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(cooldown_secs))
        };
        let lock_ttl = Duration::from_secs(env_parse("EXECUTION_LOCK_TTL_SECONDS", "30")?);
        let venue_retry_attempts = env_parse("VENUE_RETRY_ATTEMPTS", "3")?;
        let venue_retry_base_delay =
            Duration::from_millis(env_parse("VENUE_RETRY_BASE_DELAY_MS", "250")?);

        let risk_enabled = env_parse("RISK_MANAGEMENT_ENABLED", "true")?;
        let max_position_size_pct = env_parse("MAX_POSITION_SIZE_PCT", "0.1")?;
        let max_daily_loss_pct = env_parse("MAX_DAILY_LOSS_PCT", "0.05")?;
        let max_portfolio_exposure_pct = env_parse("MAX_PORTFOLIO_EXPOSURE_PCT", "0.8")?;
        let portfolio_value = env_parse::<f64>("PORTFOLIO_VALUE_USD", "10000.0")?;
        let portfolio_value = Decimal::try_from(portfolio_value)
            .context("PORTFOLIO_VALUE_USD is not a valid decimal")?;

        let oco_poll_interval = Duration::from_millis(env_parse("OCO_POLL_INTERVAL_MS", "1000")?);
        let oco_error_backoff = Duration::from_millis(env_parse("OCO_ERROR_BACKOFF_MS", "5000")?);

        let price_monitoring_interval =
            Duration::from_millis(env_parse("PRICE_MONITORING_INTERVAL_MS", "1000")?);
        let conditional_order_timeout =
            Duration::from_secs(env_parse("CONDITIONAL_ORDER_TIMEOUT_SECONDS", "3600")?);

        Ok(Self {
            mode,
            symbols,
            binance_api_key,
            binance_api_secret,
            binance_base_url,
            simulate,
            database_url,
            config_cache_ttl,
            max_signal_age_seconds,
            conflict_policy,
            timeframe_policy,
            deterministic_enabled,
            ml_light_enabled,
            llm_reasoning_enabled,
            signal_retention_seconds,
            signal_cache_ttl,
            signal_cache_cleanup_interval,
            accumulation_cooldown,
            lock_ttl,
            venue_retry_attempts,
            venue_retry_base_delay,
            risk_enabled,
            max_position_size_pct,
            max_daily_loss_pct,
            max_portfolio_exposure_pct,
            portfolio_value,
            oco_poll_interval,
            oco_error_backoff,
            price_monitoring_interval,
            conditional_order_timeout,
        })
    }
}

impl Default for EngineConfig {
    /// Mock-mode defaults used by tests; mirrors `from_env` fallbacks.
    fn default() -> Self {
        Self {
            mode: Mode::Mock,
            symbols: vec!["BTCUSDT".to_string()],
            binance_api_key: String::new(),
            binance_api_secret: String::new(),
            binance_base_url: "https://fapi.binance.com".to_string(),
            simulate: true,
            database_url: "sqlite::memory:".to_string(),
            config_cache_ttl: Duration::from_secs(60),
            max_signal_age_seconds: 300,
            conflict_policy: ConflictPolicy::StrongestWins,
            timeframe_policy: None,
            deterministic_enabled: true,
            ml_light_enabled: true,
            llm_reasoning_enabled: true,
            signal_retention_seconds: 3600,
            signal_cache_ttl: Duration::from_secs(60),
            signal_cache_cleanup_interval: Duration::from_secs(30),
            accumulation_cooldown: Some(Duration::from_secs(60)),
            lock_ttl: Duration::from_secs(30),
            venue_retry_attempts: 3,
            venue_retry_base_delay: Duration::from_millis(250),
            risk_enabled: true,
            max_position_size_pct: 0.1,
            max_daily_loss_pct: 0.05,
            max_portfolio_exposure_pct: 0.8,
            portfolio_value: Decimal::from(10_000),
            oco_poll_interval: Duration::from_secs(1),
            oco_error_backoff: Duration::from_secs(5),
            price_monitoring_interval: Duration::from_secs(1),
            conditional_order_timeout: Duration::from_secs(3600),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parsing() {
        assert_eq!(Mode::from_str("mock").unwrap(), Mode::Mock);
        assert_eq!(Mode::from_str("LIVE").unwrap(), Mode::Live);
        assert!(Mode::from_str("paper").is_err());
    }

    #[test]
    fn test_default_config_is_mocked_and_safe() {
        let config = EngineConfig::default();
        assert_eq!(config.mode, Mode::Mock);
        assert!(config.simulate);
        assert!(config.risk_enabled);
        assert_eq!(config.accumulation_cooldown, Some(Duration::from_secs(60)));
    }
}
