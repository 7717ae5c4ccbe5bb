//! Multi-strategy signal aggregation and arbitration.
//!
//! Incoming signals are validated, age-checked, risk-gated and then
//! routed to one of three mode processors (deterministic rules, a
//! pluggable light model, or a reasoning oracle). Opposing signals on
//! the same symbol are arbitrated by the configured conflict policy.
//! Winning a conflict only removes the opposing *signals*; positions
//! already opened on the other side stay untouched, so LONG and SHORT
//! continue to coexist in hedge mode.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::application::guard::PositionGuard;
use crate::domain::order::{OrderType, TimeInForce};
use crate::domain::ports::{
    ConflictingSignalSummary, ModelFeatures, ReasoningContext, ReasoningOracle, SignalModel,
};
use crate::domain::signal::{Signal, SignalAction, StrategyMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    StrongestWins,
    FirstComeFirstServed,
    ManualReview,
    WeightedAverage,
    HigherTimeframeWins,
    TimeframeWeighted,
}

impl ConflictPolicy {
    pub fn label(&self) -> &'static str {
        match self {
            ConflictPolicy::StrongestWins => "strongest_wins",
            ConflictPolicy::FirstComeFirstServed => "first_come_first_served",
            ConflictPolicy::ManualReview => "manual_review",
            ConflictPolicy::WeightedAverage => "weighted_average",
            ConflictPolicy::HigherTimeframeWins => "higher_timeframe_wins",
            ConflictPolicy::TimeframeWeighted => "timeframe_weighted",
        }
    }

    pub fn is_timeframe_based(&self) -> bool {
        matches!(
            self,
            ConflictPolicy::HigherTimeframeWins | ConflictPolicy::TimeframeWeighted
        )
    }
}

impl FromStr for ConflictPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "strongest_wins" => Ok(ConflictPolicy::StrongestWins),
            "first_come_first_served" => Ok(ConflictPolicy::FirstComeFirstServed),
            "manual_review" => Ok(ConflictPolicy::ManualReview),
            "weighted_average" => Ok(ConflictPolicy::WeightedAverage),
            "higher_timeframe_wins" => Ok(ConflictPolicy::HigherTimeframeWins),
            "timeframe_weighted" => Ok(ConflictPolicy::TimeframeWeighted),
            _ => anyhow::bail!("Unknown conflict policy: {}", s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Executed,
    Rejected,
    PendingReview,
    Expired,
    Duplicate,
    Error,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verdict::Executed => "executed",
            Verdict::Rejected => "rejected",
            Verdict::PendingReview => "pending_review",
            Verdict::Expired => "expired",
            Verdict::Duplicate => "duplicate",
            Verdict::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// Order parameters produced by an approving processor. The action may
/// differ from the signal's own under weighted-average resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderParams {
    pub symbol: String,
    pub action: SignalAction,
    pub order_type: OrderType,
    pub time_in_force: TimeInForce,
    pub position_size_pct: Option<f64>,
    pub stop_loss_pct: Option<f64>,
    pub take_profit_pct: Option<f64>,
}

impl OrderParams {
    fn from_signal(signal: &Signal, size_scale: f64) -> Self {
        Self {
            symbol: signal.symbol.clone(),
            action: signal.action,
            order_type: signal.order_type,
            time_in_force: signal.time_in_force,
            position_size_pct: signal.position_size_pct.map(|pct| pct * size_scale),
            stop_loss_pct: signal.stop_loss_pct,
            take_profit_pct: signal.take_profit_pct,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationOutcome {
    pub status: Verdict,
    pub reason: Option<String>,
    pub order_params: Option<OrderParams>,
    pub confidence: Option<f64>,
}

impl AggregationOutcome {
    fn rejected(reason: impl Into<String>) -> Self {
        Self {
            status: Verdict::Rejected,
            reason: Some(reason.into()),
            order_params: None,
            confidence: None,
        }
    }

    fn executed(reason: impl Into<String>, params: OrderParams, confidence: f64) -> Self {
        Self {
            status: Verdict::Executed,
            reason: Some(reason.into()),
            order_params: Some(params),
            confidence: Some(confidence),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub max_signal_age_seconds: i64,
    pub conflict_policy: ConflictPolicy,
    /// When set to a timeframe-based policy, it takes precedence over
    /// `conflict_policy` for opposing-signal resolution.
    pub timeframe_policy: Option<ConflictPolicy>,
    pub deterministic_enabled: bool,
    pub ml_light_enabled: bool,
    pub llm_reasoning_enabled: bool,
    /// Active signals older than this are swept.
    pub signal_retention_seconds: i64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            max_signal_age_seconds: 300,
            conflict_policy: ConflictPolicy::StrongestWins,
            timeframe_policy: None,
            deterministic_enabled: true,
            ml_light_enabled: true,
            llm_reasoning_enabled: true,
            signal_retention_seconds: 3600,
        }
    }
}

struct Conflict {
    new_strength: f64,
    existing_strength: f64,
    new_timeframe_strength: f64,
    existing_timeframe_strength: f64,
    opposing: Vec<Signal>,
}

pub struct SignalAggregator {
    config: AggregatorConfig,
    guard: Arc<PositionGuard>,
    model: Arc<dyn SignalModel>,
    oracle: Arc<dyn ReasoningOracle>,
    active_signals: RwLock<HashMap<String, Signal>>,
    strategy_weights: RwLock<HashMap<String, f64>>,
    processed_count: RwLock<u64>,
}

impl SignalAggregator {
    pub fn new(
        config: AggregatorConfig,
        guard: Arc<PositionGuard>,
        model: Arc<dyn SignalModel>,
        oracle: Arc<dyn ReasoningOracle>,
    ) -> Self {
        Self {
            config,
            guard,
            model,
            oracle,
            active_signals: RwLock::new(HashMap::new()),
            strategy_weights: RwLock::new(HashMap::new()),
            processed_count: RwLock::new(0),
        }
    }

    /// Run the full pipeline for one signal and return the decision.
    pub async fn process_signal(&self, signal: &Signal) -> AggregationOutcome {
        info!(
            "Processing signal from {}: {} {} (mode: {})",
            signal.strategy_id, signal.action, signal.symbol, signal.strategy_mode
        );
        *self.processed_count.write().await += 1;

        if let Err(e) = signal.validate() {
            warn!("Signal validation failed: {}", e);
            return AggregationOutcome::rejected(e.to_string());
        }

        if signal.is_expired(self.config.max_signal_age_seconds) {
            return AggregationOutcome {
                status: Verdict::Expired,
                reason: Some("Signal too old".to_string()),
                order_params: None,
                confidence: None,
            };
        }

        if let Err(violation) = self.guard.check_signal(signal).await {
            return AggregationOutcome::rejected(violation.to_string());
        }

        let outcome = match signal.strategy_mode {
            StrategyMode::Deterministic => self.process_deterministic(signal).await,
            StrategyMode::MlLight => self.process_ml(signal).await,
            StrategyMode::LlmReasoning => self.process_llm(signal).await,
        };

        if outcome.status == Verdict::Executed {
            self.store_signal(signal).await;
        }
        outcome
    }

    async fn process_deterministic(&self, signal: &Signal) -> AggregationOutcome {
        if !self.config.deterministic_enabled {
            return AggregationOutcome::rejected("Deterministic mode disabled");
        }

        if let Some(conflict) = self.find_conflict(signal).await {
            return self.resolve_conflict(signal, conflict).await;
        }

        if signal.confidence < 0.6 {
            return AggregationOutcome::rejected("Confidence below threshold");
        }

        AggregationOutcome::executed(
            "Deterministic rules satisfied",
            OrderParams::from_signal(signal, signal.confidence),
            signal.confidence,
        )
    }

    async fn process_ml(&self, signal: &Signal) -> AggregationOutcome {
        if !self.config.ml_light_enabled {
            return AggregationOutcome::rejected("ML mode disabled");
        }

        let features = self.extract_features(signal).await;
        let prediction = match self.model.predict(&features).await {
            Ok(prediction) => prediction,
            Err(e) => {
                error!("Signal model unavailable: {}", e);
                return AggregationOutcome::rejected("ML model not available");
            }
        };

        if prediction.confidence < 0.5 {
            return AggregationOutcome::rejected("ML model confidence too low");
        }

        AggregationOutcome::executed(
            "ML model approved signal",
            OrderParams::from_signal(signal, prediction.confidence),
            prediction.confidence,
        )
    }

    async fn process_llm(&self, signal: &Signal) -> AggregationOutcome {
        if !self.config.llm_reasoning_enabled {
            return AggregationOutcome::rejected("LLM mode disabled");
        }

        let context = self.build_reasoning_context(signal).await;
        let verdict = match self.oracle.evaluate(&context).await {
            Ok(verdict) => verdict,
            Err(e) => {
                error!("Reasoning oracle unavailable: {}", e);
                return AggregationOutcome::rejected("LLM not available");
            }
        };

        if !verdict.approved {
            return AggregationOutcome::rejected(verdict.reasoning);
        }

        // The oracle is intentionally conservative on sizing.
        let size_scale = verdict.confidence.min(0.8);
        AggregationOutcome::executed(
            "LLM reasoning approved signal",
            OrderParams::from_signal(signal, size_scale),
            verdict.confidence,
        )
    }

    /// Opposing entry signals on the same symbol, if any.
    async fn find_conflict(&self, signal: &Signal) -> Option<Conflict> {
        let active = self.active_signals.read().await;
        let opposing: Vec<Signal> = active
            .values()
            .filter(|s| {
                s.symbol == signal.symbol && s.action != signal.action && s.action.is_entry()
            })
            .cloned()
            .collect();

        if opposing.is_empty() {
            return None;
        }

        let mut existing_strength = f64::MIN;
        let mut existing_timeframe_strength = f64::MIN;
        for s in &opposing {
            existing_strength = existing_strength.max(self.signal_strength(s).await);
            existing_timeframe_strength =
                existing_timeframe_strength.max(self.timeframe_strength(s).await);
        }

        Some(Conflict {
            new_strength: self.signal_strength(signal).await,
            existing_strength,
            new_timeframe_strength: self.timeframe_strength(signal).await,
            existing_timeframe_strength,
            opposing,
        })
    }

    /// `base = confidence · strategy_weight · strength_mult · mode_mult`
    async fn signal_strength(&self, signal: &Signal) -> f64 {
        let strategy_weight = self.strategy_weight(&signal.strategy_id).await;
        signal.confidence
            * strategy_weight
            * signal.strength.multiplier()
            * signal.strategy_mode.strength_multiplier()
    }

    async fn timeframe_strength(&self, signal: &Signal) -> f64 {
        let strategy_weight = self.strategy_weight(&signal.strategy_id).await;
        signal.confidence
            * signal.timeframe.weight()
            * strategy_weight
            * signal.strategy_mode.timeframe_multiplier()
    }

    async fn strategy_weight(&self, strategy_id: &str) -> f64 {
        self.strategy_weights
            .read()
            .await
            .get(strategy_id)
            .copied()
            .unwrap_or(1.0)
    }

    async fn resolve_conflict(&self, signal: &Signal, conflict: Conflict) -> AggregationOutcome {
        let policy = self
            .config
            .timeframe_policy
            .filter(|p| p.is_timeframe_based())
            .unwrap_or(self.config.conflict_policy);

        match policy {
            ConflictPolicy::StrongestWins => {
                if conflict.new_strength > conflict.existing_strength {
                    self.cancel_opposing_signals(&signal.symbol).await;
                    AggregationOutcome::executed(
                        "Stronger signal won conflict",
                        OrderParams::from_signal(signal, signal.confidence),
                        signal.confidence,
                    )
                } else {
                    AggregationOutcome::rejected(format!(
                        "conflict:{}: weaker signal lost",
                        policy.label()
                    ))
                }
            }
            ConflictPolicy::FirstComeFirstServed => AggregationOutcome::rejected(format!(
                "conflict:{}: existing signal holds",
                policy.label()
            )),
            ConflictPolicy::ManualReview => AggregationOutcome {
                status: Verdict::PendingReview,
                reason: Some("Signal conflict requires manual review".to_string()),
                order_params: None,
                confidence: None,
            },
            ConflictPolicy::WeightedAverage => self.weighted_average(signal, &conflict).await,
            ConflictPolicy::HigherTimeframeWins => {
                let existing_rank = conflict
                    .opposing
                    .iter()
                    .map(|s| s.timeframe.rank())
                    .max()
                    .unwrap_or(0);
                if signal.timeframe.rank() > existing_rank {
                    self.cancel_opposing_signals(&signal.symbol).await;
                    AggregationOutcome::executed(
                        format!(
                            "Higher timeframe signal won conflict ({} vs rank {})",
                            signal.timeframe, existing_rank
                        ),
                        OrderParams::from_signal(signal, signal.confidence),
                        signal.confidence,
                    )
                } else {
                    AggregationOutcome::rejected(format!(
                        "conflict:{}: lower timeframe ({} vs rank {})",
                        policy.label(),
                        signal.timeframe,
                        existing_rank
                    ))
                }
            }
            ConflictPolicy::TimeframeWeighted => {
                if conflict.new_timeframe_strength > conflict.existing_timeframe_strength {
                    self.cancel_opposing_signals(&signal.symbol).await;
                    AggregationOutcome::executed(
                        "Higher timeframe-weighted signal won conflict",
                        OrderParams::from_signal(signal, signal.confidence),
                        signal.confidence,
                    )
                } else {
                    AggregationOutcome::rejected(format!(
                        "conflict:{}: lower timeframe weight",
                        policy.label()
                    ))
                }
            }
        }
    }

    /// Combine all opposing signals plus the new one into one direction:
    /// `V = Σ(vᵢ·strengthᵢ) / Σ strengthᵢ`, buy above 0.3, sell below
    /// -0.3, hold otherwise.
    async fn weighted_average(&self, signal: &Signal, conflict: &Conflict) -> AggregationOutcome {
        let mut total_weight = 0.0;
        let mut weighted_direction = 0.0;

        for s in conflict.opposing.iter().chain(std::iter::once(signal)) {
            let weight = self.signal_strength(s).await;
            weighted_direction += s.action.direction_value() * weight;
            total_weight += weight;
        }

        if total_weight <= 0.0 {
            return AggregationOutcome::rejected(
                "Insufficient signal strength for weighted average",
            );
        }

        let v = weighted_direction / total_weight;
        let final_action = if v > 0.3 {
            SignalAction::Buy
        } else if v < -0.3 {
            SignalAction::Sell
        } else {
            SignalAction::Hold
        };

        let mut params = OrderParams::from_signal(signal, signal.confidence);
        params.action = final_action;
        AggregationOutcome::executed(
            format!("Weighted average conflict resolution (V={:.2})", v),
            params,
            signal.confidence,
        )
    }

    async fn extract_features(&self, signal: &Signal) -> ModelFeatures {
        use rust_decimal::prelude::ToPrimitive;

        let conflicting = self
            .find_conflict(signal)
            .await
            .map_or(0, |c| c.opposing.len());

        ModelFeatures {
            confidence: signal.confidence,
            strength_multiplier: signal.strength.multiplier(),
            direction: signal.action.direction_value(),
            current_price: signal.current_price.to_f64().unwrap_or(0.0),
            target_price: signal
                .target_price
                .and_then(|p| p.to_f64())
                .unwrap_or(0.0),
            stop_loss_pct: signal.stop_loss_pct.unwrap_or(0.0),
            take_profit_pct: signal.take_profit_pct.unwrap_or(0.0),
            position_size_pct: signal.position_size_pct.unwrap_or(0.0),
            conflicting_signals: conflicting,
            indicators: signal
                .indicators
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
        }
    }

    async fn build_reasoning_context(&self, signal: &Signal) -> ReasoningContext {
        use rust_decimal::prelude::ToPrimitive;

        let active = self.active_signals.read().await;
        let conflicting = active
            .values()
            .filter(|s| s.symbol == signal.symbol && s.action != signal.action)
            .map(|s| ConflictingSignalSummary {
                strategy_id: s.strategy_id.clone(),
                action: s.action.to_string(),
                confidence: s.confidence,
            })
            .collect();

        ReasoningContext {
            strategy_id: signal.strategy_id.clone(),
            symbol: signal.symbol.clone(),
            action: signal.action.to_string(),
            confidence: signal.confidence,
            current_price: signal.current_price.to_f64().unwrap_or(0.0),
            rationale: signal.rationale.clone(),
            active_signals: active.len(),
            conflicting_signals: conflicting,
        }
    }

    async fn store_signal(&self, signal: &Signal) {
        self.active_signals
            .write()
            .await
            .insert(signal.store_key(), signal.clone());
        self.cleanup_old_signals().await;
    }

    /// Sweep active signals past the retention window.
    pub async fn cleanup_old_signals(&self) {
        let cutoff = Utc::now() - Duration::seconds(self.config.signal_retention_seconds);
        self.active_signals
            .write()
            .await
            .retain(|_, signal| signal.timestamp >= cutoff);
    }

    async fn cancel_opposing_signals(&self, symbol: &str) {
        let mut active = self.active_signals.write().await;
        let before = active.len();
        active.retain(|_, signal| signal.symbol != symbol);
        info!(
            "Cancelled {} active signals for {} after conflict win",
            before - active.len(),
            symbol
        );
    }

    pub async fn set_strategy_weight(&self, strategy_id: &str, weight: f64) {
        self.strategy_weights
            .write()
            .await
            .insert(strategy_id.to_string(), weight);
    }

    pub async fn active_signal_count(&self) -> usize {
        self.active_signals.read().await.len()
    }

    /// Counts by mode plus totals, for the ops surface.
    pub async fn signal_summary(&self) -> SignalSummary {
        let active = self.active_signals.read().await;
        let mut by_mode: HashMap<String, usize> = HashMap::new();
        for signal in active.values() {
            *by_mode.entry(signal.strategy_mode.to_string()).or_default() += 1;
        }
        SignalSummary {
            active_signals: active.len(),
            total_processed: *self.processed_count.read().await,
            mode_distribution: by_mode,
        }
    }

    /// Seed an active signal directly (tests and replay tooling).
    pub async fn inject_active_signal(&self, signal: Signal) {
        self.active_signals
            .write()
            .await
            .insert(signal.store_key(), signal);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SignalSummary {
    pub active_signals: usize,
    pub total_processed: u64,
    pub mode_distribution: HashMap<String, usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::guard::RiskLimits;
    use crate::infrastructure::mock::{ThresholdOracle, ThresholdSignalModel};

    fn aggregator_with(config: AggregatorConfig) -> SignalAggregator {
        SignalAggregator::new(
            config,
            Arc::new(PositionGuard::new(RiskLimits::default())),
            Arc::new(ThresholdSignalModel::default()),
            Arc::new(ThresholdOracle::default()),
        )
    }

    fn aggregator() -> SignalAggregator {
        aggregator_with(AggregatorConfig::default())
    }

    fn signal(strategy: &str, action: &str, confidence: f64, timeframe: &str) -> Signal {
        serde_json::from_value(serde_json::json!({
            "strategy_id": strategy,
            "symbol": "BTCUSDT",
            "action": action,
            "confidence": confidence,
            "strength": "strong",
            "timeframe": timeframe,
            "strategy_mode": "deterministic",
            "current_price": "50000"
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_deterministic_approves_confident_signal() {
        let aggregator = aggregator();
        let outcome = aggregator
            .process_signal(&signal("momentum", "buy", 0.85, "1h"))
            .await;
        assert_eq!(outcome.status, Verdict::Executed);
        assert_eq!(aggregator.active_signal_count().await, 1);
        let params = outcome.order_params.unwrap();
        assert_eq!(params.action, SignalAction::Buy);
    }

    #[tokio::test]
    async fn test_deterministic_rejects_low_confidence() {
        let aggregator = aggregator();
        let outcome = aggregator
            .process_signal(&signal("momentum", "buy", 0.4, "1h"))
            .await;
        assert_eq!(outcome.status, Verdict::Rejected);
        assert_eq!(aggregator.active_signal_count().await, 0);
    }

    #[tokio::test]
    async fn test_invalid_confidence_rejected() {
        let aggregator = aggregator();
        let mut bad = signal("momentum", "buy", 0.8, "1h");
        bad.confidence = 1.5;
        let outcome = aggregator.process_signal(&bad).await;
        assert_eq!(outcome.status, Verdict::Rejected);
    }

    #[tokio::test]
    async fn test_expired_signal() {
        let aggregator = aggregator();
        let mut old = signal("momentum", "buy", 0.8, "1h");
        old.timestamp = Utc::now() - Duration::seconds(600);
        let outcome = aggregator.process_signal(&old).await;
        assert_eq!(outcome.status, Verdict::Expired);
    }

    #[tokio::test]
    async fn test_strongest_wins_prefers_stronger_signal() {
        let aggregator = aggregator();
        aggregator
            .process_signal(&signal("weak_strategy", "buy", 0.65, "1h"))
            .await;

        let outcome = aggregator
            .process_signal(&signal("strong_strategy", "sell", 0.95, "1h"))
            .await;
        assert_eq!(outcome.status, Verdict::Executed);
    }

    #[tokio::test]
    async fn test_strongest_wins_rejects_weaker_signal() {
        let aggregator = aggregator();
        aggregator
            .process_signal(&signal("strong_strategy", "buy", 0.95, "1h"))
            .await;

        let outcome = aggregator
            .process_signal(&signal("weak_strategy", "sell", 0.65, "1h"))
            .await;
        assert_eq!(outcome.status, Verdict::Rejected);
        assert!(outcome.reason.unwrap().contains("conflict:strongest_wins"));
    }

    #[tokio::test]
    async fn test_higher_timeframe_wins() {
        let aggregator = aggregator_with(AggregatorConfig {
            timeframe_policy: Some(ConflictPolicy::HigherTimeframeWins),
            ..Default::default()
        });

        aggregator
            .process_signal(&signal("hourly", "buy", 0.7, "1h"))
            .await;

        // Lower confidence but higher timeframe still wins
        let outcome = aggregator
            .process_signal(&signal("four_hourly", "sell", 0.65, "4h"))
            .await;
        assert_eq!(outcome.status, Verdict::Executed);
        assert!(outcome.reason.unwrap().contains("Higher timeframe"));

        // The opposing signal was cancelled; only the winner remains
        assert_eq!(aggregator.active_signal_count().await, 1);
    }

    #[tokio::test]
    async fn test_lower_timeframe_loses() {
        let aggregator = aggregator_with(AggregatorConfig {
            timeframe_policy: Some(ConflictPolicy::HigherTimeframeWins),
            ..Default::default()
        });

        aggregator
            .process_signal(&signal("four_hourly", "buy", 0.7, "4h"))
            .await;

        let outcome = aggregator
            .process_signal(&signal("minutely", "sell", 0.99, "1m"))
            .await;
        assert_eq!(outcome.status, Verdict::Rejected);
    }

    #[tokio::test]
    async fn test_manual_review_policy() {
        let aggregator = aggregator_with(AggregatorConfig {
            conflict_policy: ConflictPolicy::ManualReview,
            ..Default::default()
        });

        aggregator
            .process_signal(&signal("a", "buy", 0.8, "1h"))
            .await;
        let outcome = aggregator
            .process_signal(&signal("b", "sell", 0.9, "1h"))
            .await;
        assert_eq!(outcome.status, Verdict::PendingReview);
    }

    #[tokio::test]
    async fn test_weighted_average_produces_hold_on_balance() {
        let aggregator = aggregator_with(AggregatorConfig {
            conflict_policy: ConflictPolicy::WeightedAverage,
            ..Default::default()
        });

        aggregator
            .process_signal(&signal("a", "buy", 0.8, "1h"))
            .await;
        let outcome = aggregator
            .process_signal(&signal("b", "sell", 0.8, "1h"))
            .await;

        assert_eq!(outcome.status, Verdict::Executed);
        assert_eq!(
            outcome.order_params.unwrap().action,
            SignalAction::Hold
        );
    }

    #[tokio::test]
    async fn test_weighted_average_strong_majority_buys() {
        let aggregator = aggregator_with(AggregatorConfig {
            conflict_policy: ConflictPolicy::WeightedAverage,
            ..Default::default()
        });

        aggregator
            .process_signal(&signal("a", "buy", 0.95, "1h"))
            .await;
        aggregator.set_strategy_weight("a", 5.0).await;

        // Conflict resolution runs before the confidence gate
        let outcome = aggregator
            .process_signal(&signal("b", "sell", 0.3, "1h"))
            .await;
        assert_eq!(outcome.status, Verdict::Executed);
        assert_eq!(outcome.order_params.unwrap().action, SignalAction::Buy);
    }

    #[tokio::test]
    async fn test_ml_mode_uses_model_confidence() {
        let aggregator = aggregator();
        let mut s = signal("ml_strategy", "buy", 0.8, "1h");
        s.strategy_mode = StrategyMode::MlLight;
        s.position_size_pct = Some(0.1);

        let outcome = aggregator.process_signal(&s).await;
        assert_eq!(outcome.status, Verdict::Executed);
        let params = outcome.order_params.unwrap();
        assert!((params.position_size_pct.unwrap() - 0.08).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_ml_mode_rejects_low_model_confidence() {
        let aggregator = aggregator();
        let mut s = signal("ml_strategy", "buy", 0.4, "1h");
        s.strategy_mode = StrategyMode::MlLight;
        let outcome = aggregator.process_signal(&s).await;
        assert_eq!(outcome.status, Verdict::Rejected);
    }

    #[tokio::test]
    async fn test_llm_mode_damps_position_size() {
        let aggregator = aggregator();
        let mut s = signal("llm_strategy", "buy", 0.9, "1h");
        s.strategy_mode = StrategyMode::LlmReasoning;
        s.position_size_pct = Some(0.5);

        let outcome = aggregator.process_signal(&s).await;
        assert_eq!(outcome.status, Verdict::Executed);
        // min(0.9, 0.8) * 0.5
        let params = outcome.order_params.unwrap();
        assert!((params.position_size_pct.unwrap() - 0.4).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_llm_mode_rejects_below_bar() {
        let aggregator = aggregator();
        let mut s = signal("llm_strategy", "buy", 0.6, "1h");
        s.strategy_mode = StrategyMode::LlmReasoning;
        let outcome = aggregator.process_signal(&s).await;
        assert_eq!(outcome.status, Verdict::Rejected);
    }

    #[tokio::test]
    async fn test_disabled_mode_rejects() {
        let aggregator = aggregator_with(AggregatorConfig {
            llm_reasoning_enabled: false,
            ..Default::default()
        });
        let mut s = signal("llm_strategy", "buy", 0.9, "1h");
        s.strategy_mode = StrategyMode::LlmReasoning;
        let outcome = aggregator.process_signal(&s).await;
        assert_eq!(outcome.status, Verdict::Rejected);
        assert!(outcome.reason.unwrap().contains("disabled"));
    }

    #[tokio::test]
    async fn test_signal_sweep_drops_stale_entries() {
        let aggregator = aggregator_with(AggregatorConfig {
            signal_retention_seconds: 1,
            ..Default::default()
        });
        let mut stale = signal("old", "buy", 0.9, "1h");
        stale.timestamp = Utc::now() - Duration::seconds(120);
        aggregator.inject_active_signal(stale).await;
        assert_eq!(aggregator.active_signal_count().await, 1);

        aggregator.cleanup_old_signals().await;
        assert_eq!(aggregator.active_signal_count().await, 0);
    }

    #[tokio::test]
    async fn test_summary_counts_modes() {
        let aggregator = aggregator();
        aggregator
            .process_signal(&signal("a", "buy", 0.9, "1h"))
            .await;
        let summary = aggregator.signal_summary().await;
        assert_eq!(summary.active_signals, 1);
        assert_eq!(summary.total_processed, 1);
        assert_eq!(summary.mode_distribution["deterministic"], 1);
    }
}
