//! Prometheus metrics definitions for the trade engine.
//!
//! All metrics use the `tradeengine_` prefix. The registry is injected so
//! tests can build a fresh one per case.

use prometheus::{
    CounterVec, GaugeVec, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
    core::{AtomicF64, GenericGaugeVec},
};
use std::sync::Arc;

/// Business metrics for the trading pipeline
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,
    /// Signals received by strategy, symbol and action
    pub signals_received_total: CounterVec,
    /// Signals suppressed by fingerprint deduplication
    pub signals_duplicate_total: CounterVec,
    /// Executed orders by type, side, symbol and exchange
    pub orders_executed_by_type_total: CounterVec,
    /// Order failures by symbol, type, reason and exchange
    pub order_failures_total: CounterVec,
    /// Risk checks by check type and result
    pub risk_checks_total: CounterVec,
    /// Risk rejections by reason and symbol
    pub risk_rejections_total: CounterVec,
    /// End-to-end order execution latency
    pub order_execution_latency_seconds: Histogram,
    /// Current aggregated position size per symbol and side
    pub current_position_size: GenericGaugeVec<AtomicF64>,
    /// Unrealized P&L in USD
    pub unrealized_pnl_usd: GenericGaugeVec<AtomicF64>,
    /// Daily realized P&L in USD
    pub daily_pnl_usd: GenericGaugeVec<AtomicF64>,
}

impl Metrics {
    /// Register all metrics against the given registry.
    pub fn new(registry: Registry) -> anyhow::Result<Self> {
        let signals_received_total = CounterVec::new(
            Opts::new(
                "tradeengine_signals_received_total",
                "Total signals received",
            ),
            &["strategy", "symbol", "action"],
        )?;
        registry.register(Box::new(signals_received_total.clone()))?;

        let signals_duplicate_total = CounterVec::new(
            Opts::new(
                "tradeengine_signals_duplicate_total",
                "Total duplicate signals suppressed",
            ),
            &["strategy", "symbol", "action"],
        )?;
        registry.register(Box::new(signals_duplicate_total.clone()))?;

        let orders_executed_by_type_total = CounterVec::new(
            Opts::new(
                "tradeengine_orders_executed_by_type_total",
                "Total executed orders by type",
            ),
            &["order_type", "side", "symbol", "exchange"],
        )?;
        registry.register(Box::new(orders_executed_by_type_total.clone()))?;

        let order_failures_total = CounterVec::new(
            Opts::new(
                "tradeengine_order_failures_total",
                "Total order failures by reason",
            ),
            &["symbol", "order_type", "failure_reason", "exchange"],
        )?;
        registry.register(Box::new(order_failures_total.clone()))?;

        let risk_checks_total = CounterVec::new(
            Opts::new(
                "tradeengine_risk_checks_total",
                "Total pre-trade risk checks by result",
            ),
            &["check_type", "result", "exchange"],
        )?;
        registry.register(Box::new(risk_checks_total.clone()))?;

        let risk_rejections_total = CounterVec::new(
            Opts::new(
                "tradeengine_risk_rejections_total",
                "Total risk rejections by reason",
            ),
            &["reason", "symbol", "exchange"],
        )?;
        registry.register(Box::new(risk_rejections_total.clone()))?;

        let order_execution_latency_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "tradeengine_order_execution_latency_seconds",
                "Order execution latency in seconds",
            )
            .buckets(vec![
                0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ]),
        )?;
        registry.register(Box::new(order_execution_latency_seconds.clone()))?;

        let current_position_size = GaugeVec::new(
            Opts::new(
                "tradeengine_current_position_size",
                "Current aggregated position size",
            ),
            &["symbol", "position_side", "exchange"],
        )?;
        registry.register(Box::new(current_position_size.clone()))?;

        let unrealized_pnl_usd = GaugeVec::new(
            Opts::new("tradeengine_unrealized_pnl_usd", "Unrealized P&L in USD"),
            &["exchange"],
        )?;
        registry.register(Box::new(unrealized_pnl_usd.clone()))?;

        let daily_pnl_usd = GaugeVec::new(
            Opts::new("tradeengine_daily_pnl_usd", "Daily realized P&L in USD"),
            &["exchange"],
        )?;
        registry.register(Box::new(daily_pnl_usd.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            signals_received_total,
            signals_duplicate_total,
            orders_executed_by_type_total,
            order_failures_total,
            risk_checks_total,
            risk_rejections_total,
            order_execution_latency_seconds,
            current_position_size,
            unrealized_pnl_usd,
            daily_pnl_usd,
        })
    }

    /// Render all metrics in Prometheus text format
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder
            .encode_to_string(&metric_families)
            .unwrap_or_default()
    }

    pub fn inc_signal_received(&self, strategy: &str, symbol: &str, action: &str) {
        self.signals_received_total
            .with_label_values(&[strategy, symbol, action])
            .inc();
    }

    pub fn inc_signal_duplicate(&self, strategy: &str, symbol: &str, action: &str) {
        self.signals_duplicate_total
            .with_label_values(&[strategy, symbol, action])
            .inc();
    }

    pub fn inc_order_executed(&self, order_type: &str, side: &str, symbol: &str, exchange: &str) {
        self.orders_executed_by_type_total
            .with_label_values(&[order_type, side, symbol, exchange])
            .inc();
    }

    pub fn inc_order_failure(&self, symbol: &str, order_type: &str, reason: &str, exchange: &str) {
        self.order_failures_total
            .with_label_values(&[symbol, order_type, reason, exchange])
            .inc();
    }

    pub fn inc_risk_check(&self, check_type: &str, result: &str, exchange: &str) {
        self.risk_checks_total
            .with_label_values(&[check_type, result, exchange])
            .inc();
    }

    pub fn inc_risk_rejection(&self, reason: &str, symbol: &str, exchange: &str) {
        self.risk_rejections_total
            .with_label_values(&[reason, symbol, exchange])
            .inc();
    }

    pub fn set_position_size(&self, symbol: &str, position_side: &str, exchange: &str, size: f64) {
        self.current_position_size
            .with_label_values(&[symbol, position_side, exchange])
            .set(size);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new(Registry::new()).expect("Failed to create default Metrics")
    }
}
