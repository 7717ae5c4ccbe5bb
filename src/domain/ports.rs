//! Port traits for external capabilities: the futures exchange, the
//! data-manager document store, the distributed lock service, and the
//! pluggable signal model / reasoning oracle used by the aggregator.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::Value;

use crate::domain::errors::VenueError;
use crate::domain::order::{ExecutionReport, OpenOrder, Order, SymbolInfo};

/// Futures exchange capability (hedge mode).
#[async_trait]
pub trait Exchange: Send + Sync {
    async fn execute(&self, order: &Order) -> Result<ExecutionReport, VenueError>;
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), VenueError>;
    async fn batch_cancel(&self, symbol: &str, order_ids: &[String])
    -> Vec<Result<(), VenueError>>;
    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, VenueError>;
    async fn get_symbol_price(&self, symbol: &str) -> Result<Decimal, VenueError>;
    async fn get_symbol_info(&self, symbol: &str) -> Result<SymbolInfo, VenueError>;
    async fn change_leverage(&self, symbol: &str, leverage: u32) -> Result<(), VenueError>;
    async fn set_position_mode(&self, hedge: bool) -> Result<(), VenueError>;
    async fn ping(&self) -> Result<(), VenueError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Document-oriented persistence capability. Filters are subset matches
/// on top-level fields.
#[async_trait]
pub trait DataManager: Send + Sync {
    async fn query(
        &self,
        collection: &str,
        filter: Value,
        sort: Option<(String, SortOrder)>,
        limit: Option<usize>,
    ) -> Result<Vec<Value>>;
    async fn insert_one(&self, collection: &str, document: Value) -> Result<()>;
    async fn update_one(&self, collection: &str, filter: Value, document: Value) -> Result<bool>;
    async fn upsert_one(&self, collection: &str, filter: Value, document: Value) -> Result<()>;
    async fn delete_one(&self, collection: &str, filter: Value) -> Result<bool>;
    async fn health(&self) -> Result<()>;
}

/// A held lease on a distributed lock.
#[derive(Debug, Clone)]
pub struct LockLease {
    pub key: String,
    pub lease_id: String,
}

/// Leader-gating lock service. `acquire` returning `None` means another
/// pod holds the lease; callers must short-circuit, not wait.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockLease>>;
    async fn release(&self, lease: LockLease) -> Result<()>;
}

/// Feature vector handed to the pluggable signal model.
#[derive(Debug, Clone)]
pub struct ModelFeatures {
    pub confidence: f64,
    pub strength_multiplier: f64,
    pub direction: f64,
    pub current_price: f64,
    pub target_price: f64,
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    pub position_size_pct: f64,
    pub conflicting_signals: usize,
    pub indicators: Vec<(String, f64)>,
}

#[derive(Debug, Clone)]
pub struct ModelPrediction {
    pub bullish: bool,
    pub confidence: f64,
}

/// Light ML model consumed by the ML-light processor.
#[async_trait]
pub trait SignalModel: Send + Sync {
    async fn predict(&self, features: &ModelFeatures) -> Result<ModelPrediction>;
}

/// Context assembled for the reasoning oracle.
#[derive(Debug, Clone)]
pub struct ReasoningContext {
    pub strategy_id: String,
    pub symbol: String,
    pub action: String,
    pub confidence: f64,
    pub current_price: f64,
    pub rationale: Option<String>,
    pub active_signals: usize,
    pub conflicting_signals: Vec<ConflictingSignalSummary>,
}

#[derive(Debug, Clone)]
pub struct ConflictingSignalSummary {
    pub strategy_id: String,
    pub action: String,
    pub confidence: f64,
}

#[derive(Debug, Clone)]
pub struct ReasoningVerdict {
    pub approved: bool,
    pub confidence: f64,
    pub reasoning: String,
}

/// LLM-style reasoning capability consumed by the LLM processor.
#[async_trait]
pub trait ReasoningOracle: Send + Sync {
    async fn evaluate(&self, context: &ReasoningContext) -> Result<ReasoningVerdict>;
}
