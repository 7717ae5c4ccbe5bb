//! Leverage reconciliation between configured and venue state.
//!
//! Best-effort: the venue refuses leverage changes while a position is
//! open (code -4028); that outcome is logged, recorded in the status
//! ledger and the trade proceeds on the existing leverage.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::domain::ports::{DataManager, Exchange};
use crate::domain::trading_config::LeverageStatus;

const STATUS_COLLECTION: &str = "leverage_status";

pub struct LeverageManager {
    exchange: Arc<dyn Exchange>,
    data: Arc<dyn DataManager>,
    cache: RwLock<HashMap<String, LeverageStatus>>,
}

#[derive(Debug, Clone, Default)]
pub struct LeverageSyncSummary {
    pub total: usize,
    pub synced: usize,
    pub failed: usize,
}

impl LeverageManager {
    pub fn new(exchange: Arc<dyn Exchange>, data: Arc<dyn DataManager>) -> Self {
        Self {
            exchange,
            data,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Ensure the symbol trades at `target` leverage before an order.
    ///
    /// Returns `true` when the venue confirms the target. A `false`
    /// return is non-fatal: the status ledger records the failure and
    /// execution continues with whatever leverage is set.
    pub async fn ensure_leverage(&self, symbol: &str, target: u32) -> bool {
        if let Some(status) = self.get_leverage_status(symbol).await
            && status.actual_leverage == Some(target)
        {
            debug!("Leverage already correct for {}: {}x", symbol, target);
            return true;
        }

        match self.exchange.change_leverage(symbol, target).await {
            Ok(()) => {
                self.update_status(symbol, target, Some(target), true, None)
                    .await;
                info!("Leverage set for {}: {}x", symbol, target);
                true
            }
            Err(e) => {
                if e.is_leverage_unchanged() {
                    warn!(
                        "Cannot change leverage for {} (open position exists). \
                         Using existing leverage. Target: {}x",
                        symbol, target
                    );
                } else {
                    warn!("Failed to set leverage for {}: {}", symbol, e);
                }

                let previous_actual = self
                    .get_leverage_status(symbol)
                    .await
                    .and_then(|s| s.actual_leverage);
                self.update_status(symbol, target, previous_actual, false, Some(e.to_string()))
                    .await;
                false
            }
        }
    }

    /// Manual override; unlike `ensure_leverage` the failure surfaces.
    pub async fn force_leverage(&self, symbol: &str, target: u32) -> Result<LeverageStatus> {
        self.exchange.change_leverage(symbol, target).await?;
        self.update_status(symbol, target, Some(target), true, None)
            .await;
        info!("Leverage force-set for {}: {}x", symbol, target);

        Ok(self
            .get_leverage_status(symbol)
            .await
            .expect("status exists after update"))
    }

    /// Replay every persisted status at startup.
    pub async fn sync_all_leverage(&self) -> Result<LeverageSyncSummary> {
        let docs = self
            .data
            .query(STATUS_COLLECTION, json!({}), None, None)
            .await?;

        let mut summary = LeverageSyncSummary {
            total: docs.len(),
            ..Default::default()
        };

        for doc in docs {
            let status: LeverageStatus = match serde_json::from_value(doc) {
                Ok(status) => status,
                Err(e) => {
                    error!("Corrupt leverage status record skipped: {}", e);
                    continue;
                }
            };
            if self
                .ensure_leverage(&status.symbol, status.configured_leverage)
                .await
            {
                summary.synced += 1;
            } else {
                summary.failed += 1;
            }
        }

        info!(
            "Leverage sync complete: {} synced, {} failed",
            summary.synced, summary.failed
        );
        Ok(summary)
    }

    pub async fn get_leverage_status(&self, symbol: &str) -> Option<LeverageStatus> {
        if let Some(status) = self.cache.read().await.get(symbol) {
            return Some(status.clone());
        }

        let docs = self
            .data
            .query(STATUS_COLLECTION, json!({"symbol": symbol}), None, Some(1))
            .await
            .ok()?;
        let status: LeverageStatus = serde_json::from_value(docs.into_iter().next()?).ok()?;
        self.cache
            .write()
            .await
            .insert(symbol.to_string(), status.clone());
        Some(status)
    }

    async fn update_status(
        &self,
        symbol: &str,
        configured: u32,
        actual: Option<u32>,
        success: bool,
        error_message: Option<String>,
    ) {
        let status = LeverageStatus {
            symbol: symbol.to_string(),
            configured_leverage: configured,
            actual_leverage: actual,
            last_sync_at: Some(Utc::now()),
            last_sync_success: success,
            last_sync_error: error_message,
            updated_at: Utc::now(),
        };

        self.cache
            .write()
            .await
            .insert(symbol.to_string(), status.clone());

        match serde_json::to_value(&status) {
            Ok(doc) => {
                if let Err(e) = self
                    .data
                    .upsert_one(STATUS_COLLECTION, json!({"symbol": symbol}), doc)
                    .await
                {
                    error!("Failed to persist leverage status for {}: {}", symbol, e);
                }
            }
            Err(e) => error!("Failed to serialize leverage status: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::VENUE_CODE_LEVERAGE_UNCHANGED;
    use crate::infrastructure::mock::{FakeExchange, InMemoryDataManager};

    fn setup() -> (Arc<FakeExchange>, LeverageManager) {
        let fake = Arc::new(FakeExchange::new());
        let manager = LeverageManager::new(fake.clone(), Arc::new(InMemoryDataManager::new()));
        (fake, manager)
    }

    #[tokio::test]
    async fn test_ensure_leverage_success_updates_status() {
        let (fake, manager) = setup();

        assert!(manager.ensure_leverage("BTCUSDT", 10).await);
        assert_eq!(fake.leverage_calls().await, vec![("BTCUSDT".to_string(), 10)]);

        let status = manager.get_leverage_status("BTCUSDT").await.unwrap();
        assert!(status.last_sync_success);
        assert!(status.is_synced());
    }

    #[tokio::test]
    async fn test_ensure_leverage_skips_when_already_synced() {
        let (fake, manager) = setup();
        assert!(manager.ensure_leverage("BTCUSDT", 10).await);
        assert!(manager.ensure_leverage("BTCUSDT", 10).await);
        // Second call short-circuits on the cached status
        assert_eq!(fake.leverage_calls().await.len(), 1);
    }

    #[tokio::test]
    async fn test_open_position_rejection_is_tolerated() {
        let (fake, manager) = setup();
        fake.set_leverage_error(VENUE_CODE_LEVERAGE_UNCHANGED, "Leverage not changed")
            .await;

        assert!(!manager.ensure_leverage("BTCUSDT", 20).await);

        let status = manager.get_leverage_status("BTCUSDT").await.unwrap();
        assert!(!status.last_sync_success);
        assert!(status.last_sync_error.as_deref().unwrap().contains("-4028"));
        assert_eq!(status.configured_leverage, 20);
        assert_eq!(status.actual_leverage, None);
    }

    #[tokio::test]
    async fn test_force_leverage_propagates_error() {
        let (fake, manager) = setup();
        fake.set_leverage_error(-2015, "Invalid API key").await;
        assert!(manager.force_leverage("BTCUSDT", 10).await.is_err());
    }

    #[tokio::test]
    async fn test_sync_all_replays_persisted_statuses() {
        let data = Arc::new(InMemoryDataManager::new());
        let fake = Arc::new(FakeExchange::new());

        for (symbol, leverage) in [("BTCUSDT", 10u32), ("ETHUSDT", 5u32)] {
            let status = LeverageStatus {
                symbol: symbol.to_string(),
                configured_leverage: leverage,
                actual_leverage: None,
                last_sync_at: None,
                last_sync_success: false,
                last_sync_error: None,
                updated_at: Utc::now(),
            };
            data.insert_one(STATUS_COLLECTION, serde_json::to_value(&status).unwrap())
                .await
                .unwrap();
        }

        let manager = LeverageManager::new(fake.clone(), data);
        let summary = manager.sync_all_leverage().await.unwrap();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.synced, 2);
        assert_eq!(summary.failed, 0);
        assert_eq!(fake.leverage_calls().await.len(), 2);
    }
}
