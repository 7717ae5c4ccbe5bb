//! Runtime configuration resolver.
//!
//! Resolution merges built-in defaults, then the global layer, then the
//! symbol layer, then the symbol-side layer; later layers win. Resolved
//! views are cached per (symbol, side) with a TTL, and a background
//! sweeper evicts stale entries. Every mutation is versioned and leaves
//! an audit record.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::domain::errors::ConfigError;
use crate::domain::order::PositionSide;
use crate::domain::ports::{DataManager, SortOrder};
use crate::domain::trading_config::{
    AuditAction, ConfigScope, ParameterPatch, TradingConfig, TradingConfigAudit, TradingParameters,
};

const AUDIT_COLLECTION: &str = "trading_configs_audit";

pub struct ConfigResolver {
    data: Arc<dyn DataManager>,
    cache_ttl: Duration,
    cache: Arc<RwLock<HashMap<String, (TradingParameters, Instant)>>>,
    sweeper: RwLock<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl ConfigResolver {
    pub fn new(data: Arc<dyn DataManager>, cache_ttl: Duration) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            data,
            cache_ttl,
            cache: Arc::new(RwLock::new(HashMap::new())),
            sweeper: RwLock::new(None),
            shutdown_tx,
        }
    }

    /// Connect persistence and start the cache sweeper.
    pub async fn start(&self) -> Result<()> {
        self.data
            .health()
            .await
            .context("Config store unreachable at startup")?;

        let cache = self.cache.clone();
        let ttl = self.cache_ttl;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(ttl);
            tick.tick().await; // first tick fires immediately
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let mut cache = cache.write().await;
                        let before = cache.len();
                        cache.retain(|_, (_, inserted_at)| inserted_at.elapsed() < ttl);
                        let evicted = before - cache.len();
                        if evicted > 0 {
                            debug!("Config cache sweeper evicted {} entries", evicted);
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        *self.sweeper.write().await = Some(handle);
        info!("Config resolver started (cache TTL {:?})", self.cache_ttl);
        Ok(())
    }

    /// Cancel the sweeper. Idempotent.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.sweeper.write().await.take() {
            if let Err(e) = handle.await {
                error!("Config sweeper task failed on shutdown: {}", e);
            }
        }
        info!("Config resolver stopped");
    }

    fn cache_key(symbol: Option<&str>, side: Option<PositionSide>) -> String {
        format!(
            "{}:{}",
            symbol.unwrap_or("global"),
            side.map_or_else(|| "all".to_string(), |s| s.to_string())
        )
    }

    async fn load_layer(&self, scope: &ConfigScope) -> Result<Option<TradingConfig>> {
        let filter = match scope {
            ConfigScope::Global => json!({"scope": "global"}),
            ConfigScope::Symbol { symbol } => json!({"scope": "symbol", "symbol": symbol}),
            ConfigScope::SymbolSide { symbol, side } => {
                json!({"scope": "symbol_side", "symbol": symbol, "side": side.to_string()})
            }
        };

        let docs = self
            .data
            .query(
                scope.collection(),
                filter,
                Some(("version".to_string(), SortOrder::Descending)),
                Some(1),
            )
            .await?;

        match docs.into_iter().next() {
            Some(doc) => Ok(Some(serde_json::from_value(doc)?)),
            None => Ok(None),
        }
    }

    /// Resolved view: defaults ⊕ global ⊕ symbol ⊕ symbol-side.
    pub async fn get_config(
        &self,
        symbol: Option<&str>,
        side: Option<PositionSide>,
    ) -> TradingParameters {
        let cache_key = Self::cache_key(symbol, side);
        if let Some((params, inserted_at)) = self.cache.read().await.get(&cache_key)
            && inserted_at.elapsed() < self.cache_ttl
        {
            debug!("Config cache hit: {}", cache_key);
            return params.clone();
        }

        let mut resolved = TradingParameters::default();

        let mut layers = vec![ConfigScope::Global];
        if let Some(symbol) = symbol {
            layers.push(ConfigScope::Symbol {
                symbol: symbol.to_string(),
            });
            if let Some(side) = side {
                layers.push(ConfigScope::SymbolSide {
                    symbol: symbol.to_string(),
                    side,
                });
            }
        }

        for scope in &layers {
            match self.load_layer(scope).await {
                Ok(Some(config)) => {
                    resolved.apply(&config.parameters);
                    debug!("Applied {} config layer", scope);
                }
                Ok(None) => {}
                Err(e) => {
                    // Fall through to whatever has resolved so far.
                    error!("Error loading {} config layer: {}", scope, e);
                }
            }
        }

        self.cache
            .write()
            .await
            .insert(cache_key, (resolved.clone(), Instant::now()));

        resolved
    }

    /// Validate and persist one layer; bumps the version and audits.
    /// With `validate_only` set, reports validation outcome and stops.
    pub async fn set_config(
        &self,
        parameters: ParameterPatch,
        changed_by: &str,
        symbol: Option<&str>,
        side: Option<PositionSide>,
        reason: Option<&str>,
        validate_only: bool,
    ) -> (bool, Option<TradingConfig>, Vec<String>) {
        let errors: Vec<String> = parameters
            .validate()
            .iter()
            .map(|e| e.to_string())
            .collect();
        if !errors.is_empty() {
            return (false, None, errors);
        }
        if validate_only {
            return (true, None, Vec::new());
        }

        let scope = ConfigScope::new(symbol, side);

        let existing = match self.load_layer(&scope).await {
            Ok(existing) => existing,
            Err(e) => return (false, None, vec![e.to_string()]),
        };

        let now = Utc::now();
        let version = existing.as_ref().map_or(1, |c| c.version + 1);
        let new_config = TradingConfig {
            scope: scope.clone(),
            parameters: parameters.clone(),
            version,
            created_at: existing.as_ref().map_or(now, |c| c.created_at),
            updated_at: now,
            created_by: changed_by.to_string(),
        };

        let filter = match &scope {
            ConfigScope::Global => json!({"scope": "global"}),
            ConfigScope::Symbol { symbol } => json!({"scope": "symbol", "symbol": symbol}),
            ConfigScope::SymbolSide { symbol, side } => {
                json!({"scope": "symbol_side", "symbol": symbol, "side": side.to_string()})
            }
        };
        let document = match serde_json::to_value(&new_config) {
            Ok(doc) => doc,
            Err(e) => return (false, None, vec![e.to_string()]),
        };
        if let Err(e) = self
            .data
            .upsert_one(scope.collection(), filter, document)
            .await
        {
            return (
                false,
                None,
                vec![ConfigError::PersistenceFailed(e.to_string()).to_string()],
            );
        }

        let audit = TradingConfigAudit {
            audit_id: Uuid::new_v4().to_string(),
            scope: scope.clone(),
            action: if existing.is_some() {
                AuditAction::Update
            } else {
                AuditAction::Create
            },
            parameters_before: existing.as_ref().map(|c| c.parameters.clone()),
            parameters_after: Some(parameters),
            version_before: existing.as_ref().map(|c| c.version),
            version_after: Some(version),
            changed_by: changed_by.to_string(),
            reason: reason.map(str::to_string),
            timestamp: now,
        };
        self.write_audit(&audit).await;

        self.invalidate_cache(symbol, side).await;

        info!("Config updated: {}", audit.change_summary());
        (true, Some(new_config), Vec::new())
    }

    /// Delete one layer and audit the removal.
    pub async fn delete_config(
        &self,
        changed_by: &str,
        symbol: Option<&str>,
        side: Option<PositionSide>,
        reason: Option<&str>,
    ) -> (bool, Vec<String>) {
        let scope = ConfigScope::new(symbol, side);

        let existing = match self.load_layer(&scope).await {
            Ok(existing) => existing,
            Err(e) => return (false, vec![e.to_string()]),
        };

        let filter = match &scope {
            ConfigScope::Global => json!({"scope": "global"}),
            ConfigScope::Symbol { symbol } => json!({"scope": "symbol", "symbol": symbol}),
            ConfigScope::SymbolSide { symbol, side } => {
                json!({"scope": "symbol_side", "symbol": symbol, "side": side.to_string()})
            }
        };
        match self.data.delete_one(scope.collection(), filter).await {
            Ok(true) => {}
            Ok(false) => return (false, vec!["Configuration not found".to_string()]),
            Err(e) => return (false, vec![e.to_string()]),
        }

        if let Some(existing) = existing {
            let audit = TradingConfigAudit {
                audit_id: Uuid::new_v4().to_string(),
                scope: scope.clone(),
                action: AuditAction::Delete,
                parameters_before: Some(existing.parameters.clone()),
                parameters_after: None,
                version_before: Some(existing.version),
                version_after: None,
                changed_by: changed_by.to_string(),
                reason: reason.map(str::to_string),
                timestamp: Utc::now(),
            };
            self.write_audit(&audit).await;
            info!("Config deleted: {}", audit.change_summary());
        }

        self.invalidate_cache(symbol, side).await;
        (true, Vec::new())
    }

    async fn write_audit(&self, audit: &TradingConfigAudit) {
        match serde_json::to_value(audit) {
            Ok(doc) => {
                if let Err(e) = self.data.insert_one(AUDIT_COLLECTION, doc).await {
                    error!("Failed to write config audit record: {}", e);
                }
            }
            Err(e) => error!("Failed to serialize config audit record: {}", e),
        }
    }

    pub async fn invalidate_cache(&self, symbol: Option<&str>, side: Option<PositionSide>) {
        let cache_key = Self::cache_key(symbol, side);
        if self.cache.write().await.remove(&cache_key).is_some() {
            debug!("Config cache invalidated: {}", cache_key);
        }
    }

    pub async fn audit_trail(&self, limit: usize) -> Result<Vec<TradingConfigAudit>> {
        let docs = self
            .data
            .query(
                AUDIT_COLLECTION,
                json!({}),
                Some(("timestamp".to_string(), SortOrder::Descending)),
                Some(limit),
            )
            .await?;
        docs.into_iter()
            .map(|doc| serde_json::from_value(doc).context("Corrupt audit record"))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::mock::InMemoryDataManager;

    fn resolver() -> ConfigResolver {
        ConfigResolver::new(
            Arc::new(InMemoryDataManager::new()),
            Duration::from_secs(60),
        )
    }

    fn patch(leverage: Option<u32>, stop_loss_pct: Option<f64>) -> ParameterPatch {
        ParameterPatch {
            leverage,
            stop_loss_pct,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_defaults_when_store_empty() {
        let resolver = resolver();
        let params = resolver.get_config(Some("BTCUSDT"), None).await;
        assert_eq!(params, TradingParameters::default());
    }

    #[tokio::test]
    async fn test_hierarchy_override_order() {
        let resolver = resolver();

        resolver
            .set_config(patch(Some(10), None), "admin", None, None, None, false)
            .await;
        resolver
            .set_config(
                patch(Some(15), None),
                "admin",
                Some("BTCUSDT"),
                None,
                None,
                false,
            )
            .await;
        resolver
            .set_config(
                patch(None, Some(0.015)),
                "admin",
                Some("BTCUSDT"),
                Some(PositionSide::Long),
                None,
                false,
            )
            .await;

        let resolved = resolver
            .get_config(Some("BTCUSDT"), Some(PositionSide::Long))
            .await;
        assert_eq!(resolved.leverage, 15);
        assert_eq!(resolved.stop_loss_pct, 0.015);
        // default retained for keys no layer touches
        assert_eq!(resolved.take_profit_pct, 0.05);

        // Symbol-level resolution ignores the side layer
        let symbol_only = resolver.get_config(Some("BTCUSDT"), None).await;
        assert_eq!(symbol_only.stop_loss_pct, 0.02);
    }

    #[tokio::test]
    async fn test_version_increments_on_update() {
        let resolver = resolver();
        let (ok, config, _) = resolver
            .set_config(patch(Some(5), None), "admin", None, None, None, false)
            .await;
        assert!(ok);
        assert_eq!(config.unwrap().version, 1);

        let (ok, config, _) = resolver
            .set_config(patch(Some(7), None), "admin", None, None, None, false)
            .await;
        assert!(ok);
        assert_eq!(config.unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_validation_rejects_without_persisting() {
        let resolver = resolver();
        let (ok, config, errors) = resolver
            .set_config(patch(Some(500), None), "admin", None, None, None, false)
            .await;
        assert!(!ok);
        assert!(config.is_none());
        assert!(!errors.is_empty());

        let resolved = resolver.get_config(None, None).await;
        assert_eq!(resolved.leverage, TradingParameters::default().leverage);
    }

    #[tokio::test]
    async fn test_validate_only_does_not_persist() {
        let resolver = resolver();
        let (ok, config, errors) = resolver
            .set_config(patch(Some(20), None), "admin", None, None, None, true)
            .await;
        assert!(ok);
        assert!(config.is_none());
        assert!(errors.is_empty());

        let resolved = resolver.get_config(None, None).await;
        assert_eq!(resolved.leverage, TradingParameters::default().leverage);
    }

    #[tokio::test]
    async fn test_set_invalidates_cache() {
        let resolver = resolver();

        // Prime the cache with defaults
        let before = resolver.get_config(Some("BTCUSDT"), None).await;
        assert_eq!(before.leverage, 5);

        resolver
            .set_config(
                patch(Some(25), None),
                "admin",
                Some("BTCUSDT"),
                None,
                None,
                false,
            )
            .await;

        let after = resolver.get_config(Some("BTCUSDT"), None).await;
        assert_eq!(after.leverage, 25);
    }

    #[tokio::test]
    async fn test_delete_config_and_audit_trail() {
        let resolver = resolver();
        resolver
            .set_config(
                patch(Some(12), None),
                "admin",
                Some("ETHUSDT"),
                None,
                Some("initial"),
                false,
            )
            .await;
        let (ok, errors) = resolver
            .delete_config("admin", Some("ETHUSDT"), None, Some("cleanup"))
            .await;
        assert!(ok, "{:?}", errors);

        let resolved = resolver.get_config(Some("ETHUSDT"), None).await;
        assert_eq!(resolved.leverage, 5);

        let trail = resolver.audit_trail(10).await.unwrap();
        assert_eq!(trail.len(), 2);
        assert!(trail.iter().any(|a| a.action == AuditAction::Delete));
    }

    #[tokio::test]
    async fn test_sweeper_start_stop() {
        let resolver = ConfigResolver::new(
            Arc::new(InMemoryDataManager::new()),
            Duration::from_millis(20),
        );
        resolver.start().await.unwrap();
        resolver.get_config(Some("BTCUSDT"), None).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        resolver.stop().await;
    }
}
