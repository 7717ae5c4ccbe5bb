//! Distributed lock implementations.
//!
//! `LeaseLock` persists leases through the data manager so that only one
//! pod at a time executes orders for a given (symbol, side). Expired
//! leases are stolen rather than waited on. `PassthroughLock` is the
//! always-leader substitute used in tests and single-pod deployments.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use crate::domain::ports::{DataManager, DistributedLock, LockLease};

const LOCK_COLLECTION: &str = "distributed_locks";

/// Always grants the lock. For tests and single-pod runs.
#[derive(Debug, Default)]
pub struct PassthroughLock;

#[async_trait]
impl DistributedLock for PassthroughLock {
    async fn acquire(&self, key: &str, _ttl: Duration) -> Result<Option<LockLease>> {
        Ok(Some(LockLease {
            key: key.to_string(),
            lease_id: Uuid::new_v4().to_string(),
        }))
    }

    async fn release(&self, _lease: LockLease) -> Result<()> {
        Ok(())
    }
}

/// Lease-based lock backed by the data-manager store.
pub struct LeaseLock {
    data: std::sync::Arc<dyn DataManager>,
    owner_id: String,
}

impl LeaseLock {
    pub fn new(data: std::sync::Arc<dyn DataManager>) -> Self {
        Self {
            data,
            owner_id: Uuid::new_v4().to_string(),
        }
    }
}

#[async_trait]
impl DistributedLock for LeaseLock {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockLease>> {
        let now = Utc::now();

        let existing = self
            .data
            .query(LOCK_COLLECTION, json!({"key": key}), None, Some(1))
            .await?;

        if let Some(doc) = existing.first() {
            let held_by_other = doc["owner_id"].as_str() != Some(self.owner_id.as_str());
            let expires_at = doc["expires_at"]
                .as_str()
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok());
            let still_valid = expires_at.is_some_and(|t| t > now);

            if held_by_other && still_valid {
                debug!("Lock {} held by another pod, short-circuiting", key);
                return Ok(None);
            }
        }

        let lease_id = Uuid::new_v4().to_string();
        let expires_at = now + chrono::Duration::from_std(ttl)?;
        self.data
            .upsert_one(
                LOCK_COLLECTION,
                json!({"key": key}),
                json!({
                    "key": key,
                    "owner_id": self.owner_id,
                    "lease_id": lease_id,
                    "expires_at": expires_at.to_rfc3339(),
                }),
            )
            .await?;

        Ok(Some(LockLease {
            key: key.to_string(),
            lease_id,
        }))
    }

    async fn release(&self, lease: LockLease) -> Result<()> {
        self.data
            .delete_one(
                LOCK_COLLECTION,
                json!({"key": lease.key, "lease_id": lease.lease_id}),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::mock::InMemoryDataManager;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_passthrough_always_grants() {
        let lock = PassthroughLock;
        let lease = lock
            .acquire("BTCUSDT:LONG", Duration::from_secs(10))
            .await
            .unwrap();
        assert!(lease.is_some());
        lock.release(lease.unwrap()).await.unwrap();
    }

    #[tokio::test]
    async fn test_lease_lock_blocks_second_owner() {
        let data: Arc<dyn DataManager> = Arc::new(InMemoryDataManager::new());
        let pod_a = LeaseLock::new(data.clone());
        let pod_b = LeaseLock::new(data.clone());

        let lease = pod_a
            .acquire("BTCUSDT:LONG", Duration::from_secs(30))
            .await
            .unwrap();
        assert!(lease.is_some());

        let contested = pod_b
            .acquire("BTCUSDT:LONG", Duration::from_secs(30))
            .await
            .unwrap();
        assert!(contested.is_none());

        pod_a.release(lease.unwrap()).await.unwrap();
        let after_release = pod_b
            .acquire("BTCUSDT:LONG", Duration::from_secs(30))
            .await
            .unwrap();
        assert!(after_release.is_some());
    }

    #[tokio::test]
    async fn test_expired_lease_is_stolen() {
        let data: Arc<dyn DataManager> = Arc::new(InMemoryDataManager::new());
        let pod_a = LeaseLock::new(data.clone());
        let pod_b = LeaseLock::new(data.clone());

        let lease = pod_a
            .acquire("ETHUSDT:SHORT", Duration::from_secs(0))
            .await
            .unwrap();
        assert!(lease.is_some());

        // TTL of zero expires immediately; the second pod may take over.
        let stolen = pod_b
            .acquire("ETHUSDT:SHORT", Duration::from_secs(30))
            .await
            .unwrap();
        assert!(stolen.is_some());
    }
}
