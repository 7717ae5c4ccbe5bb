//! Sqlite-backed document store implementing the data-manager port.
//!
//! Documents are JSON blobs in a single table keyed by collection.
//! Filters are subset matches evaluated in-process after narrowing by
//! collection; the persisted-state working set (configs, positions,
//! leverage status) is small enough that this stays cheap.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tokio::fs;
use tracing::info;

use crate::domain::ports::{DataManager, SortOrder};

#[derive(Clone)]
pub struct SqliteDocumentStore {
    pool: SqlitePool,
}

impl SqliteDocumentStore {
    pub async fn new(db_url: &str) -> Result<Self> {
        // Ensure the directory exists if it's a file path
        if let Some(path_part) = db_url.strip_prefix("sqlite://") {
            let path = Path::new(path_part);
            if let Some(parent) = path.parent()
                && !parent.exists()
            {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create database directory")?;
            }
        }

        let options = SqliteConnectOptions::from_str(db_url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        info!("Connected to document store: {}", db_url);

        let store = Self { pool };
        store.init().await?;

        Ok(store)
    }

    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                collection TEXT NOT NULL,
                doc TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_documents_collection ON documents (collection)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn load_collection(&self, collection: &str) -> Result<Vec<(i64, Value)>> {
        let rows = sqlx::query("SELECT id, doc FROM documents WHERE collection = ?")
            .bind(collection)
            .fetch_all(&self.pool)
            .await?;

        let mut documents = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.get(0);
            let raw: String = row.get(1);
            let doc: Value =
                serde_json::from_str(&raw).context("Corrupt document in store")?;
            documents.push((id, doc));
        }
        Ok(documents)
    }
}

fn matches_filter(document: &Value, filter: &Value) -> bool {
    match filter.as_object() {
        Some(fields) => fields.iter().all(|(key, expected)| &document[key] == expected),
        None => true,
    }
}

#[async_trait]
impl DataManager for SqliteDocumentStore {
    async fn query(
        &self,
        collection: &str,
        filter: Value,
        sort: Option<(String, SortOrder)>,
        limit: Option<usize>,
    ) -> Result<Vec<Value>> {
        let mut results: Vec<Value> = self
            .load_collection(collection)
            .await?
            .into_iter()
            .filter(|(_, doc)| matches_filter(doc, &filter))
            .map(|(_, doc)| doc)
            .collect();

        if let Some((field, order)) = sort {
            results.sort_by(|a, b| {
                let left = a[&field].to_string();
                let right = b[&field].to_string();
                match order {
                    SortOrder::Ascending => left.cmp(&right),
                    SortOrder::Descending => right.cmp(&left),
                }
            });
        }

        if let Some(limit) = limit {
            results.truncate(limit);
        }

        Ok(results)
    }

    async fn insert_one(&self, collection: &str, document: Value) -> Result<()> {
        sqlx::query("INSERT INTO documents (collection, doc) VALUES (?, ?)")
            .bind(collection)
            .bind(document.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_one(&self, collection: &str, filter: Value, document: Value) -> Result<bool> {
        let documents = self.load_collection(collection).await?;
        let Some((id, _)) = documents
            .iter()
            .find(|(_, doc)| matches_filter(doc, &filter))
        else {
            return Ok(false);
        };

        sqlx::query("UPDATE documents SET doc = ? WHERE id = ?")
            .bind(document.to_string())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(true)
    }

    async fn upsert_one(&self, collection: &str, filter: Value, document: Value) -> Result<()> {
        if !self
            .update_one(collection, filter, document.clone())
            .await?
        {
            self.insert_one(collection, document).await?;
        }
        Ok(())
    }

    async fn delete_one(&self, collection: &str, filter: Value) -> Result<bool> {
        let documents = self.load_collection(collection).await?;
        let Some((id, _)) = documents
            .iter()
            .find(|(_, doc)| matches_filter(doc, &filter))
        else {
            return Ok(false);
        };

        sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(true)
    }

    async fn health(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn memory_store() -> SqliteDocumentStore {
        SqliteDocumentStore::new("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_insert_and_query_by_filter() {
        let store = memory_store().await;
        store
            .insert_one("leverage_status", json!({"symbol": "BTCUSDT", "leverage": 10}))
            .await
            .unwrap();
        store
            .insert_one("leverage_status", json!({"symbol": "ETHUSDT", "leverage": 5}))
            .await
            .unwrap();

        let hits = store
            .query("leverage_status", json!({"symbol": "BTCUSDT"}), None, None)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0]["leverage"], 10);
    }

    #[tokio::test]
    async fn test_upsert_replaces_matching_document() {
        let store = memory_store().await;
        let filter = json!({"symbol": "BTCUSDT"});
        store
            .upsert_one("leverage_status", filter.clone(), json!({"symbol": "BTCUSDT", "leverage": 5}))
            .await
            .unwrap();
        store
            .upsert_one("leverage_status", filter.clone(), json!({"symbol": "BTCUSDT", "leverage": 20}))
            .await
            .unwrap();

        let hits = store
            .query("leverage_status", filter, None, None)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0]["leverage"], 20);
    }

    #[tokio::test]
    async fn test_delete_one() {
        let store = memory_store().await;
        store
            .insert_one("strategy_positions", json!({"strategy_position_id": "sp-1"}))
            .await
            .unwrap();

        let deleted = store
            .delete_one("strategy_positions", json!({"strategy_position_id": "sp-1"}))
            .await
            .unwrap();
        assert!(deleted);

        let hits = store
            .query("strategy_positions", json!({}), None, None)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_health() {
        let store = memory_store().await;
        store.health().await.unwrap();
    }
}
