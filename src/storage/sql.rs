// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL document store (SQLite or MySQL through sqlx's `Any` driver).
//!
//! Every collection shares one table; a document is addressed by the field
//! it was upserted on:
//!
//! ```sql
//! CREATE TABLE sync_documents (
//!   collection  VARCHAR(128) NOT NULL,
//!   match_field VARCHAR(128) NOT NULL,
//!   match_value VARCHAR(255) NOT NULL,
//!   body        LONGTEXT NOT NULL,     -- JSON object
//!   updated_at  BIGINT NOT NULL,       -- epoch millis
//!   PRIMARY KEY (collection, match_field, match_value)
//! )
//! ```
//!
//! Lookups on the match field hit the primary key. Lookups on any other
//! field scan the collection and compare in Rust, since JSON functions differ
//! between SQLite and MySQL.

use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};

use super::traits::{Document, DocumentStore, StorageError};
use crate::resilience::retry::{retry, RetryConfig};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

fn classify(e: sqlx::Error) -> StorageError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StorageError::DuplicateKey(db.message().to_string())
        }
        _ => StorageError::Backend(e.to_string()),
    }
}

/// TEXT comes back as `String` from SQLite but as bytes from MySQL.
fn text_column(row: &AnyRow, column: &str) -> Option<String> {
    row.try_get::<String, _>(column).ok().or_else(|| {
        row.try_get::<Vec<u8>, _>(column)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
    })
}

fn parse_body(raw: &str) -> Result<Document, StorageError> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(StorageError::Serialization("stored body is not an object".to_string())),
        Err(e) => Err(StorageError::Serialization(e.to_string())),
    }
}

fn encode_body(document: &Document) -> Result<String, StorageError> {
    serde_json::to_string(document).map_err(|e| StorageError::Serialization(e.to_string()))
}

pub struct SqlDocumentStore {
    pool: AnyPool,
    is_sqlite: bool,
}

impl SqlDocumentStore {
    /// Connect with startup-mode retry (fails fast if config is wrong).
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(if is_sqlite { 1 } else { 20 })
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        let store = Self { pool, is_sqlite };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let sql = if self.is_sqlite {
            r#"
            CREATE TABLE IF NOT EXISTS sync_documents (
                collection TEXT NOT NULL,
                match_field TEXT NOT NULL,
                match_value TEXT NOT NULL,
                body TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (collection, match_field, match_value)
            )
            "#
        } else {
            r#"
            CREATE TABLE IF NOT EXISTS sync_documents (
                collection VARCHAR(128) NOT NULL,
                match_field VARCHAR(128) NOT NULL,
                match_value VARCHAR(255) NOT NULL,
                body LONGTEXT NOT NULL,
                updated_at BIGINT NOT NULL,
                PRIMARY KEY (collection, match_field, match_value),
                INDEX idx_updated_at (updated_at)
            )
            "#
        };

        retry("sql_init_schema", &RetryConfig::startup(), || async {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        Ok(())
    }

    async fn fetch_body(
        &self,
        collection: &str,
        match_field: &str,
        match_value: &str,
    ) -> Result<Option<Document>, StorageError> {
        let row = sqlx::query(
            "SELECT body FROM sync_documents WHERE collection = ? AND match_field = ? AND match_value = ?",
        )
        .bind(collection)
        .bind(match_field)
        .bind(match_value)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify)?;

        match row.as_ref().and_then(|r| text_column(r, "body")) {
            Some(raw) => parse_body(&raw).map(Some),
            None => Ok(None),
        }
    }

    async fn update_body(
        &self,
        collection: &str,
        match_field: &str,
        match_value: &str,
        body: &Document,
    ) -> Result<u64, StorageError> {
        let result = sqlx::query(
            "UPDATE sync_documents SET body = ?, updated_at = ? WHERE collection = ? AND match_field = ? AND match_value = ?",
        )
        .bind(encode_body(body)?)
        .bind(chrono::Utc::now().timestamp_millis())
        .bind(collection)
        .bind(match_field)
        .bind(match_value)
        .execute(&self.pool)
        .await
        .map_err(classify)?;
        Ok(result.rows_affected())
    }

    async fn insert_body(
        &self,
        collection: &str,
        match_field: &str,
        match_value: &str,
        body: &Document,
    ) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO sync_documents (collection, match_field, match_value, body, updated_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(collection)
        .bind(match_field)
        .bind(match_value)
        .bind(encode_body(body)?)
        .bind(chrono::Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(classify)?;
        Ok(())
    }

    /// Every document in a collection with its address.
    async fn scan_collection(
        &self,
        collection: &str,
    ) -> Result<Vec<(String, String, Document)>, StorageError> {
        let rows = sqlx::query(
            "SELECT match_field, match_value, body FROM sync_documents WHERE collection = ?",
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        rows.iter()
            .filter_map(|row| {
                Some((
                    text_column(row, "match_field")?,
                    text_column(row, "match_value")?,
                    text_column(row, "body")?,
                ))
            })
            .map(|(field, value, raw)| Ok((field, value, parse_body(&raw)?)))
            .collect()
    }

    /// Number of stored documents in a collection.
    pub async fn count(&self, collection: &str) -> Result<u64, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) as cnt FROM sync_documents WHERE collection = ?")
            .bind(collection)
            .fetch_one(&self.pool)
            .await
            .map_err(classify)?;
        let count: i64 = row.try_get("cnt").map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(count as u64)
    }
}

fn merge(existing: &mut Document, fields: Document) {
    for (k, v) in fields {
        existing.insert(k, v);
    }
}

#[async_trait]
impl DocumentStore for SqlDocumentStore {
    async fn upsert(
        &self,
        collection: &str,
        filter_field: &str,
        key: &str,
        document: Document,
    ) -> Result<(), StorageError> {
        if let Some(mut existing) = self.fetch_body(collection, filter_field, key).await? {
            merge(&mut existing, document);
            self.update_body(collection, filter_field, key, &existing).await?;
            return Ok(());
        }

        let mut body = Document::new();
        body.insert(filter_field.to_string(), Value::String(key.to_string()));
        merge(&mut body, document.clone());

        match self.insert_body(collection, filter_field, key, &body).await {
            Err(StorageError::DuplicateKey(_)) => {
                // Lost an insert race; the row exists now, so merge into it
                let mut existing = self
                    .fetch_body(collection, filter_field, key)
                    .await?
                    .unwrap_or_default();
                merge(&mut existing, document);
                self.update_body(collection, filter_field, key, &existing).await?;
                Ok(())
            }
            other => other,
        }
    }

    async fn find_one(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> Result<Option<Document>, StorageError> {
        if let Some(found) = self.fetch_body(collection, field, value).await? {
            return Ok(Some(found));
        }

        let wanted = Value::String(value.to_string());
        Ok(self
            .scan_collection(collection)
            .await?
            .into_iter()
            .map(|(_, _, body)| body)
            .find(|body| body.get(field) == Some(&wanted)))
    }

    async fn clear_field(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> Result<u64, StorageError> {
        let wanted = Value::String(value.to_string());
        let now = Value::String(chrono::Utc::now().to_rfc3339());
        let mut changed = 0;

        for (match_field, match_value, mut body) in self.scan_collection(collection).await? {
            if body.get(field) != Some(&wanted) {
                continue;
            }
            body.remove(field);
            body.insert("updated_at".to_string(), now.clone());
            changed += self.update_body(collection, &match_field, &match_value, &body).await?;
        }
        Ok(changed)
    }

    async fn ping(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }
}
