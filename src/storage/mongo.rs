// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! MongoDB document store.
//!
//! Upserts are `update_one(filter, {"$set": data}).upsert(true)`, so fields the
//! job does not mention survive and the filter field is written on insert.

use async_trait::async_trait;
use bson::{doc, Bson};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::{Client, Collection, Database};
use tracing::info;

use super::traits::{Document, DocumentStore, StorageError};

const DUPLICATE_KEY_CODE: i32 = 11000;

fn is_duplicate_key(kind: &ErrorKind) -> bool {
    match kind {
        ErrorKind::Write(WriteFailure::WriteError(e)) => e.code == DUPLICATE_KEY_CODE,
        ErrorKind::InsertMany(e) => e
            .write_errors
            .as_ref()
            .is_some_and(|errors| errors.iter().any(|w| w.code == DUPLICATE_KEY_CODE)),
        ErrorKind::Command(e) => e.code == DUPLICATE_KEY_CODE,
        _ => false,
    }
}

fn classify(e: mongodb::error::Error) -> StorageError {
    let message = e.to_string();
    // Some wrapped errors only carry the code in their text
    if is_duplicate_key(&e.kind) || message.contains("E11000") {
        StorageError::DuplicateKey(message)
    } else {
        StorageError::Backend(message)
    }
}

fn to_bson(document: &Document) -> Result<bson::Document, StorageError> {
    bson::to_document(document).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn from_bson(document: bson::Document) -> Document {
    match Bson::Document(document).into_relaxed_extjson() {
        serde_json::Value::Object(map) => map,
        _ => Document::new(),
    }
}

#[derive(Clone)]
pub struct MongoDocumentStore {
    client: Client,
    database: Database,
}

impl MongoDocumentStore {
    /// Connect and verify with a ping.
    pub async fn connect(uri: &str, database: &str) -> Result<Self, StorageError> {
        info!(database, "Connecting to MongoDB");

        // Bound server selection so an unreachable cluster fails fast
        let uri = if uri.contains("serverSelectionTimeoutMS") {
            uri.to_string()
        } else if uri.contains('?') {
            format!("{}&serverSelectionTimeoutMS=3000&connectTimeoutMS=3000", uri)
        } else {
            format!("{}/?serverSelectionTimeoutMS=3000&connectTimeoutMS=3000", uri.trim_end_matches('/'))
        };

        let client = Client::with_uri_str(&uri)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to connect to MongoDB: {}", e)))?;

        let store = Self::from_client(client, database);
        store.ping().await?;

        info!(database, "Connected to MongoDB");
        Ok(store)
    }

    /// Wrap an existing client.
    pub fn from_client(client: Client, database: &str) -> Self {
        let database = client.database(database);
        Self { client, database }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn database_name(&self) -> &str {
        self.database.name()
    }

    fn collection(&self, name: &str) -> Collection<bson::Document> {
        self.database.collection(name)
    }
}

#[async_trait]
impl DocumentStore for MongoDocumentStore {
    async fn upsert(
        &self,
        collection: &str,
        filter_field: &str,
        key: &str,
        document: Document,
    ) -> Result<(), StorageError> {
        let mut fields = to_bson(&document)?;
        if fields.is_empty() {
            // Mongo rejects an empty $set
            fields.insert(filter_field, key);
        }

        self.collection(collection)
            .update_one(doc! { filter_field: key }, doc! { "$set": fields })
            .upsert(true)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn find_one(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> Result<Option<Document>, StorageError> {
        let found = self
            .collection(collection)
            .find_one(doc! { field: value })
            .await
            .map_err(classify)?;
        Ok(found.map(from_bson))
    }

    async fn clear_field(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> Result<u64, StorageError> {
        let result = self
            .collection(collection)
            .update_many(
                doc! { field: value },
                doc! {
                    "$unset": { field: "" },
                    "$set": { "updated_at": bson::DateTime::now() },
                },
            )
            .await
            .map_err(classify)?;
        Ok(result.modified_count)
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.database
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| StorageError::Backend(format!("MongoDB ping failed: {}", e)))?;
        Ok(())
    }
}
