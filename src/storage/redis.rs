// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis buffer store.
//!
//! Holds the three kinds of keys the pipeline uses:
//! - **Queues** (`sync:queue:<type>`, `sync:dlq:<type>`): lists, LPUSH in, RPOP out
//! - **Write buffer / read cache** (`<type>:write:<key>`, `<type>:cache:<key>`): strings with TTL
//! - **Delayed retries** (`sync:delayed:<type>`): sorted set scored by ready-at epoch millis
//!
//! Delayed members carry a random token so identical payloads scheduled twice
//! stay distinct:
//!
//! ```text
//! ZADD sync:delayed:citizen 1767607200000 "9f2c...e1:{\"id\":\"...\",...}"
//! ```
//!
//! Promotion runs as a single Lua script, so a job is always either parked or
//! queued, never both and never neither.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{cmd, AsyncCommands, Client, Script};

use super::traits::{BufferStore, MemoryUsage, StorageError};
use crate::resilience::retry::{retry, RetryConfig};

/// Length of the `<32 hex>:` token in front of every delayed member.
const TOKEN_LEN: usize = 33;

const PROMOTE_SCRIPT: &str = r"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
for _, member in ipairs(due) do
    redis.call('ZREM', KEYS[1], member)
    redis.call('LPUSH', KEYS[2], string.sub(member, 34))
end
return #due
";

fn backend(e: redis::RedisError) -> StorageError {
    StorageError::Backend(e.to_string())
}

pub struct RedisBufferStore {
    connection: ConnectionManager,
    /// Optional key prefix for namespacing (e.g., "staging:" → "staging:sync:queue:citizen")
    prefix: String,
    promote: Script,
}

impl RedisBufferStore {
    /// Connect without a key prefix.
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        Self::with_prefix(connection_string, None).await
    }

    /// Connect with an optional key prefix.
    ///
    /// The prefix is prepended to every key, so several deployments can
    /// share one Redis instance.
    ///
    /// ```rust,no_run
    /// # use sync_reconciler::storage::redis::RedisBufferStore;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// // Queues become "staging:sync:queue:<type>"
    /// let store = RedisBufferStore::with_prefix("redis://localhost", Some("staging:")).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn with_prefix(connection_string: &str, prefix: Option<&str>) -> Result<Self, StorageError> {
        let client = Client::open(connection_string).map_err(backend)?;

        // Startup config: fail fast on a bad URL instead of hanging
        let connection = retry("redis_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(backend)?;

        Ok(Self {
            connection,
            prefix: prefix.unwrap_or("").to_string(),
            promote: Script::new(PROMOTE_SCRIPT),
        })
    }

    #[inline]
    fn prefixed_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}{}", self.prefix, key)
        }
    }

    /// Get a clone of the connection manager.
    pub fn connection(&self) -> ConnectionManager {
        self.connection.clone()
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

/// Prefix `value` with a fresh random token.
fn tokenize(value: &str) -> String {
    format!("{}:{}", uuid::Uuid::new_v4().simple(), value)
}

/// Pull `used_memory` and `maxmemory` out of an `INFO memory` reply.
fn parse_memory_info(info: &str) -> Option<MemoryUsage> {
    let field = |name: &str| -> Option<u64> {
        info.lines()
            .find_map(|line| line.trim().strip_prefix(name)?.strip_prefix(':'))
            .and_then(|v| v.trim().parse().ok())
    };
    Some(MemoryUsage {
        used_bytes: field("used_memory")?,
        max_bytes: field("maxmemory").unwrap_or(0),
    })
}

#[async_trait]
impl BufferStore for RedisBufferStore {
    async fn push_front(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);

        // A retry after a lost reply may duplicate the entry; upserts are
        // idempotent so a duplicate is harmless, a lost job is not.
        retry("redis_lpush", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                let _: i64 = conn.lpush(&key, value).await?;
                Ok(())
            }
        })
        .await
        .map_err(backend)
    }

    async fn pop_back(&self, key: &str) -> Result<Option<String>, StorageError> {
        // Not retried: a popped value whose reply was lost cannot be recovered
        let mut conn = self.connection.clone();
        let key = self.prefixed_key(key);
        cmd("RPOP").arg(&key).query_async(&mut conn).await.map_err(backend)
    }

    async fn list_len(&self, key: &str) -> Result<u64, StorageError> {
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);

        retry("redis_llen", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move { conn.llen(&key).await }
        })
        .await
        .map_err(backend)
    }

    async fn list_range(&self, key: &str, limit: usize) -> Result<Vec<String>, StorageError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);
        let stop = limit as isize - 1;

        retry("redis_lrange", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move { conn.lrange(&key, 0, stop).await }
        })
        .await
        .map_err(backend)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);

        retry("redis_get", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move { conn.get(&key).await }
        })
        .await
        .map_err(backend)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StorageError> {
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);
        let ttl_ms = ttl.map(|t| (t.as_millis() as u64).max(1));

        retry("redis_set", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                let mut command = cmd("SET");
                command.arg(&key).arg(value);
                if let Some(ms) = ttl_ms {
                    command.arg("PX").arg(ms);
                }
                command.query_async::<()>(&mut conn).await
            }
        })
        .await
        .map_err(backend)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let conn = self.connection.clone();
        let key = self.prefixed_key(key);

        retry("redis_delete", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                let _: i64 = conn.del(&key).await?;
                Ok(())
            }
        })
        .await
        .map_err(backend)
    }

    async fn schedule(&self, delayed_key: &str, value: &str, ready_at_ms: i64) -> Result<(), StorageError> {
        let conn = self.connection.clone();
        let key = self.prefixed_key(delayed_key);
        // Token is fixed before the retry loop so a replayed ZADD only rescores
        let member = tokenize(value);

        retry("redis_zadd", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            let member = member.clone();
            async move {
                let _: i64 = conn.zadd(&key, &member, ready_at_ms).await?;
                Ok(())
            }
        })
        .await
        .map_err(backend)
    }

    async fn promote_due(
        &self,
        delayed_key: &str,
        queue_key: &str,
        now_ms: i64,
        limit: usize,
    ) -> Result<u64, StorageError> {
        let mut conn = self.connection.clone();
        self.promote
            .key(self.prefixed_key(delayed_key))
            .key(self.prefixed_key(queue_key))
            .arg(now_ms)
            .arg(limit)
            .invoke_async(&mut conn)
            .await
            .map_err(backend)
    }

    async fn delayed_len(&self, delayed_key: &str) -> Result<u64, StorageError> {
        let conn = self.connection.clone();
        let key = self.prefixed_key(delayed_key);

        retry("redis_zcard", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move { conn.zcard(&key).await }
        })
        .await
        .map_err(backend)
    }

    async fn ping(&self) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        let _: String = cmd("PING").query_async(&mut conn).await.map_err(backend)?;
        Ok(())
    }

    async fn memory_usage(&self) -> Result<Option<MemoryUsage>, StorageError> {
        let mut conn = self.connection.clone();
        let info: String = cmd("INFO")
            .arg("memory")
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(parse_memory_info(&info))
    }
}
