//! Redis store adapter
//!
//! Keys are enumerated with `SCAN` rather than `KEYS` so a large keyspace
//! does not block the server. Claims are `SET NX PX` markers released with
//! an owner-checked delete.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::time::Duration;
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::{CLAIM_PREFIX, KvStore, claim_key};

/// Keys fetched per `SCAN` round trip
const SCAN_BATCH: usize = 500;

/// Deletes the claim only if it still carries the caller's owner id
const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Redis-backed [`KvStore`]
///
/// Wraps a [`ConnectionManager`], which reconnects transparently after a
/// dropped connection. Cloning is cheap and shares the connection.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    key_pattern: String,
}

impl RedisStore {
    /// Connects to Redis
    ///
    /// # Arguments
    /// * `url` - Connection URL (e.g., "redis://localhost:6379/0")
    /// * `key_pattern` - `SCAN MATCH` pattern selecting job keys (e.g., "*")
    pub async fn connect(url: &str, key_pattern: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| StoreError::InvalidRequest(format!("Invalid Redis URL '{}': {}", url, e)))?;
        let conn = ConnectionManager::new(client).await?;

        Ok(Self {
            conn,
            key_pattern: key_pattern.into(),
        })
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn list_keys(&self) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let (next, batch): (u64, Vec<Vec<u8>>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&self.key_pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;

            for raw in batch {
                match String::from_utf8(raw) {
                    Ok(key) if !key.starts_with(CLAIM_PREFIX) => keys.push(key),
                    Ok(_) => {}
                    Err(e) => debug!("Skipping non UTF-8 key: {:?}", e.as_bytes()),
                }
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        // SCAN may return a key more than once while the keyspace is rehashing
        keys.sort_unstable();
        keys.dedup();

        Ok(keys)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn try_claim(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);

        let reply: Option<String> = redis::cmd("SET")
            .arg(claim_key(key))
            .arg(owner)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;

        Ok(reply.is_some())
    }

    async fn release_claim(&self, key: &str, owner: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let released: i64 = redis::cmd("EVAL")
            .arg(RELEASE_SCRIPT)
            .arg(1)
            .arg(claim_key(key))
            .arg(owner)
            .query_async(&mut conn)
            .await?;

        if released == 0 {
            debug!("Claim on {} had already lapsed or changed owner", key);
        }

        Ok(())
    }
}
