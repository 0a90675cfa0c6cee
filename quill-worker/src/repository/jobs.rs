//! Jobs repository
//!
//! Reads and writes job records in the shared store:
//! - Enumerating job keys
//! - Fetching and decoding records
//! - Persisting processed records
//! - Claiming and releasing jobs

use anyhow::{Context, Result};
use async_trait::async_trait;
use quill_core::domain::job::JobRecord;
use quill_store::KvStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Repository trait for job records in the store
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Lists the keys of all entries that may hold job records
    async fn list_keys(&self) -> Result<Vec<String>>;

    /// Fetches the record stored under `key`
    ///
    /// Returns `None` when the key vanished since it was listed, or when the
    /// value is not a job record. Only connection failures are errors.
    async fn fetch(&self, key: &str) -> Result<Option<JobRecord>>;

    /// Overwrites the record stored under `key`
    async fn save(&self, key: &str, record: &JobRecord) -> Result<()>;

    /// Claims `key` for `owner` for at most `ttl`
    ///
    /// # Returns
    /// `false` if another worker holds the claim
    async fn claim(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool>;

    /// Releases a claim taken with [`JobRepository::claim`]
    async fn release(&self, key: &str, owner: &str) -> Result<()>;
}

/// [`JobRepository`] on top of a [`KvStore`]
pub struct StoreJobRepository {
    store: Arc<dyn KvStore>,
}

impl StoreJobRepository {
    /// Creates a new store-backed job repository
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl JobRepository for StoreJobRepository {
    async fn list_keys(&self) -> Result<Vec<String>> {
        self.store
            .list_keys()
            .await
            .context("Failed to list store keys")
    }

    async fn fetch(&self, key: &str) -> Result<Option<JobRecord>> {
        let raw = match self.store.get(key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                debug!("Key {} disappeared before it could be fetched", key);
                return Ok(None);
            }
            // e.g. WRONGTYPE for a hash or list sharing the keyspace
            Err(e) if !e.is_connection_error() => {
                warn!("Ignoring {}: {}", key, e);
                return Ok(None);
            }
            Err(e) => return Err(e).with_context(|| format!("Failed to fetch {}", key)),
        };

        match JobRecord::decode(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!("Ignoring {}: {}", key, e);
                Ok(None)
            }
        }
    }

    async fn save(&self, key: &str, record: &JobRecord) -> Result<()> {
        let value = record.encode()?;
        self.store
            .set(key, value)
            .await
            .with_context(|| format!("Failed to save {}", key))
    }

    async fn claim(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        self.store
            .try_claim(key, owner, ttl)
            .await
            .with_context(|| format!("Failed to claim {}", key))
    }

    async fn release(&self, key: &str, owner: &str) -> Result<()> {
        self.store
            .release_claim(key, owner)
            .await
            .with_context(|| format!("Failed to release claim on {}", key))
    }
}
