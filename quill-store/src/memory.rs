//! In-memory store adapter
//!
//! Holds everything in a process-local map. Useful for tests and for running
//! several workers against one store inside a single process.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::KvStore;
use crate::error::Result;

#[derive(Default)]
struct Inner {
    values: HashMap<String, Vec<u8>>,
    claims: HashMap<String, (String, Instant)>,
}

/// In-memory [`KvStore`]
///
/// Clones share the same underlying map.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    /// Creates an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes `key`, returning its value if it existed
    pub async fn remove(&self, key: &str) -> Option<Vec<u8>> {
        self.inner.lock().await.values.remove(key)
    }

    /// Returns the current owner of the claim on `key`, if unexpired
    pub async fn claim_owner(&self, key: &str) -> Option<String> {
        let inner = self.inner.lock().await;
        inner
            .claims
            .get(key)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(owner, _)| owner.clone())
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn list_keys(&self) -> Result<Vec<String>> {
        Ok(self.inner.lock().await.values.keys().cloned().collect())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.lock().await.values.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.inner
            .lock()
            .await
            .values
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn try_claim(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();

        if let Some((_, expires)) = inner.claims.get(key) {
            if *expires > now {
                return Ok(false);
            }
        }

        inner
            .claims
            .insert(key.to_string(), (owner.to_string(), now + ttl));
        Ok(true)
    }

    async fn release_claim(&self, key: &str, owner: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.claims.get(key).is_some_and(|(held_by, _)| held_by == owner) {
            inner.claims.remove(key);
        }
        Ok(())
    }
}
