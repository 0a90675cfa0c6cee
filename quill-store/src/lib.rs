//! Quill Store
//!
//! Key-value store access for the Quill worker.
//!
//! The worker only needs four things from the store: enumerate keys, read a
//! value, overwrite a value, and hold short-lived per-key claims. This crate
//! puts those behind [`KvStore`] and ships two adapters:
//! - [`RedisStore`] for deployments (`SCAN`/`GET`/`SET`)
//! - [`MemoryStore`] for tests and local runs
//!
//! # Example
//!
//! ```no_run
//! use quill_store::{KvStore, RedisStore};
//!
//! #[tokio::main]
//! async fn main() -> quill_store::Result<()> {
//!     let store = RedisStore::connect("redis://localhost:6379/0", "*").await?;
//!
//!     for key in store.list_keys().await? {
//!         println!("{}", key);
//!     }
//!     Ok(())
//! }
//! ```

pub mod error;
mod memory;
mod redis_store;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use async_trait::async_trait;
use std::time::Duration;

/// Prefix of the keys that hold per-job claims
///
/// Claim keys share the keyspace with job records; adapters never return
/// them from [`KvStore::list_keys`].
pub const CLAIM_PREFIX: &str = "quill:claim:";

/// Builds the claim key guarding `key`
pub fn claim_key(key: &str) -> String {
    format!("{}{}", CLAIM_PREFIX, key)
}

/// Shared key-value store
///
/// No snapshot isolation: keys returned by `list_keys` may already be gone
/// when fetched. Writes are last-writer-wins.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Lists all record keys currently in the store, in no particular order
    async fn list_keys(&self) -> Result<Vec<String>>;

    /// Reads the value under `key`, `None` if it does not exist
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Overwrites the value under `key` unconditionally
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Tries to take the claim on `key` for `owner`
    ///
    /// Returns `false` if another owner holds an unexpired claim. The claim
    /// lapses on its own after `ttl`.
    async fn try_claim(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool>;

    /// Releases the claim on `key` if `owner` still holds it
    async fn release_claim(&self, key: &str, owner: &str) -> Result<()>;
}
