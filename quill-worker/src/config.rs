//! Worker configuration
//!
//! Defines all configurable parameters for the worker including
//! store connection settings, polling and timeout intervals, and claim leases.

use anyhow::Context;
use std::str::FromStr;
use std::time::Duration;

/// Worker configuration
///
/// All timeouts and intervals are configurable to allow tuning
/// for different deployment scenarios (single worker vs a fleet).
#[derive(Debug, Clone)]
pub struct Config {
    /// Unique identifier for this worker instance, used as the claim owner
    pub worker_id: String,

    /// Redis connection URL (e.g., "redis://localhost:6379/0")
    pub redis_url: String,

    /// `SCAN MATCH` pattern selecting job keys
    pub key_pattern: String,

    /// Pause between two full scans of the store
    pub poll_interval: Duration,

    /// Maximum time a single render may take before the job is failed
    pub render_timeout: Duration,

    /// Lifetime of a per-job claim; `None` disables claiming
    pub claim_ttl: Option<Duration>,

    /// Consecutive failed scans tolerated before giving up
    pub max_store_retries: u32,

    /// First retry delay after a store failure, doubled on each retry
    pub store_backoff: Duration,

    /// Render GitHub-flavored tables and strikethrough
    pub markdown_extensions: bool,
}

impl Config {
    /// Creates a new configuration with defaults
    pub fn new(worker_id: String, redis_url: String) -> Self {
        Self {
            worker_id,
            redis_url,
            key_pattern: "*".to_string(),
            poll_interval: Duration::from_secs(5),
            render_timeout: Duration::from_secs(30),
            claim_ttl: Some(Duration::from_secs(60)),
            max_store_retries: 10,
            store_backoff: Duration::from_millis(500),
            markdown_extensions: false,
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables (all optional):
    /// - WORKER_ID (default: random UUID)
    /// - REDIS_URL, or REDIS_HOST (default: localhost), REDIS_PORT (default: 6379),
    ///   REDIS_DB (default: 0)
    /// - KEY_PATTERN (default: *)
    /// - POLL_INTERVAL_SECS (default: 5)
    /// - RENDER_TIMEOUT_SECS (default: 30)
    /// - CLAIM_TTL_SECS (default: 60, 0 disables claims)
    /// - MAX_STORE_RETRIES (default: 10)
    /// - STORE_BACKOFF_MS (default: 500)
    /// - MARKDOWN_EXTENSIONS (default: false)
    pub fn from_env() -> anyhow::Result<Self> {
        let worker_id =
            std::env::var("WORKER_ID").unwrap_or_else(|_| uuid::Uuid::new_v4().to_string());

        let redis_url = match std::env::var("REDIS_URL") {
            Ok(url) => url,
            Err(_) => {
                let host = std::env::var("REDIS_HOST").unwrap_or_else(|_| "localhost".to_string());
                let port: u16 = env_or("REDIS_PORT", 6379)?;
                let db: u32 = env_or("REDIS_DB", 0)?;
                format!("redis://{}:{}/{}", host, port, db)
            }
        };

        let key_pattern = std::env::var("KEY_PATTERN").unwrap_or_else(|_| "*".to_string());

        let poll_interval = Duration::from_secs(env_or("POLL_INTERVAL_SECS", 5)?);
        let render_timeout = Duration::from_secs(env_or("RENDER_TIMEOUT_SECS", 30)?);

        let claim_ttl = match env_or("CLAIM_TTL_SECS", 60)? {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        let max_store_retries = env_or("MAX_STORE_RETRIES", 10)?;
        let store_backoff = Duration::from_millis(env_or("STORE_BACKOFF_MS", 500)?);
        let markdown_extensions = env_or("MARKDOWN_EXTENSIONS", false)?;

        Ok(Self {
            worker_id,
            redis_url,
            key_pattern,
            poll_interval,
            render_timeout,
            claim_ttl,
            max_store_retries,
            store_backoff,
            markdown_extensions,
        })
    }

    /// Disables per-job claims
    ///
    /// Workers then race on shared pending records the way plain
    /// read-check-write does; the last writer wins.
    #[allow(dead_code)]
    pub fn without_claims(mut self) -> Self {
        self.claim_ttl = None;
        self
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.worker_id.is_empty() {
            anyhow::bail!("worker_id cannot be empty");
        }

        if !self.redis_url.starts_with("redis://") && !self.redis_url.starts_with("rediss://") {
            anyhow::bail!("redis_url must start with redis:// or rediss://");
        }

        if self.key_pattern.is_empty() {
            anyhow::bail!("key_pattern cannot be empty");
        }

        if self.poll_interval.is_zero() {
            anyhow::bail!("poll_interval must be greater than 0");
        }

        if self.render_timeout.is_zero() {
            anyhow::bail!("render_timeout must be greater than 0");
        }

        if self.max_store_retries == 0 {
            anyhow::bail!("max_store_retries must be greater than 0");
        }

        // A claim must outlive the longest render or a second worker may take over
        if let Some(ttl) = self.claim_ttl {
            if ttl <= self.render_timeout {
                anyhow::bail!("claim_ttl must be greater than render_timeout");
            }
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(
            uuid::Uuid::new_v4().to_string(),
            "redis://localhost:6379/0".to_string(),
        )
    }
}

/// Reads and parses an optional environment variable
fn env_or<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for {}: '{}'", name, raw)),
        Err(_) => Ok(default),
    }
}
