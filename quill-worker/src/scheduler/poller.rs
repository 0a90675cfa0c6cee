//! Job poller
//!
//! Scans the whole store for pending jobs, renders them one at a time and
//! writes the outcome back. Between scans it sleeps for the poll interval.
//! The store is the only state: a restarted worker simply finds the jobs
//! that are still pending.

use anyhow::Result;
use quill_core::domain::job::{JobRecord, JobStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::repository::JobRepository;
use crate::service::JobProcessor;

/// Upper bound for the delay between retries after a store failure
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// What a single scan did
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanStats {
    /// Keys looked at
    pub scanned: usize,
    /// Jobs rendered and written back
    pub processed: usize,
    pub completed: usize,
    pub failed: usize,
    /// Keys that were gone, not jobs, not pending, or claimed elsewhere
    pub skipped: usize,
}

impl ScanStats {
    /// Counts one key; `outcome` is the status written back, if any
    ///
    /// Processing only ever writes `completed` or `failed`.
    fn record(&mut self, outcome: Option<JobStatus>) {
        let Some(status) = outcome else {
            self.skipped += 1;
            return;
        };

        self.processed += 1;
        if status == JobStatus::Failed {
            self.failed += 1;
        } else {
            self.completed += 1;
        }
    }
}

/// Job poller that continuously scans for and processes pending jobs
pub struct JobPoller {
    config: Config,
    repository: Arc<dyn JobRepository>,
    processor: JobProcessor,
}

impl JobPoller {
    /// Creates a new job poller
    pub fn new(config: Config, repository: Arc<dyn JobRepository>, processor: JobProcessor) -> Self {
        Self {
            config,
            repository,
            processor,
        }
    }

    /// Runs the polling loop until `shutdown` turns `true`
    ///
    /// A failed scan is retried with exponential backoff. After
    /// `max_store_retries` consecutive failures the last error is returned.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            "Starting job poller (interval: {:?}, claims: {})",
            self.config.poll_interval,
            match self.config.claim_ttl {
                Some(ttl) => format!("{:?} lease", ttl),
                None => "disabled".to_string(),
            }
        );

        let mut failures: u32 = 0;
        let mut backoff = self.config.store_backoff;

        loop {
            if *shutdown.borrow() {
                break;
            }

            debug!("Scanning store for pending jobs");

            let pause = match self.scan_once(&shutdown).await {
                Ok(stats) => {
                    failures = 0;
                    backoff = self.config.store_backoff;

                    if stats.processed > 0 {
                        info!(
                            "Processed {} job(s) this cycle ({} completed, {} failed, {} of {} key(s) skipped)",
                            stats.processed,
                            stats.completed,
                            stats.failed,
                            stats.skipped,
                            stats.scanned
                        );
                    } else {
                        debug!(
                            "No pending jobs among {} key(s), {} skipped",
                            stats.scanned, stats.skipped
                        );
                    }

                    self.config.poll_interval
                }
                Err(e) => {
                    failures += 1;

                    if failures >= self.config.max_store_retries {
                        error!(
                            "Store still failing after {} consecutive attempt(s), giving up",
                            failures
                        );
                        return Err(e.context(format!(
                            "Store unavailable after {} consecutive failed scans",
                            failures
                        )));
                    }

                    warn!(
                        "Scan failed (attempt {}/{}): {:#}",
                        failures, self.config.max_store_retries, e
                    );
                    warn!("Retrying in {:?}...", backoff);

                    let delay = backoff;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    delay
                }
            };

            if pause_or_shutdown(&mut shutdown, pause).await {
                break;
            }
        }

        info!("Shutdown requested, job poller stopped");
        Ok(())
    }

    /// Performs a single pass over every key in the store
    ///
    /// Stops early, after the job in flight is saved, once `shutdown` is set.
    pub async fn scan_once(&self, shutdown: &watch::Receiver<bool>) -> Result<ScanStats> {
        let keys = self.repository.list_keys().await?;
        let mut stats = ScanStats::default();

        for key in keys {
            if *shutdown.borrow() {
                debug!("Shutdown requested, ending scan early");
                break;
            }

            stats.scanned += 1;
            let outcome = self.handle_key(&key).await?;
            stats.record(outcome);
        }

        Ok(stats)
    }

    /// Processes the job under `key` if it is pending
    ///
    /// Returns the status written back, or `None` if nothing was written.
    async fn handle_key(&self, key: &str) -> Result<Option<JobStatus>> {
        let Some(record) = self.repository.fetch(key).await? else {
            return Ok(None);
        };

        if !record.is_pending() {
            return Ok(None);
        }

        let Some(ttl) = self.config.claim_ttl else {
            return self.process_and_save(key, record).await.map(Some);
        };

        let owner = &self.config.worker_id;
        if !self.repository.claim(key, owner, ttl).await? {
            debug!("Job {} is claimed by another worker", key);
            return Ok(None);
        }

        let outcome = self.process_claimed(key).await;

        if let Err(e) = self.repository.release(key, owner).await {
            warn!("Failed to release claim on {}, it will lapse: {:#}", key, e);
        }

        outcome
    }

    async fn process_claimed(&self, key: &str) -> Result<Option<JobStatus>> {
        // Another worker may have finished the job between the scan and the claim
        let Some(record) = self.repository.fetch(key).await? else {
            return Ok(None);
        };

        if !record.is_pending() {
            debug!("Job {} was finished by another worker", key);
            return Ok(None);
        }

        self.process_and_save(key, record).await.map(Some)
    }

    async fn process_and_save(&self, key: &str, record: JobRecord) -> Result<JobStatus> {
        info!("Processing job {}", key);

        let updated = self.processor.process(record).await;
        self.repository.save(key, &updated).await?;

        match updated.status {
            JobStatus::Failed => warn!(
                "Job {} failed: {}",
                key,
                updated.error.as_deref().unwrap_or_default()
            ),
            status => info!("Job {} {}", key, status),
        }

        Ok(updated.status)
    }
}

/// Sleeps for `pause`, returning `true` early if shutdown is requested
async fn pause_or_shutdown(shutdown: &mut watch::Receiver<bool>, pause: Duration) -> bool {
    let requested = tokio::select! {
        _ = tokio::time::sleep(pause) => return false,
        result = async { shutdown.wait_for(|stop| *stop).await.is_ok() } => result,
    };

    if !requested {
        // Nobody can signal anymore; keep polling
        tokio::time::sleep(pause).await;
    }

    requested
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::StoreJobRepository;
    use crate::service::{MarkdownRenderer, Renderer};
    use crate::service::render::RenderError;
    use async_trait::async_trait;
    use quill_store::{KvStore, MemoryStore, StoreError};
    use serde_json::{Value, json};
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_config(worker_id: &str) -> Config {
        let mut config = Config::new(worker_id.to_string(), "redis://localhost:6379/0".to_string());
        config.poll_interval = Duration::from_millis(10);
        config.store_backoff = Duration::from_millis(5);
        config
    }

    fn poller_with(
        config: Config,
        store: Arc<dyn KvStore>,
        renderer: Arc<dyn Renderer>,
    ) -> JobPoller {
        let processor = JobProcessor::new(renderer, config.render_timeout);
        JobPoller::new(
            config,
            Arc::new(StoreJobRepository::new(store)),
            processor,
        )
    }

    fn poller(store: &MemoryStore) -> JobPoller {
        poller_with(
            test_config("worker-1"),
            Arc::new(store.clone()),
            Arc::new(MarkdownRenderer::new()),
        )
    }

    fn no_shutdown() -> watch::Receiver<bool> {
        watch::channel(false).1
    }

    async fn put(store: &MemoryStore, key: &str, value: Value) {
        store.set(key, serde_json::to_vec(&value).unwrap()).await.unwrap();
    }

    async fn read(store: &MemoryStore, key: &str) -> JobRecord {
        JobRecord::decode(&store.get(key).await.unwrap().unwrap()).unwrap()
    }

    /// Lists one key that is never there when fetched
    struct VanishingStore {
        inner: MemoryStore,
    }

    #[async_trait]
    impl KvStore for VanishingStore {
        async fn list_keys(&self) -> quill_store::Result<Vec<String>> {
            let mut keys = vec!["ghost".to_string()];
            keys.extend(self.inner.list_keys().await?);
            Ok(keys)
        }

        async fn get(&self, key: &str) -> quill_store::Result<Option<Vec<u8>>> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: Vec<u8>) -> quill_store::Result<()> {
            self.inner.set(key, value).await
        }

        async fn try_claim(&self, key: &str, owner: &str, ttl: Duration) -> quill_store::Result<bool> {
            self.inner.try_claim(key, owner, ttl).await
        }

        async fn release_claim(&self, key: &str, owner: &str) -> quill_store::Result<()> {
            self.inner.release_claim(key, owner).await
        }
    }

    /// Fails the first `failures` key listings, then behaves like `inner`
    struct FlakyStore {
        inner: MemoryStore,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl KvStore for FlakyStore {
        async fn list_keys(&self) -> quill_store::Result<Vec<String>> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(StoreError::Unavailable("connection refused".to_string()));
            }
            self.inner.list_keys().await
        }

        async fn get(&self, key: &str) -> quill_store::Result<Option<Vec<u8>>> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: Vec<u8>) -> quill_store::Result<()> {
            self.inner.set(key, value).await
        }

        async fn try_claim(&self, key: &str, owner: &str, ttl: Duration) -> quill_store::Result<bool> {
            self.inner.try_claim(key, owner, ttl).await
        }

        async fn release_claim(&self, key: &str, owner: &str) -> quill_store::Result<()> {
            self.inner.release_claim(key, owner).await
        }
    }

    /// Lists a key holding a non-string value, whose reads fail with WRONGTYPE
    struct TypedKeyStore {
        inner: MemoryStore,
    }

    #[async_trait]
    impl KvStore for TypedKeyStore {
        async fn list_keys(&self) -> quill_store::Result<Vec<String>> {
            let mut keys = vec!["a-hash".to_string()];
            keys.extend(self.inner.list_keys().await?);
            Ok(keys)
        }

        async fn get(&self, key: &str) -> quill_store::Result<Option<Vec<u8>>> {
            if key == "a-hash" {
                return Err(StoreError::Redis(redis::RedisError::from((
                    redis::ErrorKind::TypeError,
                    "WRONGTYPE Operation against a key holding the wrong kind of value",
                ))));
            }
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: Vec<u8>) -> quill_store::Result<()> {
            self.inner.set(key, value).await
        }

        async fn try_claim(&self, key: &str, owner: &str, ttl: Duration) -> quill_store::Result<bool> {
            self.inner.try_claim(key, owner, ttl).await
        }

        async fn release_claim(&self, key: &str, owner: &str) -> quill_store::Result<()> {
            self.inner.release_claim(key, owner).await
        }
    }

    /// Holds every render until `parties` renders are in progress
    struct RendezvousRenderer {
        barrier: Barrier,
    }

    impl Renderer for RendezvousRenderer {
        fn render(&self, markdown: &str) -> Result<String, RenderError> {
            self.barrier.wait();
            MarkdownRenderer::new().render(markdown)
        }
    }

    #[tokio::test]
    async fn test_pending_job_completes() {
        let store = MemoryStore::new();
        put(&store, "job-a", json!({"status": "pending", "markdown": "# Hi"})).await;

        let stats = poller(&store).scan_once(&no_shutdown()).await.unwrap();
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.completed, 1);

        let record = read(&store, "job-a").await;
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.markdown_text(), Some("# Hi"));
        assert_eq!(record.html.as_deref().map(str::trim_end), Some("<h1>Hi</h1>"));
        assert!(record.completed_at_time().is_some());
        assert_eq!(record.error, None);
    }

    #[tokio::test]
    async fn test_null_markdown_fails() {
        let store = MemoryStore::new();
        put(&store, "job-b", json!({"status": "pending", "markdown": null})).await;

        let stats = poller(&store).scan_once(&no_shutdown()).await.unwrap();
        assert_eq!(stats.failed, 1);

        let written: Value =
            serde_json::from_slice(&store.get("job-b").await.unwrap().unwrap()).unwrap();
        assert_eq!(written, json!({"status": "failed", "error": "invalid input"}));
    }

    #[tokio::test]
    async fn test_non_string_markdown_fails() {
        let store = MemoryStore::new();
        put(&store, "job", json!({"status": "pending", "markdown": 42})).await;

        let stats = poller(&store).scan_once(&no_shutdown()).await.unwrap();
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.failed, 1);

        let written: Value =
            serde_json::from_slice(&store.get("job").await.unwrap().unwrap()).unwrap();
        assert_eq!(
            written,
            json!({"status": "failed", "markdown": 42, "error": "invalid input"})
        );
    }

    #[tokio::test]
    async fn test_only_pending_records_are_touched() {
        let store = MemoryStore::new();
        let completed = br#"{ "status": "completed", "markdown": "b", "html": "<p>b</p>", "completedAt": "2026-01-01T00:00:00+0000" }"#.to_vec();
        let failed = br#"{"error":"invalid input",  "status":"failed"}"#.to_vec();

        put(&store, "A", json!({"status": "pending", "markdown": "a"})).await;
        store.set("B", completed.clone()).await.unwrap();
        store.set("C", failed.clone()).await.unwrap();

        let stats = poller(&store).scan_once(&no_shutdown()).await.unwrap();
        assert_eq!(stats.scanned, 3);
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.skipped, 2);

        assert_eq!(read(&store, "A").await.status, JobStatus::Completed);
        assert_eq!(store.get("B").await.unwrap(), Some(completed));
        assert_eq!(store.get("C").await.unwrap(), Some(failed));
    }

    #[tokio::test]
    async fn test_second_scan_is_a_no_op() {
        let store = MemoryStore::new();
        put(&store, "job", json!({"status": "pending", "markdown": "text"})).await;

        let poller = poller(&store);
        poller.scan_once(&no_shutdown()).await.unwrap();
        let first = store.get("job").await.unwrap();

        let stats = poller.scan_once(&no_shutdown()).await.unwrap();
        assert_eq!(stats.processed, 0);
        assert_eq!(store.get("job").await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_vanished_key_is_skipped() {
        let store = MemoryStore::new();
        put(&store, "job", json!({"status": "pending", "markdown": "*x*"})).await;

        let poller = poller_with(
            test_config("worker-1"),
            Arc::new(VanishingStore {
                inner: store.clone(),
            }),
            Arc::new(MarkdownRenderer::new()),
        );

        let stats = poller.scan_once(&no_shutdown()).await.unwrap();
        assert_eq!(stats.scanned, 2);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.completed, 1);

        let record = read(&store, "job").await;
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.error, None);
        assert!(store.get("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_wrong_type_key_does_not_stop_the_scan() {
        let store = MemoryStore::new();
        put(&store, "b-job", json!({"status": "pending", "markdown": "# Hi"})).await;

        let mut config = test_config("worker-1");
        config.max_store_retries = 1;
        let poller = poller_with(
            config,
            Arc::new(TypedKeyStore {
                inner: store.clone(),
            }),
            Arc::new(MarkdownRenderer::new()),
        );

        let stats = poller.scan_once(&no_shutdown()).await.unwrap();
        assert_eq!(stats.scanned, 2);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(read(&store, "b-job").await.status, JobStatus::Completed);

        // A single allowed failure would end `run` if the key counted as an outage
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { poller.run(rx).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());

        tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("poller did not stop")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_foreign_values_are_left_alone() {
        let store = MemoryStore::new();
        store.set("session:1", b"\x00\x01binary".to_vec()).await.unwrap();
        put(&store, "settings", json!({"theme": "dark"})).await;

        let stats = poller(&store).scan_once(&no_shutdown()).await.unwrap();
        assert_eq!(stats.skipped, 2);
        assert_eq!(
            store.get("session:1").await.unwrap(),
            Some(b"\x00\x01binary".to_vec())
        );
    }

    #[tokio::test]
    async fn test_concurrent_workers_without_claims_leave_valid_record() {
        let store = MemoryStore::new();
        put(&store, "job", json!({"status": "pending", "markdown": "# Race"})).await;

        // Both workers are inside render, so both fetched the pending record
        let renderer: Arc<dyn Renderer> = Arc::new(RendezvousRenderer {
            barrier: Barrier::new(2),
        });
        let a = poller_with(
            test_config("worker-a").without_claims(),
            Arc::new(store.clone()),
            Arc::clone(&renderer),
        );
        let b = poller_with(
            test_config("worker-b").without_claims(),
            Arc::new(store.clone()),
            renderer,
        );

        let shutdown = no_shutdown();
        let (stats_a, stats_b) = tokio::join!(a.scan_once(&shutdown), b.scan_once(&shutdown));

        // Duplicate processing: both rendered and wrote
        assert_eq!(stats_a.unwrap().processed, 1);
        assert_eq!(stats_b.unwrap().processed, 1);

        let record = read(&store, "job").await;
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.html.as_deref().map(str::trim_end), Some("<h1>Race</h1>"));
        assert!(record.is_consistent());
    }

    #[tokio::test]
    async fn test_claimed_job_is_skipped() {
        let store = MemoryStore::new();
        put(&store, "job", json!({"status": "pending", "markdown": "x"})).await;
        store
            .try_claim("job", "worker-2", Duration::from_secs(60))
            .await
            .unwrap();

        let poller = poller(&store);
        let stats = poller.scan_once(&no_shutdown()).await.unwrap();
        assert_eq!(stats.processed, 0);
        assert_eq!(stats.skipped, 1);
        assert!(read(&store, "job").await.is_pending());

        store.release_claim("job", "worker-2").await.unwrap();
        let stats = poller.scan_once(&no_shutdown()).await.unwrap();
        assert_eq!(stats.completed, 1);
    }

    #[tokio::test]
    async fn test_claim_released_after_processing() {
        let store = MemoryStore::new();
        put(&store, "job", json!({"status": "pending", "markdown": "x"})).await;

        poller(&store).scan_once(&no_shutdown()).await.unwrap();

        assert_eq!(read(&store, "job").await.status, JobStatus::Completed);
        assert_eq!(store.claim_owner("job").await, None);
    }

    #[tokio::test]
    async fn test_concurrent_workers_with_claims_process_once() {
        let store = MemoryStore::new();
        for i in 0..20 {
            put(&store, &format!("job-{}", i), json!({"status": "pending", "markdown": "x"})).await;
        }

        let a = poller_with(
            test_config("worker-a"),
            Arc::new(store.clone()),
            Arc::new(MarkdownRenderer::new()),
        );
        let b = poller_with(
            test_config("worker-b"),
            Arc::new(store.clone()),
            Arc::new(MarkdownRenderer::new()),
        );

        let shutdown = no_shutdown();
        let (stats_a, stats_b) = tokio::join!(a.scan_once(&shutdown), b.scan_once(&shutdown));

        assert_eq!(stats_a.unwrap().processed + stats_b.unwrap().processed, 20);
        for i in 0..20 {
            let record = read(&store, &format!("job-{}", i)).await;
            assert_eq!(record.status, JobStatus::Completed);
        }
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let store = MemoryStore::new();
        put(&store, "job", json!({"status": "pending", "markdown": "# Loop"})).await;

        let poller = poller(&store);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { poller.run(rx).await });

        // Wait for the job to be picked up by the loop
        let mut done = false;
        for _ in 0..200 {
            if read(&store, "job").await.status == JobStatus::Completed {
                done = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(done);

        tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("poller did not stop")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_long_pause() {
        let store = MemoryStore::new();
        let mut config = test_config("worker-1");
        config.poll_interval = Duration::from_secs(3600);
        let poller = poller_with(config, Arc::new(store), Arc::new(MarkdownRenderer::new()));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { poller.run(rx).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("poller did not stop")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_run_gives_up_when_store_stays_down() {
        let mut config = test_config("worker-1");
        config.max_store_retries = 3;

        let store = FlakyStore {
            inner: MemoryStore::new(),
            failures: AtomicUsize::new(usize::MAX),
        };
        let poller = poller_with(config, Arc::new(store), Arc::new(MarkdownRenderer::new()));

        let result = tokio::time::timeout(Duration::from_secs(5), poller.run(no_shutdown()))
            .await
            .expect("poller kept retrying");

        let err = result.unwrap_err();
        assert!(format!("{:#}", err).contains("3 consecutive failed scans"));
    }

    #[tokio::test]
    async fn test_run_recovers_from_transient_store_failure() {
        let mut config = test_config("worker-1");
        config.max_store_retries = 3;

        let memory = MemoryStore::new();
        put(&memory, "job", json!({"status": "pending", "markdown": "ok"})).await;

        let store = FlakyStore {
            inner: memory.clone(),
            failures: AtomicUsize::new(2),
        };
        let poller = poller_with(config, Arc::new(store), Arc::new(MarkdownRenderer::new()));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { poller.run(rx).await });

        let mut done = false;
        for _ in 0..200 {
            if read(&memory, "job").await.status == JobStatus::Completed {
                done = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(done);

        tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("poller did not stop")
            .unwrap();
        assert!(result.is_ok());
    }

    #[test]
    fn test_scan_stats_record() {
        let mut stats = ScanStats::default();
        stats.record(Some(JobStatus::Completed));
        stats.record(Some(JobStatus::Failed));
        stats.record(Some(JobStatus::Completed));
        stats.record(None);

        assert_eq!(
            stats,
            ScanStats {
                scanned: 0,
                processed: 3,
                completed: 2,
                failed: 1,
                skipped: 1,
            }
        );
    }
}
