//! Quill Worker
//!
//! A stateless background worker that converts markdown jobs to HTML.
//!
//! Architecture:
//! - Configuration: Load settings from environment or defaults
//! - Repositories: Job records in the shared key-value store
//! - Services: Markdown rendering and job processing
//! - Scheduler: Store scanning and job lifecycle management
//!
//! Producers write `pending` records into the store. The worker scans the
//! store every few seconds, renders each pending job and writes back a
//! `completed` or `failed` record. It runs until interrupted.

mod config;
mod repository;
mod scheduler;
mod service;

use anyhow::{Context, Result};
use quill_store::RedisStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::repository::StoreJobRepository;
use crate::scheduler::JobPoller;
use crate::service::{JobProcessor, MarkdownRenderer};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "quill_worker=info,quill_store=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Quill worker");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;
    info!(
        "Loaded configuration: worker_id={}, key_pattern={}",
        config.worker_id, config.key_pattern
    );

    // Connect to the store (with retry logic)
    let store = connect_with_retry(&config).await?;
    info!("Connected to store");

    let repository = Arc::new(StoreJobRepository::new(Arc::new(store)));
    let renderer = if config.markdown_extensions {
        MarkdownRenderer::new().with_extensions()
    } else {
        MarkdownRenderer::new()
    };
    let processor = JobProcessor::new(Arc::new(renderer), config.render_timeout);

    info!(
        "Poll interval: {:?}, render timeout: {:?}, markdown extensions: {}",
        config.poll_interval, config.render_timeout, config.markdown_extensions
    );

    let poller = JobPoller::new(config, repository, processor);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received, finishing current job");
        let _ = shutdown_tx.send(true);
    });

    // Start polling loop
    if let Err(e) = poller.run(shutdown_rx).await {
        error!("Poller error: {:#}", e);
        return Err(e);
    }

    info!("Quill worker stopped");
    Ok(())
}

/// Connects to Redis with retry logic and exponential backoff
///
/// This handles the case where the store is not reachable yet when the
/// worker starts (common in container environments).
async fn connect_with_retry(config: &Config) -> Result<RedisStore> {
    const MAX_DELAY: Duration = Duration::from_secs(30);

    let mut attempt = 0;
    let mut delay = config.store_backoff;

    loop {
        attempt += 1;

        match RedisStore::connect(&config.redis_url, config.key_pattern.clone()).await {
            Ok(store) => {
                if attempt > 1 {
                    info!("Connected to store after {} attempt(s)", attempt);
                }
                return Ok(store);
            }
            Err(e) if !e.is_connection_error() => {
                return Err(e).context("Failed to connect to store");
            }
            Err(e) => {
                if attempt >= config.max_store_retries {
                    error!("Failed to connect to store after {} attempts", attempt);
                    return Err(e).context("Store unavailable");
                }

                warn!(
                    "Failed to connect to store (attempt {}/{}): {}",
                    attempt, config.max_store_retries, e
                );
                warn!("Retrying in {:?}...", delay);

                tokio::time::sleep(delay).await;

                // Exponential backoff with cap
                delay = (delay * 2).min(MAX_DELAY);
            }
        }
    }
}

/// Resolves on Ctrl-C, or SIGTERM on Unix
async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
