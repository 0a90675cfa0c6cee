//! Job processor
//!
//! Converts one pending record into its terminal state. Rendering runs on
//! the blocking pool under a timeout; every failure, including a renderer
//! panic, comes back as a `failed` record instead of an error.

use quill_core::domain::job::JobRecord;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::service::Renderer;
use crate::service::render::RenderError;

/// Renders pending records into completed or failed ones
pub struct JobProcessor {
    renderer: Arc<dyn Renderer>,
    render_timeout: Duration,
}

impl JobProcessor {
    /// Creates a new job processor
    ///
    /// # Arguments
    /// * `renderer` - The markdown renderer
    /// * `render_timeout` - Upper bound for a single render
    pub fn new(renderer: Arc<dyn Renderer>, render_timeout: Duration) -> Self {
        Self {
            renderer,
            render_timeout,
        }
    }

    /// Processes a pending record
    ///
    /// The caller is responsible for only passing pending records and for
    /// persisting the result.
    pub async fn process(&self, record: JobRecord) -> JobRecord {
        match self.render(record.markdown_text().map(str::to_owned)).await {
            Ok(html) => record.complete(html, chrono::Utc::now()),
            Err(e) => {
                debug!("Render failed: {}", e);
                record.fail(e.to_string())
            }
        }
    }

    /// `markdown` is `None` when the record has no string payload
    async fn render(&self, markdown: Option<String>) -> Result<String, RenderError> {
        let markdown = markdown.ok_or(RenderError::InvalidInput)?;
        let renderer = Arc::clone(&self.renderer);

        debug!("Rendering {} bytes of markdown", markdown.len());

        // A timed-out render keeps its blocking thread until it returns;
        // the output is dropped.
        let task = tokio::task::spawn_blocking(move || renderer.render(&markdown));

        match tokio::time::timeout(self.render_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(RenderError::Panicked(panic_message(join_error))),
            Err(_) => Err(RenderError::TimedOut(self.render_timeout)),
        }
    }
}

fn panic_message(join_error: tokio::task::JoinError) -> String {
    if !join_error.is_panic() {
        return join_error.to_string();
    }

    let payload = join_error.into_panic();
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
