//! Render service
//!
//! Turns markdown into HTML. The renderer is a plain synchronous function
//! behind a trait so the processor can run it on the blocking pool and tests
//! can swap in renderers that fail, stall or panic.

use pulldown_cmark::{Options, Parser, html};
use std::time::Duration;
use thiserror::Error;

/// Reasons a job can fail to render
///
/// The `Display` text is what ends up in the record's `error` field.
#[derive(Debug, Error)]
pub enum RenderError {
    /// The record carries no markdown string to render
    #[error("invalid input")]
    InvalidInput,

    /// The renderer did not finish in time
    #[error("render timed out after {0:?}")]
    TimedOut(Duration),

    /// The renderer panicked
    #[error("renderer panicked: {0}")]
    Panicked(String),
}

/// Markdown to HTML conversion
///
/// Implementations must be pure: the same input always yields the same
/// output. Concurrent workers rendering the same job then write identical
/// results.
pub trait Renderer: Send + Sync {
    fn render(&self, markdown: &str) -> Result<String, RenderError>;
}

/// CommonMark renderer
pub struct MarkdownRenderer {
    options: Options,
}

impl MarkdownRenderer {
    /// Creates a renderer for plain CommonMark
    pub fn new() -> Self {
        Self {
            options: Options::empty(),
        }
    }

    /// Enables GitHub-flavored tables and strikethrough
    pub fn with_extensions(mut self) -> Self {
        self.options.insert(Options::ENABLE_TABLES);
        self.options.insert(Options::ENABLE_STRIKETHROUGH);
        self
    }
}

impl Default for MarkdownRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Renderer for MarkdownRenderer {
    fn render(&self, markdown: &str) -> Result<String, RenderError> {
        let parser = Parser::new_ext(markdown, self.options);
        let mut output = String::with_capacity(markdown.len() * 3 / 2);
        html::push_html(&mut output, parser);
        Ok(output)
    }
}
