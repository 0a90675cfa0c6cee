//! Job domain types
//!
//! A job record is a flat JSON object stored under a producer-assigned key:
//!
//! ```json
//! {"status": "completed", "markdown": "# Hi", "html": "<h1>Hi</h1>\n",
//!  "completedAt": "2026-10-18T09:30:00+0000"}
//! ```

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// Format of `completedAt`: UTC wall clock with an explicit offset suffix
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%z";

/// Errors raised while reading or writing the record wire format
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("Failed to decode job record: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("Failed to encode job record: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Job lifecycle status
///
/// Transitions are monotonic: `Pending` moves to exactly one of the
/// terminal states and never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Completed,
    Failed,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Conversion job record
///
/// Fields the worker does not know about are kept in `extra` and written
/// back untouched. `markdown` is kept as raw JSON so that a pending record
/// with a malformed payload still decodes and can be failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub markdown: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl JobRecord {
    /// Creates a pending record, the shape a producer submits
    pub fn pending(markdown: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Pending,
            markdown: Some(Value::String(markdown.into())),
            html: None,
            completed_at: None,
            error: None,
            extra: Map::new(),
        }
    }

    /// Decodes a record from its stored bytes
    pub fn decode(bytes: &[u8]) -> Result<Self, RecordError> {
        serde_json::from_slice(bytes).map_err(RecordError::Decode)
    }

    /// Encodes the record into its stored bytes
    pub fn encode(&self) -> Result<Vec<u8>, RecordError> {
        serde_json::to_vec(self).map_err(RecordError::Encode)
    }

    /// The markdown payload, if present and a string
    pub fn markdown_text(&self) -> Option<&str> {
        self.markdown.as_ref().and_then(Value::as_str)
    }

    pub fn is_pending(&self) -> bool {
        self.status == JobStatus::Pending
    }

    /// Marks the job completed with the rendered output
    pub fn complete(mut self, html: String, at: DateTime<Utc>) -> Self {
        self.status = JobStatus::Completed;
        self.html = Some(html);
        self.completed_at = Some(format_timestamp(at));
        self.error = None;
        self
    }

    /// Marks the job failed; no partial output is kept
    pub fn fail(mut self, error: impl Into<String>) -> Self {
        self.status = JobStatus::Failed;
        self.html = None;
        self.completed_at = None;
        self.error = Some(error.into());
        self
    }

    /// Parses `completedAt`, if present and well formed
    pub fn completed_at_time(&self) -> Option<DateTime<FixedOffset>> {
        self.completed_at
            .as_deref()
            .and_then(|s| DateTime::parse_from_str(s, TIMESTAMP_FORMAT).ok())
    }

    /// Checks that the optional fields agree with the status
    ///
    /// completed: `html` and a parseable `completedAt`, no `error`.
    /// failed: `error`, no `html` or `completedAt`.
    /// pending: none of the three.
    pub fn is_consistent(&self) -> bool {
        match self.status {
            JobStatus::Pending => {
                self.html.is_none() && self.completed_at.is_none() && self.error.is_none()
            }
            JobStatus::Completed => {
                self.html.is_some() && self.completed_at_time().is_some() && self.error.is_none()
            }
            JobStatus::Failed => {
                self.error.is_some() && self.html.is_none() && self.completed_at.is_none()
            }
        }
    }
}

/// Formats a UTC instant in the record timestamp format
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}
