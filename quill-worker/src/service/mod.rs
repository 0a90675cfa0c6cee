//! Service layer
//!
//! Services contain the business logic of the worker: rendering markdown
//! and turning a pending job into its outcome. They never touch the store;
//! persistence belongs to the scheduler.
//!
//! The renderer sits behind a trait so other implementations can be plugged in.

mod processor;
pub mod render;

pub use processor::JobProcessor;
pub use render::{MarkdownRenderer, Renderer};
