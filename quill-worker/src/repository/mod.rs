//! Repository layer
//!
//! Repositories wrap the shared store with job-shaped operations and hold
//! no business logic. They are trait-based so the scheduler can be tested
//! against in-memory or deliberately failing stores.

mod jobs;

pub use jobs::{JobRepository, StoreJobRepository};
