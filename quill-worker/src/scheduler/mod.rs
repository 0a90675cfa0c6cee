//! Scheduler layer for the worker
//!
//! This layer drives the job lifecycle: it finds pending jobs in the store,
//! hands them to the processor and persists the outcome.

pub mod poller;

pub use poller::JobPoller;
