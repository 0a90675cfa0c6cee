//! Core domain types
//!
//! These types describe what lives in the shared store. Producers write
//! pending records; the worker reads them and writes back the outcome.

pub mod job;
