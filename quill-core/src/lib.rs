//! Quill Core
//!
//! Core types shared by the Quill conversion worker.
//!
//! This crate contains:
//! - Domain types: the job record persisted in the shared store, its
//!   lifecycle states and wire format

pub mod domain;
