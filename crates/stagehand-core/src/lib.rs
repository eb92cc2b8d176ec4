//! Core types and traits for the stagehand reconciliation engine.
//!
//! This crate contains:
//! - The error taxonomy shared by every crate
//! - `ResourceStatus` and the stack lifecycle classification
//! - Order-insensitive template diffing
//! - Bounded polling and per-instance read caches
//! - Secret and builder abstractions
//! - Control-plane client traits and an in-memory implementation

pub mod builder;
pub mod cache;
pub mod cloud;
pub mod diff;
pub mod error;
pub mod secret;
pub mod status;
pub mod wait;

pub use error::{Error, Result};
pub use status::ResourceStatus;
