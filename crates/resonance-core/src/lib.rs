//! # resonance-core
//!
//! Core types, traits, and abstractions for the resonance enrichment
//! pipeline.
//!
//! This crate provides the data structures and trait definitions that the
//! storage and job crates depend on. It performs no I/O.

pub mod config;
pub mod defaults;
pub mod error;
pub mod logging;
pub mod models;
pub mod traits;

// Re-export commonly used types at crate root
pub use config::{ConfigResolver, PipelineSettings, SettingsOverride};
pub use error::{Error, Result};
pub use models::*;
pub use traits::*;

/// Generate a new time-ordered UUIDv7.
pub fn new_v7() -> uuid::Uuid {
    uuid::Uuid::now_v7()
}
