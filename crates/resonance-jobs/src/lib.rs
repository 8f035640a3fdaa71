//! # resonance-jobs
//!
//! Background processing for the resonance enrichment pipeline.
//!
//! This crate provides:
//! - Queue workers with bounded concurrency, a shared rate limiter, and
//!   retry with exponential backoff
//! - Batch processors for full, metadata-only, and embedding-only runs
//! - Repair and parsing of AI analysis responses
//! - The pipeline controller and the resume watchdog
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use resonance_db::Database;
//! use resonance_jobs::{PipelineService, StartOptions};
//!
//! let db = Database::connect("sqlite://resonance.db").await?;
//! let pipeline = PipelineService::builder()
//!     .with_database(&db)
//!     .with_catalog_sync(Arc::new(my_sync))
//!     .with_metadata_generator(Arc::new(my_llm))
//!     .with_embedding_generator(Arc::new(my_embedder))
//!     .build()?;
//!
//! pipeline.spawn_watchdog().await;
//! let response = pipeline.start(StartOptions::default()).await;
//! println!("{}", response.message);
//!
//! // Operator hard stop
//! let stopped = pipeline.stop().await;
//! println!("cleared {} jobs", stopped.cleared_jobs);
//! ```

pub mod analysis;
pub mod controller;
pub mod handler;
pub mod pipeline_handler;
pub mod processor;
pub mod rate_limit;
pub mod watchdog;
pub mod worker;

// Re-export core types
pub use resonance_core::*;

pub use analysis::{embedding_text, parse_analysis, repair_json, ParsedAnalysis, SongAnalysis};
pub use controller::{PipelineService, PipelineServiceBuilder};
pub use handler::{JobContext, JobHandler, JobResult, NoOpHandler};
pub use pipeline_handler::PipelineJobHandler;
pub use processor::BatchProcessor;
pub use rate_limit::HandlerRateLimiter;
pub use watchdog::{PeriodicTask, ResumeWatchdog};
pub use worker::{attach, Worker, WorkerBuilder, WorkerConfig, WorkerEvent, WorkerHandle};
