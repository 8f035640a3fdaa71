//! Centralized default constants for the enrichment pipeline.
//!
//! **This module is the single source of truth** for shared default values.
//! The configuration resolver falls back to these when neither a runtime
//! override nor an environment variable supplies a value.

// =============================================================================
// BATCHING
// =============================================================================

/// Default number of items sent to the AI provider in one request.
pub const BATCH_SIZE: usize = 10;

/// Largest batch the provider accepts in one request payload.
pub const MAX_BATCH_SIZE: usize = 20;

/// Maximum ids accepted by the immediate (bypass-queue) path.
pub const IMMEDIATE_MAX: usize = 20;

// =============================================================================
// RATE LIMITING
// =============================================================================

/// Default maximum handler invocations per rate-limit window.
pub const RATE_LIMIT_MAX: u32 = 10;

/// Default rate-limit window in seconds (requests per minute).
pub const RATE_LIMIT_WINDOW_SECS: u64 = 60;

// =============================================================================
// JOB PROCESSING
// =============================================================================

/// Default concurrent handler invocations per queue worker.
pub const WORKER_CONCURRENCY: usize = 1;

/// Default maximum attempts (first run included) before a job is failed.
pub const JOB_MAX_ATTEMPTS: i32 = 3;

/// Base delay for exponential retry backoff, in milliseconds.
pub const BACKOFF_BASE_MS: u64 = 5_000;

/// Upper bound on a single retry delay, in milliseconds.
pub const BACKOFF_MAX_MS: u64 = 300_000;

/// Safety-net poll interval for idle workers, in milliseconds.
///
/// Enqueue and resume wake workers directly; polling only covers delayed
/// jobs becoming due.
pub const POLL_INTERVAL_MS: u64 = 1_000;

/// Broadcast channel capacity for worker events.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

// =============================================================================
// WATCHDOG
// =============================================================================

/// Interval between resume-schedule checks, in seconds.
pub const WATCHDOG_INTERVAL_SECS: u64 = 60;

// =============================================================================
// DATABASE
// =============================================================================

/// Default SQLite database URL.
pub const DATABASE_URL: &str = "sqlite://resonance.db";
