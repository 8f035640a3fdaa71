//! Structured logging schema and field name constants.
//!
//! All crates use these names for structured `tracing` fields so that log
//! aggregation can query one run, one job, or one item across subsystems.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service, requires operator attention |
//! | WARN  | Recoverable issue, automatic fallback applied |
//! | INFO  | Lifecycle events (startup, shutdown), operation completions |
//! | DEBUG | Decision points, intermediate values, config choices |
//! | TRACE | Per-item iteration |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Correlation ID minted per pipeline run and stamped on each job.
/// Format: UUIDv7 (time-ordered).
pub const CORRELATION_ID: &str = "correlation_id";

/// Subsystem originating the log event.
/// Values: "db", "jobs", "pipeline", "watchdog"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "worker", "processor", "controller", "pool", "queue"
pub const COMPONENT: &str = "component";

/// Logical operation name.
/// Examples: "enqueue", "dequeue", "purge", "process_full"
pub const OPERATION: &str = "op";

// ─── Entity fields ─────────────────────────────────────────────────────────

/// Job UUID being processed.
pub const JOB_ID: &str = "job_id";

/// Queue instance name ("combined", "metadata", "embedding").
pub const QUEUE: &str = "queue";

/// Catalog id of the item being operated on.
pub const ITEM_ID: &str = "item_id";

/// Processing mode ("full", "metadata", "embedding").
pub const MODE: &str = "mode";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Number of items in a batch or query result.
pub const ITEM_COUNT: &str = "item_count";

/// Number of items that succeeded in a batch.
pub const SUCCEEDED: &str = "succeeded";

/// Attempt number of a job (1-based).
pub const ATTEMPT: &str = "attempt";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_names_are_snake_case() {
        for name in [
            CORRELATION_ID,
            SUBSYSTEM,
            COMPONENT,
            OPERATION,
            JOB_ID,
            QUEUE,
            ITEM_ID,
            MODE,
            DURATION_MS,
            ITEM_COUNT,
            SUCCEEDED,
            ATTEMPT,
            ERROR_MSG,
        ] {
            assert!(name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c == '_'));
        }
    }
}
