//! Core traits for the pipeline's collaborators.
//!
//! These traits define the interfaces that concrete implementations must
//! satisfy: the durable stores the pipeline owns, and the external AI and
//! catalog collaborators it calls.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::error::Result;
use crate::models::*;

// =============================================================================
// ITEM STATE STORE
// =============================================================================

/// Durable record of each item's enrichment state.
///
/// Every write touches one item atomically. Multi-item operations run one
/// write per item inside a single transaction. Reads reflect writes made
/// by the same process immediately.
#[async_trait]
pub trait ItemStore: Send + Sync {
    /// Insert or refresh a catalog entry (used by the sync adapter).
    async fn upsert(&self, item: &CatalogItem) -> Result<UpsertOutcome>;

    /// Fetch one item.
    async fn get(&self, id: &str) -> Result<Option<Item>>;

    /// Fetch several items, in the order given; unknown ids are skipped.
    async fn get_many(&self, ids: &[String]) -> Result<Vec<Item>>;

    /// Move PENDING items to PROCESSING. Returns the ids actually claimed.
    async fn mark_processing(&self, ids: &[String]) -> Result<Vec<String>>;

    /// Return claimed PROCESSING items to PENDING ahead of a retry.
    async fn release(&self, ids: &[String]) -> Result<u64>;

    /// Store a valid analysis: metadata COMPLETED, embedding PENDING.
    async fn record_success(
        &self,
        id: &str,
        payload: &JsonValue,
        derived: &DerivedFields,
    ) -> Result<()>;

    /// Mark the metadata half FAILED.
    async fn record_failure(&self, id: &str) -> Result<()>;

    /// Set the embedding status of one item.
    async fn set_embedding_status(&self, id: &str, status: ProcessingStatus) -> Result<()>;

    /// Mark embedding PROCESSING for items about to be embedded.
    async fn mark_embedding_processing(&self, ids: &[String]) -> Result<()>;

    /// Persist a vector: embedding COMPLETED.
    async fn save_vector(&self, id: &str, vector: &[f32]) -> Result<()>;

    /// Items whose metadata is PENDING, oldest first.
    async fn get_pending(&self, limit: Option<usize>) -> Result<Vec<Item>>;

    /// Items with metadata COMPLETED and embedding PENDING, oldest first.
    async fn get_pending_embeddings(&self, limit: Option<usize>) -> Result<Vec<Item>>;

    async fn count_pending(&self) -> Result<u64>;

    async fn count_pending_embeddings(&self) -> Result<u64>;

    async fn count_total(&self) -> Result<u64>;

    /// Force metadata PROCESSING back to PENDING. Returns rows changed.
    async fn reset_interrupted_metadata(&self) -> Result<u64>;

    /// Force embedding PROCESSING back to PENDING. Returns rows changed.
    async fn reset_interrupted_embeddings(&self) -> Result<u64>;

    /// Return FAILED metadata items to PENDING. Returns rows changed.
    async fn reset_failed_metadata(&self) -> Result<u64>;

    /// Operator reprocess: reset non-PROCESSING items so `mode` can claim
    /// them again. Returns rows changed.
    async fn requeue(&self, ids: &[String], mode: ProcessingMode) -> Result<u64>;
}

// =============================================================================
// JOB QUEUE
// =============================================================================

/// A durable, FIFO work queue of item batches.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Which queue instance this is.
    fn kind(&self) -> QueueKind;

    /// Handle notified on enqueue and resume, for idle consumers.
    fn notifier(&self) -> Arc<Notify>;

    /// Add a batch. Returns the new job id.
    async fn enqueue(&self, job: NewJob) -> Result<Uuid>;

    /// Claim the next due job, or `None` when paused or empty.
    async fn dequeue(&self) -> Result<Option<Job>>;

    /// Acknowledge success with the batch outcome.
    async fn complete(&self, job_id: Uuid, outcome: BatchOutcome) -> Result<()>;

    /// Put an active job back as delayed until `delay` has elapsed.
    async fn retry(&self, job_id: Uuid, error: &str, delay: Duration) -> Result<()>;

    /// Mark an active job failed for good.
    ///
    /// Returns `false` when the job is no longer active, e.g. it was purged
    /// while its handler ran.
    async fn fail(&self, job_id: Uuid, error: &str) -> Result<bool>;

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>>;

    async fn pause(&self) -> Result<()>;

    async fn resume(&self) -> Result<()>;

    async fn is_paused(&self) -> Result<bool>;

    /// Remove waiting, active, and delayed jobs. Returns the number removed.
    async fn purge(&self) -> Result<u64>;

    async fn counts(&self) -> Result<QueueSnapshot>;
}

// =============================================================================
// RESUME SCHEDULES
// =============================================================================

/// Key-value storage for per-queue resume deadlines.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn set_resume_at(&self, queue: QueueKind, at: DateTime<Utc>) -> Result<()>;

    async fn resume_schedule(&self, queue: QueueKind) -> Result<Option<ResumeSchedule>>;

    /// Remove the deadline. Returns whether one existed.
    async fn clear_resume_at(&self, queue: QueueKind) -> Result<bool>;
}

// =============================================================================
// EXTERNAL COLLABORATORS
// =============================================================================

/// Catalog-sync adapter that discovers new and changed items.
#[async_trait]
pub trait CatalogSync: Send + Sync {
    /// Upsert catalog entries into the item store, at most `limit` of them.
    async fn sync(&self, limit: Option<usize>) -> Result<SyncSummary>;
}

/// AI provider that describes a batch of items in one request.
#[async_trait]
pub trait MetadataGenerator: Send + Sync {
    /// May return fewer results than items; errors are provider-level.
    async fn generate_batch_metadata(&self, items: &[CatalogItem]) -> Result<Vec<AnalysisResult>>;
}

/// AI provider that turns text into vectors.
#[async_trait]
pub trait EmbeddingGenerator: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vector>;

    /// Batch variant; providers without one fall back to sequential calls.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vector>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            vectors.push(self.embed(text).await?);
        }
        Ok(vectors)
    }
}
