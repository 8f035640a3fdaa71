//! Core data models for the resonance enrichment pipeline.
//!
//! These types are shared across all resonance crates and represent the
//! catalog items, jobs, and controller views the pipeline works with.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

// =============================================================================
// ITEM TYPES
// =============================================================================

/// Embedding vector produced by the embedding provider.
pub type Vector = Vec<f32>;

/// Processing status shared by the metadata and embedding halves of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    /// Waiting to be picked up
    Pending,
    /// Held by exactly one consumer
    Processing,
    /// Finished successfully
    Completed,
    /// Finished unsuccessfully
    Failed,
}

impl ProcessingStatus {
    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProcessingStatus {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid processing status: {}", s)),
        }
    }
}

/// Identifying fields of a catalog entry, as delivered by the sync adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogItem {
    /// Catalog id (stable across syncs).
    pub id: String,
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
}

impl CatalogItem {
    pub fn new(id: impl Into<String>, title: impl Into<String>, artist: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            artist: artist.into(),
            album: None,
        }
    }

    pub fn with_album(mut self, album: impl Into<String>) -> Self {
        self.album = Some(album.into());
        self
    }
}

/// Searchable fields extracted from a valid analysis payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DerivedFields {
    #[serde(default)]
    pub genres: Vec<String>,
    #[serde(default)]
    pub moods: Vec<String>,
    pub energy: Option<f32>,
}

/// A catalog item together with its enrichment state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
    pub metadata_status: ProcessingStatus,
    /// Unset until metadata has been written for the first time.
    pub embedding_status: Option<ProcessingStatus>,
    /// Provider output, stored verbatim once valid.
    pub analysis: Option<JsonValue>,
    pub derived: Option<DerivedFields>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector: Option<Vector>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Item {
    /// Identifying fields handed to the metadata generator.
    pub fn catalog_ref(&self) -> CatalogItem {
        CatalogItem {
            id: self.id.clone(),
            title: self.title.clone(),
            artist: self.artist.clone(),
            album: self.album.clone(),
        }
    }
}

/// What an upsert did to the stored item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Added,
    Updated,
    Unchanged,
}

/// Result of a catalog sync run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSummary {
    pub added: u64,
    pub updated: u64,
    pub skipped: u64,
}

impl SyncSummary {
    /// Fold one upsert outcome into the summary.
    pub fn record(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Added => self.added += 1,
            UpsertOutcome::Updated => self.updated += 1,
            UpsertOutcome::Unchanged => self.skipped += 1,
        }
    }
}

/// Raw per-item output of the AI metadata generator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub item_id: String,
    /// Unparsed model output; expected to hold a JSON object.
    pub output: String,
}

impl AnalysisResult {
    pub fn new(item_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            output: output.into(),
        }
    }
}

// =============================================================================
// JOB TYPES
// =============================================================================

/// Which batch processor a job or immediate call runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingMode {
    /// Metadata then embedding in one pass
    #[default]
    Full,
    /// Metadata only; embedding left pending
    Metadata,
    /// Embedding only, from a stored analysis payload
    Embedding,
}

impl ProcessingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Metadata => "metadata",
            Self::Embedding => "embedding",
        }
    }

    /// Queue instance that carries jobs for this mode.
    pub fn queue_kind(&self) -> QueueKind {
        match self {
            Self::Full => QueueKind::Combined,
            Self::Metadata => QueueKind::Metadata,
            Self::Embedding => QueueKind::Embedding,
        }
    }
}

impl std::fmt::Display for ProcessingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProcessingMode {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "metadata" => Ok(Self::Metadata),
            "embedding" => Ok(Self::Embedding),
            _ => Err(format!("Invalid processing mode: {}", s)),
        }
    }
}

/// The three independently controllable queue instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueKind {
    Combined,
    Metadata,
    Embedding,
}

impl QueueKind {
    pub const ALL: [QueueKind; 3] = [QueueKind::Combined, QueueKind::Metadata, QueueKind::Embedding];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Combined => "combined",
            Self::Metadata => "metadata",
            Self::Embedding => "embedding",
        }
    }

    /// Processor run by this queue's worker.
    pub fn mode(&self) -> ProcessingMode {
        match self {
            Self::Combined => ProcessingMode::Full,
            Self::Metadata => ProcessingMode::Metadata,
            Self::Embedding => ProcessingMode::Embedding,
        }
    }
}

impl std::fmt::Display for QueueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for QueueKind {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "combined" => Ok(Self::Combined),
            "metadata" => Ok(Self::Metadata),
            "embedding" => Ok(Self::Embedding),
            _ => Err(format!("Invalid queue kind: {}", s)),
        }
    }
}

/// Status of a job in a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Waiting,
    Active,
    /// Waiting for a retry backoff to elapse
    Delayed,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Delayed => "delayed",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "waiting" => Ok(Self::Waiting),
            "active" => Ok(Self::Active),
            "delayed" => Ok(Self::Delayed),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

/// A batch of item references to enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub correlation_id: Uuid,
    pub item_ids: Vec<String>,
}

/// A job stored in a queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub queue: QueueKind,
    /// Shared by every job of one pipeline run, for log tracing.
    pub correlation_id: Uuid,
    pub item_ids: Vec<String>,
    pub status: JobStatus,
    /// Number of times the job has been dequeued.
    pub attempts: i32,
    pub max_attempts: i32,
    pub last_error: Option<String>,
    pub result: Option<BatchOutcome>,
    pub run_after: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Per-batch result: how many of the batch's items succeeded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub count: usize,
    pub total: usize,
}

impl BatchOutcome {
    pub fn new(count: usize, total: usize) -> Self {
        Self { count, total }
    }

    pub fn failed(&self) -> usize {
        self.total.saturating_sub(self.count)
    }

    pub fn is_complete(&self) -> bool {
        self.count == self.total
    }
}

// =============================================================================
// CONTROLLER TYPES
// =============================================================================

/// What the controller itself is doing, independent of any item status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    #[default]
    Idle,
    Syncing,
    Enqueuing,
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Syncing => write!(f, "syncing"),
            Self::Enqueuing => write!(f, "enqueuing"),
        }
    }
}

/// Live job counts of one queue instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
    pub paused: bool,
}

impl QueueSnapshot {
    /// Jobs a purge would remove.
    pub fn outstanding(&self) -> u64 {
        self.waiting + self.active + self.delayed
    }
}

/// Deadline after which the watchdog resumes a paused queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeSchedule {
    pub queue: QueueKind,
    pub resume_at: DateTime<Utc>,
}

impl ResumeSchedule {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.resume_at <= now
    }
}

/// Options for a pipeline run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartOptions {
    #[serde(default)]
    pub skip_sync: bool,
    /// Upper bound on the number of pending items enqueued.
    pub limit: Option<usize>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub mode: ProcessingMode,
}

/// Response of `start`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartResponse {
    pub success: bool,
    pub message: String,
    pub pending_count: u64,
    pub jobs_created: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dry_run: Option<bool>,
}

/// Response of `pause`, `resume`, and similar control calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlResponse {
    pub success: bool,
    pub message: String,
}

impl ControlResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Response of `stop`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopResponse {
    pub success: bool,
    pub message: String,
    pub cleared_jobs: u64,
}

/// One queue's entry in the status view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub queue: QueueKind,
    pub snapshot: QueueSnapshot,
    pub resume_at: Option<DateTime<Utc>>,
}

/// Read-only merged view returned by `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStatus {
    pub queues: Vec<QueueStatus>,
    pub pending_songs: u64,
    pub pending_embeddings: u64,
    pub total_songs: u64,
    pub pipeline_state: PipelineState,
}

impl PipelineStatus {
    pub fn queue(&self, kind: QueueKind) -> Option<&QueueStatus> {
        self.queues.iter().find(|q| q.queue == kind)
    }
}

/// Response of the immediate (bypass-queue) path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImmediateResponse {
    pub success: bool,
    pub message: String,
    pub count: usize,
    pub total: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_processing_status_round_trips_through_str() {
        for status in [
            ProcessingStatus::Pending,
            ProcessingStatus::Processing,
            ProcessingStatus::Completed,
            ProcessingStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<ProcessingStatus>().unwrap(), status);
        }
        assert!("stuck".parse::<ProcessingStatus>().is_err());
    }

    #[test]
    fn test_processing_status_serializes_lowercase() {
        let json = serde_json::to_string(&ProcessingStatus::Processing).unwrap();
        assert_eq!(json, "\"processing\"");
    }

    #[test]
    fn test_mode_and_queue_kind_are_paired() {
        for kind in QueueKind::ALL {
            assert_eq!(kind.mode().queue_kind(), kind);
        }
        assert_eq!(ProcessingMode::Full.queue_kind(), QueueKind::Combined);
    }

    #[test]
    fn test_queue_kind_from_str_is_case_insensitive() {
        assert_eq!("EMBEDDING".parse::<QueueKind>().unwrap(), QueueKind::Embedding);
        assert!("bulk".parse::<QueueKind>().is_err());
    }

    #[test]
    fn test_sync_summary_record() {
        let mut summary = SyncSummary::default();
        summary.record(UpsertOutcome::Added);
        summary.record(UpsertOutcome::Added);
        summary.record(UpsertOutcome::Updated);
        summary.record(UpsertOutcome::Unchanged);
        assert_eq!(
            summary,
            SyncSummary {
                added: 2,
                updated: 1,
                skipped: 1
            }
        );
    }

    #[test]
    fn test_batch_outcome_partial() {
        let outcome = BatchOutcome::new(4, 5);
        assert_eq!(outcome.failed(), 1);
        assert!(!outcome.is_complete());
        assert!(BatchOutcome::new(0, 0).is_complete());
    }

    #[test]
    fn test_queue_snapshot_outstanding_excludes_finished() {
        let snapshot = QueueSnapshot {
            waiting: 3,
            active: 2,
            completed: 10,
            failed: 1,
            delayed: 1,
            paused: false,
        };
        assert_eq!(snapshot.outstanding(), 6);
    }

    #[test]
    fn test_resume_schedule_is_due() {
        let now = Utc::now();
        let past = ResumeSchedule {
            queue: QueueKind::Combined,
            resume_at: now - chrono::Duration::seconds(1),
        };
        let future = ResumeSchedule {
            queue: QueueKind::Combined,
            resume_at: now + chrono::Duration::minutes(5),
        };
        assert!(past.is_due(now));
        assert!(!future.is_due(now));
    }

    #[test]
    fn test_start_options_defaults() {
        let opts: StartOptions = serde_json::from_str("{}").unwrap();
        assert!(!opts.skip_sync);
        assert!(!opts.dry_run);
        assert_eq!(opts.limit, None);
        assert_eq!(opts.mode, ProcessingMode::Full);
    }

    #[test]
    fn test_start_response_omits_dry_run_when_unset() {
        let response = StartResponse {
            success: true,
            message: "started".to_string(),
            pending_count: 0,
            jobs_created: 0,
            dry_run: None,
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(!json.contains("dry_run"));
    }
}
