//! Job handlers for each queue.

use async_trait::async_trait;
use uuid::Uuid;

use resonance_core::{BatchOutcome, Job, QueueKind};

/// Context provided to job handlers.
pub struct JobContext {
    /// The job being processed.
    pub job: Job,
}

impl JobContext {
    /// Create a new job context.
    pub fn new(job: Job) -> Self {
        Self { job }
    }

    pub fn job_id(&self) -> Uuid {
        self.job.id
    }

    pub fn correlation_id(&self) -> Uuid {
        self.job.correlation_id
    }

    /// Item ids carried by the job.
    pub fn item_ids(&self) -> &[String] {
        &self.job.item_ids
    }

    /// 1-based attempt number of this run.
    pub fn attempt(&self) -> i32 {
        self.job.attempts
    }
}

/// Result of job execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    /// Job ran; the outcome may still report failed items.
    Success(BatchOutcome),
    /// Job failed permanently.
    Failed(String),
    /// Job should be retried after a backoff delay.
    Retry(String),
}

/// Trait for job handlers.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// The queue whose jobs this handler processes.
    fn queue_kind(&self) -> QueueKind;

    /// Execute the job.
    async fn execute(&self, ctx: JobContext) -> JobResult;

    /// Called once when a job is failed for good (attempts exhausted or
    /// a permanent failure).
    async fn on_exhausted(&self, _job: &Job, _error: &str) {}

    /// Check if this handler can process jobs from the given queue.
    fn can_handle(&self, kind: QueueKind) -> bool {
        self.queue_kind() == kind
    }
}

/// No-op handler for testing.
pub struct NoOpHandler {
    kind: QueueKind,
}

impl NoOpHandler {
    /// Create a new no-op handler for the given queue.
    pub fn new(kind: QueueKind) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl JobHandler for NoOpHandler {
    fn queue_kind(&self) -> QueueKind {
        self.kind
    }

    async fn execute(&self, ctx: JobContext) -> JobResult {
        let total = ctx.item_ids().len();
        JobResult::Success(BatchOutcome::new(total, total))
    }
}
