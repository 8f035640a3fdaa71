//! Queue handler that runs the batch processor for one queue's mode.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, warn};

use resonance_core::{ItemStore, Job, ProcessingStatus, QueueKind};

use crate::handler::{JobContext, JobHandler, JobResult};
use crate::processor::BatchProcessor;

/// Connects a queue to the [`BatchProcessor`].
pub struct PipelineJobHandler {
    kind: QueueKind,
    processor: Arc<BatchProcessor>,
    items: Arc<dyn ItemStore>,
}

impl PipelineJobHandler {
    pub fn new(kind: QueueKind, processor: Arc<BatchProcessor>, items: Arc<dyn ItemStore>) -> Self {
        Self {
            kind,
            processor,
            items,
        }
    }
}

#[async_trait]
impl JobHandler for PipelineJobHandler {
    fn queue_kind(&self) -> QueueKind {
        self.kind
    }

    async fn execute(&self, ctx: JobContext) -> JobResult {
        match self.processor.process(self.kind.mode(), ctx.item_ids()).await {
            Ok(outcome) => JobResult::Success(outcome),
            // Item-level failures are already recorded; anything reaching
            // here is the provider or the store being unavailable.
            Err(e) => {
                warn!(
                    subsystem = "jobs",
                    component = "pipeline_handler",
                    job_id = %ctx.job_id(),
                    correlation_id = %ctx.correlation_id(),
                    attempt = ctx.attempt(),
                    transient = e.is_transient(),
                    error = %e,
                    "Batch did not run to completion"
                );
                JobResult::Retry(e.to_string())
            }
        }
    }

    /// Mark every unfinished item of the job FAILED.
    async fn on_exhausted(&self, job: &Job, error: &str) {
        let items = match self.items.get_many(&job.item_ids).await {
            Ok(items) => items,
            Err(e) => {
                error!(
                    subsystem = "jobs",
                    component = "pipeline_handler",
                    job_id = %job.id,
                    error = %e,
                    "Could not load items of exhausted job"
                );
                return;
            }
        };

        let mut failed = 0usize;
        for item in items {
            let result = match self.kind {
                QueueKind::Embedding => match item.embedding_status {
                    Some(ProcessingStatus::Pending | ProcessingStatus::Processing) => self
                        .items
                        .set_embedding_status(&item.id, ProcessingStatus::Failed)
                        .await
                        .map(|_| true),
                    _ => Ok(false),
                },
                QueueKind::Combined | QueueKind::Metadata => match item.metadata_status {
                    ProcessingStatus::Pending | ProcessingStatus::Processing => {
                        self.items.record_failure(&item.id).await.map(|_| true)
                    }
                    _ => Ok(false),
                },
            };
            match result {
                Ok(true) => failed += 1,
                Ok(false) => {}
                Err(e) => error!(
                    subsystem = "jobs",
                    component = "pipeline_handler",
                    item_id = %item.id,
                    error = %e,
                    "Could not mark item failed"
                ),
            }
        }

        warn!(
            subsystem = "jobs",
            component = "pipeline_handler",
            job_id = %job.id,
            correlation_id = %job.correlation_id,
            queue = self.kind.as_str(),
            item_count = failed,
            %error,
            "Job exhausted, items marked failed"
        );
    }
}
