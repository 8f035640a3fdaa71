//! Batch processing shared by queue workers and the immediate path.
//!
//! Every function takes a list of item ids and returns how many of them
//! succeeded. Provider and parse failures become per-item status writes;
//! only store failures and transient provider errors come back as `Err`,
//! after the claimed items have been handed back to PENDING.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, trace, warn};

use resonance_core::{
    BatchOutcome, EmbeddingGenerator, Item, ItemStore, MetadataGenerator, ProcessingMode,
    ProcessingStatus, Result,
};

use crate::analysis::{embedding_text, parse_analysis, SongAnalysis};

/// An item whose metadata was just written, ready for embedding.
struct Described {
    item: Item,
    analysis: SongAnalysis,
}

/// Runs the three processing modes against the item store and providers.
pub struct BatchProcessor {
    items: Arc<dyn ItemStore>,
    metadata: Arc<dyn MetadataGenerator>,
    embeddings: Arc<dyn EmbeddingGenerator>,
}

impl BatchProcessor {
    pub fn new(
        items: Arc<dyn ItemStore>,
        metadata: Arc<dyn MetadataGenerator>,
        embeddings: Arc<dyn EmbeddingGenerator>,
    ) -> Self {
        Self {
            items,
            metadata,
            embeddings,
        }
    }

    /// Run the processor for `mode`.
    pub async fn process(&self, mode: ProcessingMode, ids: &[String]) -> Result<BatchOutcome> {
        let start = Instant::now();
        let outcome = match mode {
            ProcessingMode::Full => self.process_full(ids).await,
            ProcessingMode::Metadata => self.process_metadata(ids).await,
            ProcessingMode::Embedding => self.process_embedding(ids).await,
        }?;
        info!(
            subsystem = "jobs",
            component = "processor",
            mode = mode.as_str(),
            succeeded = outcome.count,
            total = outcome.total,
            duration_ms = start.elapsed().as_millis() as u64,
            "Batch processed"
        );
        Ok(outcome)
    }

    /// Metadata then embedding for each item.
    pub async fn process_full(&self, ids: &[String]) -> Result<BatchOutcome> {
        let total = ids.len();
        let described = match self.describe(ids).await? {
            Some(described) => described,
            None => return Ok(BatchOutcome::new(0, total)),
        };
        let count = described.len();
        self.embed_described(described).await?;
        Ok(BatchOutcome::new(count, total))
    }

    /// Metadata only; embedding is left PENDING for a later pass.
    pub async fn process_metadata(&self, ids: &[String]) -> Result<BatchOutcome> {
        let total = ids.len();
        let count = self.describe(ids).await?.map(|d| d.len()).unwrap_or(0);
        Ok(BatchOutcome::new(count, total))
    }

    /// Embedding only, from each item's stored analysis payload.
    pub async fn process_embedding(&self, ids: &[String]) -> Result<BatchOutcome> {
        let total = ids.len();
        let mut ready = Vec::with_capacity(ids.len());
        for item in self.items.get_many(ids).await? {
            let payload = match &item.analysis {
                Some(payload) if item.metadata_status == ProcessingStatus::Completed => payload,
                _ => {
                    warn!(
                        subsystem = "jobs",
                        component = "processor",
                        item_id = %item.id,
                        "Item has no stored analysis, skipping embedding"
                    );
                    continue;
                }
            };
            match SongAnalysis::from_payload(payload) {
                Ok(analysis) => ready.push(Described { item, analysis }),
                Err(e) => {
                    warn!(
                        subsystem = "jobs",
                        component = "processor",
                        item_id = %item.id,
                        error = %e,
                        "Stored analysis is unusable"
                    );
                    self.items
                        .set_embedding_status(&item.id, ProcessingStatus::Failed)
                        .await?;
                }
            }
        }

        if ready.is_empty() {
            return Ok(BatchOutcome::new(0, total));
        }
        let ready_ids: Vec<String> = ready.iter().map(|d| d.item.id.clone()).collect();
        self.items.mark_embedding_processing(&ready_ids).await?;

        let texts: Vec<String> = ready
            .iter()
            .map(|d| embedding_text(&d.item.title, &d.item.artist, &d.analysis))
            .collect();
        let vectors = match self.embeddings.embed_batch(&texts).await {
            Ok(vectors) => vectors,
            Err(e) if e.is_transient() => {
                for id in &ready_ids {
                    self.items
                        .set_embedding_status(id, ProcessingStatus::Pending)
                        .await?;
                }
                return Err(e);
            }
            Err(e) => {
                warn!(
                    subsystem = "jobs",
                    component = "processor",
                    item_count = ready_ids.len(),
                    error = %e,
                    "Embedding provider failed"
                );
                for id in &ready_ids {
                    self.items
                        .set_embedding_status(id, ProcessingStatus::Failed)
                        .await?;
                }
                return Ok(BatchOutcome::new(0, total));
            }
        };

        let count = self.save_vectors(&ready_ids, vectors).await?;
        Ok(BatchOutcome::new(count, total))
    }

    /// Claim items and write their metadata.
    ///
    /// Returns `None` when nothing could be described because of a
    /// permanent provider failure; the claimed items are then FAILED.
    async fn describe(&self, ids: &[String]) -> Result<Option<Vec<Described>>> {
        let claimed = self.items.mark_processing(ids).await?;
        if claimed.len() < ids.len() {
            debug!(
                subsystem = "jobs",
                component = "processor",
                requested = ids.len(),
                claimed = claimed.len(),
                "Some items were not pending and were skipped"
            );
        }
        if claimed.is_empty() {
            return Ok(Some(Vec::new()));
        }

        match self.describe_claimed(&claimed).await {
            Ok(described) => Ok(described),
            Err(e) => {
                // Anything not yet written goes back to PENDING for the retry.
                if let Err(release_err) = self.items.release(&claimed).await {
                    warn!(
                        subsystem = "jobs",
                        component = "processor",
                        error = %release_err,
                        "Failed to release claimed items"
                    );
                }
                Err(e)
            }
        }
    }

    async fn describe_claimed(&self, claimed: &[String]) -> Result<Option<Vec<Described>>> {
        let items = self.items.get_many(claimed).await?;
        let refs: Vec<_> = items.iter().map(Item::catalog_ref).collect();

        let results = match self.metadata.generate_batch_metadata(&refs).await {
            Ok(results) => results,
            Err(e) if e.is_transient() => return Err(e),
            Err(e) => {
                warn!(
                    subsystem = "jobs",
                    component = "processor",
                    item_count = claimed.len(),
                    error = %e,
                    "Metadata provider failed, marking batch failed"
                );
                for id in claimed {
                    self.items.record_failure(id).await?;
                }
                return Ok(None);
            }
        };

        let mut by_id: HashMap<String, String> = results
            .into_iter()
            .map(|r| (r.item_id, r.output))
            .collect();

        let mut described = Vec::with_capacity(items.len());
        for item in items {
            let Some(output) = by_id.remove(&item.id) else {
                warn!(
                    subsystem = "jobs",
                    component = "processor",
                    item_id = %item.id,
                    "Provider returned no analysis for item"
                );
                self.items.record_failure(&item.id).await?;
                continue;
            };

            match parse_analysis(&output) {
                Ok(parsed) => {
                    self.items
                        .record_success(&item.id, &parsed.payload, &parsed.analysis.derived())
                        .await?;
                    trace!(subsystem = "jobs", component = "processor", item_id = %item.id, "Metadata stored");
                    described.push(Described {
                        item,
                        analysis: parsed.analysis,
                    });
                }
                Err(e) => {
                    warn!(
                        subsystem = "jobs",
                        component = "processor",
                        item_id = %item.id,
                        error = %e,
                        "Malformed analysis, marking item failed"
                    );
                    self.items.record_failure(&item.id).await?;
                }
            }
        }
        Ok(Some(described))
    }

    /// Embed freshly described items. Failures only touch embedding status.
    async fn embed_described(&self, described: Vec<Described>) -> Result<usize> {
        if described.is_empty() {
            return Ok(0);
        }
        let ids: Vec<String> = described.iter().map(|d| d.item.id.clone()).collect();
        self.items.mark_embedding_processing(&ids).await?;

        let texts: Vec<String> = described
            .iter()
            .map(|d| embedding_text(&d.item.title, &d.item.artist, &d.analysis))
            .collect();
        match self.embeddings.embed_batch(&texts).await {
            Ok(vectors) => self.save_vectors(&ids, vectors).await,
            Err(e) => {
                warn!(
                    subsystem = "jobs",
                    component = "processor",
                    item_count = ids.len(),
                    error = %e,
                    "Embedding failed, metadata kept"
                );
                for id in &ids {
                    self.items
                        .set_embedding_status(id, ProcessingStatus::Failed)
                        .await?;
                }
                Ok(0)
            }
        }
    }

    /// Store vectors positionally; ids without a vector are FAILED.
    async fn save_vectors(&self, ids: &[String], vectors: Vec<Vec<f32>>) -> Result<usize> {
        if vectors.len() != ids.len() {
            warn!(
                subsystem = "jobs",
                component = "processor",
                expected = ids.len(),
                received = vectors.len(),
                "Embedding provider returned a different number of vectors"
            );
        }
        let mut vectors = vectors.into_iter();
        let mut saved = 0;
        for id in ids {
            match vectors.next() {
                Some(vector) if !vector.is_empty() => {
                    self.items.save_vector(id, &vector).await?;
                    saved += 1;
                }
                _ => {
                    self.items
                        .set_embedding_status(id, ProcessingStatus::Failed)
                        .await?;
                }
            }
        }
        Ok(saved)
    }
}
