//! Fake collaborators shared by the integration tests.
#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use resonance_db::test_fixtures::{catalog_items, TestDatabase};
use resonance_jobs::{
    AnalysisResult, CatalogItem, CatalogSync, ConfigResolver, EmbeddingGenerator, Error,
    ItemStore, MetadataGenerator, PipelineService, Result, SettingsOverride, SyncSummary, Vector,
};

/// How a scripted provider call fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    Transient,
    Permanent,
}

impl Failure {
    fn error(self) -> Error {
        match self {
            Failure::Transient => Error::TransientProvider("429 Too Many Requests".to_string()),
            Failure::Permanent => Error::Provider("401 Unauthorized".to_string()),
        }
    }
}

/// Valid analysis text for an item.
pub fn analysis_for(item: &CatalogItem) -> String {
    format!(
        r#"{{"description": "{} performed by {}", "genres": ["indie"], "moods": ["warm"], "themes": ["home"], "energy": 0.4}}"#,
        item.title, item.artist
    )
}

/// Metadata generator answering from a script.
#[derive(Default)]
pub struct FakeMetadataGenerator {
    malformed: Mutex<HashSet<String>>,
    omitted: Mutex<HashSet<String>>,
    failures: Mutex<VecDeque<Failure>>,
    calls: AtomicUsize,
    batch_sizes: Mutex<Vec<usize>>,
}

impl FakeMetadataGenerator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answer with unparseable text for this item.
    pub fn malformed(&self, id: &str) {
        self.malformed.lock().unwrap().insert(id.to_string());
    }

    /// Leave this item out of the response.
    pub fn omit(&self, id: &str) {
        self.omitted.lock().unwrap().insert(id.to_string());
    }

    /// Fail the next call.
    pub fn fail_next(&self, failure: Failure) {
        self.failures.lock().unwrap().push_back(failure);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.lock().unwrap().clone()
    }
}

#[async_trait]
impl MetadataGenerator for FakeMetadataGenerator {
    async fn generate_batch_metadata(&self, items: &[CatalogItem]) -> Result<Vec<AnalysisResult>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.batch_sizes.lock().unwrap().push(items.len());
        if let Some(failure) = self.failures.lock().unwrap().pop_front() {
            return Err(failure.error());
        }

        let malformed = self.malformed.lock().unwrap().clone();
        let omitted = self.omitted.lock().unwrap().clone();
        Ok(items
            .iter()
            .filter(|item| !omitted.contains(&item.id))
            .map(|item| {
                let output = if malformed.contains(&item.id) {
                    "Sorry, I cannot describe this track.".to_string()
                } else {
                    // Wrapped the way chat models tend to answer.
                    format!("```json\n{}\n```", analysis_for(item))
                };
                AnalysisResult::new(&item.id, output)
            })
            .collect())
    }
}

/// Embedding generator returning small deterministic vectors.
#[derive(Default)]
pub struct FakeEmbeddingGenerator {
    failures: Mutex<VecDeque<Failure>>,
    /// Drop this many vectors from the end of the next batch.
    short_by: AtomicUsize,
    calls: AtomicUsize,
}

impl FakeEmbeddingGenerator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next(&self, failure: Failure) {
        self.failures.lock().unwrap().push_back(failure);
    }

    pub fn return_short_by(&self, missing: usize) {
        self.short_by.store(missing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingGenerator for FakeEmbeddingGenerator {
    async fn embed(&self, text: &str) -> Result<Vector> {
        Ok(vec![text.len() as f32, 1.0, 0.5])
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vector>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(failure) = self.failures.lock().unwrap().pop_front() {
            return Err(failure.error());
        }
        let keep = texts
            .len()
            .saturating_sub(self.short_by.swap(0, Ordering::SeqCst));
        let mut vectors = Vec::with_capacity(keep);
        for text in &texts[..keep] {
            vectors.push(self.embed(text).await?);
        }
        Ok(vectors)
    }
}

/// Catalog sync upserting a fixed list of entries into the item store.
pub struct FakeCatalogSync {
    store: Arc<dyn ItemStore>,
    catalog: Mutex<Vec<CatalogItem>>,
    /// When set, `sync` waits for a notification before returning.
    gate: Mutex<Option<Arc<Notify>>>,
    calls: AtomicUsize,
}

impl FakeCatalogSync {
    pub fn new(store: Arc<dyn ItemStore>, catalog: Vec<CatalogItem>) -> Arc<Self> {
        Arc::new(Self {
            store,
            catalog: Mutex::new(catalog),
            gate: Mutex::new(None),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn set_catalog(&self, catalog: Vec<CatalogItem>) {
        *self.catalog.lock().unwrap() = catalog;
    }

    /// Block every following sync until the returned handle is notified.
    pub fn hold(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CatalogSync for FakeCatalogSync {
    async fn sync(&self, limit: Option<usize>) -> Result<SyncSummary> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let catalog = self.catalog.lock().unwrap().clone();
        let mut summary = SyncSummary::default();
        for item in catalog.iter().take(limit.unwrap_or(usize::MAX)) {
            summary.record(self.store.upsert(item).await?);
        }
        Ok(summary)
    }
}

/// A pipeline over a fresh in-memory database with fake providers.
pub struct TestPipeline {
    pub test_db: TestDatabase,
    pub service: PipelineService,
    pub sync: Arc<FakeCatalogSync>,
    pub metadata: Arc<FakeMetadataGenerator>,
    pub embeddings: Arc<FakeEmbeddingGenerator>,
}

impl TestPipeline {
    /// Fast settings: batches of 10, no meaningful rate limit, quick polls.
    pub fn fast_settings() -> SettingsOverride {
        SettingsOverride::default()
            .with_batch_size(10)
            .with_rate_limit(1_000, Duration::from_secs(1))
            .with_retry(3, Duration::from_millis(10), Duration::from_millis(40))
            .with_poll_interval(Duration::from_millis(20))
            .with_watchdog_interval(Duration::from_millis(20))
    }

    /// Pipeline whose catalog holds `catalog_size` entries, none synced yet.
    pub async fn new(catalog_size: usize) -> Self {
        Self::with_settings(catalog_size, Self::fast_settings()).await
    }

    pub async fn with_settings(catalog_size: usize, settings: SettingsOverride) -> Self {
        let test_db = TestDatabase::new().await;
        let sync = FakeCatalogSync::new(test_db.db.items.clone(), catalog_items(catalog_size));
        let metadata = FakeMetadataGenerator::new();
        let embeddings = FakeEmbeddingGenerator::new();

        let service = PipelineService::builder()
            .with_database(&test_db.db)
            .with_catalog_sync(sync.clone())
            .with_metadata_generator(metadata.clone())
            .with_embedding_generator(embeddings.clone())
            .with_config(Arc::new(ConfigResolver::new(settings)))
            .build()
            .expect("Failed to build pipeline service");

        Self {
            test_db,
            service,
            sync,
            metadata,
            embeddings,
        }
    }

    pub fn items(&self) -> Arc<dyn ItemStore> {
        self.test_db.db.items.clone()
    }
}

/// Poll `check` until it returns true or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Install a test subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
