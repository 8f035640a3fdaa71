//! Pipeline controller: sync, enqueue, and operator control of the queues.
//!
//! [`PipelineService`] is built once per process with its collaborators
//! injected and cloned wherever it is needed. Every public call returns a
//! response value; failures are reported through `success` and `message`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use resonance_core::{
    new_v7, BatchOutcome, CatalogSync, ConfigResolver, ControlResponse, EmbeddingGenerator, Error,
    ImmediateResponse, ItemStore, JobQueue, MetadataGenerator, NewJob, PipelineSettings,
    PipelineState, PipelineStatus, ProcessingMode, QueueKind, QueueStatus, Result, ScheduleStore,
    StartOptions, StartResponse, StopResponse,
};
use resonance_db::Database;

use crate::pipeline_handler::PipelineJobHandler;
use crate::processor::BatchProcessor;
use crate::rate_limit::HandlerRateLimiter;
use crate::watchdog::{PeriodicTask, ResumeWatchdog};
use crate::worker::{attach, WorkerConfig, WorkerEvent, WorkerHandle};

/// Builder for [`PipelineService`].
#[derive(Default)]
pub struct PipelineServiceBuilder {
    items: Option<Arc<dyn ItemStore>>,
    schedules: Option<Arc<dyn ScheduleStore>>,
    queues: BTreeMap<QueueKind, Arc<dyn JobQueue>>,
    sync: Option<Arc<dyn CatalogSync>>,
    metadata: Option<Arc<dyn MetadataGenerator>>,
    embeddings: Option<Arc<dyn EmbeddingGenerator>>,
    config: Option<Arc<ConfigResolver>>,
}

impl PipelineServiceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the item store, schedule store, and all three queues from `db`.
    pub fn with_database(mut self, db: &Database) -> Self {
        let items: Arc<dyn ItemStore> = db.items.clone();
        let schedules: Arc<dyn ScheduleStore> = db.schedules.clone();
        self.items = Some(items);
        self.schedules = Some(schedules);
        for kind in QueueKind::ALL {
            let queue: Arc<dyn JobQueue> = db.queue(kind);
            self.queues.insert(kind, queue);
        }
        self
    }

    pub fn with_item_store(mut self, items: Arc<dyn ItemStore>) -> Self {
        self.items = Some(items);
        self
    }

    pub fn with_schedule_store(mut self, schedules: Arc<dyn ScheduleStore>) -> Self {
        self.schedules = Some(schedules);
        self
    }

    /// Register a queue under its own kind.
    pub fn with_queue(mut self, queue: Arc<dyn JobQueue>) -> Self {
        self.queues.insert(queue.kind(), queue);
        self
    }

    pub fn with_catalog_sync(mut self, sync: Arc<dyn CatalogSync>) -> Self {
        self.sync = Some(sync);
        self
    }

    pub fn with_metadata_generator(mut self, metadata: Arc<dyn MetadataGenerator>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_embedding_generator(mut self, embeddings: Arc<dyn EmbeddingGenerator>) -> Self {
        self.embeddings = Some(embeddings);
        self
    }

    /// Defaults to a resolver reading the process environment.
    pub fn with_config(mut self, config: Arc<ConfigResolver>) -> Self {
        self.config = Some(config);
        self
    }

    pub fn build(self) -> Result<PipelineService> {
        fn required<T>(value: Option<T>, what: &str) -> Result<T> {
            value.ok_or_else(|| Error::Config(format!("pipeline service needs {}", what)))
        }

        let items = required(self.items, "an item store")?;
        let schedules = required(self.schedules, "a schedule store")?;
        let sync = required(self.sync, "a catalog sync adapter")?;
        let metadata = required(self.metadata, "a metadata generator")?;
        let embeddings = required(self.embeddings, "an embedding generator")?;
        for kind in QueueKind::ALL {
            if !self.queues.contains_key(&kind) {
                return Err(Error::Config(format!("pipeline service needs a {} queue", kind)));
            }
        }
        let config = self
            .config
            .unwrap_or_else(|| Arc::new(ConfigResolver::from_env()));

        let processor = Arc::new(BatchProcessor::new(items.clone(), metadata, embeddings));
        let limiter = Arc::new(HandlerRateLimiter::from_settings(&config.resolve())?);
        Ok(PipelineService {
            inner: Arc::new(Inner {
                items,
                schedules,
                queues: self.queues,
                sync,
                processor,
                config,
                state: Mutex::new(PipelineState::Idle),
                run: Mutex::new(None),
                workers: Mutex::new(HashMap::new()),
                limiter,
                watchdog: Mutex::new(None),
            }),
        })
    }
}

/// Orchestrates sync → enqueue → run and exposes operator controls.
#[derive(Clone)]
pub struct PipelineService {
    inner: Arc<Inner>,
}

struct Inner {
    items: Arc<dyn ItemStore>,
    schedules: Arc<dyn ScheduleStore>,
    queues: BTreeMap<QueueKind, Arc<dyn JobQueue>>,
    sync: Arc<dyn CatalogSync>,
    processor: Arc<BatchProcessor>,
    config: Arc<ConfigResolver>,
    state: Mutex<PipelineState>,
    /// Background task of the current `start()` run.
    run: Mutex<Option<JoinHandle<()>>>,
    workers: Mutex<HashMap<QueueKind, WorkerHandle>>,
    /// One budget for the life of the service; new limits are applied
    /// when a worker is attached.
    limiter: Arc<HandlerRateLimiter>,
    watchdog: Mutex<Option<PeriodicTask>>,
}

impl PipelineService {
    pub fn builder() -> PipelineServiceBuilder {
        PipelineServiceBuilder::new()
    }

    /// Settings as they would apply to an operation started now.
    pub fn settings(&self) -> PipelineSettings {
        self.inner.config.resolve()
    }

    pub fn config(&self) -> &ConfigResolver {
        &self.inner.config
    }

    pub async fn state(&self) -> PipelineState {
        *self.inner.state.lock().await
    }

    /// Begin a pipeline run.
    ///
    /// Unless `dry_run` is set, the sync and enqueue steps run in the
    /// background and the response carries no final counts.
    #[instrument(skip(self), fields(subsystem = "pipeline", component = "controller", op = "start"))]
    pub async fn start(&self, opts: StartOptions) -> StartResponse {
        let settings = self.settings();

        // Held until the run's handle is stored so `stop()` cannot slip in
        // between the state change and the spawn.
        let mut run = self.inner.run.lock().await;
        let mut state = self.inner.state.lock().await;
        if *state != PipelineState::Idle {
            info!(state = %*state, "Start requested while busy");
            return StartResponse {
                success: false,
                message: format!("Pipeline is busy ({})", *state),
                pending_count: 0,
                jobs_created: 0,
                dry_run: opts.dry_run.then_some(true),
            };
        }

        if opts.dry_run {
            if !opts.skip_sync {
                *state = PipelineState::Syncing;
            }
            drop(state);
            drop(run);
            let preview = self.inner.preview(&settings, opts).await;
            *self.inner.state.lock().await = PipelineState::Idle;
            return preview;
        }

        *state = if opts.skip_sync {
            PipelineState::Enqueuing
        } else {
            PipelineState::Syncing
        };
        drop(state);

        let correlation_id = new_v7();
        let inner = self.inner.clone();
        *run = Some(tokio::spawn(async move {
            inner.run(settings, opts, correlation_id).await;
        }));
        drop(run);

        info!(
            %correlation_id,
            mode = opts.mode.as_str(),
            skip_sync = opts.skip_sync,
            limit = ?opts.limit,
            "Pipeline run started"
        );
        StartResponse {
            success: true,
            message: format!("Pipeline started (run {})", correlation_id),
            pending_count: 0,
            jobs_created: 0,
            dry_run: None,
        }
    }

    /// Wait for the background part of the current `start()` run.
    pub async fn wait_for_run(&self) {
        let handle = self.inner.run.lock().await.take();
        if let Some(handle) = handle {
            join_run(handle).await;
        }
    }

    /// Pause one queue. The pipeline state is unaffected.
    pub async fn pause(&self, kind: QueueKind) -> ControlResponse {
        match self.inner.queue(kind).pause().await {
            Ok(()) => ControlResponse::ok(format!("{} queue paused", kind)),
            Err(e) => {
                error!(subsystem = "pipeline", component = "controller", op = "pause", queue = kind.as_str(), error = %e, "Pause failed");
                ControlResponse::error(format!("Failed to pause {} queue: {}", kind, e))
            }
        }
    }

    /// Pause one queue and let the watchdog resume it after `duration`.
    pub async fn pause_for(&self, kind: QueueKind, duration: Duration) -> ControlResponse {
        let result: Result<_> = async {
            let delta = chrono::Duration::from_std(duration)
                .map_err(|e| Error::InvalidInput(format!("pause duration out of range: {}", e)))?;
            let resume_at = Utc::now() + delta;
            self.inner.queue(kind).pause().await?;
            self.inner.schedules.set_resume_at(kind, resume_at).await?;
            Ok(resume_at)
        }
        .await;

        match result {
            Ok(resume_at) => {
                info!(subsystem = "pipeline", component = "controller", op = "pause_for", queue = kind.as_str(), %resume_at, "Queue paused with resume deadline");
                ControlResponse::ok(format!("{} queue paused until {}", kind, resume_at.to_rfc3339()))
            }
            Err(e) => {
                error!(subsystem = "pipeline", component = "controller", op = "pause_for", queue = kind.as_str(), error = %e, "Timed pause failed");
                ControlResponse::error(format!("Failed to pause {} queue: {}", kind, e))
            }
        }
    }

    /// Resume one queue, clear its resume deadline, and make sure a worker
    /// is consuming it.
    pub async fn resume(&self, kind: QueueKind) -> ControlResponse {
        let settings = self.settings();
        let result: Result<()> = async {
            self.inner.queue(kind).resume().await?;
            self.inner.schedules.clear_resume_at(kind).await?;
            self.inner.ensure_worker(kind, &settings).await
        }
        .await;

        match result {
            Ok(()) => ControlResponse::ok(format!("{} queue resumed", kind)),
            Err(e) => {
                error!(subsystem = "pipeline", component = "controller", op = "resume", queue = kind.as_str(), error = %e, "Resume failed");
                ControlResponse::error(format!("Failed to resume {} queue: {}", kind, e))
            }
        }
    }

    /// Hard stop of every queue.
    ///
    /// Pauses and purges the queues, signals the workers to stop claiming
    /// jobs, and returns interrupted items to PENDING. Handler calls already
    /// in flight are not aborted.
    #[instrument(skip(self), fields(subsystem = "pipeline", component = "controller", op = "stop"))]
    pub async fn stop(&self) -> StopResponse {
        let mut errors: Vec<String> = Vec::new();

        // Held for the whole stop so no new run starts until it returns.
        let mut run = self.inner.run.lock().await;
        if let Some(handle) = run.take() {
            handle.abort();
            join_run(handle).await;
            debug!("Aborted in-progress pipeline run");
        }
        *self.inner.state.lock().await = PipelineState::Idle;

        let mut cleared = 0u64;
        for (kind, queue) in &self.inner.queues {
            if let Err(e) = queue.pause().await {
                errors.push(format!("pause {}: {}", kind, e));
            }
            match queue.purge().await {
                Ok(n) => cleared += n,
                Err(e) => errors.push(format!("purge {}: {}", kind, e)),
            }
            if let Err(e) = self.inner.schedules.clear_resume_at(*kind).await {
                errors.push(format!("clear schedule {}: {}", kind, e));
            }
        }

        let workers: Vec<WorkerHandle> = self.inner.workers.lock().await.drain().map(|(_, w)| w).collect();
        for worker in &workers {
            if let Err(e) = worker.shutdown().await {
                debug!(queue = worker.queue().as_str(), error = %e, "Worker already stopped");
            }
        }

        let mut reset = 0u64;
        match self.inner.items.reset_interrupted_metadata().await {
            Ok(n) => reset += n,
            Err(e) => errors.push(format!("reset metadata: {}", e)),
        }
        match self.inner.items.reset_interrupted_embeddings().await {
            Ok(n) => reset += n,
            Err(e) => errors.push(format!("reset embeddings: {}", e)),
        }
        drop(run);

        if errors.is_empty() {
            info!(cleared_jobs = cleared, reset_items = reset, "Pipeline stopped");
            StopResponse {
                success: true,
                message: format!(
                    "Pipeline stopped: cleared {} jobs, reset {} interrupted items",
                    cleared, reset
                ),
                cleared_jobs: cleared,
            }
        } else {
            error!(cleared_jobs = cleared, errors = ?errors, "Pipeline stop incomplete");
            StopResponse {
                success: false,
                message: format!("Pipeline stop incomplete: {}", errors.join("; ")),
                cleared_jobs: cleared,
            }
        }
    }

    /// Return FAILED items to PENDING for the next `start()`.
    pub async fn retry_failed(&self) -> ControlResponse {
        match self.inner.items.reset_failed_metadata().await {
            Ok(n) => {
                info!(subsystem = "pipeline", component = "controller", op = "retry_failed", item_count = n, "Failed items reset");
                ControlResponse::ok(format!("Reset {} failed items to pending", n))
            }
            Err(e) => {
                error!(subsystem = "pipeline", component = "controller", op = "retry_failed", error = %e, "Failed item reset failed");
                ControlResponse::error(format!("Failed to reset failed items: {}", e))
            }
        }
    }

    /// Merged read-only view of queues, item counts, and controller state.
    ///
    /// A count that cannot be read is reported as zero and logged.
    pub async fn status(&self) -> PipelineStatus {
        fn or_zero<T: Default>(result: Result<T>, what: &str) -> T {
            result.unwrap_or_else(|e| {
                warn!(subsystem = "pipeline", component = "controller", op = "status", error = %e, "Could not read {}", what);
                T::default()
            })
        }

        let mut queues = Vec::with_capacity(self.inner.queues.len());
        for (kind, queue) in &self.inner.queues {
            let snapshot = or_zero(queue.counts().await, "queue counts");
            let resume_at = or_zero(self.inner.schedules.resume_schedule(*kind).await, "resume schedule")
                .map(|s| s.resume_at);
            queues.push(QueueStatus {
                queue: *kind,
                snapshot,
                resume_at,
            });
        }

        PipelineStatus {
            queues,
            pending_songs: or_zero(self.inner.items.count_pending().await, "pending count"),
            pending_embeddings: or_zero(
                self.inner.items.count_pending_embeddings().await,
                "pending embedding count",
            ),
            total_songs: or_zero(self.inner.items.count_total().await, "total count"),
            pipeline_state: self.state().await,
        }
    }

    /// Process a small operator-chosen batch now, bypassing the queues.
    ///
    /// The ids are reset first so already-processed items run again. The
    /// call takes a permit from the same rate limiter as the workers.
    #[instrument(skip(self, ids), fields(subsystem = "pipeline", component = "controller", op = "process_immediate", mode = mode.as_str(), item_count = ids.len()))]
    pub async fn process_immediate(&self, ids: &[String], mode: ProcessingMode) -> ImmediateResponse {
        let settings = self.settings();

        let mut seen = HashSet::new();
        let ids: Vec<String> = ids
            .iter()
            .filter(|id| seen.insert(id.as_str()))
            .cloned()
            .collect();
        if ids.is_empty() {
            return ImmediateResponse {
                success: false,
                message: "No item ids given".to_string(),
                count: 0,
                total: 0,
            };
        }
        if ids.len() > settings.immediate_max {
            return ImmediateResponse {
                success: false,
                message: format!(
                    "Too many items: {} given, at most {} allowed",
                    ids.len(),
                    settings.immediate_max
                ),
                count: 0,
                total: ids.len(),
            };
        }

        let start = Instant::now();
        let result: Result<BatchOutcome> = async {
            self.inner.items.requeue(&ids, mode).await?;
            self.inner.limiter.acquire().await;
            self.inner.processor.process(mode, &ids).await
        }
        .await;

        match result {
            Ok(outcome) => {
                info!(succeeded = outcome.count, total = outcome.total, duration_ms = start.elapsed().as_millis() as u64, "Immediate batch processed");
                ImmediateResponse {
                    success: true,
                    message: format!("Processed {} of {} items", outcome.count, outcome.total),
                    count: outcome.count,
                    total: outcome.total,
                }
            }
            Err(e) => {
                error!(error = %e, "Immediate batch failed");
                ImmediateResponse {
                    success: false,
                    message: format!("Processing failed: {}", e),
                    count: 0,
                    total: ids.len(),
                }
            }
        }
    }

    /// Start the resume watchdog if it is not already running.
    pub async fn spawn_watchdog(&self) {
        let mut slot = self.inner.watchdog.lock().await;
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let watchdog = Arc::new(ResumeWatchdog::new(
            self.inner.schedules.clone(),
            self.inner.queues.values().cloned().collect(),
        ));
        *slot = Some(watchdog.spawn(self.settings().watchdog_interval));
    }

    /// Subscribe to one queue's worker events, if a worker is attached.
    pub async fn worker_events(&self, kind: QueueKind) -> Option<broadcast::Receiver<WorkerEvent>> {
        self.inner.workers.lock().await.get(&kind).map(|w| w.events())
    }

    /// Process shutdown: stop the watchdog, the current run, and every
    /// worker, waiting for in-flight jobs. Queue contents are kept.
    pub async fn shutdown(&self) {
        if let Some(watchdog) = self.inner.watchdog.lock().await.take() {
            watchdog.cancel().await;
        }
        let mut run = self.inner.run.lock().await;
        if let Some(handle) = run.take() {
            handle.abort();
            join_run(handle).await;
        }
        *self.inner.state.lock().await = PipelineState::Idle;
        drop(run);

        let workers: Vec<WorkerHandle> = self.inner.workers.lock().await.drain().map(|(_, w)| w).collect();
        for worker in workers {
            let _ = worker.shutdown().await;
            worker.join().await;
        }
        info!(subsystem = "pipeline", component = "controller", op = "shutdown", "Pipeline service shut down");
    }
}

impl Inner {
    fn queue(&self, kind: QueueKind) -> &Arc<dyn JobQueue> {
        // The builder refuses to build without all three queues.
        &self.queues[&kind]
    }

    /// Attach a worker to `kind` unless a live one is already attached.
    async fn ensure_worker(&self, kind: QueueKind, settings: &PipelineSettings) -> Result<()> {
        let mut workers = self.workers.lock().await;
        if workers.get(&kind).is_some_and(|w| !w.is_finished()) {
            return Ok(());
        }

        self.limiter
            .reconfigure(settings.rate_limit_max, settings.rate_limit_window)?;
        let handler = Arc::new(PipelineJobHandler::new(
            kind,
            self.processor.clone(),
            self.items.clone(),
        ));
        let handle = attach(
            self.queue(kind).clone(),
            handler,
            WorkerConfig::from_settings(settings),
            self.limiter.clone(),
        )?;
        workers.insert(kind, handle);
        debug!(subsystem = "pipeline", component = "controller", queue = kind.as_str(), "Worker attached");
        Ok(())
    }

    /// Pending count and job count a run would produce, without enqueuing.
    async fn preview(&self, settings: &PipelineSettings, opts: StartOptions) -> StartResponse {
        let result: Result<u64> = async {
            if !opts.skip_sync {
                let summary = self.sync.sync(opts.limit).await?;
                debug!(subsystem = "pipeline", component = "controller", op = "dry_run", ?summary, "Dry-run sync finished");
            }
            let pending = match opts.mode {
                ProcessingMode::Embedding => self.items.count_pending_embeddings().await?,
                ProcessingMode::Full | ProcessingMode::Metadata => self.items.count_pending().await?,
            };
            Ok(match opts.limit {
                Some(limit) => pending.min(limit as u64),
                None => pending,
            })
        }
        .await;

        match result {
            Ok(pending) => {
                let jobs = settings.jobs_for(pending as usize) as u64;
                info!(subsystem = "pipeline", component = "controller", op = "dry_run", pending_count = pending, jobs_created = jobs, "Dry run computed");
                StartResponse {
                    success: true,
                    message: format!("Dry run: {} pending items would create {} jobs", pending, jobs),
                    pending_count: pending,
                    jobs_created: jobs,
                    dry_run: Some(true),
                }
            }
            Err(e) => {
                error!(subsystem = "pipeline", component = "controller", op = "dry_run", error = %e, "Dry run failed");
                StartResponse {
                    success: false,
                    message: format!("Dry run failed: {}", e),
                    pending_count: 0,
                    jobs_created: 0,
                    dry_run: Some(true),
                }
            }
        }
    }

    /// Background part of `start()`. Always leaves the state idle.
    async fn run(&self, settings: PipelineSettings, opts: StartOptions, correlation_id: Uuid) {
        let start = Instant::now();
        match self.sync_and_enqueue(&settings, opts, correlation_id).await {
            Ok((pending, jobs)) => info!(
                subsystem = "pipeline",
                component = "controller",
                op = "run",
                %correlation_id,
                pending_count = pending,
                jobs_created = jobs,
                duration_ms = start.elapsed().as_millis() as u64,
                "Pipeline run enqueued"
            ),
            Err(e) => error!(
                subsystem = "pipeline",
                component = "controller",
                op = "run",
                %correlation_id,
                error = %e,
                "Pipeline run failed"
            ),
        }
        *self.state.lock().await = PipelineState::Idle;
    }

    async fn sync_and_enqueue(
        &self,
        settings: &PipelineSettings,
        opts: StartOptions,
        correlation_id: Uuid,
    ) -> Result<(usize, usize)> {
        if !opts.skip_sync {
            let summary = self.sync.sync(opts.limit).await?;
            info!(
                subsystem = "pipeline",
                component = "controller",
                %correlation_id,
                added = summary.added,
                updated = summary.updated,
                skipped = summary.skipped,
                "Catalog sync finished"
            );
            *self.state.lock().await = PipelineState::Enqueuing;
        }

        let kind = opts.mode.queue_kind();
        let pending = match opts.mode {
            ProcessingMode::Embedding => self.items.get_pending_embeddings(opts.limit).await?,
            ProcessingMode::Full | ProcessingMode::Metadata => {
                self.items.get_pending(opts.limit).await?
            }
        };
        let ids: Vec<String> = pending.into_iter().map(|item| item.id).collect();

        let queue = self.queue(kind);
        let mut jobs = 0;
        for batch in ids.chunks(settings.batch_size) {
            queue
                .enqueue(NewJob {
                    correlation_id,
                    item_ids: batch.to_vec(),
                })
                .await?;
            jobs += 1;
        }

        self.ensure_worker(kind, settings).await?;
        queue.resume().await?;
        self.schedules.clear_resume_at(kind).await?;
        Ok((ids.len(), jobs))
    }
}

/// Wait for a run task to end; cancellation is expected after `abort()`.
async fn join_run(handle: JoinHandle<()>) {
    if let Err(e) = handle.await {
        if !e.is_cancelled() {
            error!(subsystem = "pipeline", component = "controller", error = ?e, "Pipeline run panicked");
        }
    }
}
