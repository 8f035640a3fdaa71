//! Queue consumer loop for processing batch jobs.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use resonance_core::config::exponential_backoff;
use resonance_core::{defaults, BatchOutcome, Error, Job, JobQueue, PipelineSettings, QueueKind, Result};

use crate::handler::{JobContext, JobHandler, JobResult};
use crate::rate_limit::HandlerRateLimiter;

/// Configuration for a queue worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Safety-net poll while idle; enqueue and resume also wake the worker.
    pub poll_interval: Duration,
    /// Maximum number of concurrent handler invocations.
    pub concurrency: usize,
    /// Upper bound on attempts; a job's own stamped limit may be lower.
    pub max_attempts: i32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Whether to enable job processing.
    pub enabled: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(defaults::POLL_INTERVAL_MS),
            concurrency: defaults::WORKER_CONCURRENCY,
            max_attempts: defaults::JOB_MAX_ATTEMPTS,
            backoff_base: Duration::from_millis(defaults::BACKOFF_BASE_MS),
            backoff_max: Duration::from_millis(defaults::BACKOFF_MAX_MS),
            enabled: true,
        }
    }
}

impl WorkerConfig {
    /// Worker settings taken from resolved pipeline settings.
    pub fn from_settings(settings: &PipelineSettings) -> Self {
        Self {
            poll_interval: settings.poll_interval,
            concurrency: settings.worker_concurrency.max(1),
            max_attempts: settings.max_attempts.max(1),
            backoff_base: settings.backoff_base,
            backoff_max: settings.backoff_max,
            enabled: true,
        }
    }

    /// Set the idle poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set maximum concurrent handler invocations.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Set the attempt cap.
    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set the retry backoff curve.
    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_max = max;
        self
    }

    /// Enable or disable job processing.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Delay before re-running a job whose `attempt`-th run asked for a retry.
    pub fn backoff_for(&self, attempt: i32) -> Duration {
        exponential_backoff(self.backoff_base, self.backoff_max, attempt)
    }
}

/// Event emitted by a queue worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// Worker started.
    WorkerStarted { queue: QueueKind },
    /// A job was claimed and is about to run.
    JobStarted {
        job_id: Uuid,
        queue: QueueKind,
        attempt: i32,
    },
    /// A job ran; the outcome may include failed items.
    JobCompleted {
        job_id: Uuid,
        queue: QueueKind,
        outcome: BatchOutcome,
    },
    /// A job was put back with a backoff delay.
    JobRetrying {
        job_id: Uuid,
        queue: QueueKind,
        attempt: i32,
        delay: Duration,
    },
    /// A job failed for good.
    JobFailed {
        job_id: Uuid,
        queue: QueueKind,
        error: String,
    },
    /// Worker stopped.
    WorkerStopped { queue: QueueKind },
}

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    queue: QueueKind,
    shutdown_tx: mpsc::Sender<()>,
    event_rx: broadcast::Receiver<WorkerEvent>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Queue this worker consumes.
    pub fn queue(&self) -> QueueKind {
        self.queue
    }

    /// Signal the worker to stop claiming jobs. In-flight jobs finish.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| Error::Internal("Failed to send shutdown signal".into()))?;
        Ok(())
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_rx.resubscribe()
    }

    /// Whether the consumer loop has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the consumer loop, and every job it started, to finish.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            error!(
                subsystem = "jobs",
                component = "worker",
                queue = self.queue.as_str(),
                error = ?e,
                "Worker task panicked"
            );
        }
    }
}

/// Consumer of one queue.
pub struct Worker {
    queue: Arc<dyn JobQueue>,
    handler: Arc<dyn JobHandler>,
    limiter: Option<Arc<HandlerRateLimiter>>,
    config: WorkerConfig,
    event_tx: broadcast::Sender<WorkerEvent>,
}

impl Worker {
    /// Start the worker and return a handle for control.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let event_rx = self.event_tx.subscribe();
        let queue = self.queue.kind();

        let task = tokio::spawn(async move {
            self.run(shutdown_rx).await;
        });

        WorkerHandle {
            queue,
            shutdown_tx,
            event_rx,
            task,
        }
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_tx.subscribe()
    }

    /// Run the consumer loop.
    ///
    /// Each in-flight job holds one semaphore permit, so at most
    /// `concurrency` handler calls run at once. The loop only sleeps when
    /// the queue is empty or paused.
    #[instrument(skip(self, shutdown_rx), fields(queue = self.queue.kind().as_str()))]
    async fn run(self, mut shutdown_rx: mpsc::Receiver<()>) {
        let kind = self.queue.kind();
        if !self.config.enabled {
            info!(subsystem = "jobs", component = "worker", "Worker is disabled, not starting");
            return;
        }

        info!(
            subsystem = "jobs",
            component = "worker",
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            concurrency = self.config.concurrency,
            rate_limited = self.limiter.is_some(),
            "Worker started"
        );
        let _ = self.event_tx.send(WorkerEvent::WorkerStarted { queue: kind });

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let notify = self.queue.notifier();
        let mut tasks = JoinSet::new();

        loop {
            while let Some(result) = tasks.try_join_next() {
                if let Err(e) = result {
                    error!(subsystem = "jobs", component = "worker", error = ?e, "Job task panicked");
                }
            }

            let permit = tokio::select! {
                _ = shutdown_rx.recv() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            // Register for wake-ups before looking, so an enqueue between
            // the empty dequeue and the wait is not missed.
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.queue.dequeue().await {
                Ok(Some(job)) => {
                    let runner = self.job_runner();
                    tasks.spawn(async move {
                        runner.execute_job(job).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        _ = &mut notified => {}
                        _ = sleep(self.config.poll_interval) => {}
                    }
                }
                Err(e) => {
                    drop(permit);
                    error!(subsystem = "jobs", component = "worker", error = %e, "Failed to claim job");
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        _ = sleep(self.config.poll_interval) => {}
                    }
                }
            }
        }

        info!(
            subsystem = "jobs",
            component = "worker",
            in_flight = tasks.len(),
            "Worker received shutdown signal"
        );
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(subsystem = "jobs", component = "worker", error = ?e, "Job task panicked");
            }
        }

        let _ = self.event_tx.send(WorkerEvent::WorkerStopped { queue: kind });
        info!(subsystem = "jobs", component = "worker", "Worker stopped");
    }

    fn job_runner(&self) -> JobRunner {
        JobRunner {
            queue: self.queue.clone(),
            handler: self.handler.clone(),
            limiter: self.limiter.clone(),
            config: self.config.clone(),
            event_tx: self.event_tx.clone(),
        }
    }
}

/// Reference bundle for executing a single job in a spawned task.
struct JobRunner {
    queue: Arc<dyn JobQueue>,
    handler: Arc<dyn JobHandler>,
    limiter: Option<Arc<HandlerRateLimiter>>,
    config: WorkerConfig,
    event_tx: broadcast::Sender<WorkerEvent>,
}

impl JobRunner {
    /// Execute a single claimed job and acknowledge it.
    async fn execute_job(self, job: Job) {
        let start = Instant::now();
        let job_id = job.id;
        let queue = job.queue;
        let attempt = job.attempts;
        let max_attempts = job.max_attempts.min(self.config.max_attempts);

        info!(
            subsystem = "jobs",
            component = "worker",
            op = "execute",
            %job_id,
            correlation_id = %job.correlation_id,
            queue = queue.as_str(),
            attempt,
            item_count = job.item_ids.len(),
            "Processing job"
        );
        let _ = self.event_tx.send(WorkerEvent::JobStarted {
            job_id,
            queue,
            attempt,
        });

        if let Some(limiter) = &self.limiter {
            limiter.acquire().await;
            // A stop() while waiting for a permit purges the job.
            match self.queue.get(job_id).await {
                Ok(None) => {
                    warn!(
                        subsystem = "jobs",
                        component = "worker",
                        %job_id,
                        "Job purged while waiting for a rate-limit permit, skipping"
                    );
                    return;
                }
                Ok(Some(_)) => {}
                Err(e) => {
                    warn!(subsystem = "jobs", component = "worker", %job_id, error = %e, "Could not re-check job before running");
                }
            }
        }

        let result = self.handler.execute(JobContext::new(job.clone())).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match result {
            JobResult::Success(outcome) => {
                if let Err(e) = self.queue.complete(job_id, outcome).await {
                    error!(subsystem = "jobs", component = "worker", error = %e, %job_id, "Failed to mark job as completed");
                    return;
                }
                info!(
                    subsystem = "jobs",
                    component = "worker",
                    %job_id,
                    correlation_id = %job.correlation_id,
                    succeeded = outcome.count,
                    total = outcome.total,
                    duration_ms,
                    "Job completed"
                );
                let _ = self.event_tx.send(WorkerEvent::JobCompleted {
                    job_id,
                    queue,
                    outcome,
                });
            }
            JobResult::Retry(error) if attempt < max_attempts => {
                let delay = self.config.backoff_for(attempt);
                if let Err(e) = self.queue.retry(job_id, &error, delay).await {
                    error!(subsystem = "jobs", component = "worker", error = %e, %job_id, "Failed to schedule job retry");
                    return;
                }
                warn!(
                    subsystem = "jobs",
                    component = "worker",
                    %job_id,
                    correlation_id = %job.correlation_id,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    %error,
                    "Job will be retried"
                );
                let _ = self.event_tx.send(WorkerEvent::JobRetrying {
                    job_id,
                    queue,
                    attempt,
                    delay,
                });
            }
            JobResult::Retry(error) | JobResult::Failed(error) => {
                match self.queue.fail(job_id, &error).await {
                    Ok(true) => self.handler.on_exhausted(&job, &error).await,
                    Ok(false) => {
                        // Purged while running; its items belong to whoever purged it.
                        info!(subsystem = "jobs", component = "worker", %job_id, %error, "Job removed before it could be failed");
                        return;
                    }
                    Err(e) => {
                        error!(subsystem = "jobs", component = "worker", error = %e, %job_id, "Failed to mark job as failed");
                        return;
                    }
                }
                error!(
                    subsystem = "jobs",
                    component = "worker",
                    %job_id,
                    correlation_id = %job.correlation_id,
                    attempt,
                    %error,
                    duration_ms,
                    "Job failed"
                );
                let _ = self.event_tx.send(WorkerEvent::JobFailed {
                    job_id,
                    queue,
                    error,
                });
            }
        }
        debug!(subsystem = "jobs", component = "worker", %job_id, "Job acknowledged");
    }
}

/// Builder for creating a queue worker.
pub struct WorkerBuilder {
    queue: Arc<dyn JobQueue>,
    config: WorkerConfig,
    handler: Option<Arc<dyn JobHandler>>,
    limiter: Option<Arc<HandlerRateLimiter>>,
}

impl WorkerBuilder {
    /// Create a new worker builder for a queue.
    pub fn new(queue: Arc<dyn JobQueue>) -> Self {
        Self {
            queue,
            config: WorkerConfig::default(),
            handler: None,
            limiter: None,
        }
    }

    /// Set the worker configuration.
    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the handler.
    pub fn with_handler<H: JobHandler + 'static>(self, handler: H) -> Self {
        self.with_shared_handler(Arc::new(handler))
    }

    /// Set a handler that is shared with other owners.
    pub fn with_shared_handler(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Gate every handler invocation on a shared rate limiter.
    pub fn with_rate_limiter(mut self, limiter: Arc<HandlerRateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Build and return the worker.
    pub fn build(self) -> Result<Worker> {
        let kind = self.queue.kind();
        let handler = self
            .handler
            .ok_or_else(|| Error::Config(format!("no handler for {} queue", kind)))?;
        if !handler.can_handle(kind) {
            return Err(Error::Config(format!(
                "{} handler cannot process {} queue",
                handler.queue_kind(),
                kind
            )));
        }

        let (event_tx, _) = broadcast::channel(defaults::EVENT_CHANNEL_CAPACITY);
        Ok(Worker {
            queue: self.queue,
            handler,
            limiter: self.limiter,
            config: self.config,
            event_tx,
        })
    }
}

/// Attach a handler to a queue and start consuming.
pub fn attach(
    queue: Arc<dyn JobQueue>,
    handler: Arc<dyn JobHandler>,
    config: WorkerConfig,
    limiter: Arc<HandlerRateLimiter>,
) -> Result<WorkerHandle> {
    let worker = WorkerBuilder::new(queue)
        .with_config(config)
        .with_shared_handler(handler)
        .with_rate_limiter(limiter)
        .build()?;
    Ok(worker.start())
}
