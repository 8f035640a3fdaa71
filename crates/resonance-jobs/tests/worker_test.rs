//! Integration tests for queue workers.
//!
//! This test suite validates:
//! - Workers drain their queue in FIFO order and acknowledge outcomes
//! - Retry with backoff, then failure once attempts are exhausted
//! - The shared rate limiter spaces handler invocations
//! - A job purged while waiting for a permit is never handled
//! - Shutdown stops claiming and emits lifecycle events

mod helpers;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use helpers::wait_until;
use resonance_db::test_fixtures::TestDatabase;
use resonance_jobs::{
    attach, new_v7, BatchOutcome, HandlerRateLimiter, Job, JobContext, JobHandler, JobQueue,
    JobResult, JobStatus, NewJob, NoOpHandler, QueueKind, WorkerBuilder, WorkerConfig,
    WorkerEvent,
};
use uuid::Uuid;

fn fast_config() -> WorkerConfig {
    WorkerConfig::default()
        .with_poll_interval(Duration::from_millis(20))
        .with_backoff(Duration::from_millis(10), Duration::from_millis(40))
}

fn new_job(ids: &[&str]) -> NewJob {
    NewJob {
        correlation_id: new_v7(),
        item_ids: ids.iter().map(|s| s.to_string()).collect(),
    }
}

/// Records the item lists it sees and answers from a fixed result.
struct RecordingHandler {
    kind: QueueKind,
    result: JobResult,
    seen: Mutex<Vec<Vec<String>>>,
    exhausted: Mutex<Vec<Uuid>>,
}

impl RecordingHandler {
    fn new(kind: QueueKind, result: JobResult) -> Arc<Self> {
        Arc::new(Self {
            kind,
            result,
            seen: Mutex::new(Vec::new()),
            exhausted: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

#[async_trait]
impl JobHandler for RecordingHandler {
    fn queue_kind(&self) -> QueueKind {
        self.kind
    }

    async fn execute(&self, ctx: JobContext) -> JobResult {
        self.seen.lock().unwrap().push(ctx.item_ids().to_vec());
        self.result.clone()
    }

    async fn on_exhausted(&self, job: &Job, _error: &str) {
        self.exhausted.lock().unwrap().push(job.id);
    }
}

#[tokio::test]
async fn test_worker_drains_queue_in_order() {
    let test_db = TestDatabase::new().await;
    let queue = test_db.db.queue(QueueKind::Combined);
    let handler = RecordingHandler::new(
        QueueKind::Combined,
        JobResult::Success(BatchOutcome::new(1, 1)),
    );

    let first = queue.enqueue(new_job(&["a"])).await.unwrap();
    queue.enqueue(new_job(&["b"])).await.unwrap();
    queue.enqueue(new_job(&["c"])).await.unwrap();

    let handle = WorkerBuilder::new(queue.clone())
        .with_config(fast_config())
        .with_shared_handler(handler.clone())
        .build()
        .unwrap()
        .start();

    assert!(
        wait_until(Duration::from_secs(5), || async {
            queue.counts().await.unwrap().completed == 3
        })
        .await
    );
    handle.shutdown().await.unwrap();
    handle.join().await;

    let seen = handler.seen.lock().unwrap().clone();
    assert_eq!(seen, vec![vec!["a"], vec!["b"], vec!["c"]]);
    let job = queue.get(first).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result, Some(BatchOutcome::new(1, 1)));
}

#[tokio::test]
async fn test_enqueue_wakes_idle_worker() {
    let test_db = TestDatabase::new().await;
    let queue = test_db.db.queue(QueueKind::Metadata);
    let handle = WorkerBuilder::new(queue.clone())
        .with_config(fast_config().with_poll_interval(Duration::from_secs(60)))
        .with_handler(NoOpHandler::new(QueueKind::Metadata))
        .build()
        .unwrap()
        .start();

    // Let the worker go idle on its long poll.
    tokio::time::sleep(Duration::from_millis(50)).await;
    queue.enqueue(new_job(&["x", "y"])).await.unwrap();

    assert!(
        wait_until(Duration::from_secs(2), || async {
            queue.counts().await.unwrap().completed == 1
        })
        .await
    );
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_retry_then_exhaustion() {
    let test_db = TestDatabase::with_max_attempts(3).await;
    let queue = test_db.db.queue(QueueKind::Combined);
    let handler = RecordingHandler::new(
        QueueKind::Combined,
        JobResult::Retry("provider timed out".to_string()),
    );
    let job_id = queue.enqueue(new_job(&["a"])).await.unwrap();

    let worker = WorkerBuilder::new(queue.clone())
        .with_config(fast_config())
        .with_shared_handler(handler.clone())
        .build()
        .unwrap();
    let mut events = worker.events();
    let handle = worker.start();

    assert!(
        wait_until(Duration::from_secs(5), || async {
            queue.counts().await.unwrap().failed == 1
        })
        .await
    );
    handle.shutdown().await.unwrap();
    handle.join().await;

    assert_eq!(handler.calls(), 3);
    assert_eq!(*handler.exhausted.lock().unwrap(), vec![job_id]);

    let job = queue.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.attempts, 3);
    assert_eq!(job.last_error.as_deref(), Some("provider timed out"));

    let mut retries = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let WorkerEvent::JobRetrying { attempt, delay, .. } = event {
            retries.push((attempt, delay));
        }
    }
    assert_eq!(
        retries,
        vec![
            (1, Duration::from_millis(10)),
            (2, Duration::from_millis(20))
        ]
    );
}

#[tokio::test]
async fn test_permanent_failure_skips_retries() {
    let test_db = TestDatabase::new().await;
    let queue = test_db.db.queue(QueueKind::Embedding);
    let handler = RecordingHandler::new(
        QueueKind::Embedding,
        JobResult::Failed("bad request".to_string()),
    );
    queue.enqueue(new_job(&["a"])).await.unwrap();

    let handle = WorkerBuilder::new(queue.clone())
        .with_config(fast_config())
        .with_shared_handler(handler.clone())
        .build()
        .unwrap()
        .start();

    assert!(
        wait_until(Duration::from_secs(5), || async {
            queue.counts().await.unwrap().failed == 1
        })
        .await
    );
    handle.shutdown().await.unwrap();
    assert_eq!(handler.calls(), 1);
    assert_eq!(handler.exhausted.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_rate_limiter_spaces_invocations_across_workers() {
    let test_db = TestDatabase::new().await;
    let start = Instant::now();
    // 5 calls per 500ms: one permit every 100ms, shared by two workers.
    let limiter = Arc::new(HandlerRateLimiter::new(5, Duration::from_millis(500)).unwrap());
    let combined = test_db.db.queue(QueueKind::Combined);
    let metadata = test_db.db.queue(QueueKind::Metadata);
    for _ in 0..2 {
        combined.enqueue(new_job(&["a"])).await.unwrap();
        metadata.enqueue(new_job(&["b"])).await.unwrap();
    }

    let handles = vec![
        attach(
            combined.clone(),
            Arc::new(NoOpHandler::new(QueueKind::Combined)),
            fast_config().with_concurrency(2),
            limiter.clone(),
        )
        .unwrap(),
        attach(
            metadata.clone(),
            Arc::new(NoOpHandler::new(QueueKind::Metadata)),
            fast_config().with_concurrency(2),
            limiter.clone(),
        )
        .unwrap(),
    ];

    assert!(
        wait_until(Duration::from_secs(5), || async {
            combined.counts().await.unwrap().completed == 2
                && metadata.counts().await.unwrap().completed == 2
        })
        .await
    );
    // Four invocations need at least three full periods after the first.
    assert!(start.elapsed() >= Duration::from_millis(290));
    for handle in handles {
        handle.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn test_job_purged_while_waiting_for_permit_is_skipped() {
    let test_db = TestDatabase::new().await;
    let queue = test_db.db.queue(QueueKind::Combined);
    // One permit per 400ms; the first is consumed up front.
    let limiter = Arc::new(HandlerRateLimiter::new(1, Duration::from_millis(400)).unwrap());
    assert!(limiter.try_acquire());

    let calls = Arc::new(AtomicUsize::new(0));
    struct CountingHandler(Arc<AtomicUsize>);

    #[async_trait]
    impl JobHandler for CountingHandler {
        fn queue_kind(&self) -> QueueKind {
            QueueKind::Combined
        }

        async fn execute(&self, ctx: JobContext) -> JobResult {
            self.0.fetch_add(1, Ordering::SeqCst);
            let n = ctx.item_ids().len();
            JobResult::Success(BatchOutcome::new(n, n))
        }
    }

    queue.enqueue(new_job(&["a"])).await.unwrap();
    let handle = attach(
        queue.clone(),
        Arc::new(CountingHandler(calls.clone())),
        fast_config(),
        limiter,
    )
    .unwrap();

    assert!(
        wait_until(Duration::from_secs(2), || async {
            queue.counts().await.unwrap().active == 1
        })
        .await
    );
    assert_eq!(queue.purge().await.unwrap(), 1);

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_job_purged_during_final_attempt_skips_exhaustion() {
    let test_db = TestDatabase::new().await;
    let queue = test_db.db.queue(QueueKind::Combined);

    /// Purges its own queue mid-run, as `stop()` would, then gives up.
    struct PurgingHandler {
        queue: Arc<dyn JobQueue>,
        calls: AtomicUsize,
        exhausted: AtomicUsize,
    }

    #[async_trait]
    impl JobHandler for PurgingHandler {
        fn queue_kind(&self) -> QueueKind {
            QueueKind::Combined
        }

        async fn execute(&self, _ctx: JobContext) -> JobResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.queue.purge().await.unwrap();
            JobResult::Failed("provider rejected request".to_string())
        }

        async fn on_exhausted(&self, _job: &Job, _error: &str) {
            self.exhausted.fetch_add(1, Ordering::SeqCst);
        }
    }

    let handler = Arc::new(PurgingHandler {
        queue: queue.clone(),
        calls: AtomicUsize::new(0),
        exhausted: AtomicUsize::new(0),
    });
    queue.enqueue(new_job(&["a"])).await.unwrap();

    let handle = WorkerBuilder::new(queue.clone())
        .with_config(fast_config())
        .with_shared_handler(handler.clone())
        .build()
        .unwrap()
        .start();

    assert!(
        wait_until(Duration::from_secs(2), || async {
            handler.calls.load(Ordering::SeqCst) == 1
        })
        .await
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.shutdown().await.unwrap();
    handle.join().await;

    assert_eq!(handler.exhausted.load(Ordering::SeqCst), 0);
    assert_eq!(queue.counts().await.unwrap().failed, 0);
}

#[tokio::test]
async fn test_shutdown_emits_stopped_event() {
    let test_db = TestDatabase::new().await;
    let queue = test_db.db.queue(QueueKind::Combined);
    let handle = WorkerBuilder::new(queue)
        .with_config(fast_config())
        .with_handler(NoOpHandler::new(QueueKind::Combined))
        .build()
        .unwrap()
        .start();
    let mut events = handle.events();

    handle.shutdown().await.unwrap();
    let stopped = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Ok(WorkerEvent::WorkerStopped { queue }) => return queue,
                Ok(_) => continue,
                Err(e) => panic!("event channel closed: {e}"),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(stopped, QueueKind::Combined);
    handle.join().await;
}

#[tokio::test]
async fn test_builder_rejects_mismatched_handler() {
    let test_db = TestDatabase::new().await;
    let result = WorkerBuilder::new(test_db.db.queue(QueueKind::Combined))
        .with_handler(NoOpHandler::new(QueueKind::Embedding))
        .build();
    assert!(result.is_err());

    let missing = WorkerBuilder::new(test_db.db.queue(QueueKind::Combined)).build();
    assert!(missing.is_err());
}
