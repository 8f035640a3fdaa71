//! Durable job queue implementation.
//!
//! One `SqliteJobQueue` per [`QueueKind`], all sharing the `jobs` table.
//! The paused flag is held in an atomic for the dequeue hot path and
//! persisted to `system_config` so it survives restarts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tokio::sync::Notify;
use tracing::{debug, info};
use uuid::Uuid;

use resonance_core::defaults::{JOB_MAX_ATTEMPTS, MAX_BATCH_SIZE};
use resonance_core::{
    new_v7, BatchOutcome, Error, Job, JobQueue, JobStatus, NewJob, QueueKind, QueueSnapshot,
    Result,
};

use crate::system_config;

const JOB_COLUMNS: &str = "id, queue, correlation_id, item_ids, status, attempts, max_attempts, \
                           last_error, result, run_after_ms, created_at, started_at, finished_at";

/// Persisted queue state shape (stored as JSON in `system_config`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PersistedQueueState {
    paused: bool,
}

fn state_key(kind: QueueKind) -> String {
    format!("queue_state:{}", kind.as_str())
}

/// SQLite implementation of JobQueue.
pub struct SqliteJobQueue {
    kind: QueueKind,
    pool: SqlitePool,
    max_attempts: i32,
    paused: AtomicBool,
    notify: Arc<Notify>,
}

impl SqliteJobQueue {
    /// Open a queue and load its persisted pause state.
    ///
    /// If no persisted state exists, the queue starts running.
    pub async fn load(pool: SqlitePool, kind: QueueKind) -> Result<Self> {
        let persisted: Option<PersistedQueueState> =
            system_config::load(&pool, &state_key(kind)).await?;
        let paused = persisted.map(|s| s.paused).unwrap_or(false);
        if paused {
            info!(
                subsystem = "db",
                component = "queue",
                queue = kind.as_str(),
                "Queue loaded as PAUSED from persisted state"
            );
        }

        Ok(Self {
            kind,
            pool,
            max_attempts: JOB_MAX_ATTEMPTS,
            paused: AtomicBool::new(paused),
            notify: Arc::new(Notify::new()),
        })
    }

    /// Set the attempt cap stamped on newly enqueued jobs.
    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    fn parse_status(raw: &str) -> Result<JobStatus> {
        raw.parse::<JobStatus>().map_err(Error::Internal)
    }

    fn parse_uuid(raw: &str) -> Result<Uuid> {
        Uuid::parse_str(raw).map_err(|e| Error::Internal(format!("Invalid job id {raw}: {e}")))
    }

    /// Parse a job row into a Job struct.
    fn parse_job_row(row: SqliteRow) -> Result<Job> {
        let id: String = row.try_get("id")?;
        let queue: String = row.try_get("queue")?;
        let correlation_id: String = row.try_get("correlation_id")?;
        let item_ids: String = row.try_get("item_ids")?;
        let status: String = row.try_get("status")?;
        let result: Option<String> = row.try_get("result")?;
        let run_after_ms: i64 = row.try_get("run_after_ms")?;

        Ok(Job {
            id: Self::parse_uuid(&id)?,
            queue: queue.parse::<QueueKind>().map_err(Error::Internal)?,
            correlation_id: Self::parse_uuid(&correlation_id)?,
            item_ids: serde_json::from_str(&item_ids)?,
            status: Self::parse_status(&status)?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            last_error: row.try_get("last_error")?,
            result: result.map(|r| serde_json::from_str(&r)).transpose()?,
            run_after: Utc
                .timestamp_millis_opt(run_after_ms)
                .single()
                .ok_or_else(|| Error::Internal(format!("Invalid run_after {run_after_ms}")))?,
            created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
        })
    }

    async fn persist(&self) -> Result<()> {
        let state = PersistedQueueState {
            paused: self.paused.load(Ordering::SeqCst),
        };
        system_config::store(&self.pool, &state_key(self.kind), &state).await?;
        debug!(
            subsystem = "db",
            component = "queue",
            queue = self.kind.as_str(),
            paused = state.paused,
            "Queue state persisted"
        );
        Ok(())
    }

    async fn count_status(&self, status: JobStatus) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE queue = ? AND status = ?")
                .bind(self.kind.as_str())
                .bind(status.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }
}

#[async_trait]
impl JobQueue for SqliteJobQueue {
    fn kind(&self) -> QueueKind {
        self.kind
    }

    fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    async fn enqueue(&self, job: NewJob) -> Result<Uuid> {
        if job.item_ids.is_empty() {
            return Err(Error::InvalidInput("job has no items".to_string()));
        }
        if job.item_ids.len() > MAX_BATCH_SIZE {
            return Err(Error::InvalidInput(format!(
                "job has {} items, maximum is {}",
                job.item_ids.len(),
                MAX_BATCH_SIZE
            )));
        }

        let job_id = new_v7();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO jobs (id, queue, correlation_id, item_ids, status, attempts,
                               max_attempts, run_after_ms, created_at)
             VALUES (?, ?, ?, ?, 'waiting', 0, ?, ?, ?)",
        )
        .bind(job_id.to_string())
        .bind(self.kind.as_str())
        .bind(job.correlation_id.to_string())
        .bind(serde_json::to_string(&job.item_ids)?)
        .bind(self.max_attempts)
        .bind(now.timestamp_millis())
        .bind(now)
        .execute(&self.pool)
        .await?;

        debug!(
            subsystem = "db",
            component = "queue",
            op = "enqueue",
            queue = self.kind.as_str(),
            job_id = %job_id,
            correlation_id = %job.correlation_id,
            item_count = job.item_ids.len(),
            "Job enqueued"
        );
        self.notify.notify_waiters();
        Ok(job_id)
    }

    async fn dequeue(&self) -> Result<Option<Job>> {
        if self.paused.load(Ordering::Relaxed) {
            return Ok(None);
        }
        let now = Utc::now();

        // Single statement claim; FIFO by insertion sequence.
        let row = sqlx::query(&format!(
            "UPDATE jobs
             SET status = 'active', attempts = attempts + 1, started_at = ?
             WHERE id = (
                 SELECT id FROM jobs
                 WHERE queue = ?
                   AND status IN ('waiting', 'delayed')
                   AND run_after_ms <= ?
                 ORDER BY seq ASC
                 LIMIT 1
             )
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(now)
        .bind(self.kind.as_str())
        .bind(now.timestamp_millis())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::parse_job_row).transpose()
    }

    async fn complete(&self, job_id: Uuid, outcome: BatchOutcome) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET status = 'completed', result = ?, finished_at = ?
             WHERE id = ? AND status = 'active'",
        )
        .bind(serde_json::to_string(&outcome)?)
        .bind(Utc::now())
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn retry(&self, job_id: Uuid, error: &str, delay: Duration) -> Result<()> {
        let run_after = Utc::now().timestamp_millis() + delay.as_millis() as i64;
        sqlx::query(
            "UPDATE jobs SET status = 'delayed', last_error = ?, run_after_ms = ?, started_at = NULL
             WHERE id = ? AND status = 'active'",
        )
        .bind(error)
        .bind(run_after)
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail(&self, job_id: Uuid, error: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'failed', last_error = ?, finished_at = ?
             WHERE id = ? AND status = 'active'",
        )
        .bind(error)
        .bind(Utc::now())
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"))
            .bind(job_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Self::parse_job_row).transpose()
    }

    async fn pause(&self) -> Result<()> {
        self.paused.store(true, Ordering::SeqCst);
        info!(
            subsystem = "db",
            component = "queue",
            op = "pause",
            queue = self.kind.as_str(),
            "Queue PAUSED"
        );
        self.persist().await
    }

    async fn resume(&self) -> Result<()> {
        self.paused.store(false, Ordering::SeqCst);
        info!(
            subsystem = "db",
            component = "queue",
            op = "resume",
            queue = self.kind.as_str(),
            "Queue RESUMED"
        );
        self.persist().await?;
        self.notify.notify_waiters();
        Ok(())
    }

    async fn is_paused(&self) -> Result<bool> {
        Ok(self.paused.load(Ordering::Relaxed))
    }

    async fn purge(&self) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM jobs WHERE queue = ? AND status IN ('waiting', 'active', 'delayed')",
        )
        .bind(self.kind.as_str())
        .execute(&self.pool)
        .await?;
        let removed = result.rows_affected();
        info!(
            subsystem = "db",
            component = "queue",
            op = "purge",
            queue = self.kind.as_str(),
            removed,
            "Queue purged"
        );
        Ok(removed)
    }

    async fn counts(&self) -> Result<QueueSnapshot> {
        Ok(QueueSnapshot {
            waiting: self.count_status(JobStatus::Waiting).await?,
            active: self.count_status(JobStatus::Active).await?,
            completed: self.count_status(JobStatus::Completed).await?,
            failed: self.count_status(JobStatus::Failed).await?,
            delayed: self.count_status(JobStatus::Delayed).await?,
            paused: self.paused.load(Ordering::Relaxed),
        })
    }
}
