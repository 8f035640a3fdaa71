//! Resume deadlines for paused queues.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::debug;

use resonance_core::{QueueKind, Result, ResumeSchedule, ScheduleStore};

use crate::system_config;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedSchedule {
    resume_at: DateTime<Utc>,
}

fn schedule_key(kind: QueueKind) -> String {
    format!("resume_schedule:{}", kind.as_str())
}

/// SQLite implementation of ScheduleStore, backed by `system_config`.
pub struct SqliteScheduleStore {
    pool: SqlitePool,
}

impl SqliteScheduleStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ScheduleStore for SqliteScheduleStore {
    async fn set_resume_at(&self, queue: QueueKind, at: DateTime<Utc>) -> Result<()> {
        system_config::store(
            &self.pool,
            &schedule_key(queue),
            &PersistedSchedule { resume_at: at },
        )
        .await?;
        debug!(
            subsystem = "db",
            component = "schedule",
            queue = queue.as_str(),
            resume_at = %at,
            "Resume deadline stored"
        );
        Ok(())
    }

    async fn resume_schedule(&self, queue: QueueKind) -> Result<Option<ResumeSchedule>> {
        let persisted: Option<PersistedSchedule> =
            system_config::load(&self.pool, &schedule_key(queue)).await?;
        Ok(persisted.map(|p| ResumeSchedule {
            queue,
            resume_at: p.resume_at,
        }))
    }

    async fn clear_resume_at(&self, queue: QueueKind) -> Result<bool> {
        system_config::remove(&self.pool, &schedule_key(queue)).await
    }
}
