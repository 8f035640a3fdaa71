//! # resonance-db
//!
//! SQLite persistence layer for the resonance enrichment pipeline.
//!
//! This crate provides:
//! - Connection pool management
//! - The item state store
//! - Durable job queues, one per [`QueueKind`]
//! - Resume deadlines in the `system_config` key-value table
//!
//! ## Example
//!
//! ```rust,ignore
//! use resonance_db::{Database, ItemStore, JobQueue, QueueKind};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("sqlite://resonance.db").await?;
//!
//!     let pending = db.items.count_pending().await?;
//!     let snapshot = db.queue(QueueKind::Combined).counts().await?;
//!     println!("{pending} pending items, {} waiting jobs", snapshot.waiting);
//!     Ok(())
//! }
//! ```
pub mod items;
pub mod pool;
pub mod queue;
pub mod schedule;
pub mod system_config;

// Test fixtures for integration tests
// Note: Always compiled so integration tests in other crates can use TestDatabase
pub mod test_fixtures;

use std::sync::Arc;

use sqlx::SqlitePool;
use tracing::info;

// Re-export core types
pub use resonance_core::*;

pub use items::SqliteItemStore;
pub use pool::{create_pool, create_pool_with_config, PoolConfig};
pub use queue::SqliteJobQueue;
pub use schedule::SqliteScheduleStore;

/// Run pending migrations against a pool.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
    Ok(())
}

/// Combined database context with all stores.
pub struct Database {
    /// The underlying connection pool.
    pub pool: SqlitePool,
    pub items: Arc<SqliteItemStore>,
    pub schedules: Arc<SqliteScheduleStore>,
    combined: Arc<SqliteJobQueue>,
    metadata: Arc<SqliteJobQueue>,
    embedding: Arc<SqliteJobQueue>,
}

impl Database {
    /// Migrate the schema and open every store over an existing pool.
    pub async fn open(pool: SqlitePool) -> Result<Self> {
        Self::open_with_max_attempts(pool, defaults::JOB_MAX_ATTEMPTS).await
    }

    /// Like [`Database::open`], stamping `max_attempts` on every new job.
    pub async fn open_with_max_attempts(pool: SqlitePool, max_attempts: i32) -> Result<Self> {
        migrate(&pool).await?;

        let load = |kind: QueueKind| {
            let pool = pool.clone();
            async move {
                SqliteJobQueue::load(pool, kind)
                    .await
                    .map(|q| Arc::new(q.with_max_attempts(max_attempts)))
            }
        };
        let combined = load(QueueKind::Combined).await?;
        let metadata = load(QueueKind::Metadata).await?;
        let embedding = load(QueueKind::Embedding).await?;

        info!(
            subsystem = "db",
            component = "database",
            op = "open",
            max_attempts,
            "Database opened"
        );

        Ok(Self {
            items: Arc::new(SqliteItemStore::new(pool.clone())),
            schedules: Arc::new(SqliteScheduleStore::new(pool.clone())),
            pool,
            combined,
            metadata,
            embedding,
        })
    }

    /// Create a new Database instance by connecting to the given URL.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = create_pool(url).await?;
        Self::open(pool).await
    }

    /// Create with custom pool configuration.
    pub async fn connect_with_config(url: &str, config: PoolConfig) -> Result<Self> {
        let pool = create_pool_with_config(url, config).await?;
        Self::open(pool).await
    }

    /// The queue instance for one processing mode.
    pub fn queue(&self, kind: QueueKind) -> Arc<SqliteJobQueue> {
        match kind {
            QueueKind::Combined => self.combined.clone(),
            QueueKind::Metadata => self.metadata.clone(),
            QueueKind::Embedding => self.embedding.clone(),
        }
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
