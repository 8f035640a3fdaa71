//! Test fixtures for database integration tests.
//!
//! Every [`TestDatabase`] is a private in-memory SQLite database with the
//! schema applied, so tests need no external server and never share state.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use resonance_db::test_fixtures::TestDatabase;
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let test_db = TestDatabase::new().await;
//!     let ids = test_db.seed_items(23).await;
//!
//!     // Run your tests against test_db.db ...
//! }
//! ```

use sqlx::SqlitePool;

use crate::{create_pool, CatalogItem, Database, ItemStore};

/// In-memory database URL used by every fixture.
pub const TEST_DATABASE_URL: &str = "sqlite::memory:";

/// Test database with the schema applied.
pub struct TestDatabase {
    pub pool: SqlitePool,
    pub db: Database,
}

impl TestDatabase {
    /// Create a fresh, empty test database.
    pub async fn new() -> Self {
        let pool = create_pool(TEST_DATABASE_URL)
            .await
            .expect("Failed to create test database pool");
        let db = Database::open(pool.clone())
            .await
            .expect("Failed to open test database");
        Self { pool, db }
    }

    /// Create a test database whose queues stamp `max_attempts` on new jobs.
    pub async fn with_max_attempts(max_attempts: i32) -> Self {
        let pool = create_pool(TEST_DATABASE_URL)
            .await
            .expect("Failed to create test database pool");
        let db = Database::open_with_max_attempts(pool.clone(), max_attempts)
            .await
            .expect("Failed to open test database");
        Self { pool, db }
    }

    /// Insert `count` pending items and return their ids in insertion order.
    ///
    /// Ids are `song-000`, `song-001`, ...; titles and artists carry the
    /// same index (`Song 0`, `Artist 0`).
    pub async fn seed_items(&self, count: usize) -> Vec<String> {
        let mut ids = Vec::with_capacity(count);
        for item in catalog_items(count) {
            self.db
                .items
                .upsert(&item)
                .await
                .expect("Failed to seed item");
            ids.push(item.id);
        }
        ids
    }
}

/// Build `count` catalog entries with predictable fields.
pub fn catalog_items(count: usize) -> Vec<CatalogItem> {
    (0..count)
        .map(|i| CatalogItem::new(format!("song-{i:03}"), format!("Song {i}"), format!("Artist {i}")))
        .collect()
}
