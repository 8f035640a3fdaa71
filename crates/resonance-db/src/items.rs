//! Item state store implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use resonance_core::{
    CatalogItem, DerivedFields, Error, Item, ItemStore, ProcessingMode, ProcessingStatus, Result,
    UpsertOutcome, Vector,
};

const ITEM_COLUMNS: &str = "id, title, artist, album, metadata_status, embedding_status, \
                            analysis, derived, vector, created_at, updated_at";

/// SQLite implementation of ItemStore.
pub struct SqliteItemStore {
    pool: SqlitePool,
}

impl SqliteItemStore {
    /// Create a new SqliteItemStore with the given connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn parse_status(raw: &str) -> Result<ProcessingStatus> {
        raw.parse::<ProcessingStatus>().map_err(Error::Internal)
    }

    fn parse_json<T: serde::de::DeserializeOwned>(raw: Option<String>) -> Result<Option<T>> {
        raw.map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(Error::from)
    }

    /// Parse an item row into an Item struct.
    fn parse_item_row(row: SqliteRow) -> Result<Item> {
        let metadata_status: String = row.try_get("metadata_status")?;
        let embedding_status: Option<String> = row.try_get("embedding_status")?;
        let created_at: DateTime<Utc> = row.try_get("created_at")?;
        let updated_at: DateTime<Utc> = row.try_get("updated_at")?;

        Ok(Item {
            id: row.try_get("id")?,
            title: row.try_get("title")?,
            artist: row.try_get("artist")?,
            album: row.try_get("album")?,
            metadata_status: Self::parse_status(&metadata_status)?,
            embedding_status: embedding_status
                .as_deref()
                .map(Self::parse_status)
                .transpose()?,
            analysis: Self::parse_json::<JsonValue>(row.try_get("analysis")?)?,
            derived: Self::parse_json::<DerivedFields>(row.try_get("derived")?)?,
            vector: Self::parse_json::<Vector>(row.try_get("vector")?)?,
            created_at,
            updated_at,
        })
    }

    async fn list_where(&self, clause: &str, limit: Option<usize>) -> Result<Vec<Item>> {
        // SQLite treats a negative LIMIT as unbounded.
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let rows = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM items WHERE {clause} ORDER BY seq ASC LIMIT ?"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::parse_item_row).collect()
    }

    async fn count_where(&self, clause: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM items WHERE {clause}"))
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    /// Run one single-item statement per id inside a transaction.
    ///
    /// Returns the ids whose row actually changed.
    async fn update_each(&self, sql: &str, ids: &[String]) -> Result<Vec<String>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let mut changed = Vec::with_capacity(ids.len());
        for id in ids {
            let result = sqlx::query(sql)
                .bind(now)
                .bind(id)
                .execute(&mut *tx)
                .await?;
            if result.rows_affected() > 0 {
                changed.push(id.clone());
            }
        }
        tx.commit().await?;
        Ok(changed)
    }

    async fn update_one(&self, sql: &str, id: &str, binds: &[Option<String>]) -> Result<()> {
        let mut query = sqlx::query(sql);
        for value in binds {
            query = query.bind(value.clone());
        }
        let result = query
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("item {}", id)));
        }
        Ok(())
    }

    async fn reset_all(&self, sql: &str) -> Result<u64> {
        let result = sqlx::query(sql).bind(Utc::now()).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl ItemStore for SqliteItemStore {
    async fn upsert(&self, item: &CatalogItem) -> Result<UpsertOutcome> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query("SELECT title, artist, album FROM items WHERE id = ?")
            .bind(&item.id)
            .fetch_optional(&mut *tx)
            .await?;

        let outcome = match existing {
            None => {
                sqlx::query(
                    "INSERT INTO items (id, title, artist, album, metadata_status, created_at, updated_at)
                     VALUES (?, ?, ?, ?, 'pending', ?, ?)",
                )
                .bind(&item.id)
                .bind(&item.title)
                .bind(&item.artist)
                .bind(&item.album)
                .bind(now)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                UpsertOutcome::Added
            }
            Some(row) => {
                let title: String = row.try_get("title")?;
                let artist: String = row.try_get("artist")?;
                let album: Option<String> = row.try_get("album")?;
                if title == item.title && artist == item.artist && album == item.album {
                    UpsertOutcome::Unchanged
                } else {
                    sqlx::query(
                        "UPDATE items
                         SET title = ?, artist = ?, album = ?, metadata_status = 'pending',
                             embedding_status = NULL, analysis = NULL, derived = NULL,
                             vector = NULL, updated_at = ?
                         WHERE id = ?",
                    )
                    .bind(&item.title)
                    .bind(&item.artist)
                    .bind(&item.album)
                    .bind(now)
                    .bind(&item.id)
                    .execute(&mut *tx)
                    .await?;
                    UpsertOutcome::Updated
                }
            }
        };

        tx.commit().await?;
        debug!(
            subsystem = "db",
            component = "items",
            op = "upsert",
            item_id = %item.id,
            outcome = ?outcome,
            "Item upserted"
        );
        Ok(outcome)
    }

    async fn get(&self, id: &str) -> Result<Option<Item>> {
        let row = sqlx::query(&format!("SELECT {ITEM_COLUMNS} FROM items WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Self::parse_item_row).transpose()
    }

    async fn get_many(&self, ids: &[String]) -> Result<Vec<Item>> {
        let mut items = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(item) = self.get(id).await? {
                items.push(item);
            }
        }
        Ok(items)
    }

    async fn mark_processing(&self, ids: &[String]) -> Result<Vec<String>> {
        let claimed = self
            .update_each(
                "UPDATE items SET metadata_status = 'processing', updated_at = ?
                 WHERE id = ? AND metadata_status = 'pending'",
                ids,
            )
            .await?;
        debug!(
            subsystem = "db",
            component = "items",
            op = "mark_processing",
            item_count = ids.len(),
            claimed = claimed.len(),
            "Items claimed for processing"
        );
        Ok(claimed)
    }

    async fn release(&self, ids: &[String]) -> Result<u64> {
        let released = self
            .update_each(
                "UPDATE items SET metadata_status = 'pending', updated_at = ?
                 WHERE id = ? AND metadata_status = 'processing'",
                ids,
            )
            .await?;
        Ok(released.len() as u64)
    }

    async fn record_success(
        &self,
        id: &str,
        payload: &JsonValue,
        derived: &DerivedFields,
    ) -> Result<()> {
        let payload = serde_json::to_string(payload)?;
        let derived = serde_json::to_string(derived)?;
        self.update_one(
            "UPDATE items
             SET metadata_status = 'completed', embedding_status = 'pending',
                 analysis = ?, derived = ?, updated_at = ?
             WHERE id = ?",
            id,
            &[Some(payload), Some(derived)],
        )
        .await
    }

    async fn record_failure(&self, id: &str) -> Result<()> {
        self.update_one(
            "UPDATE items SET metadata_status = 'failed', updated_at = ? WHERE id = ?",
            id,
            &[],
        )
        .await
    }

    async fn set_embedding_status(&self, id: &str, status: ProcessingStatus) -> Result<()> {
        self.update_one(
            "UPDATE items SET embedding_status = ?, updated_at = ? WHERE id = ?",
            id,
            &[Some(status.as_str().to_string())],
        )
        .await
    }

    async fn mark_embedding_processing(&self, ids: &[String]) -> Result<()> {
        self.update_each(
            "UPDATE items SET embedding_status = 'processing', updated_at = ? WHERE id = ?",
            ids,
        )
        .await?;
        Ok(())
    }

    async fn save_vector(&self, id: &str, vector: &[f32]) -> Result<()> {
        let encoded = serde_json::to_string(vector)?;
        self.update_one(
            "UPDATE items SET vector = ?, embedding_status = 'completed', updated_at = ?
             WHERE id = ?",
            id,
            &[Some(encoded)],
        )
        .await
    }

    async fn get_pending(&self, limit: Option<usize>) -> Result<Vec<Item>> {
        self.list_where("metadata_status = 'pending'", limit).await
    }

    async fn get_pending_embeddings(&self, limit: Option<usize>) -> Result<Vec<Item>> {
        self.list_where(
            "metadata_status = 'completed' AND embedding_status = 'pending'",
            limit,
        )
        .await
    }

    async fn count_pending(&self) -> Result<u64> {
        self.count_where("metadata_status = 'pending'").await
    }

    async fn count_pending_embeddings(&self) -> Result<u64> {
        self.count_where("metadata_status = 'completed' AND embedding_status = 'pending'")
            .await
    }

    async fn count_total(&self) -> Result<u64> {
        self.count_where("1 = 1").await
    }

    async fn reset_interrupted_metadata(&self) -> Result<u64> {
        let reset = self
            .reset_all(
                "UPDATE items SET metadata_status = 'pending', updated_at = ?
                 WHERE metadata_status = 'processing'",
            )
            .await?;
        if reset > 0 {
            info!(
                subsystem = "db",
                component = "items",
                op = "reset_interrupted_metadata",
                item_count = reset,
                "Reset interrupted metadata processing"
            );
        }
        Ok(reset)
    }

    async fn reset_interrupted_embeddings(&self) -> Result<u64> {
        let reset = self
            .reset_all(
                "UPDATE items SET embedding_status = 'pending', updated_at = ?
                 WHERE embedding_status = 'processing'",
            )
            .await?;
        if reset > 0 {
            info!(
                subsystem = "db",
                component = "items",
                op = "reset_interrupted_embeddings",
                item_count = reset,
                "Reset interrupted embedding processing"
            );
        }
        Ok(reset)
    }

    async fn reset_failed_metadata(&self) -> Result<u64> {
        self.reset_all(
            "UPDATE items SET metadata_status = 'pending', updated_at = ?
             WHERE metadata_status = 'failed'",
        )
        .await
    }

    async fn requeue(&self, ids: &[String], mode: ProcessingMode) -> Result<u64> {
        let sql = match mode {
            ProcessingMode::Full | ProcessingMode::Metadata => {
                "UPDATE items
                 SET metadata_status = 'pending', embedding_status = NULL, updated_at = ?
                 WHERE id = ? AND metadata_status != 'processing'"
            }
            ProcessingMode::Embedding => {
                "UPDATE items SET embedding_status = 'pending', updated_at = ?
                 WHERE id = ? AND analysis IS NOT NULL
                   AND (embedding_status IS NULL OR embedding_status != 'processing')"
            }
        };
        let changed = self.update_each(sql, ids).await?;
        Ok(changed.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::TestDatabase;
    use serde_json::json;

    async fn seeded(count: usize) -> (TestDatabase, Vec<String>) {
        let db = TestDatabase::new().await;
        let ids = db.seed_items(count).await;
        (db, ids)
    }

    #[tokio::test]
    async fn test_upsert_new_item_is_pending_without_embedding_status() {
        let db = TestDatabase::new().await;
        let outcome = db
            .db
            .items
            .upsert(&CatalogItem::new("s1", "Song", "Artist"))
            .await
            .unwrap();

        assert_eq!(outcome, UpsertOutcome::Added);
        let item = db.db.items.get("s1").await.unwrap().unwrap();
        assert_eq!(item.metadata_status, ProcessingStatus::Pending);
        assert_eq!(item.embedding_status, None);
        assert!(item.analysis.is_none());
    }

    #[tokio::test]
    async fn test_upsert_identical_input_is_unchanged() {
        let (db, ids) = seeded(1).await;
        let store = &db.db.items;
        store
            .record_success(&ids[0], &json!({"description": "x"}), &DerivedFields::default())
            .await
            .unwrap();
        let item = store.get(&ids[0]).await.unwrap().unwrap();

        let outcome = store.upsert(&item.catalog_ref()).await.unwrap();

        assert_eq!(outcome, UpsertOutcome::Unchanged);
        let after = store.get(&ids[0]).await.unwrap().unwrap();
        assert_eq!(after.metadata_status, ProcessingStatus::Completed);
        assert_eq!(after.embedding_status, Some(ProcessingStatus::Pending));
    }

    #[tokio::test]
    async fn test_upsert_changed_fields_resets_enrichment() {
        let (db, ids) = seeded(1).await;
        let store = &db.db.items;
        store
            .record_success(&ids[0], &json!({"description": "x"}), &DerivedFields::default())
            .await
            .unwrap();
        store.save_vector(&ids[0], &[0.1, 0.2]).await.unwrap();

        let changed = CatalogItem::new(ids[0].clone(), "New Title", "Artist 0");
        let outcome = store.upsert(&changed).await.unwrap();

        assert_eq!(outcome, UpsertOutcome::Updated);
        let item = store.get(&ids[0]).await.unwrap().unwrap();
        assert_eq!(item.title, "New Title");
        assert_eq!(item.metadata_status, ProcessingStatus::Pending);
        assert_eq!(item.embedding_status, None);
        assert!(item.analysis.is_none());
        assert!(item.vector.is_none());
    }

    #[tokio::test]
    async fn test_mark_processing_claims_only_pending_items() {
        let (db, ids) = seeded(3).await;
        let store = &db.db.items;
        store.record_failure(&ids[1]).await.unwrap();

        let claimed = store.mark_processing(&ids).await.unwrap();

        assert_eq!(claimed, vec![ids[0].clone(), ids[2].clone()]);
        let again = store.mark_processing(&ids).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_release_returns_processing_items_to_pending() {
        let (db, ids) = seeded(2).await;
        let store = &db.db.items;
        store.mark_processing(&ids).await.unwrap();

        assert_eq!(store.release(&ids).await.unwrap(), 2);
        assert_eq!(store.count_pending().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_record_success_sets_embedding_pending_and_stores_payload() {
        let (db, ids) = seeded(1).await;
        let store = &db.db.items;
        let derived = DerivedFields {
            genres: vec!["jazz".to_string()],
            moods: vec![],
            energy: Some(0.4),
        };
        store.mark_processing(&ids).await.unwrap();
        store
            .record_success(&ids[0], &json!({"description": "smoky"}), &derived)
            .await
            .unwrap();

        let item = store.get(&ids[0]).await.unwrap().unwrap();
        assert_eq!(item.metadata_status, ProcessingStatus::Completed);
        assert_eq!(item.embedding_status, Some(ProcessingStatus::Pending));
        assert_eq!(item.analysis, Some(json!({"description": "smoky"})));
        assert_eq!(item.derived, Some(derived));
        assert_eq!(store.count_pending_embeddings().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_save_vector_completes_embedding() {
        let (db, ids) = seeded(1).await;
        let store = &db.db.items;
        store
            .record_success(&ids[0], &json!({}), &DerivedFields::default())
            .await
            .unwrap();
        store.save_vector(&ids[0], &[1.0, 0.5]).await.unwrap();

        let item = store.get(&ids[0]).await.unwrap().unwrap();
        assert_eq!(item.embedding_status, Some(ProcessingStatus::Completed));
        assert_eq!(item.vector, Some(vec![1.0, 0.5]));
    }

    #[tokio::test]
    async fn test_write_to_unknown_item_is_not_found() {
        let db = TestDatabase::new().await;
        let err = db.db.items.record_failure("missing").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_get_pending_is_oldest_first_and_bounded() {
        let (db, ids) = seeded(5).await;
        let pending = db.db.items.get_pending(Some(3)).await.unwrap();
        let got: Vec<String> = pending.into_iter().map(|i| i.id).collect();
        assert_eq!(got, ids[..3].to_vec());

        let all = db.db.items.get_pending(None).await.unwrap();
        assert_eq!(all.len(), 5);
    }

    #[tokio::test]
    async fn test_get_many_preserves_order_and_skips_unknown() {
        let (db, ids) = seeded(3).await;
        let wanted = vec![ids[2].clone(), "missing".to_string(), ids[0].clone()];
        let items = db.db.items.get_many(&wanted).await.unwrap();
        let got: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(got, vec![ids[2].as_str(), ids[0].as_str()]);
    }

    #[tokio::test]
    async fn test_reset_interrupted_clears_processing_states() {
        let (db, ids) = seeded(3).await;
        let store = &db.db.items;
        store.mark_processing(&ids[..2]).await.unwrap();
        store
            .record_success(&ids[2], &json!({}), &DerivedFields::default())
            .await
            .unwrap();
        store.mark_embedding_processing(&ids[2..]).await.unwrap();

        assert_eq!(store.reset_interrupted_metadata().await.unwrap(), 2);
        assert_eq!(store.reset_interrupted_embeddings().await.unwrap(), 1);
        assert_eq!(store.count_pending().await.unwrap(), 2);
        assert_eq!(store.count_pending_embeddings().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reset_failed_metadata() {
        let (db, ids) = seeded(2).await;
        let store = &db.db.items;
        store.record_failure(&ids[0]).await.unwrap();

        assert_eq!(store.reset_failed_metadata().await.unwrap(), 1);
        assert_eq!(store.count_pending().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_requeue_skips_processing_items() {
        let (db, ids) = seeded(2).await;
        let store = &db.db.items;
        store.mark_processing(&ids[..1]).await.unwrap();
        store.record_failure(&ids[1]).await.unwrap();

        let changed = store.requeue(&ids, ProcessingMode::Metadata).await.unwrap();

        assert_eq!(changed, 1);
        let first = store.get(&ids[0]).await.unwrap().unwrap();
        assert_eq!(first.metadata_status, ProcessingStatus::Processing);
    }

    #[tokio::test]
    async fn test_requeue_embedding_requires_analysis() {
        let (db, ids) = seeded(2).await;
        let store = &db.db.items;
        store
            .record_success(&ids[0], &json!({}), &DerivedFields::default())
            .await
            .unwrap();
        store
            .set_embedding_status(&ids[0], ProcessingStatus::Failed)
            .await
            .unwrap();

        let changed = store.requeue(&ids, ProcessingMode::Embedding).await.unwrap();

        assert_eq!(changed, 1);
        assert_eq!(
            store.get(&ids[0]).await.unwrap().unwrap().embedding_status,
            Some(ProcessingStatus::Pending)
        );
        assert_eq!(store.get(&ids[1]).await.unwrap().unwrap().embedding_status, None);
    }

    #[tokio::test]
    async fn test_counts() {
        let (db, ids) = seeded(4).await;
        let store = &db.db.items;
        store
            .record_success(&ids[0], &json!({}), &DerivedFields::default())
            .await
            .unwrap();
        assert_eq!(store.count_total().await.unwrap(), 4);
        assert_eq!(store.count_pending().await.unwrap(), 3);
        assert_eq!(store.count_pending_embeddings().await.unwrap(), 1);
        assert!(store.mark_processing(&["nope".to_string()]).await.unwrap().is_empty());
    }
}
