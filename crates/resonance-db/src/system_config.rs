//! Key-value access to the `system_config` table.
//!
//! Values are JSON documents keyed by a short string such as
//! `queue_state:combined` or `resume_schedule:metadata`.

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::warn;

use resonance_core::{Error, Result};

/// Read and decode a value. Undecodable values are logged and treated as absent.
pub async fn load<T: DeserializeOwned>(pool: &SqlitePool, key: &str) -> Result<Option<T>> {
    let raw: Option<String> = sqlx::query_scalar("SELECT value FROM system_config WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await
        .map_err(Error::Database)?;

    match raw {
        None => Ok(None),
        Some(raw) => match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(
                    subsystem = "db",
                    component = "system_config",
                    key,
                    error = %e,
                    "Ignoring unparseable system_config value"
                );
                Ok(None)
            }
        },
    }
}

/// Insert or replace a value.
pub async fn store<T: Serialize>(pool: &SqlitePool, key: &str, value: &T) -> Result<()> {
    let encoded = serde_json::to_string(value)
        .map_err(|e| Error::Internal(format!("Failed to serialize {key}: {e}")))?;

    sqlx::query(
        "INSERT INTO system_config (key, value, updated_at) VALUES (?, ?, ?)
         ON CONFLICT (key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
    )
    .bind(key)
    .bind(encoded)
    .bind(Utc::now())
    .execute(pool)
    .await
    .map_err(Error::Database)?;
    Ok(())
}

/// Delete a value. Returns whether a row existed.
pub async fn remove(pool: &SqlitePool, key: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM system_config WHERE key = ?")
        .bind(key)
        .execute(pool)
        .await
        .map_err(Error::Database)?;
    Ok(result.rows_affected() > 0)
}
