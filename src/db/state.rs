// src/db/state.rs
// Persistent per-ingestor progress: last ingested timestamp + bookkeeping JSON.

use anyhow::Result;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::warn;

use super::pool::DatabasePool;

/// State held for each registered ingestor.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestorState {
    /// Epoch seconds of the most recent successfully ingested message;
    /// 0 when the ingestor has never run.
    pub last_timestamp: i64,
    pub metadata: Map<String, Value>,
}

impl Default for IngestorState {
    fn default() -> Self {
        Self {
            last_timestamp: 0,
            metadata: Map::new(),
        }
    }
}

/// Store for ingestor progress, backed by the shared pool.
///
/// All writes are single-statement upserts; readers of a missing row get the
/// zero value. Callers decide whether to retry on I/O errors.
#[derive(Clone)]
pub struct StateStore {
    pool: Arc<DatabasePool>,
}

impl StateStore {
    pub fn new(pool: Arc<DatabasePool>) -> Self {
        Self { pool }
    }

    /// Read state for an ingestor. Missing rows and malformed metadata both
    /// resolve to usable defaults rather than errors.
    pub async fn get(&self, ingestor_id: &str) -> Result<IngestorState> {
        let id = ingestor_id.to_string();
        self.pool
            .interact(move |conn| get_state_sync(conn, &id))
            .await
    }

    /// Upsert state for an ingestor.
    pub async fn set(
        &self,
        ingestor_id: &str,
        last_timestamp: i64,
        metadata: Map<String, Value>,
    ) -> Result<()> {
        let id = ingestor_id.to_string();
        self.pool
            .interact_with_retry(move |conn| set_state_sync(conn, &id, last_timestamp, &metadata))
            .await
    }

    /// Merge a metadata patch into the stored metadata; last_timestamp is
    /// unchanged. Creates the row if absent.
    pub async fn update_metadata(
        &self,
        ingestor_id: &str,
        patch: Map<String, Value>,
    ) -> Result<()> {
        let id = ingestor_id.to_string();
        self.pool
            .interact_with_retry(move |conn| {
                let mut state = get_state_sync(conn, &id)?;
                for (key, value) in &patch {
                    state.metadata.insert(key.clone(), value.clone());
                }
                set_state_sync(conn, &id, state.last_timestamp, &state.metadata)
            })
            .await
    }

    pub async fn list_ingestors(&self) -> Result<Vec<String>> {
        self.pool
            .interact(|conn| {
                let mut stmt =
                    conn.prepare("SELECT ingestor_id FROM ingestor_state ORDER BY ingestor_id")?;
                let ids = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(ids)
            })
            .await
    }

    pub async fn delete(&self, ingestor_id: &str) -> Result<()> {
        let id = ingestor_id.to_string();
        self.pool
            .interact(move |conn| {
                conn.execute("DELETE FROM ingestor_state WHERE ingestor_id = ?", [&id])?;
                Ok(())
            })
            .await
    }
}

fn get_state_sync(conn: &Connection, ingestor_id: &str) -> Result<IngestorState> {
    let row: Option<(i64, String)> = conn
        .query_row(
            "SELECT last_timestamp, metadata_json FROM ingestor_state WHERE ingestor_id = ?",
            [ingestor_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let Some((last_timestamp, metadata_json)) = row else {
        return Ok(IngestorState::default());
    };

    let metadata = match serde_json::from_str::<Value>(&metadata_json) {
        Ok(Value::Object(map)) => map,
        Ok(_) | Err(_) => {
            warn!(
                "malformed metadata_json for ingestor '{}', treating as empty",
                ingestor_id
            );
            Map::new()
        }
    };

    Ok(IngestorState {
        last_timestamp,
        metadata,
    })
}

fn set_state_sync(
    conn: &Connection,
    ingestor_id: &str,
    last_timestamp: i64,
    metadata: &Map<String, Value>,
) -> Result<()> {
    let metadata_json = serde_json::to_string(metadata)?;
    conn.execute(
        "INSERT INTO ingestor_state (ingestor_id, last_timestamp, metadata_json, updated_at)
         VALUES (?1, ?2, ?3, CURRENT_TIMESTAMP)
         ON CONFLICT(ingestor_id) DO UPDATE SET
             last_timestamp = excluded.last_timestamp,
             metadata_json = excluded.metadata_json,
             updated_at = CURRENT_TIMESTAMP",
        params![ingestor_id, last_timestamp, metadata_json],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn test_store() -> StateStore {
        let pool = DatabasePool::open_in_memory(4).await.expect("pool");
        StateStore::new(Arc::new(pool))
    }

    #[tokio::test]
    async fn test_missing_row_returns_zero_value() {
        let store = test_store().await;
        let state = store.get("never_registered").await.unwrap();
        assert_eq!(state.last_timestamp, 0);
        assert!(state.metadata.is_empty());
    }

    #[tokio::test]
    async fn test_set_get_round_trip() {
        let store = test_store().await;
        let mut metadata = Map::new();
        metadata.insert("total_documents_processed".into(), json!(42));

        store.set("telegram_ingestor", 3000, metadata).await.unwrap();

        let state = store.get("telegram_ingestor").await.unwrap();
        assert_eq!(state.last_timestamp, 3000);
        assert_eq!(state.metadata["total_documents_processed"], json!(42));
    }

    #[tokio::test]
    async fn test_upsert_overwrites() {
        let store = test_store().await;
        store.set("tg", 1000, Map::new()).await.unwrap();
        store.set("tg", 2000, Map::new()).await.unwrap();

        let state = store.get("tg").await.unwrap();
        assert_eq!(state.last_timestamp, 2000);
        assert_eq!(store.list_ingestors().await.unwrap(), vec!["tg"]);
    }

    #[tokio::test]
    async fn test_update_metadata_preserves_timestamp() {
        let store = test_store().await;
        let mut metadata = Map::new();
        metadata.insert("runs".into(), json!(1));
        store.set("wa", 5000, metadata).await.unwrap();

        let mut patch = Map::new();
        patch.insert("runs".into(), json!(2));
        patch.insert("status".into(), json!("ok"));
        store.update_metadata("wa", patch).await.unwrap();

        let state = store.get("wa").await.unwrap();
        assert_eq!(state.last_timestamp, 5000);
        assert_eq!(state.metadata["runs"], json!(2));
        assert_eq!(state.metadata["status"], json!("ok"));
    }

    #[tokio::test]
    async fn test_malformed_metadata_reads_as_empty() {
        let store = test_store().await;
        store.set("bad", 10, Map::new()).await.unwrap();
        store
            .pool
            .interact(|conn| {
                conn.execute(
                    "UPDATE ingestor_state SET metadata_json = 'not json' WHERE ingestor_id = 'bad'",
                    [],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let state = store.get("bad").await.unwrap();
        assert_eq!(state.last_timestamp, 10);
        assert!(state.metadata.is_empty());
    }

    #[tokio::test]
    async fn test_delete_then_get_returns_default() {
        let store = test_store().await;
        store.set("gone", 123, Map::new()).await.unwrap();
        store.delete("gone").await.unwrap();

        let state = store.get("gone").await.unwrap();
        assert_eq!(state, IngestorState::default());
        assert!(store.list_ingestors().await.unwrap().is_empty());
    }
}
