// src/store/dense.rs
// Synchronous dense-vector operations over documents + vec_documents.
// All functions take a &Connection and run inside pool.interact closures.

use anyhow::Result;
use rusqlite::{Connection, OptionalExtension, params};
use rusqlite::types::Value as SqlValue;
use tracing::warn;

use crate::document::{Document, Metadata, MetadataValue};

/// Convert an embedding to the little-endian byte layout sqlite-vec expects.
pub fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Convert cosine distance to a similarity score in [0, 1].
pub fn distance_to_score(distance: f32) -> f32 {
    1.0 - distance.clamp(0.0, 1.0)
}

/// A search hit carrying the stored document and its similarity score.
#[derive(Debug, Clone)]
pub struct ScoredDocument {
    pub document: Document,
    pub score: f32,
}

/// Compile an equality-only filter map into SQL conjuncts over the metadata
/// JSON. Returns (sql fragment, params) to append to a WHERE clause.
fn filter_clauses(filters: &Metadata) -> (String, Vec<SqlValue>) {
    let mut sql = String::new();
    let mut params = Vec::new();
    for (key, value) in filters {
        sql.push_str(&format!(" AND json_extract(d.metadata, '$.{key}') = ?"));
        params.push(match value {
            MetadataValue::Str(s) => SqlValue::Text(s.clone()),
            MetadataValue::Int(i) => SqlValue::Integer(*i),
            MetadataValue::Float(f) => SqlValue::Real(*f),
            // JSON booleans read back as 0/1 through json_extract
            MetadataValue::Bool(b) => SqlValue::Integer(*b as i64),
        });
    }
    (sql, params)
}

fn parse_metadata(doc_id: &str, raw: &str) -> Metadata {
    match serde_json::from_str(raw) {
        Ok(metadata) => metadata,
        Err(e) => {
            warn!("unparseable metadata for document '{}': {}", doc_id, e);
            Metadata::new()
        }
    }
}

/// Upsert one document and its embedding. Returns the internal rowid.
pub fn upsert_document_sync(
    conn: &Connection,
    collection: &str,
    doc_id: &str,
    text: &str,
    metadata: &Metadata,
    embedding: &[f32],
) -> Result<i64> {
    let metadata_json = serde_json::to_string(metadata)?;
    conn.execute(
        "INSERT INTO documents (doc_id, collection, text, metadata, updated_at)
         VALUES (?1, ?2, ?3, ?4, CURRENT_TIMESTAMP)
         ON CONFLICT(collection, doc_id) DO UPDATE SET
             text = excluded.text,
             metadata = excluded.metadata,
             updated_at = CURRENT_TIMESTAMP",
        params![doc_id, collection, text, metadata_json],
    )?;

    let row_id: i64 = conn.query_row(
        "SELECT id FROM documents WHERE collection = ?1 AND doc_id = ?2",
        params![collection, doc_id],
        |row| row.get(0),
    )?;

    // Replace the embedding for this rowid (vec0 has no upsert)
    conn.execute("DELETE FROM vec_documents WHERE rowid = ?", [row_id])?;
    conn.execute(
        "INSERT INTO vec_documents (rowid, embedding) VALUES (?1, ?2)",
        params![row_id, embedding_to_bytes(embedding)],
    )?;

    Ok(row_id)
}

/// Dense KNN over one collection, optionally filtered on metadata equality.
/// Results come back sorted by cosine distance ascending.
pub fn search_sync(
    conn: &Connection,
    collection: &str,
    embedding: &[f32],
    filters: Option<&Metadata>,
    limit: usize,
) -> Result<Vec<ScoredDocument>> {
    let (filter_sql, filter_params) = filters
        .map(filter_clauses)
        .unwrap_or_else(|| (String::new(), Vec::new()));

    let sql = format!(
        "SELECT d.doc_id, d.text, d.metadata, vec_distance_cosine(v.embedding, ?1) AS distance
         FROM vec_documents v
         JOIN documents d ON d.id = v.rowid
         WHERE d.collection = ?2{filter_sql}
         ORDER BY distance
         LIMIT {limit}"
    );

    let mut stmt = conn.prepare(&sql)?;
    let mut bound: Vec<SqlValue> = vec![
        SqlValue::Blob(embedding_to_bytes(embedding)),
        SqlValue::Text(collection.to_string()),
    ];
    bound.extend(filter_params);

    let results = stmt
        .query_map(rusqlite::params_from_iter(bound), |row| {
            let doc_id: String = row.get(0)?;
            let text: String = row.get(1)?;
            let metadata_raw: String = row.get(2)?;
            let distance: f32 = row.get(3)?;
            Ok((doc_id, text, metadata_raw, distance))
        })?
        .filter_map(|r| r.ok())
        .map(|(doc_id, text, metadata_raw, distance)| {
            let metadata = parse_metadata(&doc_id, &metadata_raw);
            ScoredDocument {
                document: Document {
                    id: doc_id,
                    text,
                    metadata,
                    vector: None,
                },
                score: distance_to_score(distance),
            }
        })
        .collect();

    Ok(results)
}

/// Fetch stored documents by external id, preserving the requested order.
pub fn fetch_by_ids_sync(
    conn: &Connection,
    collection: &str,
    doc_ids: &[String],
) -> Result<Vec<Document>> {
    let mut stmt = conn.prepare_cached(
        "SELECT text, metadata FROM documents WHERE collection = ?1 AND doc_id = ?2",
    )?;

    let mut documents = Vec::with_capacity(doc_ids.len());
    for doc_id in doc_ids {
        let row: Option<(String, String)> = stmt
            .query_row(params![collection, doc_id], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .optional()?;
        if let Some((text, metadata_raw)) = row {
            documents.push(Document {
                id: doc_id.clone(),
                text,
                metadata: parse_metadata(doc_id, &metadata_raw),
                vector: None,
            });
        }
    }
    Ok(documents)
}

/// Delete documents by external ids. Returns the ids that actually existed
/// and were removed.
pub fn delete_by_ids_sync(
    conn: &Connection,
    collection: &str,
    doc_ids: &[String],
) -> Result<Vec<String>> {
    let mut deleted = Vec::new();
    for doc_id in doc_ids {
        let row_id: Option<i64> = conn
            .query_row(
                "SELECT id FROM documents WHERE collection = ?1 AND doc_id = ?2",
                params![collection, doc_id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(row_id) = row_id {
            conn.execute("DELETE FROM vec_documents WHERE rowid = ?", [row_id])?;
            conn.execute("DELETE FROM documents WHERE id = ?", [row_id])?;
            deleted.push(doc_id.clone());
        }
    }
    Ok(deleted)
}

/// Delete documents matching a metadata equality filter.
/// Returns the external ids removed (for keyword-index upkeep).
pub fn delete_by_filters_sync(
    conn: &Connection,
    collection: &str,
    filters: &Metadata,
) -> Result<Vec<String>> {
    let (filter_sql, filter_params) = filter_clauses(filters);
    let sql = format!(
        "SELECT d.id, d.doc_id FROM documents d WHERE d.collection = ?1{filter_sql}"
    );

    let mut stmt = conn.prepare(&sql)?;
    let mut bound: Vec<SqlValue> = vec![SqlValue::Text(collection.to_string())];
    bound.extend(filter_params);

    let matches: Vec<(i64, String)> = stmt
        .query_map(rusqlite::params_from_iter(bound), |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut removed = Vec::with_capacity(matches.len());
    for (row_id, doc_id) in matches {
        conn.execute("DELETE FROM vec_documents WHERE rowid = ?", [row_id])?;
        conn.execute("DELETE FROM documents WHERE id = ?", [row_id])?;
        removed.push(doc_id);
    }
    Ok(removed)
}

/// Count documents in a collection, optionally filtered.
pub fn count_sync(conn: &Connection, collection: &str, filters: Option<&Metadata>) -> Result<i64> {
    let (filter_sql, filter_params) = filters
        .map(filter_clauses)
        .unwrap_or_else(|| (String::new(), Vec::new()));
    let sql = format!("SELECT COUNT(*) FROM documents d WHERE d.collection = ?1{filter_sql}");

    let mut bound: Vec<SqlValue> = vec![SqlValue::Text(collection.to_string())];
    bound.extend(filter_params);

    let count = conn.query_row(&sql, rusqlite::params_from_iter(bound), |row| row.get(0))?;
    Ok(count)
}

/// All (doc_id, text) pairs of a collection in insertion order, for keyword
/// index rebuilds.
pub fn all_texts_sync(conn: &Connection, collection: &str) -> Result<Vec<(String, String)>> {
    let mut stmt = conn.prepare(
        "SELECT doc_id, text FROM documents WHERE collection = ?1 ORDER BY id",
    )?;
    let rows = stmt
        .query_map([collection], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::pool::ensure_sqlite_vec_registered;
    use crate::db::schema::run_migrations;

    fn test_conn() -> Connection {
        ensure_sqlite_vec_registered();
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn, 4).unwrap();
        conn
    }

    fn meta(pairs: &[(&str, MetadataValue)]) -> Metadata {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_upsert_and_search() {
        let conn = test_conn();
        let m = meta(&[("source", "telegram".into())]);
        upsert_document_sync(&conn, "documents", "d1", "hello", &m, &[1.0, 0.0, 0.0, 0.0]).unwrap();
        upsert_document_sync(&conn, "documents", "d2", "world", &m, &[0.0, 1.0, 0.0, 0.0]).unwrap();

        let hits = search_sync(&conn, "documents", &[1.0, 0.0, 0.0, 0.0], None, 10).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].document.id, "d1");
        assert!(hits[0].score > hits[1].score);
        assert_eq!(
            hits[0].document.meta_str("source"),
            Some("telegram")
        );
    }

    #[test]
    fn test_upsert_same_id_replaces() {
        let conn = test_conn();
        let m = Metadata::new();
        upsert_document_sync(&conn, "documents", "d1", "old", &m, &[1.0, 0.0, 0.0, 0.0]).unwrap();
        upsert_document_sync(&conn, "documents", "d1", "new", &m, &[0.0, 1.0, 0.0, 0.0]).unwrap();

        assert_eq!(count_sync(&conn, "documents", None).unwrap(), 1);
        let hits = search_sync(&conn, "documents", &[0.0, 1.0, 0.0, 0.0], None, 10).unwrap();
        assert_eq!(hits[0].document.text, "new");

        let vec_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM vec_documents", [], |row| row.get(0))
            .unwrap();
        assert_eq!(vec_count, 1);
    }

    #[test]
    fn test_search_with_filters() {
        let conn = test_conn();
        upsert_document_sync(
            &conn,
            "documents",
            "d1",
            "a",
            &meta(&[("conversation_id", "C1".into())]),
            &[1.0, 0.0, 0.0, 0.0],
        )
        .unwrap();
        upsert_document_sync(
            &conn,
            "documents",
            "d2",
            "b",
            &meta(&[("conversation_id", "C2".into())]),
            &[1.0, 0.0, 0.0, 0.0],
        )
        .unwrap();

        let filters = meta(&[("conversation_id", "C2".into())]);
        let hits =
            search_sync(&conn, "documents", &[1.0, 0.0, 0.0, 0.0], Some(&filters), 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document.id, "d2");
    }

    #[test]
    fn test_collections_are_isolated() {
        let conn = test_conn();
        let m = Metadata::new();
        upsert_document_sync(&conn, "telegram_messages", "t1", "tg", &m, &[1.0, 0.0, 0.0, 0.0])
            .unwrap();
        upsert_document_sync(&conn, "documents", "d1", "doc", &m, &[1.0, 0.0, 0.0, 0.0]).unwrap();

        let hits = search_sync(&conn, "telegram_messages", &[1.0, 0.0, 0.0, 0.0], None, 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document.id, "t1");
        assert_eq!(count_sync(&conn, "documents", None).unwrap(), 1);
        // Unknown collection searches come back empty
        assert!(search_sync(&conn, "nope", &[1.0, 0.0, 0.0, 0.0], None, 10)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_delete_by_ids_idempotent() {
        let conn = test_conn();
        let m = Metadata::new();
        upsert_document_sync(&conn, "documents", "d1", "a", &m, &[1.0, 0.0, 0.0, 0.0]).unwrap();
        upsert_document_sync(&conn, "documents", "d2", "b", &m, &[0.0, 1.0, 0.0, 0.0]).unwrap();

        let ids = vec!["d1".to_string(), "d2".to_string()];
        assert_eq!(delete_by_ids_sync(&conn, "documents", &ids).unwrap().len(), 2);
        assert!(delete_by_ids_sync(&conn, "documents", &ids).unwrap().is_empty());
        assert_eq!(count_sync(&conn, "documents", None).unwrap(), 0);
    }

    #[test]
    fn test_delete_by_filters_returns_ids() {
        let conn = test_conn();
        upsert_document_sync(
            &conn,
            "documents",
            "d1",
            "a",
            &meta(&[("author", "alice".into())]),
            &[1.0, 0.0, 0.0, 0.0],
        )
        .unwrap();
        upsert_document_sync(
            &conn,
            "documents",
            "d2",
            "b",
            &meta(&[("author", "bob".into())]),
            &[0.0, 1.0, 0.0, 0.0],
        )
        .unwrap();

        let removed =
            delete_by_filters_sync(&conn, "documents", &meta(&[("author", "alice".into())]))
                .unwrap();
        assert_eq!(removed, vec!["d1".to_string()]);
        assert_eq!(count_sync(&conn, "documents", None).unwrap(), 1);
    }

    #[test]
    fn test_count_matches_search_breadth() {
        let conn = test_conn();
        for i in 0..7 {
            upsert_document_sync(
                &conn,
                "documents",
                &format!("d{i}"),
                "text",
                &meta(&[("parity", MetadataValue::Int(i % 2))]),
                &[i as f32, 1.0, 0.0, 0.0],
            )
            .unwrap();
        }
        let filters = meta(&[("parity", MetadataValue::Int(0))]);
        let count = count_sync(&conn, "documents", Some(&filters)).unwrap();
        let hits =
            search_sync(&conn, "documents", &[1.0, 1.0, 0.0, 0.0], Some(&filters), 1000).unwrap();
        assert_eq!(count as usize, hits.len());
        assert_eq!(count, 4);
    }

    #[test]
    fn test_all_texts_insertion_order() {
        let conn = test_conn();
        let m = Metadata::new();
        upsert_document_sync(&conn, "documents", "b", "second", &m, &[0.0; 4]).unwrap();
        upsert_document_sync(&conn, "documents", "a", "first", &m, &[0.0; 4]).unwrap();
        let texts = all_texts_sync(&conn, "documents").unwrap();
        assert_eq!(texts[0].0, "b");
        assert_eq!(texts[1].0, "a");
    }
}
