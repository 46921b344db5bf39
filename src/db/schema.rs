// src/db/schema.rs
// Schema for the embedded store: documents, dense vectors, ingestor state.

use anyhow::Result;
use rusqlite::Connection;

/// Main schema. Documents are the source of truth; the vec0 table holds one
/// embedding per document keyed by the same rowid.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    id INTEGER PRIMARY KEY,
    doc_id TEXT NOT NULL,
    collection TEXT NOT NULL,
    text TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT DEFAULT CURRENT_TIMESTAMP,
    updated_at TEXT DEFAULT CURRENT_TIMESTAMP,
    UNIQUE(collection, doc_id)
);
CREATE INDEX IF NOT EXISTS idx_documents_collection ON documents(collection);

CREATE TABLE IF NOT EXISTS ingestor_state (
    ingestor_id TEXT PRIMARY KEY,
    last_timestamp INTEGER NOT NULL DEFAULT 0,
    metadata_json TEXT NOT NULL DEFAULT '{}',
    updated_at TEXT DEFAULT CURRENT_TIMESTAMP
);
"#;

/// Build the vec0 virtual table DDL for the configured embedding dimension.
///
/// chunk_size=256 keeps per-chunk preallocation small; sqlite-vec scans
/// brute-force for KNN, so chunk size does not affect query behavior at this
/// scale.
fn vec_documents_create_sql(dim: usize) -> String {
    format!(
        "CREATE VIRTUAL TABLE IF NOT EXISTS vec_documents USING vec0(
    embedding float[{dim}],
    chunk_size=256
)"
    )
}

/// Run all migrations. Idempotent; called once per pool at startup.
pub fn run_migrations(conn: &Connection, embedding_dim: usize) -> Result<()> {
    conn.execute_batch(SCHEMA)?;
    conn.execute_batch(&vec_documents_create_sql(embedding_dim))?;
    migrate_vec_dimension(conn, embedding_dim)?;
    Ok(())
}

/// If the vec table exists with a different dimension, it cannot hold the
/// configured embeddings; recreate it empty. Dense data is rebuilt by
/// re-ingestion; documents and state are untouched.
fn migrate_vec_dimension(conn: &Connection, embedding_dim: usize) -> Result<()> {
    let existing_sql: Option<String> = conn
        .query_row(
            "SELECT sql FROM sqlite_master WHERE type='table' AND name='vec_documents'",
            [],
            |row| row.get(0),
        )
        .ok();

    if let Some(sql) = existing_sql {
        let wanted = format!("float[{embedding_dim}]");
        if !sql.contains(&wanted) {
            tracing::warn!(
                "vec_documents dimension differs from configured {}; recreating empty",
                embedding_dim
            );
            conn.execute("DROP TABLE vec_documents", [])?;
            conn.execute_batch(&vec_documents_create_sql(embedding_dim))?;
        }
    }
    Ok(())
}
