// src/store/mod.rs
// Hybrid vector store: dense collections in sqlite-vec plus a BM25 keyword
// index over the default collection.

pub mod bm25;
pub mod dense;

pub use bm25::{Bm25Params, IndexingState, KeywordIndex};
pub use dense::{ScoredDocument, distance_to_score, embedding_to_bytes};

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::VectorStoreConfig;
use crate::db::DatabasePool;
use crate::document::{Document, Metadata};
use crate::error::MnemoError;

/// Default wait for keyword searches that need the index idle.
pub const DEFAULT_KEYWORD_WAIT: Duration = Duration::from_secs(60);

/// Aggregate health signal for the store.
#[derive(Debug, Clone)]
pub struct Health {
    pub healthy: bool,
    pub details: String,
}

/// Store facade owning the dense collections and the keyword index.
pub struct VectorStore {
    pool: Arc<DatabasePool>,
    config: VectorStoreConfig,
    keyword: Option<Arc<KeywordIndex>>,
}

impl VectorStore {
    /// Open the store. When BM25 is enabled, loads the persisted snapshot for
    /// the default collection, rebuilding from stored documents if the
    /// snapshot is missing or unusable. Keyword failures degrade to
    /// dense-only operation.
    pub async fn new(pool: Arc<DatabasePool>, config: VectorStoreConfig) -> Result<Self> {
        let keyword = if config.enable_bm25 {
            let params = Bm25Params {
                k1: config.bm25_k1,
                b: config.bm25_b,
                tokenizer_pattern: config.tokenizer_pattern.clone(),
            };
            match KeywordIndex::new(&config.collection_name, &config.persist_directory, params) {
                Ok(index) => Some(Arc::new(index)),
                Err(e) => {
                    warn!("keyword index unavailable, dense-only mode: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let store = Self {
            pool,
            config,
            keyword,
        };

        if let Some(index) = &store.keyword {
            if let Err(e) = index.load().await {
                info!("keyword snapshot not usable ({}), rebuilding", e);
                if let Err(e) = store.rebuild_keyword_index(index).await {
                    warn!("keyword index rebuild failed, dense-only until next write: {}", e);
                }
            }
        }

        Ok(store)
    }

    pub fn default_collection(&self) -> &str {
        &self.config.collection_name
    }

    /// Resolve the collection for a source key; unmapped sources use the
    /// default collection.
    pub fn find_collection_name(&self, source: &str) -> String {
        self.config
            .source_collections
            .get(&source.to_lowercase())
            .cloned()
            .unwrap_or_else(|| self.config.collection_name.clone())
    }

    fn resolve_collection(&self, collection: Option<&str>) -> String {
        collection
            .map(str::to_string)
            .unwrap_or_else(|| self.config.collection_name.clone())
    }

    /// Upsert documents with their vectors. Returns the assigned ids
    /// (generated UUIDs where the incoming id was empty).
    ///
    /// Already-written documents are not rolled back when a later write in
    /// the batch fails; the first error is propagated after the batch.
    pub async fn add_documents(
        &self,
        documents: Vec<Document>,
        vectors: Vec<Vec<f32>>,
        collection: Option<&str>,
    ) -> Result<Vec<String>, MnemoError> {
        if documents.len() != vectors.len() {
            return Err(MnemoError::InvalidInput(format!(
                "documents ({}) and vectors ({}) must have equal length",
                documents.len(),
                vectors.len()
            )));
        }
        let dim = self.pool.embedding_dim();
        for vector in &vectors {
            if vector.len() != dim {
                return Err(MnemoError::InvalidInput(format!(
                    "vector has {} dimensions, store expects {}",
                    vector.len(),
                    dim
                )));
            }
        }

        let target = self.resolve_collection(collection);
        let mut assigned_ids = Vec::with_capacity(documents.len());
        let mut written: Vec<(String, String)> = Vec::with_capacity(documents.len());
        let mut first_error: Option<anyhow::Error> = None;

        for (mut document, vector) in documents.into_iter().zip(vectors.into_iter()) {
            if document.id.is_empty() {
                document.id = Uuid::new_v4().to_string();
            }
            if document.text.is_empty() {
                warn!("storing document '{}' with empty text", document.id);
            }
            assigned_ids.push(document.id.clone());

            let target_clone = target.clone();
            let doc_id = document.id.clone();
            let text = document.text.clone();
            let metadata = document.metadata.clone();
            let result = self
                .pool
                .interact_with_retry(move |conn| {
                    dense::upsert_document_sync(
                        conn,
                        &target_clone,
                        &doc_id,
                        &text,
                        &metadata,
                        &vector,
                    )
                })
                .await;

            match result {
                Ok(_) => written.push((document.id.clone(), document.text.clone())),
                Err(e) => {
                    warn!("failed to write document '{}': {}", document.id, e);
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        // Keyword upkeep for the default collection; never fails the write.
        if target == self.config.collection_name && !written.is_empty() {
            self.index_keywords(&written).await;
        }

        if let Some(e) = first_error {
            return Err(MnemoError::Store(format!(
                "batch write partially failed ({} of {} written): {}",
                written.len(),
                assigned_ids.len(),
                e
            )));
        }
        Ok(assigned_ids)
    }

    /// Convenience wrapper for documents that already carry their vector.
    pub async fn store_documents(
        &self,
        documents: Vec<Document>,
        collection: Option<&str>,
    ) -> Result<(), MnemoError> {
        let mut docs = Vec::with_capacity(documents.len());
        let mut vectors = Vec::with_capacity(documents.len());
        for mut document in documents {
            let Some(vector) = document.vector.take() else {
                return Err(MnemoError::InvalidInput(format!(
                    "document '{}' has no vector",
                    document.id
                )));
            };
            docs.push(document);
            vectors.push(vector);
        }
        self.add_documents(docs, vectors, collection).await?;
        Ok(())
    }

    /// Dense search over one collection. Unknown collections come back empty.
    pub async fn search(
        &self,
        query_vector: &[f32],
        limit: usize,
        filters: Option<Metadata>,
        collection: Option<&str>,
    ) -> Result<Vec<ScoredDocument>, MnemoError> {
        let dim = self.pool.embedding_dim();
        if query_vector.len() != dim {
            return Err(MnemoError::InvalidInput(format!(
                "query vector has {} dimensions, store expects {}",
                query_vector.len(),
                dim
            )));
        }

        let target = self.resolve_collection(collection);
        let query = query_vector.to_vec();
        let results = self
            .pool
            .interact(move |conn| {
                dense::search_sync(conn, &target, &query, filters.as_ref(), limit)
            })
            .await;

        match results {
            Ok(hits) => Ok(hits),
            Err(e) => {
                warn!("dense search failed, returning empty: {}", e);
                Ok(Vec::new())
            }
        }
    }

    /// BM25 search over the default collection. Requires the keyword index to
    /// be idle; other collections yield an empty result with a warning.
    pub async fn keyword_search(
        &self,
        query: &str,
        limit: usize,
        filters: Option<Metadata>,
        collection: Option<&str>,
    ) -> Result<Vec<ScoredDocument>, MnemoError> {
        let target = self.resolve_collection(collection);
        if target != self.config.collection_name {
            warn!(
                "keyword search requested on '{}' but only '{}' is indexed",
                target, self.config.collection_name
            );
            return Ok(Vec::new());
        }
        let Some(index) = &self.keyword else {
            warn!("keyword search requested but BM25 is disabled");
            return Ok(Vec::new());
        };

        let scored = index.search(query, limit).await?;
        self.hydrate_keyword_hits(scored, filters, limit).await
    }

    /// Like [`keyword_search`](Self::keyword_search) but waits up to
    /// `max_wait` for the index to become idle, then fails with a timeout.
    pub async fn keyword_search_async(
        &self,
        query: &str,
        limit: usize,
        filters: Option<Metadata>,
        collection: Option<&str>,
        max_wait: Duration,
    ) -> Result<Vec<ScoredDocument>, MnemoError> {
        let target = self.resolve_collection(collection);
        if target != self.config.collection_name {
            warn!(
                "keyword search requested on '{}' but only '{}' is indexed",
                target, self.config.collection_name
            );
            return Ok(Vec::new());
        }
        let Some(index) = &self.keyword else {
            warn!("keyword search requested but BM25 is disabled");
            return Ok(Vec::new());
        };

        let scored = index.search_waiting(query, limit, max_wait).await?;
        self.hydrate_keyword_hits(scored, filters, limit).await
    }

    async fn hydrate_keyword_hits(
        &self,
        scored: Vec<(String, f64)>,
        filters: Option<Metadata>,
        limit: usize,
    ) -> Result<Vec<ScoredDocument>, MnemoError> {
        if scored.is_empty() {
            return Ok(Vec::new());
        }
        let collection = self.config.collection_name.clone();
        let ids: Vec<String> = scored.iter().map(|(id, _)| id.clone()).collect();
        let documents = self
            .pool
            .interact(move |conn| dense::fetch_by_ids_sync(conn, &collection, &ids))
            .await?;

        let hits = scored
            .into_iter()
            .filter_map(|(id, score)| {
                documents
                    .iter()
                    .find(|d| d.id == id)
                    .map(|d| ScoredDocument {
                        document: d.clone(),
                        score: score as f32,
                    })
            })
            .filter(|hit| match &filters {
                Some(filters) => filters
                    .iter()
                    .all(|(key, value)| hit.document.metadata.get(key) == Some(value)),
                None => true,
            })
            .take(limit)
            .collect();
        Ok(hits)
    }

    /// Delete by ids or by filters (exactly one must be given).
    /// Returns the number of documents removed.
    pub async fn delete(
        &self,
        ids: Option<Vec<String>>,
        filters: Option<Metadata>,
        collection: Option<&str>,
    ) -> Result<usize, MnemoError> {
        let target = self.resolve_collection(collection);

        let removed_ids: Vec<String> = match (ids, filters) {
            (Some(ids), None) => {
                let target_clone = target.clone();
                self.pool
                    .interact(move |conn| dense::delete_by_ids_sync(conn, &target_clone, &ids))
                    .await?
            }
            (None, Some(filters)) => {
                let target_clone = target.clone();
                self.pool
                    .interact(move |conn| {
                        dense::delete_by_filters_sync(conn, &target_clone, &filters)
                    })
                    .await?
            }
            _ => {
                return Err(MnemoError::InvalidInput(
                    "delete requires exactly one of ids or filters".into(),
                ));
            }
        };

        if target == self.config.collection_name && !removed_ids.is_empty() {
            if let Some(index) = &self.keyword {
                if let Err(e) = index.remove(&removed_ids).await {
                    warn!("keyword index removal failed: {}", e);
                } else if let Err(e) = index.save().await {
                    warn!("keyword index save after delete failed: {}", e);
                }
            }
        }

        Ok(removed_ids.len())
    }

    /// Count documents in a collection, optionally filtered.
    pub async fn count(
        &self,
        filters: Option<Metadata>,
        collection: Option<&str>,
    ) -> Result<i64, MnemoError> {
        let target = self.resolve_collection(collection);
        let count = self
            .pool
            .interact(move |conn| dense::count_sync(conn, &target, filters.as_ref()))
            .await?;
        Ok(count)
    }

    /// Exercise a count against the default collection.
    pub async fn healthcheck(&self) -> Health {
        match self.count(None, None).await {
            Ok(count) => Health {
                healthy: true,
                details: format!(
                    "collection '{}' reachable, {} documents",
                    self.config.collection_name, count
                ),
            },
            Err(e) => Health {
                healthy: false,
                details: format!("store unreachable: {e}"),
            },
        }
    }

    /// Current keyword index state, if BM25 is enabled.
    pub async fn keyword_state(&self) -> Option<IndexingState> {
        match &self.keyword {
            Some(index) => Some(index.state().await),
            None => None,
        }
    }

    /// Whether a document id is present in the keyword index.
    pub async fn keyword_contains(&self, doc_id: &str) -> bool {
        match &self.keyword {
            Some(index) => index.contains(doc_id).await,
            None => false,
        }
    }

    async fn rebuild_keyword_index(&self, index: &Arc<KeywordIndex>) -> Result<(), MnemoError> {
        let collection = self.config.collection_name.clone();
        let texts = self
            .pool
            .interact(move |conn| dense::all_texts_sync(conn, &collection))
            .await?;
        index.build(&texts).await?;
        index.save().await?;
        Ok(())
    }

    /// Incrementally index freshly written documents, persisting afterwards.
    /// Failures are logged and never abort ingestion.
    async fn index_keywords(&self, written: &[(String, String)]) {
        let Some(index) = &self.keyword else {
            return;
        };
        if let Err(e) = index.update(written).await {
            warn!("keyword index update failed: {}", e);
            return;
        }
        if let Err(e) = index.save().await {
            warn!("keyword index save failed: {}", e);
        }
    }
}
