// src/retrieval/mod.rs
// Hybrid retrieval: source routing, query expansion, parallel dense + sparse
// search, rank fusion, threshold filtering.

pub mod expansion;
pub mod rrf;

pub use expansion::QueryExpander;
pub use rrf::fuse;

use regex::Regex;
use std::sync::Arc;
use std::sync::LazyLock;
use tracing::{debug, warn};

use crate::embeddings::Embedder;
use crate::error::Result;
use crate::store::{DEFAULT_KEYWORD_WAIT, ScoredDocument, VectorStore};

/// `from:<src>` / `source:<src>` routing token, case-insensitive.
static SOURCE_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(?:from|source):(\w+)").expect("valid routing pattern"));
static SOURCE_TOKEN_STRIP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(?:from|source):\w+\s*").expect("valid routing pattern"));

/// Pull an optional source routing token out of a query.
/// Returns the cleaned query and the source key, if any.
pub fn parse_source_token(query: &str) -> (String, Option<String>) {
    let Some(captures) = SOURCE_TOKEN.captures(query) else {
        return (query.to_string(), None);
    };
    let source = captures[1].to_lowercase();
    let cleaned = SOURCE_TOKEN_STRIP.replace_all(query, "").trim().to_string();
    (cleaned, Some(source))
}

/// Retrieval core shared by query orchestration and evaluation tools.
pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    store: Arc<VectorStore>,
    expander: QueryExpander,
}

impl Retriever {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        store: Arc<VectorStore>,
        expander: QueryExpander,
    ) -> Self {
        Self {
            embedder,
            store,
            expander,
        }
    }

    /// Retrieve the top `k` documents for a query.
    ///
    /// Dense and sparse hit lists from every query variant are fused with
    /// reciprocal rank fusion; only fused scores at or above `threshold`
    /// survive.
    pub async fn retrieve(
        &self,
        query: &str,
        k: usize,
        threshold: f64,
    ) -> Result<Vec<ScoredDocument>> {
        let (cleaned, source) = parse_source_token(query);
        let collection = source
            .as_deref()
            .map(|src| self.store.find_collection_name(src));
        if let Some(collection) = &collection {
            debug!(collection = %collection, "query routed by source token");
        }

        let variants = self.expander.expand(&cleaned).await;
        let per_variant_limit = k.max(5);

        let mut dense_hits = Vec::new();
        let mut sparse_hits = Vec::new();
        for variant in &variants {
            let query_vector = match self.embedder.embed(variant).await {
                Ok(vector) => vector,
                Err(e) => {
                    warn!("embedding query variant failed: {}", e);
                    continue;
                }
            };

            match self
                .store
                .search(&query_vector, per_variant_limit, None, collection.as_deref())
                .await
            {
                Ok(hits) => dense_hits.extend(hits),
                Err(e) => warn!("dense search failed: {}", e),
            }

            match self
                .store
                .keyword_search_async(
                    variant,
                    per_variant_limit,
                    None,
                    collection.as_deref(),
                    DEFAULT_KEYWORD_WAIT,
                )
                .await
            {
                Ok(hits) => sparse_hits.extend(hits),
                Err(e) => warn!("keyword search unavailable: {}", e),
            }
        }

        let fused = fuse(vec![dense_hits, sparse_hits]);
        let mut kept = Vec::with_capacity(k);
        for hit in fused {
            if (hit.score as f64) >= threshold {
                kept.push(hit);
            }
            if kept.len() >= k {
                break;
            }
        }
        Ok(kept)
    }
}
