// src/store/bm25/index.rs
// In-memory BM25 postings and scoring.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// BM25 parameters, persisted with every snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bm25Params {
    pub k1: f64,
    pub b: f64,
    pub tokenizer_pattern: String,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self {
            k1: 1.5,
            b: 0.75,
            tokenizer_pattern: super::tokenizer::DEFAULT_PATTERN.to_string(),
        }
    }
}

/// Core index fields, serialized under `bm25_index` in the snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Bm25Fields {
    /// term -> { internal doc id -> term frequency }
    pub term_doc_freq: HashMap<String, HashMap<u64, u32>>,
    /// internal doc id -> token count
    pub doc_lengths: HashMap<u64, u32>,
    pub avg_doc_length: f64,
    pub total_docs: u64,
}

/// Postings plus the external-to-internal id map. Internal ids are assigned
/// in insertion order and break score ties.
#[derive(Debug, Clone, Default)]
pub struct Bm25Data {
    pub fields: Bm25Fields,
    pub doc_id_map: HashMap<String, u64>,
    internal_to_external: HashMap<u64, String>,
    next_internal_id: u64,
}

impl Bm25Data {
    /// Rebuild runtime lookups after deserializing a snapshot.
    pub fn from_snapshot(fields: Bm25Fields, doc_id_map: HashMap<String, u64>) -> Self {
        let internal_to_external = doc_id_map
            .iter()
            .map(|(ext, int)| (*int, ext.clone()))
            .collect::<HashMap<_, _>>();
        let next_internal_id = doc_id_map.values().max().map(|m| m + 1).unwrap_or(0);
        Self {
            fields,
            doc_id_map,
            internal_to_external,
            next_internal_id,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.total_docs == 0
    }

    pub fn contains(&self, external_id: &str) -> bool {
        self.doc_id_map.contains_key(external_id)
    }

    /// Index one document. Re-indexing an existing id first drops its stale
    /// postings so term and document statistics stay exact.
    pub fn index_document(&mut self, external_id: &str, tokens: &[String]) {
        let internal_id = match self.doc_id_map.get(external_id) {
            Some(existing) => {
                let id = *existing;
                self.remove_postings(id);
                id
            }
            None => {
                let id = self.next_internal_id;
                self.next_internal_id += 1;
                self.doc_id_map.insert(external_id.to_string(), id);
                self.internal_to_external.insert(id, external_id.to_string());
                id
            }
        };

        for token in tokens {
            *self
                .fields
                .term_doc_freq
                .entry(token.clone())
                .or_default()
                .entry(internal_id)
                .or_insert(0) += 1;
        }
        self.fields.doc_lengths.insert(internal_id, tokens.len() as u32);
        self.recompute_stats();
    }

    /// Remove a document entirely (postings and id mapping).
    pub fn remove_document(&mut self, external_id: &str) -> bool {
        let Some(internal_id) = self.doc_id_map.remove(external_id) else {
            return false;
        };
        self.internal_to_external.remove(&internal_id);
        self.remove_postings(internal_id);
        self.fields.doc_lengths.remove(&internal_id);
        self.recompute_stats();
        true
    }

    /// Sweep all posting lists for one internal id. O(vocabulary), acceptable
    /// at batch scale; keeps df exact so IDF stays correct.
    fn remove_postings(&mut self, internal_id: u64) {
        self.fields.term_doc_freq.retain(|_, postings| {
            postings.remove(&internal_id);
            !postings.is_empty()
        });
    }

    fn recompute_stats(&mut self) {
        self.fields.total_docs = self.fields.doc_lengths.len() as u64;
        self.fields.avg_doc_length = if self.fields.total_docs == 0 {
            0.0
        } else {
            self.fields.doc_lengths.values().map(|&l| l as f64).sum::<f64>()
                / self.fields.total_docs as f64
        };
    }

    /// Score all documents containing at least one query token.
    /// Returns (external id, score) sorted by score descending, ties broken
    /// by internal insertion order.
    pub fn score(&self, query_tokens: &[String], params: &Bm25Params, limit: usize) -> Vec<(String, f64)> {
        if self.fields.total_docs == 0 || query_tokens.is_empty() {
            return Vec::new();
        }

        let n = self.fields.total_docs as f64;
        let avg_len = self.fields.avg_doc_length.max(f64::EPSILON);
        let mut scores: HashMap<u64, f64> = HashMap::new();

        for token in query_tokens {
            let Some(postings) = self.fields.term_doc_freq.get(token) else {
                continue;
            };
            let df = postings.len() as f64;
            let idf = (((n - df + 0.5) / (df + 0.5)) + 1.0).ln();

            for (&doc, &freq) in postings {
                let doc_len = self.fields.doc_lengths.get(&doc).copied().unwrap_or(0) as f64;
                let f = freq as f64;
                let denom = f + params.k1 * (1.0 - params.b + params.b * doc_len / avg_len);
                *scores.entry(doc).or_insert(0.0) += idf * (f * (params.k1 + 1.0)) / denom;
            }
        }

        let mut ranked: Vec<(u64, f64)> = scores.into_iter().collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });

        ranked
            .into_iter()
            .take(limit)
            .filter_map(|(internal, score)| {
                self.internal_to_external
                    .get(&internal)
                    .map(|ext| (ext.clone(), score))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    fn build_sample() -> Bm25Data {
        let mut data = Bm25Data::default();
        data.index_document("d1", &tokens(&["the", "quick", "brown", "fox"]));
        data.index_document("d2", &tokens(&["the", "lazy", "dog"]));
        data.index_document("d3", &tokens(&["quick", "quick", "fox"]));
        data
    }

    #[test]
    fn test_stats_invariant() {
        let data = build_sample();
        assert_eq!(data.fields.total_docs, 3);
        assert_eq!(data.fields.doc_lengths.len(), 3);
        let expected_avg = (4.0 + 3.0 + 3.0) / 3.0;
        assert!((data.fields.avg_doc_length - expected_avg).abs() < 1e-9);
    }

    #[test]
    fn test_score_prefers_higher_term_frequency() {
        let data = build_sample();
        let results = data.score(&tokens(&["quick"]), &Bm25Params::default(), 10);
        assert_eq!(results.len(), 2);
        // d3 has "quick" twice and is shorter
        assert_eq!(results[0].0, "d3");
        assert!(results[0].1 > results[1].1);
    }

    #[test]
    fn test_unmatched_docs_not_scored() {
        let data = build_sample();
        let results = data.score(&tokens(&["dog"]), &Bm25Params::default(), 10);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "d2");
    }

    #[test]
    fn test_no_matches_empty() {
        let data = build_sample();
        assert!(data.score(&tokens(&["zebra"]), &Bm25Params::default(), 10).is_empty());
        assert!(data.score(&[], &Bm25Params::default(), 10).is_empty());
    }

    #[test]
    fn test_reindex_removes_stale_postings() {
        let mut data = build_sample();
        data.index_document("d1", &tokens(&["completely", "different"]));

        assert_eq!(data.fields.total_docs, 3);
        // "brown" only appeared in d1's old text
        assert!(!data.fields.term_doc_freq.contains_key("brown"));
        assert!(data.score(&tokens(&["brown"]), &Bm25Params::default(), 10).is_empty());
        let results = data.score(&tokens(&["different"]), &Bm25Params::default(), 10);
        assert_eq!(results[0].0, "d1");
    }

    #[test]
    fn test_remove_document() {
        let mut data = build_sample();
        assert!(data.remove_document("d2"));
        assert!(!data.remove_document("d2"));
        assert_eq!(data.fields.total_docs, 2);
        assert!(!data.fields.term_doc_freq.contains_key("lazy"));
        assert!(data.score(&tokens(&["dog"]), &Bm25Params::default(), 10).is_empty());
    }

    #[test]
    fn test_tie_broken_by_insertion_order() {
        let mut data = Bm25Data::default();
        data.index_document("first", &tokens(&["alpha", "beta"]));
        data.index_document("second", &tokens(&["alpha", "gamma"]));
        let results = data.score(&tokens(&["alpha"]), &Bm25Params::default(), 10);
        assert_eq!(results[0].0, "first");
        assert_eq!(results[1].0, "second");
        assert!((results[0].1 - results[1].1).abs() < 1e-12);
    }

    #[test]
    fn test_snapshot_round_trip_preserves_assignment() {
        let data = build_sample();
        let restored = Bm25Data::from_snapshot(data.fields.clone(), data.doc_id_map.clone());
        assert_eq!(restored.fields.total_docs, data.fields.total_docs);

        let before = data.score(&tokens(&["quick", "fox"]), &Bm25Params::default(), 10);
        let after = restored.score(&tokens(&["quick", "fox"]), &Bm25Params::default(), 10);
        let before_ids: Vec<_> = before.iter().map(|(id, _)| id.clone()).collect();
        let after_ids: Vec<_> = after.iter().map(|(id, _)| id.clone()).collect();
        assert_eq!(before_ids, after_ids);
    }
}
