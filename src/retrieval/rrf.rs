// src/retrieval/rrf.rs
// Reciprocal Rank Fusion over ranked hit lists.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use crate::store::ScoredDocument;

/// RRF constant (k=60 is standard in information retrieval).
pub const RRF_K: f64 = 60.0;

/// Fuse ranked lists: each appearance of a document at rank r contributes
/// 1/(K + r). Output is sorted by aggregate score descending, and each hit's
/// score field carries its fused score.
pub fn fuse(result_lists: Vec<Vec<ScoredDocument>>) -> Vec<ScoredDocument> {
    let mut scores: HashMap<String, f64> = HashMap::new();
    let mut documents: HashMap<String, ScoredDocument> = HashMap::new();

    for results in result_lists {
        for (rank, hit) in results.into_iter().enumerate() {
            let key = fusion_key(&hit);
            *scores.entry(key.clone()).or_insert(0.0) += 1.0 / (RRF_K + rank as f64);
            documents.entry(key).or_insert(hit);
        }
    }

    let mut fused: Vec<(f64, ScoredDocument)> = scores
        .into_iter()
        .filter_map(|(key, score)| {
            documents.remove(&key).map(|mut hit| {
                hit.score = score as f32;
                (score, hit)
            })
        })
        .collect();

    fused.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    fused.into_iter().map(|(_, hit)| hit).collect()
}

/// Documents without a stable id fuse under a synthetic key derived from
/// their text and metadata.
fn fusion_key(hit: &ScoredDocument) -> String {
    if !hit.document.id.is_empty() {
        return hit.document.id.clone();
    }
    let mut text_hasher = std::collections::hash_map::DefaultHasher::new();
    hit.document.text.hash(&mut text_hasher);
    let mut meta_hasher = std::collections::hash_map::DefaultHasher::new();
    for (key, value) in &hit.document.metadata {
        key.hash(&mut meta_hasher);
        format!("{value:?}").hash(&mut meta_hasher);
    }
    format!("synthetic_{:x}", text_hasher.finish() ^ meta_hasher.finish())
}
