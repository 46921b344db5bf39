// src/retrieval/expansion.rs
// Optional LM-backed query expansion. The original query is always the first
// variant; expansion failures leave it standing alone.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::llm::Generator;

const EXPANSION_PROMPT: &str = "Generate three alternative versions of the following query to improve document retrieval.

Original Query: {query}

Instructions:
1. Rephrase the query in different ways while preserving the core intent
2. Use synonyms for key terms
3. Make one version more specific and one more general
4. Format as a numbered list with no additional text

Example:
1. [rephrased query 1]
2. [rephrased query 2]
3. [rephrased query 3]
";

pub struct QueryExpander {
    generator: Option<Arc<dyn Generator>>,
    enabled: bool,
}

impl QueryExpander {
    pub fn new(generator: Option<Arc<dyn Generator>>, enabled: bool) -> Self {
        Self { generator, enabled }
    }

    pub fn disabled() -> Self {
        Self {
            generator: None,
            enabled: false,
        }
    }

    /// Produce query variants for retrieval. The returned list always starts
    /// with the original query and never comes back empty.
    pub async fn expand(&self, query: &str) -> Vec<String> {
        let mut variants = vec![query.to_string()];

        if !self.enabled {
            return variants;
        }
        let Some(generator) = &self.generator else {
            return variants;
        };

        let prompt = EXPANSION_PROMPT.replace("{query}", query);
        match generator.generate(&prompt, None).await {
            Ok(result) => {
                for candidate in parse_numbered_list(&result) {
                    if !variants.contains(&candidate) {
                        variants.push(candidate);
                    }
                }
                debug!(count = variants.len(), "expanded query");
            }
            Err(e) => {
                warn!("query expansion failed, using original only: {}", e);
            }
        }
        variants
    }
}

/// Extract entries of a "1. ..." numbered list.
fn parse_numbered_list(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| {
            let trimmed = line.trim();
            let (prefix, rest) = trimmed.split_once('.')?;
            if prefix.chars().all(|c| c.is_ascii_digit()) && !prefix.is_empty() {
                let entry = rest.trim();
                (!entry.is_empty()).then(|| entry.to_string())
            } else {
                None
            }
        })
        .collect()
}
