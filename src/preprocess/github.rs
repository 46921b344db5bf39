// src/preprocess/github.rs
// Normalizes GitHub repository records: one document per repo descriptor or
// commit, grouped by repository.

use serde_json::Value;
use tracing::warn;

use super::{ChainSeed, Preprocessor, finish_documents};
use crate::document::{Document, Metadata, MetadataValue, Source, timestamp_to_secs};
use crate::error::{MnemoError, Result};
use crate::sources::RawBatch;

#[derive(Debug, Default)]
pub struct GithubPreprocessor;

impl GithubPreprocessor {
    pub fn new() -> Self {
        Self
    }

    fn parse_record(&self, record: &Value) -> Option<(ChainSeed, Document)> {
        let record = record.as_object()?;
        let repo = record.get("repo")?.as_str().filter(|s| !s.is_empty())?;
        let kind = record.get("kind").and_then(Value::as_str).unwrap_or("item");

        let (item_id, text, author, timestamp_raw) = match kind {
            "repository" => {
                let id = record
                    .get("id")
                    .map(value_to_id)
                    .unwrap_or_else(|| "repo".to_string());
                let description = record
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let text = if description.is_empty() {
                    format!("Repository {repo}")
                } else {
                    format!("Repository {repo}: {description}")
                };
                (id, text, "github".to_string(), record.get("updated_at").cloned())
            }
            "commit" => {
                let sha = record.get("sha").and_then(Value::as_str)?.to_string();
                let message = record
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let author = record
                    .get("author")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string();
                (sha, message, author, record.get("date").cloned())
            }
            other => {
                warn!("unknown github record kind '{}', skipping", other);
                return None;
            }
        };

        let timestamp_value = timestamp_raw.and_then(|v| match v {
            Value::String(s) => Some(MetadataValue::Str(s)),
            Value::Number(n) => n.as_i64().map(MetadataValue::Int),
            _ => None,
        });
        let timestamp_sec = timestamp_value
            .as_ref()
            .and_then(timestamp_to_secs)
            .unwrap_or(0);

        // Slashes in repo names would break the id scheme's separators
        let conversation_id = repo.replace('/', "_");

        let mut metadata = Metadata::new();
        metadata.insert("source".into(), "github".into());
        metadata.insert("conversation_id".into(), conversation_id.clone().into());
        metadata.insert("conversation_name".into(), repo.into());
        metadata.insert("message_id".into(), item_id.clone().into());
        metadata.insert("author".into(), author.into());
        metadata.insert("kind".into(), kind.into());
        if let Some(timestamp) = timestamp_value {
            metadata.insert("timestamp".into(), timestamp);
        }
        metadata.insert("timestamp_sec".into(), timestamp_sec.into());

        let document = Document::new(
            format!("github_{conversation_id}_{item_id}"),
            text,
            metadata,
        );
        let seed = ChainSeed {
            conversation_id,
            message_id: item_id,
            timestamp_sec,
        };
        Some((seed, document))
    }
}

fn value_to_id(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => "unknown".to_string(),
    }
}

impl Preprocessor for GithubPreprocessor {
    fn source(&self) -> Source {
        Source::Github
    }

    fn preprocess(&self, raw: &RawBatch) -> Result<Vec<Document>> {
        if raw.repositories.is_empty() && !raw.messages.is_empty() {
            return Err(MnemoError::Preprocess(
                "github batch carries no repository records".into(),
            ));
        }

        let mut seeds = Vec::with_capacity(raw.repositories.len());
        for record in &raw.repositories {
            match self.parse_record(record) {
                Some(parsed) => seeds.push(parsed),
                None => warn!("skipping malformed github record: {}", record),
            }
        }
        Ok(finish_documents(seeds))
    }
}
