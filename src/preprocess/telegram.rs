// src/preprocess/telegram.rs
// Normalizes Telegram gateway messages. Gateway timestamps are epoch seconds.

use serde_json::Value;
use tracing::warn;

use super::{ChainSeed, Preprocessor, finish_documents, is_bot_username};
use crate::document::{Document, Metadata, Source};
use crate::error::{MnemoError, Result};
use crate::sources::RawBatch;

/// Fallback text for media messages without a caption.
const MEDIA_SENTINEL: &str = "[media message]";

#[derive(Debug, Default)]
pub struct TelegramPreprocessor;

impl TelegramPreprocessor {
    pub fn new() -> Self {
        Self
    }

    fn parse_message(&self, message: &Value) -> Option<(ChainSeed, Document)> {
        let message = message.as_object()?;

        let message_id = field_string(message.get("id")?)?;
        let conversation_id = field_string(message.get("conversation_id")?)?;
        let timestamp = message.get("timestamp")?.as_i64()?;

        let text = message
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let has_media = message
            .get("has_media")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let text = if !text.is_empty() {
            text.to_string()
        } else if has_media {
            message
                .get("media_caption")
                .and_then(Value::as_str)
                .filter(|c| !c.is_empty())
                .unwrap_or(MEDIA_SENTINEL)
                .to_string()
        } else {
            String::new()
        };

        let from_me = message
            .get("from_me")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let author = if from_me {
            "Me".to_string()
        } else {
            message
                .get("sender_name")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string()
        };

        let username = message
            .get("sender_username")
            .and_then(Value::as_str)
            .unwrap_or_default();

        let mut metadata = Metadata::new();
        metadata.insert("source".into(), "telegram".into());
        metadata.insert("conversation_id".into(), conversation_id.clone().into());
        if let Some(name) = message.get("conversation_name").and_then(Value::as_str) {
            metadata.insert("conversation_name".into(), name.into());
        }
        metadata.insert("message_id".into(), message_id.clone().into());
        metadata.insert("author".into(), author.into());
        metadata.insert("is_from_me".into(), from_me.into());
        // Telegram is already second-precision; both fields carry the same value
        metadata.insert("timestamp".into(), timestamp.into());
        metadata.insert("timestamp_sec".into(), timestamp.into());
        if let Some(reply_to) = message.get("reply_to_id").filter(|v| !v.is_null()) {
            if let Some(reply_to) = field_string(reply_to) {
                metadata.insert("reply_to_id".into(), reply_to.into());
            }
        }
        metadata.insert(
            "is_group".into(),
            message
                .get("is_group")
                .and_then(Value::as_bool)
                .unwrap_or(false)
                .into(),
        );
        metadata.insert("is_bot_chat".into(), is_bot_username(username).into());
        if has_media {
            metadata.insert("has_media".into(), true.into());
        }

        let document = Document::new(
            format!("telegram_{conversation_id}_{message_id}"),
            text,
            metadata,
        );
        let seed = ChainSeed {
            conversation_id,
            message_id,
            timestamp_sec: timestamp,
        };
        Some((seed, document))
    }
}

/// Ids may arrive as numbers or strings.
fn field_string(value: &Value) -> Option<String> {
    if let Some(s) = value.as_str() {
        if s.is_empty() {
            return None;
        }
        return Some(s.to_string());
    }
    value.as_i64().map(|n| n.to_string())
}

impl Preprocessor for TelegramPreprocessor {
    fn source(&self) -> Source {
        Source::Telegram
    }

    fn preprocess(&self, raw: &RawBatch) -> Result<Vec<Document>> {
        if raw.messages.is_empty() && !raw.repositories.is_empty() {
            return Err(MnemoError::Preprocess(
                "telegram batch carries no messages".into(),
            ));
        }

        let mut seeds = Vec::with_capacity(raw.messages.len());
        for message in &raw.messages {
            match self.parse_message(message) {
                Some(parsed) => seeds.push(parsed),
                None => warn!("skipping malformed telegram message: {}", message),
            }
        }
        Ok(finish_documents(seeds))
    }
}
