// src/preprocess/whatsapp.rs
// Normalizes WhatsApp bridge messages. Bridge timestamps are epoch millis;
// the original value is preserved while ordering uses normalized seconds.

use serde_json::Value;
use tracing::warn;

use super::{ChainSeed, Preprocessor, finish_documents, is_bot_username};
use crate::document::{Document, Metadata, Source};
use crate::error::{MnemoError, Result};
use crate::sources::RawBatch;

const MEDIA_SENTINEL: &str = "[media message]";

#[derive(Debug, Default)]
pub struct WhatsappPreprocessor;

impl WhatsappPreprocessor {
    pub fn new() -> Self {
        Self
    }

    fn parse_message(&self, message: &Value) -> Option<(ChainSeed, Document)> {
        let message = message.as_object()?;

        let message_id = message.get("id")?.as_str().filter(|s| !s.is_empty())?.to_string();
        let conversation_id = message
            .get("chatId")?
            .as_str()
            .filter(|s| !s.is_empty())?
            .to_string();
        let timestamp = message.get("timestamp")?.as_i64()?;
        // The bridge always speaks milliseconds
        let timestamp_sec = timestamp.div_euclid(1000);

        let body = message
            .get("body")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let has_media = message
            .get("hasMedia")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let text = if !body.is_empty() {
            body.to_string()
        } else if has_media {
            message
                .get("caption")
                .and_then(Value::as_str)
                .filter(|c| !c.is_empty())
                .unwrap_or(MEDIA_SENTINEL)
                .to_string()
        } else {
            String::new()
        };

        let from_me = message
            .get("fromMe")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let author = if from_me {
            "Me".to_string()
        } else {
            message
                .get("author")
                .or_else(|| message.get("notifyName"))
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string()
        };

        let mut metadata = Metadata::new();
        metadata.insert("source".into(), "whatsapp".into());
        metadata.insert("conversation_id".into(), conversation_id.clone().into());
        if let Some(name) = message.get("chatName").and_then(Value::as_str) {
            metadata.insert("conversation_name".into(), name.into());
        }
        metadata.insert("message_id".into(), message_id.clone().into());
        metadata.insert("author".into(), author.clone().into());
        metadata.insert("is_from_me".into(), from_me.into());
        // Original bridge value stays as-is; the normalized form drives ordering
        metadata.insert("timestamp".into(), timestamp.into());
        metadata.insert("timestamp_sec".into(), timestamp_sec.into());
        if let Some(quoted) = message
            .get("quotedMsgId")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
        {
            metadata.insert("reply_to_id".into(), quoted.into());
        }
        metadata.insert(
            "is_group".into(),
            message
                .get("isGroup")
                .and_then(Value::as_bool)
                .unwrap_or(false)
                .into(),
        );
        metadata.insert("is_bot_chat".into(), is_bot_username(&author).into());
        if has_media {
            metadata.insert("has_media".into(), true.into());
        }

        let document = Document::new(
            format!("whatsapp_{conversation_id}_{message_id}"),
            text,
            metadata,
        );
        let seed = ChainSeed {
            conversation_id,
            message_id,
            timestamp_sec,
        };
        Some((seed, document))
    }
}

impl Preprocessor for WhatsappPreprocessor {
    fn source(&self) -> Source {
        Source::Whatsapp
    }

    fn preprocess(&self, raw: &RawBatch) -> Result<Vec<Document>> {
        if raw.messages.is_empty() && !raw.repositories.is_empty() {
            return Err(MnemoError::Preprocess(
                "whatsapp batch carries no messages".into(),
            ));
        }

        let mut seeds = Vec::with_capacity(raw.messages.len());
        for message in &raw.messages {
            match self.parse_message(message) {
                Some(parsed) => seeds.push(parsed),
                None => warn!("skipping malformed whatsapp message: {}", message),
            }
        }
        Ok(finish_documents(seeds))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn batch(messages: Vec<Value>) -> RawBatch {
        RawBatch {
            messages,
            ..Default::default()
        }
    }

    fn message(id: &str, chat: &str, ts_ms: i64, body: &str) -> Value {
        json!({
            "id": id,
            "chatId": chat,
            "chatName": "Family",
            "author": "Maria",
            "body": body,
            "timestamp": ts_ms,
            "fromMe": false,
            "isGroup": true,
        })
    }

    #[test]
    fn test_millisecond_normalization() {
        let pre = WhatsappPreprocessor::new();
        let docs = pre
            .preprocess(&batch(vec![message("w1", "chat@g.us", 3_000_000, "hello")]))
            .unwrap();

        assert_eq!(docs[0].id, "whatsapp_chat@g.us_w1");
        // Original bridge value preserved; normalized field is in seconds
        assert_eq!(docs[0].meta_i64("timestamp"), Some(3_000_000));
        assert_eq!(docs[0].meta_i64("timestamp_sec"), Some(3000));

        let docs = pre
            .preprocess(&batch(vec![message("w2", "chat@g.us", 3_000_000_000_000, "hi")]))
            .unwrap();
        assert_eq!(docs[0].meta_i64("timestamp"), Some(3_000_000_000_000));
        assert_eq!(docs[0].meta_i64("timestamp_sec"), Some(3_000_000_000));
    }

    #[test]
    fn test_quoted_message_maps_to_reply() {
        let pre = WhatsappPreprocessor::new();
        let mut quoted = message("w2", "c", 1_700_000_000_000, "yes");
        quoted["quotedMsgId"] = json!("w1");
        let docs = pre.preprocess(&batch(vec![quoted])).unwrap();
        assert_eq!(docs[0].meta_str("reply_to_id"), Some("w1"));
    }

    #[test]
    fn test_from_me_author() {
        let pre = WhatsappPreprocessor::new();
        let mut own = message("w1", "c", 1_700_000_000_000, "mine");
        own["fromMe"] = json!(true);
        let docs = pre.preprocess(&batch(vec![own])).unwrap();
        assert_eq!(docs[0].meta_str("author"), Some("Me"));
    }

    #[test]
    fn test_media_sentinel_and_caption() {
        let pre = WhatsappPreprocessor::new();
        let mut media = message("w1", "c", 1_700_000_000_000, "");
        media["hasMedia"] = json!(true);
        let docs = pre.preprocess(&batch(vec![media])).unwrap();
        assert_eq!(docs[0].text, "[media message]");

        let mut captioned = message("w2", "c", 1_700_000_000_001, "");
        captioned["hasMedia"] = json!(true);
        captioned["caption"] = json!("voice note");
        let docs = pre.preprocess(&batch(vec![captioned])).unwrap();
        assert_eq!(docs[0].text, "voice note");
    }

    #[test]
    fn test_link_chains_ordered_by_normalized_time() {
        let pre = WhatsappPreprocessor::new();
        let docs = pre
            .preprocess(&batch(vec![
                message("w2", "c", 1_700_000_002_000, "second"),
                message("w1", "c", 1_700_000_001_000, "first"),
            ]))
            .unwrap();
        assert_eq!(docs[0].meta_str("message_id"), Some("w1"));
        assert_eq!(docs[1].meta_str("previous_message_ids"), Some("w1"));
    }

    #[test]
    fn test_malformed_skipped() {
        let pre = WhatsappPreprocessor::new();
        let docs = pre
            .preprocess(&batch(vec![
                json!({"id": "w1"}),
                message("ok", "c", 1_700_000_000_000, "fine"),
            ]))
            .unwrap();
        assert_eq!(docs.len(), 1);
    }
}
