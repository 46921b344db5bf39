// src/preprocess/mod.rs
// Pure, deterministic normalization of raw source records into documents.

pub mod github;
pub mod telegram;
pub mod whatsapp;

pub use github::GithubPreprocessor;
pub use telegram::TelegramPreprocessor;
pub use whatsapp::WhatsappPreprocessor;

use crate::document::{Document, Source};
use crate::error::Result;
use crate::sources::RawBatch;

/// Turns raw source-shaped records into uniform documents with stable ids and
/// in-batch conversation links. No I/O; same input, same output.
pub trait Preprocessor: Send + Sync {
    fn source(&self) -> Source;
    fn preprocess(&self, raw: &RawBatch) -> Result<Vec<Document>>;
}

/// A message's position in its conversation, used to derive link chains.
#[derive(Debug, Clone)]
pub(crate) struct ChainSeed {
    pub conversation_id: String,
    pub message_id: String,
    pub timestamp_sec: i64,
}

/// Compute in-batch `previous_message_ids` / `next_message_ids` for messages
/// already sorted by (conversation_id, timestamp) ascending.
///
/// Previous ids run oldest to newest; next ids earliest to latest. Links are
/// restricted to the batch; references outside it are expected and render as
/// partial context downstream.
pub(crate) fn conversation_chains(sorted: &[ChainSeed]) -> Vec<(String, String)> {
    let mut chains = Vec::with_capacity(sorted.len());
    let mut index = 0;
    while index < sorted.len() {
        let conversation = &sorted[index].conversation_id;
        let end = sorted[index..]
            .iter()
            .position(|s| &s.conversation_id != conversation)
            .map(|offset| index + offset)
            .unwrap_or(sorted.len());

        let ids: Vec<&str> = sorted[index..end]
            .iter()
            .map(|s| s.message_id.as_str())
            .collect();
        for position in 0..ids.len() {
            let previous = ids[..position].join(",");
            let next = ids[position + 1..].join(",");
            chains.push((previous, next));
        }
        index = end;
    }
    chains
}

/// Sort key shared by the message preprocessors.
pub(crate) fn sort_seeds(seeds: &mut [(ChainSeed, Document)]) {
    seeds.sort_by(|a, b| {
        a.0.conversation_id
            .cmp(&b.0.conversation_id)
            .then(a.0.timestamp_sec.cmp(&b.0.timestamp_sec))
            .then(a.0.message_id.cmp(&b.0.message_id))
    });
}

/// Attach the computed chains to sorted documents and return them.
pub(crate) fn finish_documents(mut seeds: Vec<(ChainSeed, Document)>) -> Vec<Document> {
    sort_seeds(&mut seeds);
    let chains = conversation_chains(
        &seeds.iter().map(|(seed, _)| seed.clone()).collect::<Vec<_>>(),
    );
    seeds
        .into_iter()
        .zip(chains)
        .map(|((_, mut document), (previous, next))| {
            document
                .metadata
                .insert("previous_message_ids".to_string(), previous.into());
            document
                .metadata
                .insert("next_message_ids".to_string(), next.into());
            document
        })
        .collect()
}

/// Username heuristic shared by chat sources.
pub(crate) fn is_bot_username(username: &str) -> bool {
    username.to_lowercase().ends_with("bot")
}
