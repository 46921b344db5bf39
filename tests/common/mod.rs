// tests/common/mod.rs
// Shared fixtures: deterministic embedder, scripted adapters, store builders.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mnemo::config::VectorStoreConfig;
use mnemo::db::{DatabasePool, StateStore};
use mnemo::document::Source;
use mnemo::embeddings::Embedder;
use mnemo::error::Result;
use mnemo::pipeline::IngestionPipeline;
use mnemo::sources::{AdapterHealth, RawBatch, SourceAdapter};
use mnemo::store::VectorStore;

pub const DIM: usize = 4;

/// Deterministic embedder: folds text bytes into a fixed-dimension vector.
pub struct HashEmbedder;

#[async_trait]
impl Embedder for HashEmbedder {
    fn dimensions(&self) -> usize {
        DIM
    }

    fn model_name(&self) -> String {
        "hash-embedder".to_string()
    }

    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let mut vector = vec![0.0f32; DIM];
        for (i, byte) in text.bytes().enumerate() {
            vector[i % DIM] += byte as f32 / 255.0;
        }
        Ok(vector)
    }

    async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.embed(text).await?);
        }
        Ok(results)
    }
}

/// Adapter whose fetches pop scripted results in order; an exhausted script
/// returns empty batches.
pub struct ScriptedAdapter {
    source: Source,
    script: Mutex<Vec<Result<RawBatch>>>,
    pub authenticated: bool,
}

impl ScriptedAdapter {
    pub fn new(source: Source, script: Vec<Result<RawBatch>>) -> Self {
        Self {
            source,
            script: Mutex::new(script),
            authenticated: true,
        }
    }

    fn next(&self) -> Result<RawBatch> {
        let mut script = self.script.lock().unwrap();
        if script.is_empty() {
            Ok(RawBatch::default())
        } else {
            script.remove(0)
        }
    }
}

#[async_trait]
impl SourceAdapter for ScriptedAdapter {
    fn source(&self) -> Source {
        self.source
    }

    async fn fetch_full(&self) -> Result<RawBatch> {
        self.next()
    }

    async fn fetch_since(&self, _since: DateTime<Utc>) -> Result<RawBatch> {
        self.next()
    }

    async fn fetch_range(&self, _start: DateTime<Utc>, _end: DateTime<Utc>) -> Result<RawBatch> {
        self.next()
    }

    async fn healthcheck(&self) -> AdapterHealth {
        AdapterHealth {
            healthy: true,
            details: "scripted".to_string(),
        }
    }

    async fn is_authenticated(&self) -> Result<bool> {
        Ok(self.authenticated)
    }

    async fn wait_for_auth(&self, _timeout: Duration) -> Result<bool> {
        Ok(self.authenticated)
    }
}

pub fn store_config(dir: &Path) -> VectorStoreConfig {
    VectorStoreConfig {
        persist_directory: dir.to_path_buf(),
        collection_name: "documents".to_string(),
        embedding_dim: DIM,
        enable_bm25: true,
        bm25_k1: 1.5,
        bm25_b: 0.75,
        tokenizer_pattern: r"\b\w+\b".to_string(),
        source_collections: [
            ("telegram".to_string(), "telegram_messages".to_string()),
            ("whatsapp".to_string(), "whatsapp_messages".to_string()),
            ("github".to_string(), "github_data".to_string()),
        ]
        .into_iter()
        .collect(),
    }
}

pub async fn open_store(dir: &Path) -> (Arc<DatabasePool>, Arc<VectorStore>) {
    let pool = Arc::new(DatabasePool::open_in_memory(DIM).await.expect("pool"));
    let store = Arc::new(
        VectorStore::new(pool.clone(), store_config(dir))
            .await
            .expect("store"),
    );
    (pool, store)
}

pub fn pipeline_over(pool: Arc<DatabasePool>, store: Arc<VectorStore>) -> IngestionPipeline {
    IngestionPipeline::new(
        Arc::new(HashEmbedder),
        store,
        StateStore::new(pool),
        100,
        Duration::from_secs(1),
    )
}

pub fn telegram_message(id: &str, conv: &str, ts: i64, text: &str) -> serde_json::Value {
    json!({
        "id": id,
        "conversation_id": conv,
        "conversation_name": "Chat",
        "sender_name": "Alice",
        "sender_username": "alice",
        "text": text,
        "timestamp": ts,
    })
}

pub fn message_batch(messages: Vec<serde_json::Value>) -> RawBatch {
    RawBatch {
        messages,
        ..Default::default()
    }
}

pub fn whatsapp_message(id: &str, chat: &str, ts_ms: i64, body: &str) -> serde_json::Value {
    json!({
        "id": id,
        "chatId": chat,
        "chatName": "Family",
        "author": "Maria",
        "body": body,
        "timestamp": ts_ms,
        "fromMe": false,
        "isGroup": false,
    })
}
