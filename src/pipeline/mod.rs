// src/pipeline/mod.rs
// Ingestion runs: fetch → preprocess → embed → store, with per-ingestor
// persisted progress.

pub mod file_driver;

pub use file_driver::FileIngestDriver;

use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::db::StateStore;
use crate::document::Document;
use crate::embeddings::Embedder;
use crate::error::{MnemoError, Result};
use crate::preprocess::Preprocessor;
use crate::sources::{RawBatch, SourceAdapter};
use crate::store::VectorStore;

/// Bounded retries for rate-limited fetches; retry state is per fetch and
/// never persisted.
const MAX_FETCH_ATTEMPTS: u32 = 5;
const BACKOFF_BASE_SECS: u64 = 2;
const BACKOFF_CAP_SECS: u64 = 300;

/// Outcome of one ingestion run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub success: bool,
    pub documents_processed: usize,
    pub errors: Vec<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration: Duration,
    pub authentication_required: bool,
    pub authentication_url: Option<String>,
    pub message: Option<String>,
}

impl RunSummary {
    fn begin() -> Self {
        let now = Utc::now();
        Self {
            success: false,
            documents_processed: 0,
            errors: Vec::new(),
            start_time: now,
            end_time: now,
            duration: Duration::ZERO,
            authentication_required: false,
            authentication_url: None,
            message: None,
        }
    }

    fn finish(mut self) -> Self {
        self.end_time = Utc::now();
        self.duration = (self.end_time - self.start_time)
            .to_std()
            .unwrap_or(Duration::ZERO);
        self
    }
}

struct RegisteredIngestor {
    adapter: Arc<dyn SourceAdapter>,
    preprocessor: Arc<dyn Preprocessor>,
}

/// Drives ingestion for registered sources, one run at a time.
pub struct IngestionPipeline {
    ingestors: BTreeMap<String, RegisteredIngestor>,
    embedder: Arc<dyn Embedder>,
    store: Arc<VectorStore>,
    state: StateStore,
    batch_size: usize,
    auth_timeout: Duration,
    stopping: AtomicBool,
}

impl IngestionPipeline {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        store: Arc<VectorStore>,
        state: StateStore,
        batch_size: usize,
        auth_timeout: Duration,
    ) -> Self {
        Self {
            ingestors: BTreeMap::new(),
            embedder,
            store,
            state,
            batch_size: batch_size.max(1),
            auth_timeout,
            stopping: AtomicBool::new(false),
        }
    }

    /// Register an adapter/preprocessor pair. First registration creates the
    /// persisted state row with a registration date.
    pub async fn register_ingestor(
        &mut self,
        ingestor_id: &str,
        adapter: Arc<dyn SourceAdapter>,
        preprocessor: Arc<dyn Preprocessor>,
    ) -> Result<()> {
        let existing = self.state.list_ingestors().await?;
        if !existing.iter().any(|id| id == ingestor_id) {
            let mut metadata = serde_json::Map::new();
            metadata.insert("registration_date".into(), json!(Utc::now().to_rfc3339()));
            metadata.insert("total_documents_processed".into(), json!(0));
            self.state.set(ingestor_id, 0, metadata).await?;
            info!(ingestor = ingestor_id, "registered new ingestor");
        }

        self.ingestors.insert(
            ingestor_id.to_string(),
            RegisteredIngestor {
                adapter,
                preprocessor,
            },
        );
        Ok(())
    }

    pub fn registered_ids(&self) -> Vec<String> {
        self.ingestors.keys().cloned().collect()
    }

    /// Run every registered ingestor sequentially. A failure in one does not
    /// abort the others.
    pub async fn start(&self) -> Vec<(String, RunSummary)> {
        let mut summaries = Vec::new();
        for ingestor_id in self.ingestors.keys() {
            if self.stopping.load(Ordering::Relaxed) {
                info!("pipeline stop requested, skipping remaining ingestors");
                break;
            }
            let summary = match self.run_ingestion(ingestor_id).await {
                Ok(summary) => summary,
                Err(e) => {
                    error!(ingestor = %ingestor_id, "run failed: {}", e);
                    let mut summary = RunSummary::begin();
                    summary.errors.push(e.to_string());
                    summary.finish()
                }
            };
            summaries.push((ingestor_id.clone(), summary));
        }
        summaries
    }

    /// Advisory stop: the pipeline finishes the batch in flight and skips the
    /// rest.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Relaxed);
    }

    /// One full ingestion run for a single ingestor.
    pub async fn run_ingestion(&self, ingestor_id: &str) -> Result<RunSummary> {
        let registered = self.ingestors.get(ingestor_id).ok_or_else(|| {
            MnemoError::InvalidInput(format!("unknown ingestor id: {ingestor_id}"))
        })?;
        let mut summary = RunSummary::begin();

        info!(ingestor = ingestor_id, "starting ingestion run");
        let state = self.state.get(ingestor_id).await?;
        let last_timestamp = state.last_timestamp;

        // Interactive authorization (e.g. WhatsApp pairing) before fetching
        if !registered.adapter.is_authenticated().await? {
            summary.authentication_required = true;
            summary.authentication_url = registered.adapter.auth_url().await;
            if let Some(url) = &summary.authentication_url {
                info!(ingestor = ingestor_id, "authorization required at {}", url);
            }
            if !registered.adapter.wait_for_auth(self.auth_timeout).await? {
                let message = format!(
                    "authentication timed out after {}s",
                    self.auth_timeout.as_secs()
                );
                warn!(ingestor = ingestor_id, "{}", message);
                summary.errors.push(message);
                summary.message = Some("Authentication timeout".into());
                return Ok(summary.finish());
            }
            summary.authentication_required = false;
        }

        let raw = match self.fetch_with_backoff(&*registered.adapter, last_timestamp).await {
            Ok(raw) => raw,
            Err(e) => {
                summary.errors.push(e.to_string());
                return Ok(summary.finish());
            }
        };

        if raw.is_empty() {
            info!(ingestor = ingestor_id, "no new data to process");
            summary.success = true;
            summary.message = Some("No new data to process".into());
            return Ok(summary.finish());
        }

        let documents = match registered.preprocessor.preprocess(&raw) {
            Ok(documents) => documents,
            Err(e) => {
                // Structurally bad input aborts the run; state stays put
                summary.errors.push(e.to_string());
                return Ok(summary.finish());
            }
        };
        if documents.is_empty() {
            summary.success = true;
            summary.message = Some("No documents generated".into());
            return Ok(summary.finish());
        }
        debug!(
            ingestor = ingestor_id,
            documents = documents.len(),
            "preprocessing complete"
        );

        let target_collection = self
            .store
            .find_collection_name(registered.adapter.source().as_str());
        let mut latest_timestamp = last_timestamp;
        let mut processed = 0usize;

        for batch in documents.chunks(self.batch_size) {
            if self.stopping.load(Ordering::Relaxed) {
                summary.message = Some("Stopped before completion".into());
                break;
            }
            match self.process_batch(batch, &target_collection).await {
                Ok(batch_latest) => {
                    processed += batch.len();
                    latest_timestamp = latest_timestamp.max(batch_latest);
                }
                Err(e) => {
                    warn!(ingestor = ingestor_id, "batch failed: {}", e);
                    summary.errors.push(format!("batch failed: {e}"));
                }
            }
        }

        // Monotonic advance, only when something was actually stored
        if latest_timestamp > last_timestamp && processed > 0 {
            let mut metadata = state.metadata.clone();
            let processed_before = metadata
                .get("total_documents_processed")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            metadata.insert(
                "total_documents_processed".into(),
                json!(processed_before + processed as u64),
            );
            metadata.insert("last_run".into(), json!(Utc::now().to_rfc3339()));
            self.state
                .set(ingestor_id, latest_timestamp, metadata)
                .await?;
            debug!(
                ingestor = ingestor_id,
                last_timestamp = latest_timestamp,
                "state advanced"
            );
        }

        summary.success = true;
        summary.documents_processed = processed;
        info!(
            ingestor = ingestor_id,
            documents = processed,
            errors = summary.errors.len(),
            "ingestion run complete"
        );
        Ok(summary.finish())
    }

    /// Embed and store one batch. Returns the newest normalized timestamp
    /// seen in the batch.
    async fn process_batch(&self, batch: &[Document], collection: &str) -> Result<i64> {
        let texts: Vec<String> = batch.iter().map(|d| d.text.clone()).collect();
        let vectors = self
            .embedder
            .embed_batch(&texts)
            .await
            .map_err(|e| MnemoError::Embedding(e.to_string()))?;

        let batch_latest = batch
            .iter()
            .filter_map(|d| d.timestamp_sec())
            .max()
            .unwrap_or(0);

        self.store
            .add_documents(batch.to_vec(), vectors, Some(collection))
            .await?;
        Ok(batch_latest)
    }

    /// Fetch honoring the adapter's rate-limit signals with bounded
    /// exponential backoff.
    async fn fetch_with_backoff(
        &self,
        adapter: &dyn SourceAdapter,
        last_timestamp: i64,
    ) -> Result<RawBatch> {
        for attempt in 0..MAX_FETCH_ATTEMPTS {
            let result = if last_timestamp == 0 {
                adapter.fetch_full().await
            } else {
                let since = DateTime::from_timestamp(last_timestamp, 0)
                    .unwrap_or_else(Utc::now);
                adapter.fetch_since(since).await
            };

            match result {
                Ok(raw) => return Ok(raw),
                Err(MnemoError::RateLimited { wait_seconds }) => {
                    if attempt + 1 == MAX_FETCH_ATTEMPTS {
                        return Err(MnemoError::RateLimited { wait_seconds });
                    }
                    let delay = backoff_delay(wait_seconds, attempt);
                    warn!(
                        source = %adapter.source(),
                        attempt = attempt + 1,
                        "rate limited, backing off {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(MnemoError::Source("fetch retries exhausted".into()))
    }
}

/// Backoff for a rate-limited fetch: at least the server's wait, at least
/// exponential in the attempt, never above the cap.
pub(crate) fn backoff_delay(wait_seconds: u64, attempt: u32) -> Duration {
    let exponential = BACKOFF_BASE_SECS.saturating_mul(1u64 << attempt.min(32));
    Duration::from_secs(wait_seconds.max(exponential).min(BACKOFF_CAP_SECS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VectorStoreConfig;
    use crate::db::DatabasePool;
    use crate::document::Source;
    use crate::preprocess::TelegramPreprocessor;
    use crate::sources::AdapterHealth;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// Deterministic embedder: a fixed 4-dim vector derived from text bytes.
    pub(crate) struct MockEmbedder;

    #[async_trait]
    impl Embedder for MockEmbedder {
        fn dimensions(&self) -> usize {
            4
        }

        fn model_name(&self) -> String {
            "mock".to_string()
        }

        async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
            let mut vector = [0.0f32; 4];
            for (i, byte) in text.bytes().enumerate() {
                vector[i % 4] += byte as f32 / 255.0;
            }
            Ok(vector.to_vec())
        }

        async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            let mut results = Vec::with_capacity(texts.len());
            for text in texts {
                results.push(self.embed(text).await?);
            }
            Ok(results)
        }
    }

    /// Adapter whose fetches pop scripted results.
    struct ScriptedAdapter {
        source: Source,
        script: Mutex<Vec<Result<RawBatch>>>,
        authenticated: bool,
    }

    impl ScriptedAdapter {
        fn new(source: Source, script: Vec<Result<RawBatch>>) -> Self {
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

        async fn fetch_range(&self, _s: DateTime<Utc>, _e: DateTime<Utc>) -> Result<RawBatch> {
            self.next()
        }

        async fn healthcheck(&self) -> AdapterHealth {
            AdapterHealth {
                healthy: true,
                details: "scripted".into(),
            }
        }

        async fn is_authenticated(&self) -> Result<bool> {
            Ok(self.authenticated)
        }

        async fn wait_for_auth(&self, _timeout: Duration) -> Result<bool> {
            Ok(self.authenticated)
        }
    }

    fn telegram_batch(timestamps: &[i64]) -> RawBatch {
        RawBatch {
            messages: timestamps
                .iter()
                .enumerate()
                .map(|(i, ts)| {
                    json!({
                        "id": format!("msg{}", i + 1),
                        "conversation_id": "C1",
                        "sender_name": "Alice",
                        "sender_username": "alice",
                        "text": format!("message {}", i + 1),
                        "timestamp": ts,
                    })
                })
                .collect(),
            ..Default::default()
        }
    }

    async fn test_pipeline(dir: &std::path::Path) -> IngestionPipeline {
        let pool = Arc::new(DatabasePool::open_in_memory(4).await.unwrap());
        let store = Arc::new(
            VectorStore::new(
                pool.clone(),
                VectorStoreConfig {
                    persist_directory: dir.to_path_buf(),
                    collection_name: "documents".to_string(),
                    embedding_dim: 4,
                    enable_bm25: true,
                    bm25_k1: 1.5,
                    bm25_b: 0.75,
                    tokenizer_pattern: r"\b\w+\b".to_string(),
                    source_collections: [("telegram".to_string(), "telegram_messages".to_string())]
                        .into_iter()
                        .collect(),
                },
            )
            .await
            .unwrap(),
        );
        let state = StateStore::new(pool);
        IngestionPipeline::new(
            Arc::new(MockEmbedder),
            store,
            state,
            100,
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn test_initial_run_stores_documents_and_state() {
        let dir = tempdir().unwrap();
        let mut pipeline = test_pipeline(dir.path()).await;
        pipeline
            .register_ingestor(
                "telegram_ingestor",
                Arc::new(ScriptedAdapter::new(
                    Source::Telegram,
                    vec![Ok(telegram_batch(&[1000, 2000, 3000]))],
                )),
                Arc::new(TelegramPreprocessor::new()),
            )
            .await
            .unwrap();

        let summary = pipeline.run_ingestion("telegram_ingestor").await.unwrap();
        assert!(summary.success);
        assert_eq!(summary.documents_processed, 3);
        assert!(summary.errors.is_empty());

        let state = pipeline.state.get("telegram_ingestor").await.unwrap();
        assert_eq!(state.last_timestamp, 3000);
        assert_eq!(state.metadata["total_documents_processed"], json!(3));

        let count = pipeline
            .store
            .count(None, Some("telegram_messages"))
            .await
            .unwrap();
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn test_incremental_run_advances_monotonically() {
        let dir = tempdir().unwrap();
        let mut pipeline = test_pipeline(dir.path()).await;
        pipeline
            .register_ingestor(
                "tg",
                Arc::new(ScriptedAdapter::new(
                    Source::Telegram,
                    vec![
                        Ok(telegram_batch(&[2000])),
                        Ok(telegram_batch(&[1500])), // older than state
                    ],
                )),
                Arc::new(TelegramPreprocessor::new()),
            )
            .await
            .unwrap();

        pipeline.run_ingestion("tg").await.unwrap();
        let after_first = pipeline.state.get("tg").await.unwrap().last_timestamp;
        assert_eq!(after_first, 2000);

        let summary = pipeline.run_ingestion("tg").await.unwrap();
        assert!(summary.success);
        let after_second = pipeline.state.get("tg").await.unwrap().last_timestamp;
        assert_eq!(after_second, 2000, "state never moves backwards");
    }

    #[tokio::test]
    async fn test_empty_fetch_is_clean_success() {
        let dir = tempdir().unwrap();
        let mut pipeline = test_pipeline(dir.path()).await;
        pipeline
            .register_ingestor(
                "tg",
                Arc::new(ScriptedAdapter::new(Source::Telegram, vec![])),
                Arc::new(TelegramPreprocessor::new()),
            )
            .await
            .unwrap();

        let summary = pipeline.run_ingestion("tg").await.unwrap();
        assert!(summary.success);
        assert_eq!(summary.documents_processed, 0);
        assert_eq!(pipeline.state.get("tg").await.unwrap().last_timestamp, 0);
    }

    #[tokio::test]
    async fn test_rate_limit_backoff_then_success() {
        let dir = tempdir().unwrap();
        let mut pipeline = test_pipeline(dir.path()).await;
        pipeline
            .register_ingestor(
                "tg",
                Arc::new(ScriptedAdapter::new(
                    Source::Telegram,
                    vec![
                        Err(MnemoError::RateLimited { wait_seconds: 0 }),
                        Err(MnemoError::RateLimited { wait_seconds: 0 }),
                        Ok(telegram_batch(&[4000])),
                    ],
                )),
                Arc::new(TelegramPreprocessor::new()),
            )
            .await
            .unwrap();

        // Pause time so exponential backoff elapses instantly
        tokio::time::pause();
        let summary = pipeline.run_ingestion("tg").await.unwrap();
        tokio::time::resume();

        assert!(summary.success);
        assert_eq!(summary.documents_processed, 1);
        assert_eq!(pipeline.state.get("tg").await.unwrap().last_timestamp, 4000);
    }

    #[tokio::test]
    async fn test_rate_limit_exhaustion_records_error() {
        let dir = tempdir().unwrap();
        let mut pipeline = test_pipeline(dir.path()).await;
        let script = (0..MAX_FETCH_ATTEMPTS)
            .map(|_| Err(MnemoError::RateLimited { wait_seconds: 0 }))
            .collect();
        pipeline
            .register_ingestor(
                "tg",
                Arc::new(ScriptedAdapter::new(Source::Telegram, script)),
                Arc::new(TelegramPreprocessor::new()),
            )
            .await
            .unwrap();

        tokio::time::pause();
        let summary = pipeline.run_ingestion("tg").await.unwrap();
        tokio::time::resume();

        assert!(!summary.success);
        assert!(!summary.errors.is_empty());
        assert_eq!(pipeline.state.get("tg").await.unwrap().last_timestamp, 0);
    }

    #[tokio::test]
    async fn test_auth_timeout_returns_cleanly() {
        let dir = tempdir().unwrap();
        let mut pipeline = test_pipeline(dir.path()).await;
        let mut adapter = ScriptedAdapter::new(Source::Whatsapp, vec![]);
        adapter.authenticated = false;
        pipeline
            .register_ingestor("wa", Arc::new(adapter), Arc::new(TelegramPreprocessor::new()))
            .await
            .unwrap();

        let summary = pipeline.run_ingestion("wa").await.unwrap();
        assert!(summary.authentication_required);
        assert!(!summary.success);
        assert_eq!(summary.message.as_deref(), Some("Authentication timeout"));
    }

    #[tokio::test]
    async fn test_start_runs_all_despite_failures() {
        let dir = tempdir().unwrap();
        let mut pipeline = test_pipeline(dir.path()).await;
        pipeline
            .register_ingestor(
                "a_failing",
                Arc::new(ScriptedAdapter::new(
                    Source::Telegram,
                    vec![Err(MnemoError::Source("gateway down".into()))],
                )),
                Arc::new(TelegramPreprocessor::new()),
            )
            .await
            .unwrap();
        pipeline
            .register_ingestor(
                "b_working",
                Arc::new(ScriptedAdapter::new(
                    Source::Telegram,
                    vec![Ok(telegram_batch(&[1000]))],
                )),
                Arc::new(TelegramPreprocessor::new()),
            )
            .await
            .unwrap();

        let summaries = pipeline.start().await;
        assert_eq!(summaries.len(), 2);
        assert!(!summaries[0].1.success);
        assert!(summaries[1].1.success);
    }

    #[test]
    fn test_backoff_delay_bounds() {
        assert_eq!(backoff_delay(0, 0), Duration::from_secs(2));
        assert_eq!(backoff_delay(0, 1), Duration::from_secs(4));
        assert_eq!(backoff_delay(2, 0), Duration::from_secs(2));
        assert_eq!(backoff_delay(2, 1), Duration::from_secs(4));
        assert_eq!(backoff_delay(30, 1), Duration::from_secs(30));
        assert_eq!(backoff_delay(1000, 0), Duration::from_secs(300));
        assert_eq!(backoff_delay(0, 20), Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_registration_creates_state_row() {
        let dir = tempdir().unwrap();
        let mut pipeline = test_pipeline(dir.path()).await;
        pipeline
            .register_ingestor(
                "fresh",
                Arc::new(ScriptedAdapter::new(Source::Telegram, vec![])),
                Arc::new(TelegramPreprocessor::new()),
            )
            .await
            .unwrap();

        let state = pipeline.state.get("fresh").await.unwrap();
        assert_eq!(state.last_timestamp, 0);
        assert!(state.metadata.contains_key("registration_date"));
    }
}
