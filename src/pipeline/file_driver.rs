// src/pipeline/file_driver.rs
// File-driven ingestion: picks up exported batch files from a directory on a
// fixed tick. Each file is all-or-nothing; a file is marked processed only
// after preprocess, embed and store all succeed, otherwise it is retried on
// the next tick.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::FilePipelineConfig;
use crate::embeddings::Embedder;
use crate::error::{MnemoError, Result};
use crate::preprocess::Preprocessor;
use crate::sources::FileAdapter;
use crate::store::VectorStore;

/// Suffix given to processed files.
const DONE_SUFFIX: &str = "done";

/// Outcome of one tick.
#[derive(Debug, Default, Clone)]
pub struct TickSummary {
    pub files_processed: usize,
    pub files_failed: usize,
    pub documents_stored: usize,
}

pub struct FileIngestDriver {
    directory: PathBuf,
    files_per_tick: usize,
    interval: Duration,
    preprocessor: Arc<dyn Preprocessor>,
    embedder: Arc<dyn Embedder>,
    store: Arc<VectorStore>,
}

impl FileIngestDriver {
    pub fn new(
        config: &FilePipelineConfig,
        preprocessor: Arc<dyn Preprocessor>,
        embedder: Arc<dyn Embedder>,
        store: Arc<VectorStore>,
    ) -> Self {
        Self {
            directory: config.watch_directory.clone(),
            files_per_tick: config.files_per_tick.max(1),
            interval: Duration::from_secs(config.interval_minutes * 60),
            preprocessor,
            embedder,
            store,
        }
    }

    /// Process up to `files_per_tick` pending files.
    pub async fn run_tick(&self) -> Result<TickSummary> {
        let adapter = FileAdapter::new(&self.directory);
        let pending = adapter.pending_files()?;
        let mut summary = TickSummary::default();

        for path in pending.into_iter().take(self.files_per_tick) {
            match self.process_file(&path).await {
                Ok(stored) => {
                    summary.files_processed += 1;
                    summary.documents_stored += stored;
                    self.mark_done(&path)?;
                }
                Err(e) => {
                    warn!(file = %path.display(), "left unprocessed for retry: {}", e);
                    summary.files_failed += 1;
                }
            }
        }

        debug!(
            processed = summary.files_processed,
            failed = summary.files_failed,
            documents = summary.documents_stored,
            "file ingestion tick complete"
        );
        Ok(summary)
    }

    /// Run ticks until shutdown is signalled.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            directory = %self.directory.display(),
            interval_secs = self.interval.as_secs(),
            "file ingestion driver started"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.run_tick().await {
                warn!("file ingestion tick failed: {}", e);
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("file ingestion driver stopped");
    }

    /// Preprocess, embed and store one file. Any failure leaves the file
    /// untouched; upserts make the eventual retry idempotent.
    async fn process_file(&self, path: &Path) -> Result<usize> {
        let raw = FileAdapter::read_batch(path)?;
        let documents = self.preprocessor.preprocess(&raw)?;
        if documents.is_empty() {
            return Ok(0);
        }

        let texts: Vec<String> = documents.iter().map(|d| d.text.clone()).collect();
        let vectors = self
            .embedder
            .embed_batch(&texts)
            .await
            .map_err(|e| MnemoError::Embedding(e.to_string()))?;

        let collection = self
            .store
            .find_collection_name(self.preprocessor.source().as_str());
        let stored = documents.len();
        self.store
            .add_documents(documents, vectors, Some(&collection))
            .await?;
        Ok(stored)
    }

    fn mark_done(&self, path: &Path) -> Result<()> {
        let done_path = path.with_extension(DONE_SUFFIX);
        std::fs::rename(path, &done_path)
            .map_err(|e| MnemoError::Source(format!("cannot mark {} done: {e}", path.display())))?;
        Ok(())
    }
}
