// src/store/bm25/mod.rs
// Keyword index lifecycle: an explicit state machine guarded by one mutex,
// with JSON snapshots persisted atomically beside the dense store.

pub mod index;
pub mod tokenizer;

pub use index::{Bm25Data, Bm25Fields, Bm25Params};
pub use tokenizer::Tokenizer;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::MnemoError;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// Lifecycle states. Transitions are guarded by the index mutex; any request
/// that does not match an allowed transition is refused with a busy signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexingState {
    Idle,
    Building,
    Updating,
    Saving,
    Loading,
}

impl IndexingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexingState::Idle => "idle",
            IndexingState::Building => "building",
            IndexingState::Updating => "updating",
            IndexingState::Saving => "saving",
            IndexingState::Loading => "loading",
        }
    }
}

/// On-disk snapshot layout.
#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    bm25_index: Bm25Fields,
    doc_id_map: HashMap<String, u64>,
    parameters: Bm25Params,
    collection_name: String,
    created_at: String,
}

/// Polling interval for callers waiting on an idle index.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

struct Inner {
    state: IndexingState,
    data: Bm25Data,
}

/// BM25 keyword index for one collection.
pub struct KeywordIndex {
    collection: String,
    persist_dir: PathBuf,
    params: Bm25Params,
    tokenizer: Tokenizer,
    inner: Mutex<Inner>,
}

impl KeywordIndex {
    pub fn new(collection: &str, persist_dir: &Path, params: Bm25Params) -> Result<Self> {
        let tokenizer = Tokenizer::new(&params.tokenizer_pattern)?;
        Ok(Self {
            collection: collection.to_string(),
            persist_dir: persist_dir.to_path_buf(),
            params,
            tokenizer,
            inner: Mutex::new(Inner {
                state: IndexingState::Idle,
                data: Bm25Data::default(),
            }),
        })
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.persist_dir
            .join(format!("bm25_index_{}.json", self.collection))
    }

    pub async fn state(&self) -> IndexingState {
        self.inner.lock().await.state
    }

    pub async fn total_docs(&self) -> u64 {
        self.inner.lock().await.data.fields.total_docs
    }

    /// Rebuild the index from scratch over the given documents.
    /// Refused with a busy signal unless the index is idle.
    pub async fn build(&self, docs: &[(String, String)]) -> Result<(), MnemoError> {
        {
            let mut inner = self.inner.lock().await;
            if inner.state != IndexingState::Idle {
                return Err(MnemoError::Busy(format!(
                    "cannot build while {}",
                    inner.state.as_str()
                )));
            }
            inner.state = IndexingState::Building;
        }

        // Index into a fresh structure outside the lock; searches observe the
        // building state and refuse rather than reading a partial index.
        let mut data = Bm25Data::default();
        for (doc_id, text) in docs {
            let tokens = self.tokenizer.tokenize(text);
            data.index_document(doc_id, &tokens);
        }
        let total = data.fields.total_docs;

        let mut inner = self.inner.lock().await;
        inner.data = data;
        if inner.state == IndexingState::Building {
            inner.state = IndexingState::Idle;
        } else {
            warn!(
                "keyword index state was {} at build completion",
                inner.state.as_str()
            );
            inner.state = IndexingState::Idle;
        }
        info!(
            collection = %self.collection,
            documents = total,
            "keyword index built"
        );
        Ok(())
    }

    /// Incrementally index documents (new or changed text).
    /// Refused with a busy signal unless the index is idle.
    pub async fn update(&self, docs: &[(String, String)]) -> Result<(), MnemoError> {
        if docs.is_empty() {
            return Ok(());
        }

        let mut data = {
            let mut inner = self.inner.lock().await;
            if inner.state != IndexingState::Idle {
                return Err(MnemoError::Busy(format!(
                    "cannot update while {}",
                    inner.state.as_str()
                )));
            }
            inner.state = IndexingState::Updating;
            inner.data.clone()
        };

        for (doc_id, text) in docs {
            let tokens = self.tokenizer.tokenize(text);
            data.index_document(doc_id, &tokens);
        }

        let mut inner = self.inner.lock().await;
        inner.data = data;
        inner.state = IndexingState::Idle;
        debug!(
            collection = %self.collection,
            documents = docs.len(),
            "keyword index updated"
        );
        Ok(())
    }

    /// Remove documents from the index. Refused unless idle.
    pub async fn remove(&self, doc_ids: &[String]) -> Result<usize, MnemoError> {
        let mut data = {
            let mut inner = self.inner.lock().await;
            if inner.state != IndexingState::Idle {
                return Err(MnemoError::Busy(format!(
                    "cannot remove while {}",
                    inner.state.as_str()
                )));
            }
            inner.state = IndexingState::Updating;
            inner.data.clone()
        };

        let mut removed = 0;
        for doc_id in doc_ids {
            if data.remove_document(doc_id) {
                removed += 1;
            }
        }

        let mut inner = self.inner.lock().await;
        inner.data = data;
        inner.state = IndexingState::Idle;
        Ok(removed)
    }

    /// Search the index. Requires the idle state.
    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<(String, f64)>, MnemoError> {
        let inner = self.inner.lock().await;
        if inner.state != IndexingState::Idle {
            return Err(MnemoError::Busy(format!(
                "index is {}",
                inner.state.as_str()
            )));
        }
        let tokens = self.tokenizer.tokenize(query);
        Ok(inner.data.score(&tokens, &self.params, limit))
    }

    /// Search, waiting for the index to become idle for up to `max_wait`.
    /// Polls every 500ms; a zero wait gives exactly one attempt.
    pub async fn search_waiting(
        &self,
        query: &str,
        limit: usize,
        max_wait: Duration,
    ) -> Result<Vec<(String, f64)>, MnemoError> {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            match self.search(query, limit).await {
                Ok(results) => return Ok(results),
                Err(MnemoError::Busy(_)) => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(MnemoError::Timeout(max_wait.as_secs()));
                    }
                    tokio::time::sleep(POLL_INTERVAL.min(
                        deadline.saturating_duration_since(tokio::time::Instant::now()),
                    ))
                    .await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Persist a snapshot atomically: write `.tmp`, restrict permissions,
    /// rename over the destination. Allowed from idle, building or updating;
    /// the snapshot reflects the state at the moment the lock was acquired.
    pub async fn save(&self) -> Result<(), MnemoError> {
        let (previous_state, snapshot) = {
            let mut inner = self.inner.lock().await;
            match inner.state {
                IndexingState::Idle | IndexingState::Building | IndexingState::Updating => {}
                other => {
                    return Err(MnemoError::Busy(format!(
                        "cannot save while {}",
                        other.as_str()
                    )));
                }
            }
            let previous = inner.state;
            inner.state = IndexingState::Saving;
            let snapshot = Snapshot {
                bm25_index: inner.data.fields.clone(),
                doc_id_map: inner.data.doc_id_map.clone(),
                parameters: self.params.clone(),
                collection_name: self.collection.clone(),
                created_at: Utc::now().to_rfc3339(),
            };
            (previous, snapshot)
        };

        let result = self.write_snapshot(&snapshot).await;

        let mut inner = self.inner.lock().await;
        if inner.state == IndexingState::Saving {
            inner.state = match previous_state {
                IndexingState::Building | IndexingState::Updating => previous_state,
                _ => IndexingState::Idle,
            };
        }
        result?;

        debug!(
            collection = %self.collection,
            path = %self.snapshot_path().display(),
            documents = snapshot.bm25_index.total_docs,
            "keyword index saved"
        );
        Ok(())
    }

    async fn write_snapshot(&self, snapshot: &Snapshot) -> Result<(), MnemoError> {
        let path = self.snapshot_path();
        let tmp_path = path.with_extension("json.tmp");
        let payload = serde_json::to_vec_pretty(snapshot)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&tmp_path, &payload).await?;

        #[cfg(unix)]
        {
            let perms = std::fs::Permissions::from_mode(0o600);
            if let Err(e) = tokio::fs::set_permissions(&tmp_path, perms).await {
                warn!("could not restrict snapshot permissions: {}", e);
            }
        }

        tokio::fs::rename(&tmp_path, &path).await?;
        Ok(())
    }

    /// Load a snapshot from disk. Fails (leaving the index empty and idle) if
    /// the file is missing, unparseable, or names a different collection;
    /// callers fall back to a rebuild.
    pub async fn load(&self) -> Result<(), MnemoError> {
        {
            let mut inner = self.inner.lock().await;
            if inner.state != IndexingState::Idle {
                return Err(MnemoError::Busy(format!(
                    "cannot load while {}",
                    inner.state.as_str()
                )));
            }
            inner.state = IndexingState::Loading;
        }

        let result = self.read_snapshot().await;

        let mut inner = self.inner.lock().await;
        inner.state = IndexingState::Idle;
        match result {
            Ok(data) => {
                info!(
                    collection = %self.collection,
                    documents = data.fields.total_docs,
                    "keyword index loaded from snapshot"
                );
                inner.data = data;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn read_snapshot(&self) -> Result<Bm25Data, MnemoError> {
        let path = self.snapshot_path();
        let raw = tokio::fs::read(&path)
            .await
            .with_context(|| format!("cannot read snapshot {}", path.display()))
            .map_err(MnemoError::Anyhow)?;
        let snapshot: Snapshot = serde_json::from_slice(&raw)?;

        if snapshot.collection_name != self.collection {
            return Err(MnemoError::Store(format!(
                "snapshot names collection '{}', expected '{}'",
                snapshot.collection_name, self.collection
            )));
        }

        Ok(Bm25Data::from_snapshot(snapshot.bm25_index, snapshot.doc_id_map))
    }

    /// Whether the given external id is indexed.
    pub async fn contains(&self, doc_id: &str) -> bool {
        self.inner.lock().await.data.contains(doc_id)
    }
}
