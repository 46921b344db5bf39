// src/sources/file.rs
// Adapter over a directory of exported conversation batches (JSON files,
// one RawBatch per file). Useful for offline exports and testing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::{AdapterHealth, RawBatch, SourceAdapter};
use crate::document::{MetadataValue, Source, timestamp_to_secs};
use crate::error::{MnemoError, Result};

pub struct FileAdapter {
    directory: PathBuf,
}

impl FileAdapter {
    pub fn new(directory: &Path) -> Self {
        Self {
            directory: directory.to_path_buf(),
        }
    }

    /// List unprocessed batch files in name order (deterministic runs).
    pub fn pending_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let entries = std::fs::read_dir(&self.directory)
            .map_err(|e| MnemoError::Source(format!("cannot read {}: {e}", self.directory.display())))?;
        for entry in entries {
            let path = entry.map_err(MnemoError::Io)?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    pub fn read_batch(path: &Path) -> Result<RawBatch> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| MnemoError::Source(format!("cannot read {}: {e}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|e| MnemoError::Source(format!("malformed batch {}: {e}", path.display())))
    }

    fn load_all(&self) -> Result<RawBatch> {
        let mut combined = RawBatch::default();
        for path in self.pending_files()? {
            match Self::read_batch(&path) {
                Ok(batch) => {
                    combined.messages.extend(batch.messages);
                    combined.conversations.extend(batch.conversations);
                    combined.repositories.extend(batch.repositories);
                }
                Err(e) => warn!("skipping {}: {}", path.display(), e),
            }
        }
        debug!(records = combined.record_count(), "loaded file batches");
        Ok(combined)
    }

    fn message_secs(message: &serde_json::Value) -> Option<i64> {
        let raw = message.get("timestamp")?;
        let value = if let Some(n) = raw.as_i64() {
            MetadataValue::Int(n)
        } else {
            MetadataValue::Str(raw.as_str()?.to_string())
        };
        timestamp_to_secs(&value)
    }

    fn filter_window(
        mut batch: RawBatch,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> RawBatch {
        batch.messages.retain(|m| {
            let Some(secs) = Self::message_secs(m) else {
                return true;
            };
            if let Some(start) = start
                && secs <= start.timestamp()
            {
                return false;
            }
            if let Some(end) = end
                && secs > end.timestamp()
            {
                return false;
            }
            true
        });
        batch
    }
}

#[async_trait]
impl SourceAdapter for FileAdapter {
    fn source(&self) -> Source {
        Source::File
    }

    async fn fetch_full(&self) -> Result<RawBatch> {
        self.load_all()
    }

    async fn fetch_since(&self, since: DateTime<Utc>) -> Result<RawBatch> {
        Ok(Self::filter_window(self.load_all()?, Some(since), None))
    }

    async fn fetch_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<RawBatch> {
        Ok(Self::filter_window(self.load_all()?, Some(start), Some(end)))
    }

    async fn healthcheck(&self) -> AdapterHealth {
        if self.directory.is_dir() {
            AdapterHealth {
                healthy: true,
                details: format!("directory {} readable", self.directory.display()),
            }
        } else {
            AdapterHealth {
                healthy: false,
                details: format!("directory {} missing", self.directory.display()),
            }
        }
    }
}
