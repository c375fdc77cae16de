//! File-backed document store.
//!
//! Documents live in one JSON array file (the session's `modules.db`).
//! The whole array is loaded on open and rewritten on every mutation
//! with the temp-file-then-rename pattern, so a crash mid-write never
//! leaves a half-written database behind.

use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

use crate::store::{remove_in, upsert_in};
use crate::{DocumentStore, Query, StoreError};

/// Persistent document store backed by a single JSON file.
///
/// # Example
///
/// ```no_run
/// use breach_store::FileStore;
/// use std::path::PathBuf;
///
/// # async fn example() -> Result<(), breach_store::StoreError> {
/// let store = FileStore::open(PathBuf::from("/data/session/modules.db")).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    docs: Mutex<Vec<Value>>,
}

impl FileStore {
    /// Opens (or creates) the store at `path`.
    ///
    /// Parent directories are created as needed. A missing file opens
    /// as an empty store; the file is only created on first write.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] on filesystem failure or
    /// [`StoreError::Corrupt`] if the file exists but does not hold a
    /// JSON array.
    pub async fn open(path: PathBuf) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let docs = match fs::read_to_string(&path).await {
            Ok(text) => {
                let value: Value = serde_json::from_str(&text)
                    .map_err(|e| StoreError::Corrupt(e.to_string()))?;
                match value {
                    Value::Array(docs) => docs,
                    other => {
                        return Err(StoreError::Corrupt(format!(
                            "expected a document array, found {other}"
                        )))
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        debug!(path = %path.display(), documents = docs.len(), "document store opened");

        Ok(Self {
            path,
            docs: Mutex::new(docs),
        })
    }

    /// Returns the backing file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrites the backing file atomically.
    async fn persist(&self, docs: &[Value]) -> Result<(), StoreError> {
        let text = serde_json::to_string_pretty(docs)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        let tmp = self.path.with_extension("db.tmp");
        fs::write(&tmp, text).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for FileStore {
    async fn find(&self, query: &Query) -> Result<Vec<Value>, StoreError> {
        let docs = self.docs.lock().await;
        Ok(docs.iter().filter(|d| query.matches(d)).cloned().collect())
    }

    async fn upsert(&self, query: &Query, doc: Value) -> Result<(), StoreError> {
        let mut docs = self.docs.lock().await;
        upsert_in(&mut docs, query, doc);
        self.persist(&docs).await
    }

    async fn remove(&self, query: &Query, multi: bool) -> Result<usize, StoreError> {
        let mut docs = self.docs.lock().await;
        let removed = remove_in(&mut docs, query, multi);
        if removed > 0 {
            self.persist(&docs).await?;
        }
        Ok(removed)
    }
}
