//! In-memory document store.
//!
//! Off-the-record sessions must never touch disk; their registry runs
//! on this backend and evaporates with the session.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::store::{remove_in, upsert_in};
use crate::{DocumentStore, Query, StoreError};

/// Volatile document store for off-the-record sessions.
#[derive(Debug, Default)]
pub struct MemoryStore {
    docs: Mutex<Vec<Value>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn find(&self, query: &Query) -> Result<Vec<Value>, StoreError> {
        let docs = self.docs.lock().await;
        Ok(docs.iter().filter(|d| query.matches(d)).cloned().collect())
    }

    async fn upsert(&self, query: &Query, doc: Value) -> Result<(), StoreError> {
        let mut docs = self.docs.lock().await;
        upsert_in(&mut docs, query, doc);
        Ok(())
    }

    async fn remove(&self, query: &Query, multi: bool) -> Result<usize, StoreError> {
        let mut docs = self.docs.lock().await;
        Ok(remove_in(&mut docs, query, multi))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn find_upsert_remove_cycle() {
        let store = MemoryStore::new();
        let key = Query::on("path", "local:/tmp/alpha");

        assert!(store.find(&key).await.unwrap().is_empty());

        store
            .upsert(&key, json!({"path": "local:/tmp/alpha", "name": "alpha"}))
            .await
            .unwrap();
        let found = store.find(&key).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["name"], "alpha");

        store
            .upsert(&key, json!({"path": "local:/tmp/alpha", "name": "alpha2"}))
            .await
            .unwrap();
        let found = store.find(&Query::all()).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["name"], "alpha2");

        assert_eq!(store.remove(&key, false).await.unwrap(), 1);
        assert!(store.find(&Query::all()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn multi_remove() {
        let store = MemoryStore::new();
        for i in 0..3 {
            store
                .upsert(&Query::on("i", i), json!({"i": i, "group": "g"}))
                .await
                .unwrap();
        }

        assert_eq!(store.remove(&Query::on("group", "g"), true).await.unwrap(), 3);
        assert!(store.find(&Query::all()).await.unwrap().is_empty());
    }
}
