//! Document storage abstraction.
//!
//! The [`DocumentStore`] trait defines the small document-container
//! contract the module registry needs: equality-query `find`, keyed
//! `upsert`, and single- or multi-document `remove`. Backends are
//! pluggable so that off-the-record sessions can stay entirely in
//! memory while normal sessions persist to disk.
//!
//! # Example
//!
//! ```no_run
//! use breach_store::{DocumentStore, Query, StoreError};
//! use serde_json::json;
//!
//! async fn add_record(store: &dyn DocumentStore) -> Result<(), StoreError> {
//!     let query = Query::on("path", "local:/tmp/alpha");
//!     store
//!         .upsert(&query, json!({"path": "local:/tmp/alpha", "name": "alpha"}))
//!         .await?;
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::StoreError;

/// Field-equality query over JSON documents.
///
/// A document matches when every queried field is present and equal.
/// An empty query matches every document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    fields: Map<String, Value>,
}

impl Query {
    /// Creates an empty query (matches everything).
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Creates a single-field equality query.
    #[must_use]
    pub fn on(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::all().and(field, value)
    }

    /// Adds another field-equality constraint.
    #[must_use]
    pub fn and(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    /// Returns `true` if the document satisfies every constraint.
    #[must_use]
    pub fn matches(&self, doc: &Value) -> bool {
        self.fields
            .iter()
            .all(|(field, expected)| doc.get(field) == Some(expected))
    }

    /// Returns `true` if the query has no constraints.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Per-session document container.
///
/// Implementations must be thread-safe (`Send + Sync`); the registry
/// holds the store behind an `Arc` and calls it from async context.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Returns all documents matching the query, in insertion order.
    async fn find(&self, query: &Query) -> Result<Vec<Value>, StoreError>;

    /// Replaces the first document matching the query, or appends the
    /// document if nothing matches.
    async fn upsert(&self, query: &Query, doc: Value) -> Result<(), StoreError>;

    /// Removes matching documents and returns how many were removed.
    ///
    /// With `multi = false` at most the first match is removed.
    async fn remove(&self, query: &Query, multi: bool) -> Result<usize, StoreError>;
}

/// Shared in-memory upsert used by both backends.
pub(crate) fn upsert_in(docs: &mut Vec<Value>, query: &Query, doc: Value) {
    match docs.iter_mut().find(|d| query.matches(d)) {
        Some(slot) => *slot = doc,
        None => docs.push(doc),
    }
}

/// Shared in-memory remove used by both backends.
pub(crate) fn remove_in(docs: &mut Vec<Value>, query: &Query, multi: bool) -> usize {
    if multi {
        let before = docs.len();
        docs.retain(|d| !query.matches(d));
        before - docs.len()
    } else {
        match docs.iter().position(|d| query.matches(d)) {
            Some(idx) => {
                docs.remove(idx);
                1
            }
            None => 0,
        }
    }
}
