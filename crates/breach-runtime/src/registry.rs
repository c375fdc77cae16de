//! Per-session module registry.
//!
//! The registry is the durable record of which modules a session has
//! added. Records live in the session's document store (`modules.db`,
//! or memory for off-the-record sessions) keyed by canonical path.
//!
//! # Conflict rules
//!
//! `add` rejects a module when any existing record has:
//!
//! - the identical canonical path,
//! - the same remote owner and repository regardless of tag, or
//! - the same manifest name.
//!
//! Names double as running-module keys on the bus, so they must be
//! unique per session.

use breach_store::{DocumentStore, Query};
use breach_types::{ModuleManifest, ModulePath, MANIFEST_FILE};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::remote::RemoteHost;
use crate::resolver::Resolver;
use crate::ModuleError;

/// One registered module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleRecord {
    /// Canonical identifier string; primary key.
    pub path: String,

    /// Module name from its manifest; unique per session.
    pub name: String,

    /// Cleaned semver version from the manifest.
    pub version: String,

    /// Reserved for future enable/disable; always `true` today.
    pub active: bool,

    /// Repository owner (remote modules only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,

    /// Repository name (remote modules only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,

    /// Resolved tag (remote modules only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,

    /// When the module was added to this session.
    pub added_at: DateTime<Utc>,
}

/// A record annotated with its live state, as returned by `list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleStatus {
    /// The stored record.
    #[serde(flatten)]
    pub record: ModuleRecord,

    /// `true` when the module currently has a running process.
    pub running: bool,
}

/// Durable per-session record of added modules.
#[derive(Clone)]
pub struct Registry {
    store: Arc<dyn DocumentStore>,
    resolver: Resolver,
    host: Arc<dyn RemoteHost>,
}

impl Registry {
    /// Creates a registry over the given store and host.
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>, host: Arc<dyn RemoteHost>) -> Self {
        Self {
            store,
            resolver: Resolver::new(host.clone()),
            host,
        }
    }

    /// Parses and resolves a raw identifier to its canonical form.
    ///
    /// Identifiers are re-resolved on every boundary crossing, so an
    /// untagged remote path always lands on the same record its `add`
    /// created.
    pub async fn canonicalize(&self, raw: &str) -> Result<ModulePath, ModuleError> {
        let parsed = ModulePath::parse(raw)?;
        self.resolver.resolve(&parsed).await
    }

    /// Adds a module to the session.
    ///
    /// Resolves the identifier, enforces the conflict rules, fetches
    /// and validates the manifest, and upserts the record.
    ///
    /// # Errors
    ///
    /// - [`ModuleError::InvalidPath`] on parse/resolution failure
    /// - [`ModuleError::Conflict`] on a path, owner/repo, or name clash
    /// - [`ModuleError::InvalidName`] / [`ModuleError::InvalidVersion`]
    ///   on a bad manifest
    pub async fn add(&self, raw: &str) -> Result<ModuleRecord, ModuleError> {
        let resolved = self.canonicalize(raw).await?;
        let canonical = resolved.canonical();

        let existing = self.list().await?;
        for record in &existing {
            let clash = record.path == canonical
                || match &resolved {
                    ModulePath::Remote { owner, name, .. } => {
                        record.owner.as_deref() == Some(owner.as_str())
                            && record.repo.as_deref() == Some(name.as_str())
                    }
                    ModulePath::Local { .. } => false,
                };
            if clash {
                return Err(ModuleError::Conflict(format!(
                    "{canonical} collides with {}",
                    record.path
                )));
            }
        }

        let manifest = self.fetch_manifest(&resolved).await?;

        if existing.iter().any(|r| r.name == manifest.name) {
            return Err(ModuleError::Conflict(format!(
                "name {} is already taken",
                manifest.name
            )));
        }

        let (owner, repo, tag) = match &resolved {
            ModulePath::Remote { owner, name, tag } => {
                (Some(owner.clone()), Some(name.clone()), tag.clone())
            }
            ModulePath::Local { .. } => (None, None, None),
        };

        let record = ModuleRecord {
            path: canonical.clone(),
            name: manifest.name,
            version: manifest.version,
            active: true,
            owner,
            repo,
            tag,
            added_at: Utc::now(),
        };

        let doc = serde_json::to_value(&record)
            .map_err(|e| ModuleError::Manifest(e.to_string()))?;
        self.store
            .upsert(&Query::on("path", canonical.as_str()), doc)
            .await?;

        info!(module = %record.name, path = %record.path, version = %record.version, "module added");
        Ok(record)
    }

    /// Returns all records, in insertion order.
    pub async fn list(&self) -> Result<Vec<ModuleRecord>, ModuleError> {
        let docs = self.store.find(&Query::all()).await?;
        Ok(docs
            .into_iter()
            .filter_map(|doc| match serde_json::from_value(doc) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(error = %e, "skipping undecodable registry document");
                    None
                }
            })
            .collect())
    }

    /// Returns the record for a canonical path.
    ///
    /// # Errors
    ///
    /// [`ModuleError::Unknown`] if the path is not registered.
    pub async fn get(&self, path: &ModulePath) -> Result<ModuleRecord, ModuleError> {
        let canonical = path.canonical();
        let docs = self
            .store
            .find(&Query::on("path", canonical.as_str()))
            .await?;
        docs.into_iter()
            .next()
            .and_then(|doc| serde_json::from_value(doc).ok())
            .ok_or(ModuleError::Unknown(canonical))
    }

    /// Deletes the record for a canonical path.
    pub async fn remove(&self, path: &ModulePath) -> Result<(), ModuleError> {
        self.store
            .remove(&Query::on("path", path.canonical().as_str()), false)
            .await?;
        info!(path = %path, "module removed from registry");
        Ok(())
    }

    async fn fetch_manifest(&self, path: &ModulePath) -> Result<ModuleManifest, ModuleError> {
        let text = match path {
            ModulePath::Local { path: dir } => {
                tokio::fs::read_to_string(dir.join(MANIFEST_FILE)).await?
            }
            ModulePath::Remote {
                owner,
                name,
                tag: Some(tag),
            } => self.host.fetch_manifest(owner, name, tag).await?,
            ModulePath::Remote { tag: None, .. } => {
                return Err(ModuleError::InvalidPath(path.to_string()))
            }
        };
        Ok(ModuleManifest::from_json(&text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::RemoteError;
    use async_trait::async_trait;
    use breach_store::MemoryStore;
    use std::collections::HashMap;
    use std::fs;
    use tempfile::TempDir;

    /// Host with fixed tags and per-reference manifests.
    #[derive(Default)]
    struct TestHost {
        tags: Vec<String>,
        manifests: HashMap<String, String>,
    }

    impl TestHost {
        fn with_manifest(mut self, reference: &str, manifest: &str) -> Self {
            self.manifests
                .insert(reference.to_string(), manifest.to_string());
            self
        }

        fn with_tags(mut self, tags: &[&str]) -> Self {
            self.tags = tags.iter().map(|t| t.to_string()).collect();
            self
        }
    }

    #[async_trait]
    impl RemoteHost for TestHost {
        async fn list_tags(&self, _: &str, _: &str) -> Result<Vec<String>, RemoteError> {
            Ok(self.tags.clone())
        }

        async fn fetch_manifest(
            &self,
            _: &str,
            _: &str,
            reference: &str,
        ) -> Result<String, RemoteError> {
            self.manifests
                .get(reference)
                .cloned()
                .ok_or(RemoteError::Status {
                    status: 404,
                    url: reference.to_string(),
                })
        }

        async fn fetch_tarball(&self, _: &str, _: &str, _: &str) -> Result<Vec<u8>, RemoteError> {
            unreachable!("registry never fetches tarballs")
        }
    }

    fn registry(host: TestHost) -> Registry {
        Registry::new(Arc::new(MemoryStore::new()), Arc::new(host))
    }

    fn local_module(name: &str, version: &str) -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join(MANIFEST_FILE),
            format!(r#"{{"name": "{name}", "version": "{version}"}}"#),
        )
        .unwrap();
        dir
    }

    #[tokio::test]
    async fn add_local_round_trips() {
        let dir = local_module("alpha", "1.2.3");
        let reg = registry(TestHost::default());
        let raw = format!("local:{}", dir.path().display());

        let record = reg.add(&raw).await.unwrap();
        assert_eq!(record.name, "alpha");
        assert_eq!(record.version, "1.2.3");
        assert!(record.active);
        assert_eq!(record.owner, None);

        let listed = reg.list().await.unwrap();
        assert_eq!(listed, vec![record]);
    }

    #[tokio::test]
    async fn add_remote_denormalizes_owner_repo_tag() {
        let host = TestHost::default()
            .with_tags(&["v0.1.0", "v0.2.0"])
            .with_manifest("v0.2.0", r#"{"name": "strip", "version": "0.2.0"}"#);
        let reg = registry(host);

        let record = reg.add("github:breach/mod_strip").await.unwrap();
        assert_eq!(record.path, "github:breach/mod_strip#v0.2.0");
        assert_eq!(record.owner.as_deref(), Some("breach"));
        assert_eq!(record.repo.as_deref(), Some("mod_strip"));
        assert_eq!(record.tag.as_deref(), Some("v0.2.0"));
    }

    #[tokio::test]
    async fn duplicate_path_conflicts() {
        let dir = local_module("alpha", "1.0.0");
        let reg = registry(TestHost::default());
        let raw = format!("local:{}", dir.path().display());

        reg.add(&raw).await.unwrap();
        let err = reg.add(&raw).await.unwrap_err();
        assert!(matches!(err, ModuleError::Conflict(_)));
    }

    #[tokio::test]
    async fn same_owner_repo_conflicts_across_tags() {
        let host = TestHost::default()
            .with_tags(&["v0.1.0", "v0.2.0"])
            .with_manifest("v0.1.0", r#"{"name": "one", "version": "0.1.0"}"#)
            .with_manifest("v0.2.0", r#"{"name": "two", "version": "0.2.0"}"#);
        let reg = registry(host);

        reg.add("github:breach/mod_strip#v0.1.0").await.unwrap();
        let err = reg
            .add("github:breach/mod_strip#v0.2.0")
            .await
            .unwrap_err();
        assert!(matches!(err, ModuleError::Conflict(_)));
    }

    #[tokio::test]
    async fn duplicate_name_conflicts() {
        let dir_a = local_module("alpha", "1.0.0");
        let dir_b = local_module("alpha", "2.0.0");
        let reg = registry(TestHost::default());

        reg.add(&format!("local:{}", dir_a.path().display()))
            .await
            .unwrap();
        let err = reg
            .add(&format!("local:{}", dir_b.path().display()))
            .await
            .unwrap_err();
        assert!(matches!(err, ModuleError::Conflict(_)));
    }

    #[tokio::test]
    async fn bad_manifest_rejected() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join(MANIFEST_FILE),
            r#"{"name": "alpha", "version": "latest"}"#,
        )
        .unwrap();
        let reg = registry(TestHost::default());

        let err = reg
            .add(&format!("local:{}", dir.path().display()))
            .await
            .unwrap_err();
        assert!(matches!(err, ModuleError::InvalidVersion(_)));
    }

    #[tokio::test]
    async fn missing_local_manifest_propagates_io() {
        let dir = TempDir::new().unwrap();
        let reg = registry(TestHost::default());

        let err = reg
            .add(&format!("local:{}", dir.path().display()))
            .await
            .unwrap_err();
        assert!(matches!(err, ModuleError::Io(_)));
    }

    #[tokio::test]
    async fn get_unknown_path() {
        let reg = registry(TestHost::default());
        let path: ModulePath = "github:o/m#master".parse().unwrap();
        let err = reg.get(&path).await.unwrap_err();
        assert!(matches!(err, ModuleError::Unknown(_)));
    }

    #[tokio::test]
    async fn remove_then_list_is_empty() {
        let dir = local_module("alpha", "1.0.0");
        let reg = registry(TestHost::default());
        let raw = format!("local:{}", dir.path().display());

        let record = reg.add(&raw).await.unwrap();
        let path: ModulePath = record.path.parse().unwrap();

        reg.remove(&path).await.unwrap();
        assert!(reg.list().await.unwrap().is_empty());
        assert!(matches!(
            reg.get(&path).await,
            Err(ModuleError::Unknown(_))
        ));
    }

    #[tokio::test]
    async fn canonicalize_re_resolves_untagged_remote() {
        let host = TestHost::default()
            .with_tags(&["v0.3.0"])
            .with_manifest("v0.3.0", r#"{"name": "strip", "version": "0.3.0"}"#);
        let reg = registry(host);

        let added = reg.add("github:breach/mod_strip").await.unwrap();
        let resolved = reg.canonicalize("github:breach/mod_strip").await.unwrap();
        assert_eq!(resolved.canonical(), added.path);
    }
}
