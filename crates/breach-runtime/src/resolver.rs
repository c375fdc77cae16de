//! Tag and path resolution.
//!
//! [`Resolver::resolve`] turns a parsed identifier into its canonical,
//! fully-pinned form: local paths are checked for existence, remote
//! paths get a concrete tag chosen against the host's tag listing.
//!
//! # Tag selection
//!
//! Applied in order:
//!
//! 1. An explicit tag that exactly matches a listed tag is kept.
//! 2. An explicit `master` is kept literally, without a tag lookup.
//! 3. Any other explicit tag not in the listing is an invalid path.
//! 4. With no explicit tag, the greatest version-like tag wins.
//! 5. With no version-like tags at all, `master` is used.

use breach_types::{clean_version, ModulePath};
use semver::Version;
use std::sync::Arc;
use tracing::debug;

use crate::remote::RemoteHost;
use crate::ModuleError;

/// Branch name used when no tag can be chosen.
pub const DEFAULT_TAG: &str = "master";

/// Resolves identifiers against the filesystem and the remote host.
#[derive(Clone)]
pub struct Resolver {
    host: Arc<dyn RemoteHost>,
}

impl Resolver {
    /// Creates a resolver backed by the given host.
    #[must_use]
    pub fn new(host: Arc<dyn RemoteHost>) -> Self {
        Self { host }
    }

    /// Resolves an identifier to its canonical form.
    ///
    /// # Errors
    ///
    /// - [`ModuleError::InvalidPath`] for a missing local path or an
    ///   explicit tag the host does not list
    /// - [`ModuleError::Remote`] if the tag listing itself fails
    pub async fn resolve(&self, path: &ModulePath) -> Result<ModulePath, ModuleError> {
        match path {
            ModulePath::Local { path: dir } => {
                tokio::fs::metadata(dir)
                    .await
                    .map_err(|_| ModuleError::InvalidPath(path.to_string()))?;
                Ok(path.clone())
            }
            ModulePath::Remote { owner, name, tag } => {
                if tag.as_deref() == Some(DEFAULT_TAG) {
                    return Ok(path.clone());
                }

                let tags = self.host.list_tags(owner, name).await?;

                let chosen = match tag {
                    Some(wanted) => {
                        if tags.iter().any(|t| t == wanted) {
                            wanted.clone()
                        } else {
                            return Err(ModuleError::InvalidPath(path.to_string()));
                        }
                    }
                    None => pick_highest(&tags).unwrap_or_else(|| DEFAULT_TAG.to_string()),
                };

                debug!(module = %path, tag = %chosen, "tag resolved");
                Ok(path.with_tag(chosen))
            }
        }
    }
}

/// Picks the tag with the greatest cleaned version, if any.
fn pick_highest(tags: &[String]) -> Option<String> {
    tags.iter()
        .filter_map(|t| clean_version(t).map(|v| (v, t)))
        .max_by(|a, b| Version::cmp(&a.0, &b.0))
        .map(|(_, t)| t.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::RemoteError;
    use async_trait::async_trait;

    /// Host serving a fixed tag list.
    struct FixedTags {
        tags: Vec<&'static str>,
        fail_listing: bool,
    }

    impl FixedTags {
        fn new(tags: Vec<&'static str>) -> Self {
            Self {
                tags,
                fail_listing: false,
            }
        }
    }

    #[async_trait]
    impl RemoteHost for FixedTags {
        async fn list_tags(&self, _: &str, _: &str) -> Result<Vec<String>, RemoteError> {
            if self.fail_listing {
                return Err(RemoteError::Status {
                    status: 500,
                    url: "tags".into(),
                });
            }
            Ok(self.tags.iter().map(|t| t.to_string()).collect())
        }

        async fn fetch_manifest(&self, _: &str, _: &str, _: &str) -> Result<String, RemoteError> {
            unreachable!("resolver never fetches manifests")
        }

        async fn fetch_tarball(&self, _: &str, _: &str, _: &str) -> Result<Vec<u8>, RemoteError> {
            unreachable!("resolver never fetches tarballs")
        }
    }

    fn resolver(tags: Vec<&'static str>) -> Resolver {
        Resolver::new(Arc::new(FixedTags::new(tags)))
    }

    fn remote(s: &str) -> ModulePath {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn explicit_listed_tag_kept() {
        let resolved = resolver(vec!["v0.1.0", "v0.2.0"])
            .resolve(&remote("github:o/m#v0.1.0"))
            .await
            .unwrap();
        assert_eq!(resolved.to_string(), "github:o/m#v0.1.0");
    }

    #[tokio::test]
    async fn explicit_master_kept_without_lookup() {
        let host = FixedTags {
            tags: vec![],
            fail_listing: true,
        };
        let resolved = Resolver::new(Arc::new(host))
            .resolve(&remote("github:o/m#master"))
            .await
            .unwrap();
        assert_eq!(resolved.to_string(), "github:o/m#master");
    }

    #[tokio::test]
    async fn explicit_unlisted_tag_rejected() {
        let err = resolver(vec!["v0.1.0"])
            .resolve(&remote("github:o/m#v9.9.9"))
            .await
            .unwrap_err();
        assert!(matches!(err, ModuleError::InvalidPath(_)));
    }

    #[tokio::test]
    async fn highest_semver_wins_without_explicit_tag() {
        let resolved = resolver(vec!["v0.1.0", "v0.10.0", "v0.2.0", "junk"])
            .resolve(&remote("github:o/m"))
            .await
            .unwrap();
        assert_eq!(resolved.to_string(), "github:o/m#v0.10.0");
    }

    #[tokio::test]
    async fn no_version_like_tags_defaults_to_master() {
        let resolved = resolver(vec!["nightly", "junk"])
            .resolve(&remote("github:o/m"))
            .await
            .unwrap();
        assert_eq!(resolved.to_string(), "github:o/m#master");

        let resolved = resolver(vec![])
            .resolve(&remote("github:o/m"))
            .await
            .unwrap();
        assert_eq!(resolved.to_string(), "github:o/m#master");
    }

    #[tokio::test]
    async fn listing_failure_propagates() {
        let host = FixedTags {
            tags: vec![],
            fail_listing: true,
        };
        let err = Resolver::new(Arc::new(host))
            .resolve(&remote("github:o/m"))
            .await
            .unwrap_err();
        assert!(matches!(err, ModuleError::Remote(_)));
    }

    #[tokio::test]
    async fn local_path_must_exist() {
        let temp = tempfile::TempDir::new().unwrap();
        let existing = format!("local:{}", temp.path().display());
        let resolved = resolver(vec![]).resolve(&remote(&existing)).await.unwrap();
        assert_eq!(resolved.to_string(), existing);

        let missing = remote("local:/definitely/not/here");
        let err = resolver(vec![]).resolve(&missing).await.unwrap_err();
        assert!(matches!(err, ModuleError::InvalidPath(_)));
    }

    #[test]
    fn pick_highest_ignores_non_versions() {
        let tags: Vec<String> = ["a", "v1.0.0", "2.0.0", "v1.5.0"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(pick_highest(&tags), Some("2.0.0".to_string()));
        assert_eq!(pick_highest(&[]), None);
    }
}
