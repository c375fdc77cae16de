//! Remote host access.
//!
//! The [`RemoteHost`] trait is the supervisor's window onto the
//! version-control host: listing a repository's tags, fetching a raw
//! manifest, and downloading a release tarball. The production
//! implementation is [`GithubHost`]; tests substitute in-process fakes.

use async_trait::async_trait;
use breach_types::{ErrorCode, MANIFEST_FILE};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// User agent sent on every request; the tarball endpoint rejects
/// requests without one.
const USER_AGENT: &str = concat!("breach-modules/", env!("CARGO_PKG_VERSION"));

/// Remote host failure.
///
/// # Error Codes
///
/// | Variant | Code | Recoverable |
/// |---------|------|-------------|
/// | [`RemoteError::Http`] | `REMOTE_HTTP` | Yes |
/// | [`RemoteError::Status`] | `REMOTE_STATUS` | Yes |
/// | [`RemoteError::Decode`] | `REMOTE_DECODE` | No |
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Transport-level failure (DNS, TLS, connect, read).
    #[error("remote request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success HTTP status.
    #[error("remote returned {status} for {url}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Requested URL.
        url: String,
    },

    /// Response body did not match the expected shape.
    #[error("remote response undecodable: {0}")]
    Decode(String),
}

impl ErrorCode for RemoteError {
    fn code(&self) -> &'static str {
        match self {
            Self::Http(_) => "REMOTE_HTTP",
            Self::Status { .. } => "REMOTE_STATUS",
            Self::Decode(_) => "REMOTE_DECODE",
        }
    }

    fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Decode(_))
    }
}

/// Version-control host contract.
#[async_trait]
pub trait RemoteHost: Send + Sync {
    /// Lists all tag names of a repository, newest first as the host
    /// reports them.
    async fn list_tags(&self, owner: &str, name: &str) -> Result<Vec<String>, RemoteError>;

    /// Fetches the raw manifest text at `owner/name/<reference>/package.json`.
    async fn fetch_manifest(
        &self,
        owner: &str,
        name: &str,
        reference: &str,
    ) -> Result<String, RemoteError>;

    /// Downloads the gzipped release tarball for `reference`.
    async fn fetch_tarball(
        &self,
        owner: &str,
        name: &str,
        reference: &str,
    ) -> Result<Vec<u8>, RemoteError>;
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
}

/// GitHub-backed [`RemoteHost`].
///
/// Endpoints:
///
/// - tags: `https://api.github.com/repos/<owner>/<name>/tags`
/// - manifest: `https://raw.githubusercontent.com/<owner>/<name>/<ref>/package.json`
/// - tarball: `https://api.github.com/repos/<owner>/<name>/tarball/<ref>`
///
/// Base URLs are injectable so tests can point at a local server.
#[derive(Debug, Clone)]
pub struct GithubHost {
    client: reqwest::Client,
    api_base: String,
    raw_base: String,
}

impl GithubHost {
    /// Creates a host client against the public GitHub endpoints.
    #[must_use]
    pub fn new() -> Self {
        Self::with_bases(
            "https://api.github.com".to_string(),
            "https://raw.githubusercontent.com".to_string(),
        )
    }

    /// Creates a host client against custom base URLs.
    #[must_use]
    pub fn with_bases(api_base: String, raw_base: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base,
            raw_base,
        }
    }

    async fn get(&self, url: String) -> Result<reqwest::Response, RemoteError> {
        debug!(%url, "remote fetch");
        let response = self
            .client
            .get(url.as_str())
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(RemoteError::Status {
                status: response.status().as_u16(),
                url,
            });
        }
        Ok(response)
    }
}

impl Default for GithubHost {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteHost for GithubHost {
    async fn list_tags(&self, owner: &str, name: &str) -> Result<Vec<String>, RemoteError> {
        let url = format!("{}/repos/{owner}/{name}/tags", self.api_base);
        let entries: Vec<TagEntry> = self
            .get(url)
            .await?
            .json()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))?;
        Ok(entries.into_iter().map(|t| t.name).collect())
    }

    async fn fetch_manifest(
        &self,
        owner: &str,
        name: &str,
        reference: &str,
    ) -> Result<String, RemoteError> {
        let url = format!(
            "{}/{owner}/{name}/{reference}/{MANIFEST_FILE}",
            self.raw_base
        );
        Ok(self.get(url).await?.text().await?)
    }

    async fn fetch_tarball(
        &self,
        owner: &str,
        name: &str,
        reference: &str,
    ) -> Result<Vec<u8>, RemoteError> {
        let url = format!("{}/repos/{owner}/{name}/tarball/{reference}", self.api_base);
        Ok(self.get(url).await?.bytes().await?.to_vec())
    }
}
