//! Module installation into the shared on-disk cache.
//!
//! `install` is idempotent: a module whose install directory already
//! exists is a no-op success. Fresh remote installs fetch the release
//! tarball, extract it, and then run the external package-install tool
//! to materialize the module's own dependencies. Local modules are
//! used in place; installing one that is missing is a hard error.
//!
//! Concurrent installs of the same canonical path are serialized on a
//! per-path lock, and a waiter short-circuits if the first holder
//! finished the install.

use async_trait::async_trait;
use breach_types::{ErrorCode, ModulePath};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::archive::unpack_tarball;
use crate::layout::StorageLayout;
use crate::remote::RemoteHost;
use crate::ModuleError;

/// Package-install tool failure.
///
/// # Error Codes
///
/// | Variant | Code | Recoverable |
/// |---------|------|-------------|
/// | [`InstallError::Io`] | `INSTALL_IO` | Yes |
/// | [`InstallError::Failed`] | `INSTALL_FAILED` | Yes |
#[derive(Debug, Error)]
pub enum InstallError {
    /// The tool could not be launched.
    #[error("package-install tool could not run: {0}")]
    Io(#[from] std::io::Error),

    /// The tool ran and exited non-zero.
    #[error("package-install tool {tool} failed with status {status:?}")]
    Failed {
        /// Tool name, for diagnostics.
        tool: String,
        /// Exit code, if any.
        status: Option<i32>,
    },
}

impl ErrorCode for InstallError {
    fn code(&self) -> &'static str {
        match self {
            Self::Io(_) => "INSTALL_IO",
            Self::Failed { .. } => "INSTALL_FAILED",
        }
    }

    fn is_recoverable(&self) -> bool {
        true
    }
}

/// External package-install tool contract.
///
/// The tool is pointed at an install directory and materializes the
/// module's declared dependencies there. Its output is ignored;
/// failures propagate.
#[async_trait]
pub trait DependencyInstaller: Send + Sync {
    /// Installs dependencies in `dir`.
    async fn install_dependencies(&self, dir: &Path) -> Result<(), InstallError>;
}

/// `npm install` as the package-install tool.
#[derive(Debug, Clone, Default)]
pub struct NpmInstaller;

#[async_trait]
impl DependencyInstaller for NpmInstaller {
    async fn install_dependencies(&self, dir: &Path) -> Result<(), InstallError> {
        debug!(dir = %dir.display(), "npm install");
        let status = tokio::process::Command::new("npm")
            .arg("install")
            .current_dir(dir)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;

        if !status.success() {
            return Err(InstallError::Failed {
                tool: "npm".to_string(),
                status: status.code(),
            });
        }
        Ok(())
    }
}

/// Installs module payloads into the shared cache.
#[derive(Clone)]
pub struct Installer {
    layout: StorageLayout,
    host: Arc<dyn RemoteHost>,
    deps: Arc<dyn DependencyInstaller>,
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl Installer {
    /// Creates an installer.
    #[must_use]
    pub fn new(
        layout: StorageLayout,
        host: Arc<dyn RemoteHost>,
        deps: Arc<dyn DependencyInstaller>,
    ) -> Self {
        Self {
            layout,
            host,
            deps,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Returns the layout this installer writes into.
    #[must_use]
    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// Installs a module, returning its install directory.
    ///
    /// Safe to call repeatedly and concurrently for the same path.
    ///
    /// # Errors
    ///
    /// - [`ModuleError::InvalidPath`] for an unresolved remote or a
    ///   missing local module
    /// - [`ModuleError::Remote`] / [`ModuleError::Io`] on a failed
    ///   fetch or extraction (any partial install dir is removed first)
    /// - [`ModuleError::Install`] if the package-install tool fails
    pub async fn install(&self, path: &ModulePath) -> Result<PathBuf, ModuleError> {
        let dir = self
            .layout
            .install_dir(path)
            .ok_or_else(|| ModuleError::InvalidPath(path.to_string()))?;

        let lock = self.lock_for(path).await;
        let _held = lock.lock().await;

        if tokio::fs::metadata(&dir).await.is_ok() {
            debug!(path = %path, dir = %dir.display(), "already installed");
            return Ok(dir);
        }

        let ModulePath::Remote {
            owner,
            name,
            tag: Some(tag),
        } = path
        else {
            // A local module that does not exist cannot be materialized.
            return Err(ModuleError::InvalidPath(path.to_string()));
        };

        info!(path = %path, dir = %dir.display(), "installing module");
        if let Err(e) = self.fetch_and_extract(owner, name, tag, &dir).await {
            if tokio::fs::remove_dir_all(&dir).await.is_ok() {
                warn!(path = %path, "removed partial install after failure");
            }
            return Err(e);
        }

        self.deps.install_dependencies(&dir).await?;
        Ok(dir)
    }

    async fn fetch_and_extract(
        &self,
        owner: &str,
        name: &str,
        tag: &str,
        dir: &Path,
    ) -> Result<(), ModuleError> {
        let bytes = self.host.fetch_tarball(owner, name, tag).await?;
        let dir = dir.to_path_buf();
        tokio::task::spawn_blocking(move || unpack_tarball(&bytes, &dir))
            .await
            .map_err(|e| ModuleError::Io(std::io::Error::other(e)))??;
        Ok(())
    }

    async fn lock_for(&self, path: &ModulePath) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(path.canonical()).or_default().clone()
    }
}
