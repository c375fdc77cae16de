//! On-disk storage layout for installed modules.
//!
//! The modules root is shared by every session on the host; installs
//! only ever create new `<owner>/<name>#<tag>` directories under it.
//! Local modules are used in place and never written to.
//!
//! ```text
//! <data>/breach/modules/
//! ├── breach/mod_strip#v0.2.1/
//! ├── breach/mod_strip#v0.3.0/
//! └── morganrallen/mod_devtools#master/
//! ```

use breach_types::ModulePath;
use std::path::{Path, PathBuf};

/// Returns the host-wide default modules root.
///
/// `<data>/breach/modules`, falling back to a dot directory in the
/// home directory when the platform has no data dir.
#[must_use]
pub fn default_modules_root() -> PathBuf {
    match dirs::data_dir() {
        Some(data) => data.join("breach").join("modules"),
        None => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".breach")
            .join("modules"),
    }
}

/// Maps module identifiers to install directories.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    /// Creates a layout rooted at `root`.
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Returns the shared modules root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the install directory for a module.
    ///
    /// Remote identifiers must be resolved (carry a tag); `None` is
    /// returned for an unresolved remote. Local identifiers map to
    /// their own path.
    #[must_use]
    pub fn install_dir(&self, path: &ModulePath) -> Option<PathBuf> {
        match path {
            ModulePath::Remote {
                owner,
                name,
                tag: Some(tag),
            } => Some(self.root.join(owner).join(format!("{name}#{tag}"))),
            ModulePath::Remote { tag: None, .. } => None,
            ModulePath::Local { path } => Some(path.clone()),
        }
    }
}
