//! Runtime layer errors.
//!
//! [`ModuleError`] is the error surfaced to the host by every
//! user-initiated operation. Dispatcher-internal failures (malformed
//! messages, spoofed sources, unknown reply ids) are logged and dropped
//! instead; they never reach this type and never tear down the
//! supervisor.
//!
//! # Error Codes
//!
//! | Variant | Code | Recoverable |
//! |---------|------|-------------|
//! | [`ModuleError::InvalidPath`] | `MODULE_INVALID_PATH` | No |
//! | [`ModuleError::InvalidVersion`] | `MODULE_INVALID_VERSION` | No |
//! | [`ModuleError::InvalidName`] | `MODULE_INVALID_NAME` | No |
//! | [`ModuleError::Conflict`] | `MODULE_CONFLICT` | No |
//! | [`ModuleError::Unknown`] | `MODULE_UNKNOWN` | No |
//! | [`ModuleError::Manifest`] | `MODULE_MANIFEST` | No |
//! | [`ModuleError::Rpc`] | `MODULE_RPC_FAILED` | No |
//! | [`ModuleError::Store`] | `MODULE_STORE` | Yes |
//! | [`ModuleError::Remote`] | `MODULE_REMOTE` | Yes |
//! | [`ModuleError::Process`] | `MODULE_PROCESS` | No |
//! | [`ModuleError::Install`] | `MODULE_INSTALL` | Yes |
//! | [`ModuleError::Io`] | `MODULE_IO` | Yes |
//! | [`ModuleError::SupervisorStopped`] | `MODULE_SUPERVISOR_STOPPED` | No |

use breach_store::StoreError;
use breach_types::{ErrorCode, ManifestError, PathError, RpcFailure};
use thiserror::Error;

use crate::installer::InstallError;
use crate::process::ProcessError;
use crate::remote::RemoteError;

/// Module runtime error.
///
/// # Example
///
/// ```
/// use breach_runtime::ModuleError;
/// use breach_types::ErrorCode;
///
/// let err = ModuleError::Unknown("github:breach/gone".into());
/// assert_eq!(err.code(), "MODULE_UNKNOWN");
/// assert!(!err.is_recoverable());
/// ```
#[derive(Debug, Error)]
pub enum ModuleError {
    /// Identifier parse failure, unknown local path, or an explicit
    /// remote tag that does not exist.
    #[error("invalid module path: {0}")]
    InvalidPath(String),

    /// Manifest version absent or not semver.
    #[error("invalid module version: {0:?}")]
    InvalidVersion(Option<String>),

    /// Manifest name absent or empty.
    #[error("invalid module name")]
    InvalidName,

    /// Add rejected because of a path, owner/name, or name collision.
    #[error("module conflict: {0}")]
    Conflict(String),

    /// Operation on a path that is not in the registry.
    #[error("unknown module: {0}")]
    Unknown(String),

    /// Manifest file is not parseable JSON.
    #[error("unreadable manifest: {0}")]
    Manifest(String),

    /// An RPC addressed through the core endpoint failed.
    #[error("rpc failed: {0}")]
    Rpc(RpcFailure),

    /// Registry document store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Remote host (tag listing, manifest, tarball) failure.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// Child process spawn or IPC failure.
    #[error(transparent)]
    Process(#[from] ProcessError),

    /// External package-install tool failure.
    #[error(transparent)]
    Install(#[from] InstallError),

    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The supervisor loop is gone; no further operations can complete.
    #[error("supervisor stopped")]
    SupervisorStopped,
}

impl ErrorCode for ModuleError {
    fn code(&self) -> &'static str {
        match self {
            Self::InvalidPath(_) => "MODULE_INVALID_PATH",
            Self::InvalidVersion(_) => "MODULE_INVALID_VERSION",
            Self::InvalidName => "MODULE_INVALID_NAME",
            Self::Conflict(_) => "MODULE_CONFLICT",
            Self::Unknown(_) => "MODULE_UNKNOWN",
            Self::Manifest(_) => "MODULE_MANIFEST",
            Self::Rpc(_) => "MODULE_RPC_FAILED",
            Self::Store(_) => "MODULE_STORE",
            Self::Remote(_) => "MODULE_REMOTE",
            Self::Process(_) => "MODULE_PROCESS",
            Self::Install(_) => "MODULE_INSTALL",
            Self::Io(_) => "MODULE_IO",
            Self::SupervisorStopped => "MODULE_SUPERVISOR_STOPPED",
        }
    }

    fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Store(_) | Self::Remote(_) | Self::Install(_) | Self::Io(_)
        )
    }
}

impl From<PathError> for ModuleError {
    fn from(err: PathError) -> Self {
        Self::InvalidPath(err.to_string())
    }
}

impl From<ManifestError> for ModuleError {
    fn from(err: ManifestError) -> Self {
        match err {
            ManifestError::MissingName => Self::InvalidName,
            ManifestError::InvalidVersion(raw) => Self::InvalidVersion(raw),
            ManifestError::Parse(msg) => Self::Manifest(msg),
        }
    }
}
