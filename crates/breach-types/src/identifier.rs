//! Module identifiers.
//!
//! A module is named by a [`ModulePath`]: either a repository on the
//! version-control host (`github:owner/name#tag`) or a directory on the
//! local filesystem (`local:/abs/path`). The canonical string form is
//! the primary key for every registry record, so parsing and rendering
//! must round-trip exactly.
//!
//! # Grammar
//!
//! ```text
//! path     := "github:" owner "/" name [ "#" tag ]
//!           | "local:" fs-path
//! owner    := segment
//! name     := segment
//! tag      := segment
//! segment  := [A-Za-z0-9._-]+
//! fs-path  := absolute path, or "~"-prefixed path (home-expanded)
//! ```
//!
//! Local paths are normalized before canonicalization: `.` and `..`
//! segments are resolved lexically and trailing separators removed.
//!
//! # Example
//!
//! ```
//! use breach_types::ModulePath;
//!
//! let path: ModulePath = "github:breach/mod_strip#v0.2.1".parse().unwrap();
//! assert_eq!(path.to_string(), "github:breach/mod_strip#v0.2.1");
//! assert!(path.is_remote());
//!
//! let local: ModulePath = "local:/tmp/my-mod/".parse().unwrap();
//! assert_eq!(local.to_string(), "local:/tmp/my-mod");
//! ```

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

use crate::ErrorCode;

/// Scheme prefix for repository-hosted modules.
pub const REMOTE_SCHEME: &str = "github:";

/// Scheme prefix for local-directory modules.
pub const LOCAL_SCHEME: &str = "local:";

/// Identifier parse or normalization failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PathError {
    /// The string matches neither scheme or violates the grammar.
    #[error("invalid module path: {0}")]
    Invalid(String),

    /// A local path is relative (and not `~`-prefixed).
    #[error("local module path must be absolute: {0}")]
    NotAbsolute(String),

    /// A `..` segment would escape the filesystem root.
    #[error("local module path escapes the root: {0}")]
    EscapesRoot(String),

    /// `~` was used but no home directory could be determined.
    #[error("cannot expand '~': no home directory")]
    NoHome,
}

impl ErrorCode for PathError {
    fn code(&self) -> &'static str {
        match self {
            Self::Invalid(_) => "PATH_INVALID",
            Self::NotAbsolute(_) => "PATH_NOT_ABSOLUTE",
            Self::EscapesRoot(_) => "PATH_ESCAPES_ROOT",
            Self::NoHome => "PATH_NO_HOME",
        }
    }

    fn is_recoverable(&self) -> bool {
        false
    }
}

/// A parsed module identifier.
///
/// Exactly one variant: a repository on the remote host, or a local
/// directory. The [`Display`](fmt::Display) form is canonical and is
/// used as the registry primary key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ModulePath {
    /// Repository-hosted module: `github:<owner>/<name>[#<tag>]`.
    Remote {
        /// Repository owner.
        owner: String,
        /// Repository name.
        name: String,
        /// Optional tag. `None` until resolved against the host's tag list.
        tag: Option<String>,
    },
    /// Local-directory module: `local:<abs-path>`.
    Local {
        /// Normalized absolute path to the module directory.
        path: PathBuf,
    },
}

impl ModulePath {
    /// Parses a module path string.
    ///
    /// # Errors
    ///
    /// Returns [`PathError`] if the string matches neither scheme, a
    /// segment violates the `[A-Za-z0-9._-]` charset, or a local path
    /// cannot be normalized to an absolute path.
    pub fn parse(s: &str) -> Result<Self, PathError> {
        if let Some(rest) = s.strip_prefix(REMOTE_SCHEME) {
            return Self::parse_remote(s, rest);
        }
        if let Some(rest) = s.strip_prefix(LOCAL_SCHEME) {
            return Self::parse_local(rest);
        }
        Err(PathError::Invalid(s.to_string()))
    }

    fn parse_remote(full: &str, rest: &str) -> Result<Self, PathError> {
        let (repo, tag) = match rest.split_once('#') {
            Some((repo, tag)) => (repo, Some(tag)),
            None => (rest, None),
        };

        let Some((owner, name)) = repo.split_once('/') else {
            return Err(PathError::Invalid(full.to_string()));
        };

        if !is_segment(owner) || !is_segment(name) {
            return Err(PathError::Invalid(full.to_string()));
        }
        if let Some(tag) = tag {
            if !is_segment(tag) {
                return Err(PathError::Invalid(full.to_string()));
            }
        }

        Ok(Self::Remote {
            owner: owner.to_string(),
            name: name.to_string(),
            tag: tag.map(str::to_string),
        })
    }

    fn parse_local(rest: &str) -> Result<Self, PathError> {
        if rest.is_empty() {
            return Err(PathError::Invalid(format!("{LOCAL_SCHEME}{rest}")));
        }

        let expanded = expand_home(rest)?;
        if !expanded.is_absolute() {
            return Err(PathError::NotAbsolute(rest.to_string()));
        }

        Ok(Self::Local {
            path: normalize(&expanded)?,
        })
    }

    /// Returns `true` for the repository-hosted variant.
    #[must_use]
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote { .. })
    }

    /// Returns `true` for the local-directory variant.
    #[must_use]
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local { .. })
    }

    /// Returns the canonical string form.
    ///
    /// Equivalent to [`ToString::to_string`]; provided for call sites
    /// that read better with a named method.
    #[must_use]
    pub fn canonical(&self) -> String {
        self.to_string()
    }

    /// Returns a copy with the tag replaced.
    ///
    /// Only meaningful for the remote variant; local paths are returned
    /// unchanged.
    #[must_use]
    pub fn with_tag(&self, tag: impl Into<String>) -> Self {
        match self {
            Self::Remote { owner, name, .. } => Self::Remote {
                owner: owner.clone(),
                name: name.clone(),
                tag: Some(tag.into()),
            },
            Self::Local { .. } => self.clone(),
        }
    }
}

impl fmt::Display for ModulePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remote { owner, name, tag } => match tag {
                Some(tag) => write!(f, "{REMOTE_SCHEME}{owner}/{name}#{tag}"),
                None => write!(f, "{REMOTE_SCHEME}{owner}/{name}"),
            },
            Self::Local { path } => write!(f, "{LOCAL_SCHEME}{}", path.display()),
        }
    }
}

impl FromStr for ModulePath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for ModulePath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ModulePath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(de::Error::custom)
    }
}

/// Checks the `[A-Za-z0-9._-]+` segment charset.
fn is_segment(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// Expands a leading `~` to the current user's home directory.
fn expand_home(raw: &str) -> Result<PathBuf, PathError> {
    if raw == "~" {
        return dirs::home_dir().ok_or(PathError::NoHome);
    }
    if let Some(rest) = raw.strip_prefix("~/") {
        let home = dirs::home_dir().ok_or(PathError::NoHome)?;
        return Ok(home.join(rest));
    }
    Ok(PathBuf::from(raw))
}

/// Lexically normalizes an absolute path.
///
/// Resolves `.` and `..` segments and drops trailing separators. Fails
/// if a `..` segment would pop past the root.
fn normalize(path: &Path) -> Result<PathBuf, PathError> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::RootDir | Component::Prefix(_) => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() || out.as_os_str().is_empty() {
                    return Err(PathError::EscapesRoot(path.display().to_string()));
                }
            }
            Component::Normal(seg) => out.push(seg),
        }
    }
    Ok(out)
}
