//! Module manifests.
//!
//! Every module ships a `package.json` at its root. The runtime only
//! cares about two fields: the module `name` (the key it runs under on
//! the bus) and its `version` (must clean to a valid semver). The rest
//! of the file belongs to the module and its package-install tool.
//!
//! # Example
//!
//! ```
//! use breach_types::ModuleManifest;
//!
//! let manifest = ModuleManifest::from_json(
//!     r#"{ "name": "alpha", "version": "v1.2.3", "main": "index.js" }"#,
//! ).unwrap();
//!
//! assert_eq!(manifest.name, "alpha");
//! assert_eq!(manifest.version, "1.2.3");
//! ```

use semver::Version;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ErrorCode;

/// Manifest file name at a module's root.
pub const MANIFEST_FILE: &str = "package.json";

/// Manifest validation failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ManifestError {
    /// Manifest is not valid JSON or not an object.
    #[error("manifest is not valid JSON: {0}")]
    Parse(String),

    /// `name` is absent or empty.
    #[error("manifest has no name")]
    MissingName,

    /// `version` is absent or does not clean to a semver.
    #[error("manifest version is not semver: {0:?}")]
    InvalidVersion(Option<String>),
}

impl ErrorCode for ManifestError {
    fn code(&self) -> &'static str {
        match self {
            Self::Parse(_) => "MANIFEST_PARSE",
            Self::MissingName => "MANIFEST_MISSING_NAME",
            Self::InvalidVersion(_) => "MANIFEST_INVALID_VERSION",
        }
    }

    fn is_recoverable(&self) -> bool {
        false
    }
}

/// The subset of `package.json` the runtime reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleManifest {
    /// Module name; unique per session, used as the running key.
    pub name: String,
    /// Cleaned semver string (leading `v`/`=` stripped).
    pub version: String,
}

impl ModuleManifest {
    /// Parses and validates manifest JSON text.
    ///
    /// # Errors
    ///
    /// - [`ManifestError::Parse`] on malformed JSON
    /// - [`ManifestError::MissingName`] if `name` is absent or empty
    /// - [`ManifestError::InvalidVersion`] if `version` is absent or
    ///   does not clean to a semver
    pub fn from_json(text: &str) -> Result<Self, ManifestError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| ManifestError::Parse(e.to_string()))?;

        let name = value
            .get("name")
            .and_then(serde_json::Value::as_str)
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .ok_or(ManifestError::MissingName)?;

        let raw_version = value.get("version").and_then(serde_json::Value::as_str);
        let version = raw_version
            .and_then(clean_version)
            .ok_or_else(|| ManifestError::InvalidVersion(raw_version.map(str::to_string)))?;

        Ok(Self {
            name: name.to_string(),
            version: version.to_string(),
        })
    }
}

/// Cleans a raw version string to a semver.
///
/// Strips surrounding whitespace and a single leading `v`, `V` or `=`,
/// then parses strictly. Returns `None` if the remainder is not a
/// semver. Also used by the resolver to decide which remote tags are
/// version-like.
#[must_use]
pub fn clean_version(raw: &str) -> Option<Version> {
    let trimmed = raw.trim();
    let stripped = trimmed
        .strip_prefix(['v', 'V', '='])
        .unwrap_or(trimmed)
        .trim();
    Version::parse(stripped).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_manifest() {
        let m = ModuleManifest::from_json(r#"{"name": "alpha", "version": "1.2.3"}"#).unwrap();
        assert_eq!(m.name, "alpha");
        assert_eq!(m.version, "1.2.3");
    }

    #[test]
    fn extra_fields_ignored() {
        let m = ModuleManifest::from_json(
            r#"{"name": "alpha", "version": "1.0.0", "main": "index.js", "dependencies": {}}"#,
        )
        .unwrap();
        assert_eq!(m.name, "alpha");
    }

    #[test]
    fn version_cleaned() {
        let m = ModuleManifest::from_json(r#"{"name": "a", "version": " v1.2.3 "}"#).unwrap();
        assert_eq!(m.version, "1.2.3");

        let m = ModuleManifest::from_json(r#"{"name": "a", "version": "=0.1.0"}"#).unwrap();
        assert_eq!(m.version, "0.1.0");
    }

    #[test]
    fn missing_name_rejected() {
        let err = ModuleManifest::from_json(r#"{"version": "1.0.0"}"#).unwrap_err();
        assert_eq!(err, ManifestError::MissingName);

        let err = ModuleManifest::from_json(r#"{"name": "  ", "version": "1.0.0"}"#).unwrap_err();
        assert_eq!(err, ManifestError::MissingName);
    }

    #[test]
    fn bad_version_rejected() {
        let err = ModuleManifest::from_json(r#"{"name": "a"}"#).unwrap_err();
        assert_eq!(err, ManifestError::InvalidVersion(None));

        let err = ModuleManifest::from_json(r#"{"name": "a", "version": "latest"}"#).unwrap_err();
        assert_eq!(err, ManifestError::InvalidVersion(Some("latest".into())));

        let err = ModuleManifest::from_json(r#"{"name": "a", "version": "1.2"}"#).unwrap_err();
        assert!(matches!(err, ManifestError::InvalidVersion(_)));
    }

    #[test]
    fn malformed_json_rejected() {
        assert!(matches!(
            ModuleManifest::from_json("not json"),
            Err(ManifestError::Parse(_))
        ));
        assert!(matches!(
            ModuleManifest::from_json("[1, 2]"),
            Err(ManifestError::MissingName)
        ));
    }

    #[test]
    fn clean_version_variants() {
        assert_eq!(clean_version("1.2.3"), Some(Version::new(1, 2, 3)));
        assert_eq!(clean_version("v1.2.3"), Some(Version::new(1, 2, 3)));
        assert_eq!(clean_version("V2.0.0"), Some(Version::new(2, 0, 0)));
        assert_eq!(clean_version("=1.0.0"), Some(Version::new(1, 0, 0)));
        assert_eq!(clean_version("  v0.0.1  "), Some(Version::new(0, 0, 1)));

        assert_eq!(clean_version("master"), None);
        assert_eq!(clean_version("1.2"), None);
        assert_eq!(clean_version(""), None);
    }

    #[test]
    fn error_codes() {
        use crate::assert_error_codes;
        assert_error_codes(
            &[
                ManifestError::Parse("x".into()),
                ManifestError::MissingName,
                ManifestError::InvalidVersion(None),
            ],
            "MANIFEST_",
        );
    }
}
