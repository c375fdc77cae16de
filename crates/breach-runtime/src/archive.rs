//! Release tarball extraction.
//!
//! The tarball endpoint serves a gzipped tar whose single top-level
//! directory (`owner-name-sha/`) is stripped on extraction, so the
//! module's own files land directly in the install directory.

use flate2::read::GzDecoder;
use std::io;
use std::path::{Component, Path, PathBuf};
use tar::Archive;

/// Unpacks a gzipped tarball into `target`, stripping the single
/// leading path component of every entry.
///
/// Entries that collapse to nothing after stripping (the top-level
/// directory itself) are skipped. Entries that would escape `target`
/// are rejected.
///
/// # Errors
///
/// Returns [`io::Error`] on a corrupt archive, an escaping entry, or a
/// filesystem failure. The caller is responsible for removing a
/// partially-populated `target` afterwards.
pub fn unpack_tarball(bytes: &[u8], target: &Path) -> io::Result<()> {
    std::fs::create_dir_all(target)?;

    let mut archive = Archive::new(GzDecoder::new(bytes));
    for entry in archive.entries()? {
        let mut entry = entry?;
        let Some(stripped) = strip_leading_component(&entry.path()?) else {
            continue;
        };

        let out = target.join(stripped);
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent)?;
        }
        entry.unpack(&out)?;
    }
    Ok(())
}

/// Drops the first path component; `None` if nothing remains.
///
/// Rejects absolute entries and `..` segments with `None` as well, so
/// a hostile archive cannot write outside the target.
fn strip_leading_component(path: &Path) -> Option<PathBuf> {
    let mut components = path.components();
    components.next()?;

    let rest = components.as_path();
    if rest.as_os_str().is_empty() {
        return None;
    }
    if rest
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return None;
    }
    Some(rest.to_path_buf())
}
