//! Path canonicalization and containment helpers.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Canonicalize `path`, resolving symlinks and `..` components.
pub fn canonicalize(path: &Path) -> Result<PathBuf> {
    path.canonicalize()
        .with_context(|| format!("can't canonicalize: {}", path.display()))
}

/// True if `path` (assumed canonical) is `base` or a descendant of it
/// (assumed canonical). Used to enforce that every bind destination and
/// every directory `mkdirs` creates stays under the intended root.
pub fn is_subdir(base: &Path, path: &Path) -> bool {
    path == base || path.starts_with(base)
}

/// Split `path` into `(parent, basename)`, the way `dirname(3)`/`basename(3)`
/// do, used by the pivot dance to find the new root's parent directory.
pub fn split(path: &Path) -> (PathBuf, PathBuf) {
    let parent = path.parent().unwrap_or_else(|| Path::new("/")).to_path_buf();
    let base = path
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/"));
    (parent, base)
}

/// True if `path` exists (following symlinks), without erroring on ENOENT.
pub fn exists(path: &Path) -> bool {
    path.exists()
}
