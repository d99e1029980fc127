//! Named-image storage: resolving an image name to its on-disk path under
//! the storage directory, and classifying an arbitrary reference as a
//! directory, a squashfs file, or a name to resolve.
//!
//! Ground: `core.c::img_name2path`/`image_type`.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use crate::config::ImageType;

/// Transform an image name into its path under `storage_dir/img`, the way
/// Charliecloud's storage directory lays out pulled images: `/` becomes
/// `%` and `:` becomes `+`, since image names may contain registry paths
/// and tags that aren't valid path components as-is.
pub fn img_name2path(name: &str, storage_dir: &Path) -> PathBuf {
    let name_fs: String = name.chars().map(|c| match c {
        '/' => '%',
        ':' => '+',
        other => other,
    }).collect();
    storage_dir.join("img").join(name_fs)
}

/// Classify `ref_` as a directory, a squashfs image file, or a name to
/// resolve under `storage_dir`. Fatal if none of these apply.
pub fn image_type(ref_: &str, storage_dir: &Path) -> Result<ImageType> {
    let path = Path::new(ref_);

    // If storage already has a directory where ref_ would land as a name,
    // assume it really is a name rather than a literal path.
    if img_name2path(ref_, storage_dir).exists() {
        return Ok(ImageType::Name);
    }

    let meta = std::fs::metadata(path).with_context(|| format!("can't stat: {ref_}"))?;
    if meta.is_dir() {
        return Ok(ImageType::Directory);
    }

    let mut magic = [0u8; 4];
    let mut file = File::open(path).with_context(|| format!("can't open: {ref_}"))?;
    file.read_exact(&mut magic).with_context(|| format!("can't read magic bytes: {ref_}"))?;

    // SquashFS superblock magic is "hsqs" (little-endian 0x73717368); the
    // format's designers apparently meant "sqsh" but got the endianness
    // backwards.
    if &magic == b"hsqs" {
        return Ok(ImageType::Squash);
    }

    bail!("unknown image type: {ref_}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name2path_escapes_slash_and_colon() {
        let path = img_name2path("example.com/library:latest", Path::new("/home/u/.ch"));
        assert_eq!(path, PathBuf::from("/home/u/.ch/img/example.com%library+latest"));
    }

    #[test]
    fn name2path_leaves_plain_names_alone() {
        let path = img_name2path("alpine", Path::new("/store"));
        assert_eq!(path, PathBuf::from("/store/img/alpine"));
    }
}
