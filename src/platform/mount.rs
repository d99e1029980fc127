//! Mount flag translation and thin `mount(2)`/`umount2(2)` wrappers.
//!
//! `statvfs(3)` returns `ST_*` flags, but `mount(2)`'s `MS_REMOUNT` needs the
//! equivalent `MS_*` flags to preserve the existing mount options. The
//! kernel documents that the two are "kept in sync" but does not expose a
//! conversion function, so we do it by hand, same as the original.
use std::path::Path;

use anyhow::{Context, Result};
use rustix::fs::{Mode, StatVfsMountFlags, statvfs};
use rustix::mount::{MountFlags, mount, mount_remount, unmount, UnmountFlags};

/// Translate the `ST_*` flags statvfs(3) reports for `path` into their
/// `MS_*` equivalents, so a later `MS_REMOUNT|MS_BIND` preserves them.
pub fn path_mount_flags(path: &Path) -> Result<MountFlags> {
    let st = statvfs(path).with_context(|| format!("can't statvfs: {}", path.display()))?;
    let known = st.f_flag;

    let mut flags = MountFlags::empty();
    if known.contains(StatVfsMountFlags::MANDLOCK) {
        flags |= MountFlags::MANDLOCK;
    }
    if known.contains(StatVfsMountFlags::NOATIME) {
        flags |= MountFlags::NOATIME;
    }
    if known.contains(StatVfsMountFlags::NODEV) {
        flags |= MountFlags::NODEV;
    }
    if known.contains(StatVfsMountFlags::NODIRATIME) {
        flags |= MountFlags::NODIRATIME;
    }
    if known.contains(StatVfsMountFlags::NOEXEC) {
        flags |= MountFlags::NOEXEC;
    }
    if known.contains(StatVfsMountFlags::NOSUID) {
        flags |= MountFlags::NOSUID;
    }
    if known.contains(StatVfsMountFlags::RDONLY) {
        flags |= MountFlags::RDONLY;
    }
    if known.contains(StatVfsMountFlags::RELATIME) {
        flags |= MountFlags::RELATIME;
    }
    if known.contains(StatVfsMountFlags::SYNCHRONOUS) {
        flags |= MountFlags::SYNCHRONOUS;
    }
    Ok(flags)
}

/// Recursive bind mount, the workhorse behind every bind request in §4.2.
pub fn bind_mount(src: &Path, dst: &Path, extra: MountFlags) -> Result<()> {
    mount(
        src,
        dst,
        "",
        MountFlags::REC | MountFlags::BIND | extra,
        "",
    )
    .with_context(|| format!("can't bind {} to {}", src.display(), dst.display()))?;
    Ok(())
}

/// Remount an existing mount point read-only, preserving its other flags.
pub fn remount_readonly(path: &Path) -> Result<()> {
    let existing = path_mount_flags(path)?;
    mount_remount(path, existing | MountFlags::BIND | MountFlags::RDONLY, "")
        .with_context(|| format!("can't re-mount image read-only (is it on NFS?): {}", path.display()))?;
    Ok(())
}

pub fn tmpfs_mount(dst: &Path, data: Option<&str>) -> Result<()> {
    mount("", dst, "tmpfs", MountFlags::empty(), data.unwrap_or(""))
        .with_context(|| format!("can't mount tmpfs at {}", dst.display()))?;
    Ok(())
}

pub fn overlay_mount(dst: &Path, options: &str) -> Result<()> {
    mount("", dst, "overlay", MountFlags::empty(), options)
        .with_context(|| format!("can't overlay: {}, {}", dst.display(), options))?;
    Ok(())
}

pub fn move_mount_root(parent: &Path) -> Result<()> {
    mount(parent, "/", "", MountFlags::MOVE, "")
        .with_context(|| format!("can't move-mount {} over /", parent.display()))?;
    Ok(())
}

pub fn detach_unmount(path: &Path) -> Result<()> {
    unmount(path, UnmountFlags::DETACH)
        .with_context(|| format!("can't umount old root at {}", path.display()))?;
    Ok(())
}

pub fn mkdir(path: &Path, mode: u32) -> Result<()> {
    rustix::fs::mkdir(path, Mode::from_raw_mode(mode))
        .with_context(|| format!("can't mkdir: {}", path.display()))?;
    Ok(())
}
