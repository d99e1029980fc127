//! Container constructor: namespace setup, filesystem tree assembly, and
//! the `pivot_root` dance, tying together every other module into the
//! algorithm `main.rs` calls once per invocation.
//!
//! Grounded on `core.c::containerize`/`mounts_setup`/`pivot`, generalized
//! from flatpak-rs's `Sandbox::run`/`unshare`/`create_rootfs` sequence.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, ensure};
use rustix::mount::MountFlags;

use crate::bindmount::{self, BindRegistry};
use crate::config::{ContainerConfig, ImageType};
use crate::{fuse, hooks, join, passwd, platform};

const WF_MNT: &str = "/srv";

/// Set up new namespaces (or join existing ones) and assemble the
/// container filesystem tree, running pre-start hooks and pivoting into
/// it. On return, the caller is inside the container and may `execvp`
/// the requested command.
pub fn containerize(cfg: &mut ContainerConfig) -> Result<()> {
    if let Some(pid) = cfg.join.join_pid {
        join::namespaces_join(pid as i32)?;
        return Ok(());
    }

    let resolved_join = join::resolve(&cfg.join)?;
    let coord = match &resolved_join {
        Some((tag, _)) => Some(join::begin(tag)?),
        None => None,
    };
    let is_winner = coord.as_ref().map(|c| c.is_winner()).unwrap_or(true);

    if is_winner {
        let euid = rustix::process::geteuid().as_raw();
        let egid = rustix::process::getegid().as_raw();
        platform::namespaces::unshare_user_and_mount().context("outer namespace setup failed")?;
        platform::namespaces::write_id_maps(0, euid, 0, egid)?;

        let fuse_mount = if cfg.image_type == ImageType::Squash {
            let mountdir = PathBuf::from("/var/tmp").join(format!("ch-run_sqfs.{}", std::process::id()));
            Some(fuse::spawn(&cfg.img_ref_path(), &mountdir)?)
        } else {
            None
        };

        platform::namespaces::unshare_user_and_mount().context("inner namespace setup failed")?;
        platform::namespaces::write_id_maps(cfg.container_uid, 0, cfg.container_gid, 0)?;

        if let Some(mount) = &fuse_mount {
            cfg.newroot = mount.mountpoint.clone();
        }

        mounts_setup(cfg)?;
        hooks::run(cfg)?;
        pivot(cfg)?;

        // `fuse_mount`, if any, is intentionally leaked here: the squashfs
        // tree is now part of the pivoted root, and the FUSE server only
        // needs to outlive the container process, which `main.rs` is
        // about to replace via `execvp` (see platform/warnings.rs's note
        // on why teardown isn't a `Drop` impl — there would be nothing
        // left to run it).
        let _ = fuse_mount;
    } else {
        let winner_pid = coord.as_ref().expect("loser implies a coordinator exists").winner_pid();
        join::namespaces_join(winner_pid)?;
    }

    if let (Some(coord), Some((_, ct))) = (coord, &resolved_join) {
        join::end(coord, *ct as i32)?;
    }
    Ok(())
}

/// Build the container filesystem tree. Namespaces must already be set up.
fn mounts_setup(cfg: &mut ContainerConfig) -> Result<()> {
    log::debug!("creating container filesystem tree");
    let mut registry = BindRegistry::new();
    let mut scratch: Option<PathBuf> = None;

    let (nr_parent, _) = platform::path::split(&cfg.newroot);

    // Claim new root for this namespace. Needed even with MS_REC in
    // bind_mount() to avoid pivot_root(2) failing with EBUSY later.
    log::debug!("claiming new root for this namespace");
    platform::mount::bind_mount(&cfg.newroot, &cfg.newroot, MountFlags::PRIVATE)?;
    platform::mount::bind_mount(&nr_parent, &nr_parent, MountFlags::PRIVATE)?;

    if !cfg.writable && !is_already_readonly(&cfg.newroot) {
        platform::mount::remount_readonly(&cfg.newroot)?;
    }

    if let Some(size) = &cfg.overlay_size {
        log::debug!("overlaying tmpfs for --write-fake ({size})");
        let wf_mnt = Path::new(WF_MNT);
        platform::mount::tmpfs_mount(wf_mnt, Some(&format!("size={size}")))?;
        platform::mount::mkdir(&wf_mnt.join("upper"), 0o700)?;
        platform::mount::mkdir(&wf_mnt.join("work"), 0o700)?;
        platform::mount::mkdir(&wf_mnt.join("merged"), 0o700)?;
        let scratch_dir = wf_mnt.join("mkdir_overmount");
        platform::mount::mkdir(&scratch_dir, 0o700)?;
        scratch = Some(scratch_dir);

        ensure!(
            cfg.newroot.exists(),
            "can't stat new root; overmounted by tmpfs for -W?: {}",
            cfg.newroot.display()
        );
        let options = format!(
            "lowerdir={},upperdir={},workdir={},index=on,userxattr,volatile",
            cfg.newroot.display(),
            wf_mnt.join("upper").display(),
            wf_mnt.join("work").display(),
        );
        cfg.newroot = wf_mnt.join("merged");
        platform::mount::overlay_mount(&cfg.newroot, &options)?;
        log::debug!("newroot updated: {}", cfg.newroot.display());
    }

    log::debug!("starting bind-mounts");
    bindmount::bind_mounts(&mut registry, &bindmount::defaults(), &cfg.newroot, MountFlags::RDONLY, None)?;

    if !cfg.private_passwd {
        let host_tmp = std::env::var("TMPDIR").unwrap_or_else(|_| "/tmp".to_string());
        passwd::install(&mut registry, &cfg.newroot, Path::new(&host_tmp), cfg.container_uid, cfg.container_gid)?;
    }

    if cfg.private_tmp {
        let tmp_in_container = cfg.newroot.join("tmp");
        platform::mount::mkdir(&tmp_in_container, 0o1777).or_else(|e| {
            if tmp_in_container.exists() { Ok(()) } else { Err(e) }
        })?;
        platform::mount::tmpfs_mount(&tmp_in_container, None)?;
    } else {
        let host_tmp = std::env::var("TMPDIR").unwrap_or_else(|_| "/tmp".to_string());
        let req = crate::config::BindRequest::new(host_tmp, "/tmp", crate::config::BindDependency::Required);
        bindmount::bind_mount(&mut registry, &req, &cfg.newroot, MountFlags::empty(), None)?;
    }

    if let Some(home) = &cfg.host_home {
        ensure!(cfg.overlay_size.is_some(), "--home requires --write-fake");
        let req = crate::config::BindRequest::new(
            home.clone(),
            format!("/home/{}", cfg.username),
            crate::config::BindDependency::MakeDst,
        );
        bindmount::bind_mount(&mut registry, &req, &cfg.newroot, MountFlags::empty(), scratch.as_deref())?;
    }

    bindmount::bind_mounts(&mut registry, &cfg.binds, &cfg.newroot, MountFlags::empty(), scratch.as_deref())?;

    Ok(())
}

fn is_already_readonly(path: &Path) -> bool {
    matches!(rustix::fs::access(path, rustix::fs::Access::WRITE_OK), Err(rustix::io::Errno::ROFS))
}

/// Pivot into the container. `pivot_root(2)` requires the dance below to
/// avoid several undocumented error conditions; see `core.c::pivot`.
fn pivot(cfg: &mut ContainerConfig) -> Result<()> {
    log::debug!("pivoting into container");
    let (nr_parent, nr_base) = platform::path::split(&cfg.newroot);

    // Overmount / to avoid EINVAL if it's a rootfs.
    rustix::process::chdir(&nr_parent).context("can't chdir into new root's parent")?;
    platform::mount::move_mount_root(&nr_parent)?;
    rustix::process::chroot(".").context("can't chroot(2)")?;

    cfg.newroot = Path::new("/").join(&nr_base);
    rustix::process::chdir(&cfg.newroot).with_context(|| format!("can't chdir into new root: {}", cfg.newroot.display()))?;

    let put_old = cfg.newroot.join("dev");
    pivot_root(&cfg.newroot, &put_old).context("can't pivot_root(2)")?;
    rustix::process::chroot(".").context("can't chroot(2) into new root")?;
    platform::mount::detach_unmount(Path::new("/dev"))?;

    Ok(())
}

/// `pivot_root(2)` has no rustix wrapper; invoke the raw syscall.
fn pivot_root(new_root: &Path, put_old: &Path) -> Result<()> {
    use std::ffi::CString;
    let new_root = CString::new(new_root.as_os_str().as_encoded_bytes()).context("new_root contains NUL")?;
    let put_old = CString::new(put_old.as_os_str().as_encoded_bytes()).context("put_old contains NUL")?;
    // SAFETY: both paths are valid NUL-terminated C strings for the
    // duration of the call; pivot_root(2) has no other preconditions
    // beyond the ones the dance above already satisfies.
    let rc = unsafe { libc::syscall(libc::SYS_pivot_root, new_root.as_ptr(), put_old.as_ptr()) };
    platform::assert::zero_or_errno(rc as i32, "pivot_root(2) failed")
}

impl ContainerConfig {
    /// Resolve `img_ref` to a filesystem path, accounting for named-image
    /// storage (see [`crate::store`]).
    pub fn img_ref_path(&self) -> PathBuf {
        PathBuf::from(&self.img_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_already_readonly_on_proc_is_false_or_true_but_does_not_panic() {
        let _ = is_already_readonly(Path::new("/"));
    }
}
