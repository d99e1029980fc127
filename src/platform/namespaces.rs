//! User and mount namespace primitives.
//!
//! Charliecloud needs exactly one UID and one GID mapped, never a range, so
//! this deliberately does not offer the newuidmap/newgidmap multi-range path
//! flatpak-rs supports for its desktop sandbox use case.

use std::fs::OpenOptions;
use std::io::Write;

use anyhow::{Context, Result};
use rustix::thread::{UnshareFlags, unshare};

/// Unshare new user and mount namespaces. Must be called before any of the
/// id-map writes below; the kernel requires CLONE_NEWUSER to precede them.
pub fn unshare_user_and_mount() -> Result<()> {
    unshare(UnshareFlags::NEWUSER | UnshareFlags::NEWNS)
        .context("can't init user+mount namespaces")?;
    Ok(())
}

/// Write the 1:1 uid_map/gid_map pair for the current namespace, denying
/// setgroups first (required before a non-root process may write gid_map).
///
/// `inside` is the UID/GID the process will appear as within the new
/// namespace; `outside` is the current EUID/EGID in the parent namespace.
pub fn write_id_maps(uid_inside: u32, uid_outside: u32, gid_inside: u32, gid_outside: u32) -> Result<()> {
    write_proc_self("uid_map", &format!("{uid_inside} {uid_outside} 1\n"))
        .context("can't write uid_map")?;
    write_proc_self("setgroups", "deny\n").context("can't deny setgroups")?;
    write_proc_self("gid_map", &format!("{gid_inside} {gid_outside} 1\n"))
        .context("can't write gid_map")?;
    Ok(())
}

fn write_proc_self(file: &str, content: &str) -> Result<()> {
    let path = format!("/proc/self/{file}");
    let mut fd = OpenOptions::new()
        .write(true)
        .open(&path)
        .with_context(|| format!("can't open {path}"))?;
    fd.write_all(content.as_bytes())
        .with_context(|| format!("can't write {content:?} to {path}"))?;
    Ok(())
}
