//! Synthesis of `/etc/passwd` and `/etc/group` entries for the container
//! UID/GID, bound in over whatever the image ships.
//!
//! Ported from `core.c::passwd_setup`.

use std::ffi::CStr;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use rustix::mount::MountFlags;

use crate::bindmount::BindRegistry;
use crate::config::{BindDependency, BindRequest};
use crate::platform::mount as pmount;

/// Build the `/etc/passwd` lines for `uid`/`gid`: always a `root` entry
/// (unless `uid` is 0) and a `nobody` entry (unless `uid` is 65534), plus
/// one entry for `uid` itself, resolved via NSS when possible.
pub fn build_passwd_lines(uid: u32, gid: u32) -> Vec<String> {
    let mut lines = Vec::new();
    if uid != 0 {
        lines.push("root:x:0:0:root:/root:/bin/sh".to_string());
    }
    if uid != 65534 {
        lines.push("nobody:x:65534:65534:nobody:/:/bin/false".to_string());
    }

    match lookup_passwd(uid) {
        Some((name, gecos)) => lines.push(format!("{name}:x:{uid}:{gid}:{gecos}:/:/bin/sh")),
        None => {
            log::debug!("UID {uid} not found; using dummy info");
            lines.push(format!("charlie:x:{uid}:{gid}:Charlie:/:/bin/sh"));
        }
    }
    lines
}

/// Build the `/etc/group` lines for `gid`, analogous to
/// [`build_passwd_lines`].
pub fn build_group_lines(gid: u32) -> Vec<String> {
    let mut lines = Vec::new();
    if gid != 0 {
        lines.push("root:x:0:".to_string());
    }
    if gid != 65534 {
        lines.push("nogroup:x:65534:".to_string());
    }

    match lookup_group(gid) {
        Some(name) => lines.push(format!("{name}:x:{gid}:")),
        None => {
            log::debug!("GID {gid} not found; using dummy info");
            lines.push(format!("charliegroup:x:{gid}:"));
        }
    }
    lines
}

/// Write the synthesized `/etc/passwd` and `/etc/group` into temp files
/// under `host_tmp`, bind-mount each over the corresponding path in
/// `newroot`, then unlink the host-side temp file (the bind mount keeps
/// the content available; nothing on the host needs to see it after).
pub fn install(registry: &mut BindRegistry, newroot: &Path, host_tmp: &Path, uid: u32, gid: u32) -> Result<()> {
    install_one(registry, newroot, host_tmp, "ch-run_passwd", "/etc/passwd", &build_passwd_lines(uid, gid))?;
    install_one(registry, newroot, host_tmp, "ch-run_group", "/etc/group", &build_group_lines(gid))?;
    Ok(())
}

fn install_one(
    registry: &mut BindRegistry,
    newroot: &Path,
    host_tmp: &Path,
    prefix: &str,
    container_path: &str,
    lines: &[String],
) -> Result<()> {
    let mut file = tempfile::Builder::new()
        .prefix(prefix)
        .tempfile_in(host_tmp)
        .with_context(|| format!("can't create temp file under {}", host_tmp.display()))?;
    for line in lines {
        writeln!(file, "{line}")?;
    }
    file.flush()?;

    let path = file.path().to_path_buf();
    let req = BindRequest::new(path.clone(), container_path, BindDependency::Required);
    crate::bindmount::bind_mount(registry, &req, newroot, MountFlags::empty(), None)
        .with_context(|| format!("can't bind synthesized {container_path}"))?;

    // Drop the NamedTempFile's own cleanup by persisting then removing by
    // hand, matching mkstemp(3)+unlink(2): the file's content stays
    // reachable only through the bind mount from here on.
    let (_f, path) = file.keep().context("can't persist temp file before bind")?;
    std::fs::remove_file(&path).with_context(|| format!("can't unlink {}", path.display()))?;
    Ok(())
}

fn lookup_passwd(uid: u32) -> Option<(String, String)> {
    // SAFETY: getpwuid's static return buffer is not thread-safe across
    // other callers, but passwd_setup runs single-threaded during
    // container setup, consistent with how the original program also
    // calls it without locking.
    unsafe {
        *libc::__errno_location() = 0;
        let p = libc::getpwuid(uid);
        if p.is_null() {
            return None;
        }
        let name = CStr::from_ptr((*p).pw_name).to_string_lossy().into_owned();
        let gecos = CStr::from_ptr((*p).pw_gecos).to_string_lossy().into_owned();
        Some((name, gecos))
    }
}

fn lookup_group(gid: u32) -> Option<String> {
    // SAFETY: see lookup_passwd.
    unsafe {
        *libc::__errno_location() = 0;
        let g = libc::getgrgid(gid);
        if g.is_null() {
            return None;
        }
        Some(CStr::from_ptr((*g).gr_name).to_string_lossy().into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passwd_lines_include_root_and_nobody_for_nonzero_uid() {
        let lines = build_passwd_lines(1000, 1000);
        assert!(lines.iter().any(|l| l.starts_with("root:x:0:0:")));
        assert!(lines.iter().any(|l| l.starts_with("nobody:x:65534:")));
    }

    #[test]
    fn passwd_lines_omit_root_when_uid_is_zero() {
        let lines = build_passwd_lines(0, 0);
        assert!(!lines.iter().any(|l| l.starts_with("root:x:0:0:")));
    }

    #[test]
    fn group_lines_omit_nogroup_when_gid_is_65534() {
        let lines = build_group_lines(65534);
        assert!(!lines.iter().any(|l| l.starts_with("nogroup:")));
    }
}
