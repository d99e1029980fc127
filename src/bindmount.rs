//! Bind-mount policy: the default Cray HPC bind set, user-requested binds,
//! and the directory-creation machinery (`mkdirs`/`mkdir_overmount`) that
//! lets a bind destination be created even under a read-only parent.
//!
//! Grounded on `core.c::bind_mount`/`bind_mounts`/`BINDS_DEFAULT` and
//! `misc.c::mkdirs`/`mkdir_overmount`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail, ensure};
use rustix::mount::MountFlags;

use crate::config::{BindDependency, BindRequest};
use crate::platform::{mount as pmount, path as ppath};

/// Paths the launcher has already bound into the container, consulted by
/// `mkdirs` so it can refuse to create a directory nested inside an
/// existing bind mount (which would silently shadow the bind's contents).
#[derive(Default)]
pub struct BindRegistry {
    bound: Vec<PathBuf>,
}

impl BindRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&mut self, newroot: &Path, dst_full: &Path) {
        if newroot != Path::new("/") {
            self.bound.push(dst_full.to_path_buf());
        }
    }

    fn denies(&self, path: &Path) -> Option<&Path> {
        self.bound.iter().find(|b| ppath::is_subdir(b, path)).map(|p| p.as_path())
    }
}

/// Binds present on every Cray-class HPC host ch-run targets, mirroring
/// `core.c::BINDS_DEFAULT`. Optional entries are silently skipped if
/// absent on the host; required ones (`/dev`, `/proc`, `/sys`) are fatal
/// if missing.
pub fn defaults() -> Vec<BindRequest> {
    let required = ["/dev", "/proc", "/sys"];
    let optional = [
        "/etc/hosts",
        "/etc/machine-id",
        "/etc/resolv.conf",
        "/var/lib/hugetlbfs",
        "/etc/opt/cray/wlm_detect",
        "/opt/cray/wlm_detect",
        "/opt/cray/alps",
        "/opt/cray/udreg",
        "/opt/cray/ugni",
        "/opt/cray/xpmem",
        "/var/opt/cray/alps",
        "/var/spool/slurmd",
    ];
    required
        .iter()
        .map(|p| BindRequest::new(*p, *p, BindDependency::Required))
        .chain(optional.iter().map(|p| BindRequest::new(*p, *p, BindDependency::Optional)))
        .collect()
}

/// Bind-mount `src` onto `dst` (interpreted relative to `newroot`),
/// honoring `req.dependency`'s policy for a missing source or
/// destination. `scratch`, if given, is a disposable directory
/// `mkdir_overmount` may use to make a read-only destination writeable.
pub fn bind_mount(
    registry: &mut BindRegistry,
    req: &BindRequest,
    newroot: &Path,
    extra: MountFlags,
    scratch: Option<&Path>,
) -> Result<()> {
    ensure!(req.dst.is_absolute() && newroot.is_absolute(), "relative path in bind request");

    if !ppath::exists(&req.src) {
        match req.dependency {
            BindDependency::Optional => {
                log::debug!("bind: optional source missing, skipping: {}", req.src.display());
                return Ok(());
            }
            _ => bail!("can't bind: source not found: {}", req.src.display()),
        }
    }

    let dst_full = newroot.join(req.dst.strip_prefix("/").unwrap_or(&req.dst));
    if !ppath::exists(&dst_full) {
        match req.dependency {
            BindDependency::Required => bail!("can't bind: destination not found: {}", dst_full.display()),
            BindDependency::Optional => return Ok(()),
            BindDependency::MakeDst => mkdirs(registry, newroot, &req.dst, scratch)?,
        }
    }

    let newroot_c = ppath::canonicalize(newroot)?;
    let dst_full_c = ppath::canonicalize(&dst_full)?;
    ensure!(
        ppath::is_subdir(&newroot_c, &dst_full_c),
        "can't bind: {} not subdirectory of {}",
        dst_full_c.display(),
        newroot_c.display()
    );
    registry.record(newroot, &dst_full_c);

    pmount::bind_mount(&req.src, &dst_full, extra)
}

/// Bind-mount a whole list of requests, in order.
pub fn bind_mounts(
    registry: &mut BindRegistry,
    reqs: &[BindRequest],
    newroot: &Path,
    extra: MountFlags,
    scratch: Option<&Path>,
) -> Result<()> {
    for req in reqs {
        bind_mount(registry, req, newroot, extra, scratch)?;
    }
    Ok(())
}

/// Create every directory component of `path` under `base` that doesn't
/// already exist. `path` must stay under `base` after symlink resolution
/// (no climbing out with `..` or an absolute symlink). If a component
/// can't be created because its parent is read-only and `scratch` is
/// given, fall back to [`mkdir_overmount`].
pub fn mkdirs(registry: &BindRegistry, base: &Path, path: &Path, scratch: Option<&Path>) -> Result<()> {
    ensure!(base.is_absolute() && path.is_absolute(), "mkdirs: relative path");

    let base_c = ppath::canonicalize(base)?;
    let mut next_c = base_c.clone();

    for component in path.components().filter(|c| !matches!(c, std::path::Component::RootDir)) {
        let candidate = next_c.join(component);
        if ppath::exists(&candidate) {
            let meta = std::fs::symlink_metadata(&candidate)
                .with_context(|| format!("can't stat: {}", candidate.display()))?;
            if meta.file_type().is_symlink() {
                let target = std::fs::read_link(&candidate)
                    .with_context(|| format!("can't read symlink: {}", candidate.display()))?;
                ensure!(target.is_relative(), "can't mkdir: symlink not relative: {}", candidate.display());
            }
            let resolved = ppath::canonicalize(&candidate)?;
            ensure!(
                resolved.is_dir(),
                "can't mkdir: exists but not a directory: {}",
                candidate.display()
            );
            next_c = resolved;
        } else {
            ensure!(
                ppath::is_subdir(&base_c, &candidate),
                "can't mkdir: {} not subdirectory of {}",
                candidate.display(),
                base_c.display()
            );
            if let Some(denied_under) = registry.denies(&candidate) {
                bail!("can't mkdir: {} under existing bind-mount {}", candidate.display(), denied_under.display());
            }
            match pmount::mkdir(&candidate, 0o755) {
                Ok(()) => {}
                Err(e) => {
                    let eaccess = e
                        .downcast_ref::<rustix::io::Errno>()
                        .map(|errno| matches!(*errno, rustix::io::Errno::ACCESS | rustix::io::Errno::PERM))
                        .unwrap_or(false);
                    if eaccess && scratch.is_some() {
                        mkdir_overmount(&candidate, scratch.unwrap())?;
                    } else {
                        return Err(e).with_context(|| format!("can't mkdir: {}", candidate.display()));
                    }
                }
            }
            next_c = candidate;
        }
    }
    Ok(())
}

/// Make `path` creatable despite its parent being read-only, by
/// bind-mounting a fresh writeable directory from `scratch` over the
/// parent and symlinking the parent's original entries back in (the
/// "symlink ranch"). The original parent contents remain reachable under
/// `.orig` inside the new writeable directory.
fn mkdir_overmount(path: &Path, scratch: &Path) -> Result<()> {
    log::debug!("making writeable via symlink ranch: {}", path.display());
    let parent = path.parent().context("mkdir_overmount: path has no parent")?;

    let generation = std::fs::read_dir(scratch).map(|it| it.count()).unwrap_or(0) + 1;
    let over = scratch.join(generation.to_string());
    let orig_dir_name = ".orig";
    let path_dst = over.join(orig_dir_name);

    pmount::mkdir(&over, 0o755)?;
    pmount::mkdir(&path_dst, 0o755)?;
    pmount::bind_mount(parent, &path_dst, MountFlags::empty())?;
    pmount::bind_mount(&over, parent, MountFlags::empty())?;

    let entries = std::fs::read_dir(&path_dst)
        .with_context(|| format!("can't list: {}", path_dst.display()))?;
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let src = parent.join(&name);
        let dst = PathBuf::from(orig_dir_name).join(&name);
        std::os::unix::fs::symlink(&dst, &src)
            .with_context(|| format!("can't symlink: {} -> {}", src.display(), dst.display()))?;
    }

    pmount::mkdir(path, 0o755).with_context(|| format!("can't mkdir even after overmount: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_include_required_and_optional() {
        let binds = defaults();
        assert!(binds.iter().any(|b| b.dst == Path::new("/dev") && b.dependency == BindDependency::Required));
        assert!(binds.iter().any(|b| b.dst == Path::new("/etc/hosts") && b.dependency == BindDependency::Optional));
    }

    #[test]
    fn registry_denies_nested_bind_destination() {
        let mut reg = BindRegistry::new();
        reg.record(Path::new("/newroot"), Path::new("/newroot/mnt/data"));
        assert!(reg.denies(Path::new("/newroot/mnt/data/more")).is_some());
        assert!(reg.denies(Path::new("/newroot/other")).is_none());
    }

    #[test]
    fn mkdirs_idempotent_on_existing_tree() {
        let base = tempfile::tempdir().unwrap();
        let registry = BindRegistry::new();
        let target = base.path().join("a/b/c");

        mkdirs(&registry, base.path(), &target, None).unwrap();
        assert!(target.is_dir());

        // Every component already exists now; a second pass must be a no-op,
        // not an EEXIST error.
        mkdirs(&registry, base.path(), &target, None).unwrap();
        assert!(target.is_dir());
    }
}
