//! Container configuration: the single mutable record carried through
//! namespace setup, filesystem assembly, and exec.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};

use crate::hooks::Hook;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindDependency {
    Required,
    Optional,
    MakeDst,
}

#[derive(Debug, Clone)]
pub struct BindRequest {
    pub src: PathBuf,
    pub dst: PathBuf,
    pub dependency: BindDependency,
}

impl BindRequest {
    pub fn new(src: impl Into<PathBuf>, dst: impl Into<PathBuf>, dependency: BindDependency) -> Self {
        Self { src: src.into(), dst: dst.into(), dependency }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageType {
    Directory,
    Squash,
    Name,
    None,
}

#[derive(Debug, Clone, Default)]
pub struct JoinConfig {
    pub join: bool,
    pub join_ct: u32,
    pub join_pid: Option<u32>,
    pub join_tag: String,
}

/// The container configuration record. Constructed by the launcher driver,
/// mutated by the container constructor and hooks, consumed by exec.
pub struct ContainerConfig {
    pub binds: Vec<BindRequest>,
    pub container_uid: u32,
    pub container_gid: u32,
    pub env_expand: bool,
    pub hooks_prestart: Vec<Hook>,
    pub host_home: Option<PathBuf>,
    pub img_ref: String,
    pub newroot: PathBuf,
    pub image_type: ImageType,
    pub join: JoinConfig,
    pub overlay_size: Option<String>,
    pub private_passwd: bool,
    pub private_tmp: bool,
    pub writable: bool,
    pub ldconfigs: Vec<PathBuf>,
    pub initial_dir: Option<PathBuf>,
    pub seccomp: bool,
    pub username: String,
}

impl ContainerConfig {
    /// Validate the invariants from the data model before any namespace or
    /// mount syscall runs, per the usage-error error class in §7.
    pub fn validate(&self) -> Result<()> {
        if self.host_home.is_some() && self.overlay_size.is_none() {
            bail!("--home requires --write-fake (home injection needs the writable overlay)");
        }
        for bind in &self.binds {
            if !bind.dst.is_absolute() {
                bail!("bind destination must be absolute: {}", bind.dst.display());
            }
            if bind.dst == PathBuf::from("/") {
                bail!("bind destination must not be the container root");
            }
        }
        if !self.newroot.is_absolute() {
            bail!("new root must be an absolute path: {}", self.newroot.display());
        }
        Ok(())
    }

    /// Canonicalize `newroot` in place. Called at every observable point per
    /// the invariant that newroot is absolute and canonical.
    pub fn canonicalize_newroot(&mut self) -> Result<()> {
        self.newroot = self
            .newroot
            .canonicalize()
            .with_context(|| format!("can't canonicalize new root: {}", self.newroot.display()))?;
        Ok(())
    }
}
