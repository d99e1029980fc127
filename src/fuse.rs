//! Read-only FUSE filesystem serving a SquashFS image.
//!
//! Ground: `ch_fuse.c`'s `sq_mount`/`sq_clean`/`sq_end` session lifecycle.
//! The outer user+mount namespace (see [`crate::container`]) has an
//! effective root inside itself, which is enough to drive a non-setuid
//! FUSE mount; the fork happens before the *inner* namespace (the one
//! matching the requested container UID/GID) is created, exactly as the
//! original forks before narrowing privilege further. Image contents are
//! read through `backhand`, a pure-Rust SquashFS reader; the FUSE ops
//! table itself is `fuse-backend-rs`'s low-level session/server, since
//! `backhand` only parses the image and provides no FUSE plumbing of its
//! own.

use std::collections::HashMap;
use std::ffi::CStr;
use std::fs::File;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use backhand::{FilesystemReader, InnerNode};
use fuse_backend_rs::abi::fuse_abi::stat64;
use fuse_backend_rs::api::filesystem::{Context, DirEntry, Entry, FileSystem, FsOptions, ZeroCopyWriter};
use fuse_backend_rs::api::server::Server;
use fuse_backend_rs::transport::{FuseChannel, FuseSession};

const ROOT_INO: u64 = 1;
const ATTR_TTL: Duration = Duration::from_secs(1);

enum Kind {
    File { data: Vec<u8> },
    Dir { children: Vec<(String, u64)> },
    Symlink { target: Vec<u8> },
}

struct InodeEntry {
    kind: Kind,
    mode: u32,
    uid: u32,
    gid: u32,
    mtime: u32,
}

/// A fully materialized, read-only view of a squashfs image, indexed by
/// inode number for `fuse-backend-rs`'s ops table. Contents are loaded
/// eagerly at mount time: squashfs images in this context are container
/// base layers, not arbitrarily large live filesystems, so holding them
/// in memory trades a larger resident set for a much simpler (and
/// entirely safe) implementation than streaming block-by-block from the
/// compressed image on every read.
pub struct SquashfsFs {
    inodes: Mutex<Vec<InodeEntry>>, // index 0 unused; ROOT_INO == 1
}

impl SquashfsFs {
    pub fn load(image_path: &Path) -> Result<Self> {
        let file = File::open(image_path)
            .with_context(|| format!("can't open squashfs image: {}", image_path.display()))?;
        let reader = FilesystemReader::from_reader(file)
            .with_context(|| format!("can't read squashfs superblock: {}", image_path.display()))?;

        let mut inodes = vec![InodeEntry {
            kind: Kind::Dir { children: vec![] },
            mode: 0o755,
            uid: 0,
            gid: 0,
            mtime: 0,
        }];
        let mut path_to_ino: HashMap<PathBuf, u64> = HashMap::new();
        path_to_ino.insert(PathBuf::from("/"), ROOT_INO);

        for node in reader.files() {
            let path = PathBuf::from("/").join(&node.fullpath);
            let header = node.header;
            let kind = match &node.inner {
                InnerNode::File(f) => {
                    let mut data = Vec::new();
                    let mut file_reader = reader
                        .file(f)
                        .reader();
                    std::io::copy(&mut file_reader, &mut data)
                        .with_context(|| format!("can't read file from image: {}", path.display()))?;
                    Kind::File { data }
                }
                InnerNode::Symlink(s) => Kind::Symlink { target: s.link.as_os_str().as_encoded_bytes().to_vec() },
                InnerNode::Dir(_) => Kind::Dir { children: vec![] },
                InnerNode::CharacterDevice(_) | InnerNode::BlockDevice(_) => continue,
            };
            let ino = inodes.len() as u64;
            inodes.push(InodeEntry {
                kind,
                mode: header.permissions as u32,
                uid: header.uid,
                gid: header.gid,
                mtime: header.mtime,
            });
            path_to_ino.insert(path.clone(), ino);

            if let (Some(parent_path), Some(name)) = (path.parent(), path.file_name()) {
                if let Some(&parent_ino) = path_to_ino.get(parent_path) {
                    if let Kind::Dir { children } = &mut inodes[parent_ino as usize].kind {
                        children.push((name.to_string_lossy().into_owned(), ino));
                    }
                }
            }
        }

        Ok(Self { inodes: Mutex::new(inodes) })
    }

    fn attr_of(&self, ino: u64) -> Option<stat64> {
        let inodes = self.inodes.lock().unwrap();
        let entry = inodes.get(ino as usize)?;
        let mut st: stat64 = unsafe { std::mem::zeroed() };
        st.st_ino = ino;
        st.st_uid = entry.uid;
        st.st_gid = entry.gid;
        st.st_mtime = entry.mtime as i64;
        match &entry.kind {
            Kind::File { data } => {
                st.st_mode = libc::S_IFREG | (entry.mode & 0o7777);
                st.st_size = data.len() as i64;
                st.st_nlink = 1;
            }
            Kind::Dir { children } => {
                st.st_mode = libc::S_IFDIR | (entry.mode & 0o7777);
                st.st_nlink = 2 + children.len() as u64;
            }
            Kind::Symlink { target } => {
                st.st_mode = libc::S_IFLNK | 0o777;
                st.st_size = target.len() as i64;
                st.st_nlink = 1;
            }
        }
        Some(st)
    }
}

impl FileSystem for SquashfsFs {
    type Inode = u64;
    type Handle = u64;

    fn init(&self, _capable: FsOptions) -> std::io::Result<FsOptions> {
        Ok(FsOptions::empty())
    }

    fn lookup(&self, _ctx: &Context, parent: Self::Inode, name: &CStr) -> std::io::Result<Entry> {
        let want = name.to_string_lossy();
        let ino = {
            let inodes = self.inodes.lock().unwrap();
            let Some(entry) = inodes.get(parent as usize) else {
                return Err(std::io::Error::from_raw_os_error(libc::ENOENT));
            };
            let Kind::Dir { children } = &entry.kind else {
                return Err(std::io::Error::from_raw_os_error(libc::ENOTDIR));
            };
            children
                .iter()
                .find(|(n, _)| n == want.as_ref())
                .map(|(_, i)| *i)
                .ok_or_else(|| std::io::Error::from_raw_os_error(libc::ENOENT))?
        };
        let attr = self.attr_of(ino).ok_or_else(|| std::io::Error::from_raw_os_error(libc::ENOENT))?;
        Ok(Entry {
            inode: ino,
            generation: 0,
            attr,
            attr_flags: 0,
            attr_timeout: ATTR_TTL,
            entry_timeout: ATTR_TTL,
        })
    }

    fn getattr(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        _handle: Option<Self::Handle>,
    ) -> std::io::Result<(stat64, Duration)> {
        let attr = self.attr_of(inode).ok_or_else(|| std::io::Error::from_raw_os_error(libc::ENOENT))?;
        Ok((attr, ATTR_TTL))
    }

    fn readlink(&self, _ctx: &Context, inode: Self::Inode) -> std::io::Result<Vec<u8>> {
        let inodes = self.inodes.lock().unwrap();
        match &inodes.get(inode as usize).map(|e| &e.kind) {
            Some(Kind::Symlink { target }) => Ok(target.clone()),
            Some(_) => Err(std::io::Error::from_raw_os_error(libc::EINVAL)),
            None => Err(std::io::Error::from_raw_os_error(libc::ENOENT)),
        }
    }

    fn open(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        _flags: u32,
        _fuse_flags: u32,
    ) -> std::io::Result<(Option<Self::Handle>, fuse_backend_rs::api::filesystem::OpenOptions)> {
        let inodes = self.inodes.lock().unwrap();
        match inodes.get(inode as usize).map(|e| &e.kind) {
            Some(Kind::File { .. }) => {
                Ok((Some(inode), fuse_backend_rs::api::filesystem::OpenOptions::empty()))
            }
            Some(_) => Err(std::io::Error::from_raw_os_error(libc::EISDIR)),
            None => Err(std::io::Error::from_raw_os_error(libc::ENOENT)),
        }
    }

    fn release(
        &self,
        _ctx: &Context,
        _inode: Self::Inode,
        _flags: u32,
        _handle: Self::Handle,
        _flush: bool,
        _flock_release: bool,
        _lock_owner: Option<u64>,
    ) -> std::io::Result<()> {
        Ok(())
    }

    fn read(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        _handle: Self::Handle,
        w: &mut dyn ZeroCopyWriter,
        size: u32,
        offset: u64,
        _lock_owner: Option<u64>,
        _flags: u32,
    ) -> std::io::Result<usize> {
        let inodes = self.inodes.lock().unwrap();
        let Some(Kind::File { data }) = inodes.get(inode as usize).map(|e| &e.kind) else {
            return Err(std::io::Error::from_raw_os_error(libc::EISDIR));
        };
        let start = (offset as usize).min(data.len());
        let end = start.saturating_add(size as usize).min(data.len());
        w.write_all(&data[start..end])?;
        Ok(end - start)
    }

    fn readdir(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        _handle: Self::Handle,
        _size: u32,
        offset: u64,
        add_entry: &mut dyn FnMut(DirEntry) -> std::io::Result<usize>,
    ) -> std::io::Result<()> {
        let inodes = self.inodes.lock().unwrap();
        let Some(Kind::Dir { children }) = inodes.get(inode as usize).map(|e| &e.kind) else {
            return Err(std::io::Error::from_raw_os_error(libc::ENOTDIR));
        };
        for (i, (name, ino)) in children.iter().enumerate().skip(offset as usize) {
            let used = add_entry(DirEntry {
                ino: *ino,
                offset: (i + 1) as u64,
                type_: libc::DT_UNKNOWN as u32,
                name: name.as_bytes(),
            })?;
            if used == 0 {
                break;
            }
        }
        Ok(())
    }

    fn getxattr(
        &self,
        _ctx: &Context,
        _inode: Self::Inode,
        _name: &CStr,
        _size: u32,
    ) -> std::io::Result<fuse_backend_rs::api::filesystem::GetxattrReply> {
        Err(std::io::Error::from_raw_os_error(libc::ENODATA))
    }
}

/// A running FUSE session and the forked child serving it. Dropped
/// explicitly by the launcher (see §4.9's note on why teardown isn't left
/// to `Drop`): the process is about to `execvp` into the user's command,
/// which would otherwise leak the session without ever running a
/// destructor.
pub struct Mount {
    pub mountpoint: PathBuf,
    child_pid: libc::pid_t,
}

/// Fork and mount `image_path`'s squashfs contents at `mountpoint`. Must
/// run before the inner user+mount namespace is created: the outer
/// namespace's effective root is what lets `fuse-backend-rs` mount
/// without a setuid helper.
pub fn spawn(image_path: &Path, mountpoint: &Path) -> Result<Mount> {
    std::fs::create_dir_all(mountpoint)
        .with_context(|| format!("can't create mount point: {}", mountpoint.display()))?;

    let fs = SquashfsFs::load(image_path)?;

    let mut session = FuseSession::new(mountpoint, "ch-run", "", true)
        .with_context(|| format!("can't create FUSE session for: {}", mountpoint.display()))?;
    session.mount().context("can't mount squashfs FUSE filesystem")?;

    // SAFETY: fork(2) with no shared mutable state between parent and
    // child beyond the already-initialized FUSE session and warnings
    // buffer, both designed to be shared across fork.
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        bail!("can't fork squashfs FUSE server: {}", std::io::Error::last_os_error());
    }
    if pid == 0 {
        serve(fs, session);
        std::process::exit(0);
    }

    Ok(Mount { mountpoint: mountpoint.to_path_buf(), child_pid: pid })
}

fn serve(fs: SquashfsFs, session: FuseSession) {
    let channel = match session.new_channel() {
        Ok(c) => c,
        Err(e) => {
            log::error!("squashfs FUSE: can't create channel: {e}");
            return;
        }
    };
    serve_requests(fs, channel);
}

fn serve_requests(fs: SquashfsFs, mut channel: FuseChannel) {
    let server = Server::new(std::sync::Arc::new(fs));
    loop {
        match channel.get_request() {
            Ok(Some((reader, writer))) => {
                if let Err(e) = server.handle_message(reader, writer.into(), None, None) {
                    log::warn!("squashfs FUSE: request handling error: {e}");
                }
            }
            Ok(None) => break,
            Err(e) => {
                log::debug!("squashfs FUSE: channel closed: {e}");
                break;
            }
        }
    }
}

impl Mount {
    /// Tear down the FUSE server: signal the child (it exits immediately
    /// on SIGTERM, the Rust analogue of `ch_fuse.c`'s SIGCHLD-driven
    /// `sq_end`/`sq_clean`) and wait for it, then unmount.
    pub fn teardown(self) -> Result<()> {
        // SAFETY: child_pid was returned by our own fork() and has not
        // been waited on yet.
        unsafe {
            libc::kill(self.child_pid, libc::SIGTERM);
            let mut status = 0;
            libc::waitpid(self.child_pid, &mut status, 0);
        }
        // Best-effort: the child's own exit already drops its FUSE
        // session and triggers the kernel-side unmount; an explicit
        // umount2 here just catches the case where it didn't.
        let _ = rustix::mount::unmount(&self.mountpoint, rustix::mount::UnmountFlags::DETACH);
        Ok(())
    }
}
