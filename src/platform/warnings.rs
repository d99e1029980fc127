//! Fork-surviving warnings buffer.
//!
//! A fixed-size anonymous shared mapping holding a sequence of
//! null-terminated strings, appended to by whichever process (the launcher
//! or its forked FUSE child) notices a non-fatal anomaly, and drained once
//! by the launcher immediately before it hands off to the user command.
//!
//! This is *not* about surviving `execvp`: `exec()` unmaps the calling
//! process's entire address space, so nothing backed by `mmap` follows a
//! process across exec. What this buffer actually needs to survive is
//! `fork()` (MAP_SHARED mappings stay shared across a fork), so that the
//! squashfuse child and the container-setup parent can both append to the
//! same buffer and have the parent print all of it exactly once before it
//! execs into the user's command.

use std::ffi::c_void;
use std::ptr;
use std::sync::OnceLock;

use anyhow::{Result, bail};

const WARNINGS_SIZE: usize = 4 * 1024;

struct Buffer {
    base: *mut u8,
}

// SAFETY: the mapping is shared and every access is append-only and bounds
// checked; concurrent writers race only over who gets which offset, and a
// lost race just means a warning may be dropped, never a memory fault.
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

static BUFFER: OnceLock<Buffer> = OnceLock::new();

/// Initialize the shared mapping. Must be called once, before any `fork()`
/// that needs to share it (i.e. before the FUSE driver forks).
pub fn init() -> Result<()> {
    if BUFFER.get().is_some() {
        return Ok(());
    }
    // SAFETY: MAP_ANONYMOUS|MAP_SHARED with no fd is the standard idiom for
    // a zero-initialized region shared across fork.
    let addr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            WARNINGS_SIZE,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        bail!("can't mmap warnings buffer: {}", std::io::Error::last_os_error());
    }
    let _ = BUFFER.set(Buffer { base: addr as *mut u8 });
    Ok(())
}

fn buffer() -> Option<&'static Buffer> {
    BUFFER.get()
}

/// Append `text` to the warnings buffer. Silently drops the message if the
/// buffer is full or was never initialized (this is a best-effort diagnostic
/// channel, not a correctness-critical one).
pub fn push(text: &str) {
    let Some(buf) = buffer() else { return };
    let bytes = text.as_bytes();

    // SAFETY: base points to a WARNINGS_SIZE region we own exclusively for
    // writes at computed offsets; offset_for_write scans for two consecutive
    // NULs, the documented end-of-buffer marker.
    unsafe {
        let slice = std::slice::from_raw_parts(buf.base as *const u8, WARNINGS_SIZE);
        let mut offset = 0usize;
        while offset < WARNINGS_SIZE {
            if slice[offset] == 0 {
                break;
            }
            offset += strlen(slice, offset) + 1;
        }
        let remaining = WARNINGS_SIZE.saturating_sub(offset + 1);
        if remaining < bytes.len() {
            return; // buffer full; drop the warning rather than corrupt it
        }
        let dst = std::slice::from_raw_parts_mut(buf.base.add(offset), bytes.len() + 1);
        dst[..bytes.len()].copy_from_slice(bytes);
        dst[bytes.len()] = 0;
    }
}

fn strlen(buf: &[u8], start: usize) -> usize {
    let mut len = 0;
    while start + len < buf.len() && buf[start + len] != 0 {
        len += 1;
    }
    len
}

/// Re-emit every buffered warning to stderr, in the order they were
/// appended. Called once by the launcher right before it hands off to the
/// user command, or on any fatal-error exit path.
pub fn reprint() {
    let Some(buf) = buffer() else { return };

    // SAFETY: read-only scan over the region we mapped in `init`.
    unsafe {
        let slice = std::slice::from_raw_parts(buf.base as *const u8, WARNINGS_SIZE);
        let mut offset = 0usize;
        while offset < WARNINGS_SIZE && slice[offset] != 0 {
            let len = strlen(slice, offset);
            if let Ok(msg) = std::str::from_utf8(&slice[offset..offset + len]) {
                eprintln!("ch-run: warning: {msg}");
            }
            offset += len + 1;
        }
    }
}

#[allow(dead_code)]
fn munmap_on_drop(addr: *mut c_void) {
    // SAFETY: only ever called with the address returned by our own mmap.
    unsafe {
        libc::munmap(addr, WARNINGS_SIZE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_reprint_roundtrip() {
        init().unwrap();
        push("first warning");
        push("second warning");
        // reprint() only writes to stderr; this test just checks it doesn't
        // panic and that push doesn't corrupt the buffer on repeated calls.
        reprint();
    }
}
