//! Namespace join coordinator.
//!
//! When several peer processes (e.g. MPI ranks on the same node) want to
//! share one container instead of each creating their own, the first to
//! arrive ("the winner") creates the namespaces; the rest ("losers") wait
//! for it to finish setting up and then join its namespaces with
//! `setns(2)`. Coordination uses a named POSIX semaphore plus a small
//! named shared-memory region, both keyed off a user-supplied tag so
//! unrelated invocations don't collide.
//!
//! Ported from `core.c`'s `join_begin`/`join_end`/`namespace_join`/
//! `namespaces_join`/`sem_timedwait_relative`.

use std::ffi::CString;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr;
use std::thread::sleep;
use std::time::Duration;

use anyhow::{Context, Result, bail, ensure};

use crate::config::JoinConfig;

const JOIN_TIMEOUT_SECS: i64 = 30;

#[repr(C)]
struct SharedState {
    winner_pid: libc::pid_t,
    proc_left_ct: i32,
}

/// State held across `begin()`/`end()` by whichever process called them.
pub struct Coordinator {
    sem_name: CString,
    shm_name: CString,
    sem: *mut libc::sem_t,
    shared: *mut SharedState,
    winner: bool,
}

// SAFETY: the semaphore and shared-memory pointers refer to kernel-backed,
// process-shareable objects; Coordinator is only ever used from the single
// thread that called `begin()`, so there's no concurrent-access hazard
// within one process.
unsafe impl Send for Coordinator {}

impl Coordinator {
    /// True if this process is the one that will set up the namespaces
    /// (everyone else joins them instead).
    pub fn is_winner(&self) -> bool {
        self.winner
    }

    /// PID of the winning process. Only meaningful for losers, and only
    /// after `begin()` returns: the semaphore protocol guarantees the
    /// winner has already run `end()` (which writes this field) by the
    /// time any loser gets past its own `begin()` call.
    pub fn winner_pid(&self) -> i32 {
        // SAFETY: shared points at a live mapping; the semaphore handshake
        // in begin()/end() establishes happens-before ordering with the
        // winner's write.
        unsafe { (*self.shared).winner_pid }
    }
}

/// Begin the coordinated section: serialize against peers sharing the same
/// tag, and determine whether this process is the winner (first to create
/// the shared-memory region) or a loser (joins an existing one).
pub fn begin(tag: &str) -> Result<Coordinator> {
    let sem_name = CString::new(format!("/ch-run_sem-{tag}")).context("join tag contains NUL")?;
    let shm_name = CString::new(format!("/ch-run_shm-{tag}")).context("join tag contains NUL")?;

    // SAFETY: sem_name is a valid, NUL-terminated C string for the lifetime
    // of this call.
    let sem = unsafe { libc::sem_open(sem_name.as_ptr(), libc::O_CREAT, 0o600, 1) };
    ensure!(sem != libc::SEM_FAILED, "can't open join semaphore: {}", std::io::Error::last_os_error());
    sem_timedwait_relative(sem, JOIN_TIMEOUT_SECS)?;

    // SAFETY: shm_name is valid and NUL-terminated.
    let fd = unsafe { libc::shm_open(shm_name.as_ptr(), libc::O_CREAT | libc::O_EXCL | libc::O_RDWR, 0o600) };
    let (winner, fd) = if fd >= 0 {
        log::debug!("join: I won");
        // SAFETY: ftruncate on a freshly created, writable shm fd.
        let rc = unsafe { libc::ftruncate(fd, std::mem::size_of::<SharedState>() as libc::off_t) };
        if rc != 0 {
            bail!("can't size join shared memory: {}", std::io::Error::last_os_error());
        }
        (true, fd)
    } else if std::io::Error::last_os_error().raw_os_error() == Some(libc::EEXIST) {
        log::debug!("join: I lost");
        // SAFETY: shm_name is valid and NUL-terminated.
        let fd = unsafe { libc::shm_open(shm_name.as_ptr(), libc::O_RDWR, 0) };
        ensure!(fd >= 0, "can't open existing join shared memory: {}", std::io::Error::last_os_error());
        (false, fd)
    } else {
        bail!("can't create join shared memory: {}", std::io::Error::last_os_error());
    };

    // SAFETY: fd refers to a shm object sized to hold exactly one SharedState.
    let shared = unsafe {
        libc::mmap(
            ptr::null_mut(),
            std::mem::size_of::<SharedState>(),
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    ensure!(shared != libc::MAP_FAILED, "can't mmap join shared memory: {}", std::io::Error::last_os_error());
    // SAFETY: fd has been mmap'd; the mapping keeps the object alive.
    unsafe {
        let _ = OwnedFd::from_raw_fd(fd); // closes fd on drop
    }

    if !winner {
        // SAFETY: sem was returned by sem_open above and is still open.
        let rc = unsafe { libc::sem_post(sem) };
        ensure!(rc == 0, "can't post join semaphore: {}", std::io::Error::last_os_error());
    }

    Ok(Coordinator { sem_name, shm_name, sem, shared: shared as *mut SharedState, winner })
}

/// End the coordinated section. The winner records how many peers are
/// expected (`join_ct`) and initializes the countdown; losers wait their
/// turn. The last process to leave unlinks the semaphore and shared
/// memory so the next unrelated run with the same tag starts fresh.
pub fn end(coord: Coordinator, join_ct: i32) -> Result<()> {
    // SAFETY: shared points at a live mapping owned by this Coordinator.
    unsafe {
        if coord.winner {
            log::debug!("join: winner initializing shared data");
            (*coord.shared).winner_pid = std::process::id() as libc::pid_t;
            (*coord.shared).proc_left_ct = join_ct;
        } else {
            sem_timedwait_relative(coord.sem, JOIN_TIMEOUT_SECS)?;
        }

        (*coord.shared).proc_left_ct -= 1;
        let left = (*coord.shared).proc_left_ct;
        log::debug!("join: {left} peers left excluding myself");

        if left <= 0 {
            log::debug!("join: cleaning up IPC resources");
            ensure!(left == 0, "expected 0 peers left but found {left}");
            if libc::sem_unlink(coord.sem_name.as_ptr()) != 0 {
                log::warn!("can't unlink join semaphore: {}", std::io::Error::last_os_error());
            }
            if libc::shm_unlink(coord.shm_name.as_ptr()) != 0 {
                log::warn!("can't unlink join shared memory: {}", std::io::Error::last_os_error());
            }
        }

        ensure!(libc::sem_post(coord.sem) == 0, "can't post join semaphore: {}", std::io::Error::last_os_error());
        ensure!(
            libc::munmap(coord.shared as *mut _, std::mem::size_of::<SharedState>()) == 0,
            "can't unmap join shared memory"
        );
        ensure!(libc::sem_close(coord.sem) == 0, "can't close join semaphore");
    }
    log::debug!("join: done");
    Ok(())
}

/// `sem_wait` with a relative timeout, since POSIX only offers an absolute
/// deadline.
fn sem_timedwait_relative(sem: *mut libc::sem_t, timeout_secs: i64) -> Result<()> {
    let mut deadline = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // SAFETY: deadline is a valid out-pointer.
    ensure!(unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut deadline) } == 0, "clock_gettime failed");
    deadline.tv_sec += timeout_secs;

    // SAFETY: sem is a live semaphore obtained from sem_open; deadline is
    // fully initialized.
    let rc = unsafe { libc::sem_timedwait(sem, &deadline) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ETIMEDOUT) {
            bail!("timed out waiting for other join peers after {timeout_secs}s");
        }
        bail!("sem_timedwait failed: {err}");
    }
    Ok(())
}

/// Join the user and mount namespaces of an already-running container
/// process, retrying a few times on `EINVAL` (observed to race
/// occasionally against syslog under some configurations).
pub fn namespaces_join(pid: i32) -> Result<()> {
    log::debug!("joining namespaces of pid {pid}");
    namespace_join(pid, "user")?;
    namespace_join(pid, "mnt")?;
    Ok(())
}

fn namespace_join(pid: i32, ns: &str) -> Result<()> {
    let path = format!("/proc/{pid}/ns/{ns}");
    let file = std::fs::File::open(&path)
        .with_context(|| format!("join: no PID {pid} or namespace not joinable: {path}"))?;

    // setns(2) has been observed to race against syslog(3) under some
    // configurations and fail transiently with EINVAL; retry a few times
    // rather than give up immediately.
    for attempt in 1..=5 {
        // SAFETY: file.as_raw_fd() is a valid, open fd for the lifetime of
        // this call; setns takes no pointer arguments.
        let rc = unsafe { libc::setns(file.as_raw_fd(), 0) };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINVAL) && attempt < 5 {
            let msg = format!("can't join {ns} namespace; trying again");
            log::warn!("{msg}");
            crate::platform::warnings::push(&msg);
            sleep(Duration::from_secs(1));
        } else {
            bail!("can't join {ns} namespace of pid {pid}: {err}");
        }
    }
    bail!("can't join {ns} namespace of pid {pid}: exhausted retries")
}

/// Environment variables consulted for an implicit `--join-ct`, in order.
const JOIN_CT_ENV: &[&str] = &["OMPI_COMM_WORLD_LOCAL_SIZE", "SLURM_STEP_TASKS_PER_NODE", "SLURM_CPUS_ON_NODE"];

/// Environment variables consulted for an implicit `--join-tag`, in order.
const JOIN_TAG_ENV: &[&str] = &["SLURM_STEP_ID"];

/// Resolve the join tag and process count from CLI flags, falling back to
/// workload-manager environment variables and, for the tag, the parent
/// PID, the way `ch-run`'s front end does. Returns `None` when joining
/// isn't requested.
pub fn resolve(join: &JoinConfig) -> Result<Option<(String, u32)>> {
    if !join.join {
        return Ok(None);
    }

    let tag = if !join.join_tag.is_empty() {
        join.join_tag.clone()
    } else if let Some(tag) = JOIN_TAG_ENV.iter().find_map(|name| std::env::var(name).ok()) {
        tag
    } else {
        // SAFETY: getppid(2) takes no arguments and cannot fail.
        unsafe { libc::getppid() }.to_string()
    };
    ensure!(!tag.is_empty(), "join: peer group tag cannot be empty string");

    let ct = if join.join_ct != 0 {
        join.join_ct
    } else {
        JOIN_CT_ENV
            .iter()
            .find_map(|name| std::env::var(name).ok().and_then(|s| s.parse().ok()))
            .context("--join requires --join-ct or a workload-manager task count in the environment")?
    };
    ensure!(ct > 0, "--join-ct must be positive, got {ct}");
    Ok(Some((tag, ct)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_disabled_returns_none() {
        let join = JoinConfig { join: false, ..Default::default() };
        assert!(resolve(&join).unwrap().is_none());
    }

    #[test]
    fn resolve_uses_explicit_tag_and_count() {
        let join = JoinConfig { join: true, join_tag: "mytag".into(), join_ct: 4, join_pid: None };
        let (tag, ct) = resolve(&join).unwrap().unwrap();
        assert_eq!(tag, "mytag");
        assert_eq!(ct, 4);
    }

}
