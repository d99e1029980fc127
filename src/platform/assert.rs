//! Thin helpers standing in for the original's `Z_`/`Zf`/`Ze`/`T_`/`Tf`/`Te`
//! macro bank: turn a failed raw syscall (C convention: nonzero/negative
//! return plus `errno`) into an `anyhow::Error` carrying the same
//! "description: cause" shape those macros produced.
//!
//! Most of this crate calls `rustix`, whose wrappers already return
//! `Result`, so these exist only for the handful of raw `libc`/`libc::syscall`
//! escape hatches (`pivot_root`, `setns`, seccomp, POSIX IPC) where the
//! convention is still "zero or positive is success".

use anyhow::{Error, Result, bail};

/// Equivalent of `Zf(x, ...)`: fail if `rc` is nonzero, attaching `ctx` and
/// the current `errno` as the cause.
pub fn zero_or_errno(rc: i32, ctx: &str) -> Result<()> {
    if rc != 0 {
        bail!("{ctx}: {}", std::io::Error::last_os_error());
    }
    Ok(())
}

/// Equivalent of `Ze(x, ...)`: fail if `rc` is nonzero, with no `errno`
/// attached (used where the failure isn't a syscall's but an internal
/// invariant check dressed up as one).
pub fn zero_or_fail(rc: i32, ctx: &str) -> Result<()> {
    if rc != 0 {
        bail!("{ctx}");
    }
    Ok(())
}

/// Equivalent of `Tf(x, ...)`: fail unless `cond` holds, attaching `ctx`
/// and `errno`.
pub fn truthy_or_errno(cond: bool, ctx: &str) -> Result<()> {
    if !cond {
        bail!("{ctx}: {}", std::io::Error::last_os_error());
    }
    Ok(())
}

/// Equivalent of `Te(x, ...)`: fail unless `cond` holds, no `errno`.
pub fn truthy_or_fail(cond: bool, ctx: &str) -> Result<()> {
    if !cond {
        bail!("{ctx}");
    }
    Ok(())
}

/// Render a chained error the way the original's fatal-message path did:
/// one line per cause, innermost last becomes outermost first here since
/// `anyhow`'s `Display` already walks the chain top to bottom.
pub fn render_chain(err: &Error) -> String {
    let mut out = err.to_string();
    for cause in err.chain().skip(1) {
        out.push_str(": ");
        out.push_str(&cause.to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_or_errno_passes_through_success() {
        assert!(zero_or_errno(0, "should not fail").is_ok());
    }

    #[test]
    fn zero_or_errno_reports_failure() {
        let err = zero_or_errno(-1, "can't frobnicate").unwrap_err();
        assert!(err.to_string().starts_with("can't frobnicate"));
    }

    #[test]
    fn truthy_or_fail_reports_failure_without_errno() {
        let err = truthy_or_fail(false, "invariant violated").unwrap_err();
        assert_eq!(err.to_string(), "invariant violated");
    }
}
