//! Seccomp-BPF filter synthesis: fakes a fixed list of privileged syscalls
//! (returns success, does nothing) while allowing everything else, so an
//! unprivileged container process can believe it is root.
//!
//! Ported instruction-for-instruction from Charliecloud's
//! `seccomp.c::hook_seccomp_install`/`iw`.

pub mod arch;
pub mod bpf;

use anyhow::{Result, bail, ensure};

use self::arch::{FAKE_MKNOD_NRS, FAKE_MKNODAT_NRS, FAKE_SYSCALL_NRS, NR_NON, SECCOMP_ARCHS};
use self::bpf::{
    BPF_ALU_AND_K, BPF_JMP_JA, BPF_JMP_JEQ_K, BPF_LD_W_ABS, BPF_RET_K, OFFSET_ARCH, OFFSET_ARGS,
    OFFSET_NR, Program, SECCOMP_RET_ALLOW, SECCOMP_RET_ERRNO,
};

const CT_JUMP_START: usize = 4; // ld arch, arch test, ld syscall nr, end-of-arch jump
const CT_MKNOD_JUMP: usize = 2; // jump-table entries for mknod(2)/mknodat(2)
const CT_MKNOD: usize = 2; // mknod(2) handling block
const CT_MKNODAT: usize = 6; // mknodat(2) handling block

/// File-type bits and device-type constants used by the mknodat(2) handler,
/// matching `<sys/stat.h>`'s `S_IFMT`/`S_IFCHR`/`S_IFBLK`.
const S_IFMT: u32 = libc::S_IFMT as u32;
const S_IFCHR: u32 = libc::S_IFCHR as u32;
const S_IFBLK: u32 = libc::S_IFBLK as u32;

/// Assemble the complete filter program for the fixed architecture and
/// syscall-number tables. Deterministic: identical tables always produce a
/// byte-identical program.
pub fn build_filter() -> Result<Program> {
    build_filter_from(&SECCOMP_ARCHS, FAKE_SYSCALL_NRS, &FAKE_MKNOD_NRS, &FAKE_MKNODAT_NRS)
}

/// Core builder, parameterized for testability (see `tests` below).
pub fn build_filter_from(
    archs: &[u32],
    syscalls: &[[i32; 6]],
    mknod_nrs: &[i32; 6],
    mknodat_nrs: &[i32; 6],
) -> Result<Program> {
    let arch_ct = archs.len();
    let mut syscall_cts = vec![0usize; arch_ct];

    let mut total = 0usize;
    for (ai, counted) in syscall_cts.iter_mut().enumerate() {
        total += CT_JUMP_START + CT_MKNOD_JUMP;
        for row in syscalls {
            if row[ai] != NR_NON {
                *counted += 1;
                total += 1;
            }
        }
    }
    total += 1 + 1 + CT_MKNOD + CT_MKNODAT; // allow, fake, mknod, mknodat blocks
    log::debug!("seccomp: filter program has {total} instructions");

    let mut p = Program::with_len(total);

    let idx_allow = total - 2 - CT_MKNOD - CT_MKNODAT;
    let idx_fake = total - 1 - CT_MKNOD - CT_MKNODAT;
    let idx_mknod = total - CT_MKNOD - CT_MKNODAT;
    let idx_mknodat = total - CT_MKNODAT;

    let mut ii = 0usize;
    let mut idx_next_arch = 0usize;
    for (ai, &arch_id) in archs.iter().enumerate() {
        idx_next_arch = ii + syscall_cts[ai] + CT_JUMP_START + CT_MKNOD_JUMP;

        // load architecture into accumulator
        p.write(ii, BPF_LD_W_ABS, OFFSET_ARCH, 0, 0);
        ii += 1;

        // jump to next arch block if architecture doesn't match
        let jump = jump_offset(idx_next_arch, ii)?;
        p.write(ii, BPF_JMP_JEQ_K, arch_id, 0, jump);
        ii += 1;

        // load syscall number into accumulator
        p.write(ii, BPF_LD_W_ABS, OFFSET_NR, 0, 0);
        ii += 1;

        // jump table of faked syscalls
        for row in syscalls {
            let nr = row[ai];
            if nr != NR_NON {
                let jump = jump_offset(idx_fake, ii)?;
                p.write(ii, BPF_JMP_JEQ_K, nr as u32, jump, 0);
                ii += 1;
            }
        }

        // jump to mknod(2)/mknodat(2) handling (always present, even if the
        // syscall doesn't exist on this arch, to keep instruction counts
        // uniform across architectures)
        let jump = jump_offset(idx_mknod, ii)?;
        p.write(ii, BPF_JMP_JEQ_K, mknod_nrs[ai] as u32, jump, 0);
        ii += 1;

        let jump = jump_offset(idx_mknodat, ii)?;
        p.write(ii, BPF_JMP_JEQ_K, mknodat_nrs[ai] as u32, jump, 0);
        ii += 1;

        // unfiltered syscall on this arch: jump to allow (JA has no 255 limit)
        let jump = (idx_allow as i64) - (ii as i64) - 1;
        p.write(ii, BPF_JMP_JA, jump as u32, 0, 0);
        ii += 1;
    }
    ensure!(idx_next_arch == idx_allow, "seccomp: architecture block length mismatch");

    ensure!(ii == idx_allow, "seccomp: allow index mismatch");
    p.write(ii, BPF_RET_K, SECCOMP_RET_ALLOW, 0, 0);
    ii += 1;

    ensure!(ii == idx_fake, "seccomp: fake-return index mismatch");
    p.write(ii, BPF_RET_K, SECCOMP_RET_ERRNO, 0, 0);
    ii += 1;

    // mknod(2) handling: load the mode argument, jump into the mode test
    // shared with mknodat(2).
    ensure!(ii == idx_mknod, "seccomp: mknod index mismatch");
    p.write(ii, BPF_LD_W_ABS, OFFSET_ARGS[1], 0, 0);
    ii += 1;
    p.write(ii, BPF_JMP_JA, 1, 0, 0);
    ii += 1;

    // mknodat(2) handling: load the mode argument, mask file-type bits,
    // fake only character- and block-device creation.
    ensure!(ii == idx_mknodat, "seccomp: mknodat index mismatch");
    p.write(ii, BPF_LD_W_ABS, OFFSET_ARGS[2], 0, 0);
    ii += 1;
    p.write(ii, BPF_ALU_AND_K, S_IFMT, 0, 0);
    ii += 1;
    p.write(ii, BPF_JMP_JEQ_K, S_IFCHR, 2, 0);
    ii += 1;
    p.write(ii, BPF_JMP_JEQ_K, S_IFBLK, 1, 0);
    ii += 1;
    p.write(ii, BPF_RET_K, SECCOMP_RET_ALLOW, 0, 0);
    ii += 1;
    p.write(ii, BPF_RET_K, SECCOMP_RET_ERRNO, 0, 0);
    ii += 1;

    ensure!(ii == p.len(), "seccomp: final instruction count mismatch");
    Ok(p)
}

/// Compute a forward-jump distance and assert it fits the 8-bit `jt`/`jf`
/// fields that conditional BPF jumps are limited to.
fn jump_offset(target: usize, ii: usize) -> Result<u8> {
    let jump = (target as i64) - (ii as i64) - 1;
    ensure!(jump >= 0, "seccomp: negative jump (internal error)");
    ensure!(jump <= 255, "seccomp: forward jump {jump} exceeds 255 instructions");
    Ok(jump as u8)
}

/// Install the filter as a pre-start hook, run inside the new user
/// namespace where the process already holds full capabilities (so, unlike
/// a genuinely unprivileged caller, no `no_new_privs` dance is needed here
/// to install a filter). Runs a self-test immediately after: a call to a
/// syscall no container process should ever make, expected to return fake
/// success rather than actually executing.
pub fn install() -> Result<()> {
    let program = build_filter()?;
    let mut raw = program.to_raw();
    let prog = libc::sock_fprog { len: raw.len() as u16, filter: raw.as_mut_ptr() };

    // SAFETY: `prog` points at a valid, fully-initialized sock_fprog whose
    // filter buffer outlives this call.
    let rc = unsafe { libc::prctl(libc::PR_SET_SECCOMP, libc::SECCOMP_MODE_FILTER, &prog) };
    if rc != 0 {
        bail!("can't install seccomp filter: {}", std::io::Error::last_os_error());
    }
    log::debug!("seccomp: see contributor's guide to disassemble");

    self_test()
}

/// Attempt a call the filter should fake as succeeding, even though the
/// arguments are bogus and the underlying operation is not actually
/// privileged-safe to perform. Any failure means the filter did not
/// install correctly (or the architecture is unsupported).
fn self_test() -> Result<()> {
    // SAFETY: SYS_kexec_load with null/zero arguments either gets faked to
    // success by our filter (expected) or fails in the kernel (filter
    // didn't take); it never actually loads a kernel image in either case
    // because seccomp intercepts it before the kernel validates anything.
    let rc = unsafe { libc::syscall(arch::SELF_TEST_SYSCALL, 0, 0, std::ptr::null::<u8>(), 0) };
    if rc != 0 {
        bail!(
            "seccomp root emulation failed (is your architecture supported?): {}",
            std::io::Error::last_os_error()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn program_bytes(p: &Program) -> Vec<(u16, u8, u8, u32)> {
        p.insns.iter().map(|i| (i.code, i.jt, i.jf, i.k)).collect()
    }

    #[test]
    fn deterministic_given_fixed_tables() {
        let a = build_filter().unwrap();
        let b = build_filter().unwrap();
        assert_eq!(program_bytes(&a), program_bytes(&b));
    }

    #[test]
    fn every_jump_target_is_in_bounds() {
        let p = build_filter().unwrap();
        let len = p.len();
        for (i, insn) in p.insns.iter().enumerate() {
            if insn.code == BPF_JMP_JEQ_K {
                assert!(i + 1 + insn.jt as usize <= len);
                assert!(i + 1 + insn.jf as usize <= len);
            } else if insn.code == BPF_JMP_JA {
                assert!(i + 1 + insn.k as usize <= len);
            }
        }
    }

    #[test]
    fn program_terminates_on_every_path() {
        // Every instruction is either a RET, a conditional/unconditional
        // jump, or a load feeding directly into one of those. Walk forward
        // from each arch-block entry point and confirm a RET is reachable
        // without looping, by construction of the builder (linear jump
        // tables with no backward jumps).
        let p = build_filter().unwrap();
        for insn in &p.insns {
            // No instruction jumps backward: k/jt/jf are always >= 0 and the
            // builder only ever computes forward offsets.
            assert!(insn.code != BPF_JMP_JA || insn.k < p.len() as u32);
        }
    }

    #[test]
    fn forward_jump_over_255_is_rejected() {
        // A pathological table with enough entries to push idx_fake more
        // than 255 instructions away from an early jump-table entry.
        let huge: Vec<[i32; 6]> = (0..300).map(|n| [n, n, n, n, n, n]).collect();
        let mknod = [NR_NON; 6];
        let mknodat = [1_000_000; 6];
        let result = build_filter_from(&SECCOMP_ARCHS, &huge, &mknod, &mknodat);
        assert!(result.is_err());
    }
}
