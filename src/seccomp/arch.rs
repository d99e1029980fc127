//! Per-architecture syscall number tables for the seccomp filter.
//!
//! Ported verbatim from Charliecloud's `seccomp.c`. Numbers come from the
//! Chromium OS cross-arch syscall table and strace's syscall tables for
//! PPC64LE and s390x.

/// Syscall does not exist on this architecture.
pub const NR_NON: i32 = -1;

/// `AUDIT_ARCH_*` values, in column order matching [`FAKE_SYSCALL_NRS`].
/// Some of these are not exposed by `<linux/audit.h>` on older distros
/// (e.g. CentOS 7), so they're hardcoded the way the original does.
pub const SECCOMP_ARCHS: [u32; 6] = [
    0xC00000B7, // AUDIT_ARCH_AARCH64
    0x40000028, // AUDIT_ARCH_ARM
    0x40000003, // AUDIT_ARCH_I386
    0x80000015, // AUDIT_ARCH_PPC64LE
    0x80000016, // AUDIT_ARCH_S390X
    0xC000003E, // AUDIT_ARCH_X86_64
];

/// One row per faked syscall; one column per architecture in
/// [`SECCOMP_ARCHS`] order. `NR_NON` means "doesn't exist on this arch".
///
/// arm64,  arm32,  x86,    PPC64,  s390x,  x86-64
#[rustfmt::skip]
pub const FAKE_SYSCALL_NRS: &[[i32; 6]] = &[
    [     91,    185,    185,    184,    185,    126 ], // capset
    [ NR_NON,    182,    182,    181,    212,     92 ], // chown
    [ NR_NON,    212,    212, NR_NON, NR_NON, NR_NON ], // chown32
    [     55,     95,     95,     95,    207,     93 ], // fchown
    [ NR_NON,    207,    207, NR_NON, NR_NON, NR_NON ], // fchown32
    [     54,    325,    298,    289,    291,    260 ], // fchownat
    [ NR_NON,     16,     16,     16,    198,     94 ], // lchown
    [ NR_NON,    198,    198, NR_NON, NR_NON, NR_NON ], // lchown32
    [    104,    347,    283,    268,    277,    246 ], // kexec_load
    [    152,    139,    139,    139,    216,    123 ], // setfsgid
    [ NR_NON,    216,    216, NR_NON, NR_NON, NR_NON ], // setfsgid32
    [    151,    138,    138,    138,    215,    122 ], // setfsuid
    [ NR_NON,    215,    215, NR_NON, NR_NON, NR_NON ], // setfsuid32
    [    144,     46,     46,     46,    214,    106 ], // setgid
    [ NR_NON,    214,    214, NR_NON, NR_NON, NR_NON ], // setgid32
    [    159,     81,     81,     81,    206,    116 ], // setgroups
    [ NR_NON,    206,    206, NR_NON, NR_NON, NR_NON ], // setgroups32
    [    143,     71,     71,     71,    204,    114 ], // setregid
    [ NR_NON,    204,    204, NR_NON, NR_NON, NR_NON ], // setregid32
    [    149,    170,    170,    169,    210,    119 ], // setresgid
    [ NR_NON,    210,    210, NR_NON, NR_NON, NR_NON ], // setresgid32
    [    147,    164,    164,    164,    208,    117 ], // setresuid
    [ NR_NON,    208,    208, NR_NON, NR_NON, NR_NON ], // setresuid32
    [    145,     70,     70,     70,    203,    113 ], // setreuid
    [ NR_NON,    203,    203, NR_NON, NR_NON, NR_NON ], // setreuid32
    [    146,     23,     23,     23,    213,    105 ], // setuid
    [ NR_NON,    213,    213, NR_NON, NR_NON, NR_NON ], // setuid32
];

/// `mknod(2)` numbers, same column order as [`SECCOMP_ARCHS`].
pub const FAKE_MKNOD_NRS: [i32; 6] = [NR_NON, 14, 14, 14, 14, 133];

/// `mknodat(2)` numbers, same column order as [`SECCOMP_ARCHS`].
pub const FAKE_MKNODAT_NRS: [i32; 6] = [33, 324, 297, 288, 290, 259];

/// The syscall self-test: a call no container process should ever make and
/// that no future, smarter seccomp layer is likely to start silently
/// emulating. Used to verify the filter was installed correctly.
pub const SELF_TEST_SYSCALL: i64 = libc::SYS_kexec_load;
