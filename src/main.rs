//! `ch-run` launcher front end: parses the command line, assembles a
//! [`ch_run_core::config::ContainerConfig`], hands it to
//! [`ch_run_core::container::containerize`], then execs the user's command.
//!
//! Grounded on `ch-run.c`'s `main`/`hooks_env_install`/`join_ct`/`join_tag`
//! and flatpak-rs's `main.rs` `#[derive(Parser)]` shape, adapted from its
//! subcommand surface to ch-run's single-command-with-flags one.

use std::os::unix::process::CommandExt;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;

use ch_run_core::config::{BindDependency, BindRequest, ContainerConfig, ImageType, JoinConfig};
use ch_run_core::{cdi, container, hooks, platform, seccomp, store};

/// Run a command in a Charliecloud-style container.
///
/// Example: ch-run /data/foo -- echo hello
#[derive(Parser, Debug)]
#[command(
    name = "ch-run",
    version,
    about = "Run a command in an unprivileged Linux container",
    override_usage = "ch-run [OPTIONS] IMAGE -- COMMAND [ARG...]"
)]
struct Args {
    /// Mount SRC at guest DST (default: same path as SRC). Repeatable.
    #[arg(short, long = "bind", value_name = "SRC[:DST]")]
    bind: Vec<String>,

    /// Initial working directory inside the container.
    #[arg(short = 'c', long = "cd", value_name = "DIR")]
    cd: Option<PathBuf>,

    /// Run as GID within the container.
    #[arg(short, long = "gid", value_name = "GID")]
    gid: Option<u32>,

    /// Run as UID within the container.
    #[arg(short, long = "uid", value_name = "UID")]
    uid: Option<u32>,

    /// Mount host $HOME at guest /home/$USER; implies --write-fake.
    #[arg(long)]
    home: bool,

    /// Use the same container as a peer ch-run invocation.
    #[arg(short, long)]
    join: bool,

    /// Number of join peers (implies --join).
    #[arg(long = "join-ct", value_name = "N")]
    join_ct: Option<u32>,

    /// Label for the peer group (implies --join).
    #[arg(long = "join-tag", value_name = "TAG")]
    join_tag: Option<String>,

    /// Join the namespaces of an already-running ch-run by PID, bypassing
    /// election entirely.
    #[arg(long = "join-pid", value_name = "PID")]
    join_pid: Option<u32>,

    /// Explicit SquashFS mount point.
    #[arg(short, long = "mount", value_name = "DIR")]
    mount: Option<PathBuf>,

    /// Don't bind-mount synthetic /etc/passwd and /etc/group.
    #[arg(long = "no-passwd")]
    no_passwd: bool,

    /// Use container-private tmpfs /tmp instead of bind-mounting the host's.
    #[arg(short = 't', long = "private-tmp")]
    private_tmp: bool,

    /// Set environment variables from ARG: a literal NAME=VALUE, or else a
    /// path to a newline-delimited file of them. Repeatable.
    #[arg(long = "set-env", value_name = "ARG")]
    set_env: Vec<String>,

    /// Like --set-env, but ARG is a path to a null-delimited file.
    #[arg(long = "set-env0", value_name = "ARG")]
    set_env0: Vec<String>,

    /// Unset environment variable(s) matching GLOB. Repeatable.
    #[arg(long = "unset-env", value_name = "GLOB")]
    unset_env: Vec<String>,

    /// Don't expand $VAR references in --set-env/--set-env0 input.
    #[arg(long = "env-no-expand")]
    env_no_expand: bool,

    /// Install the fake-success seccomp(2) filter.
    #[arg(long)]
    seccomp: bool,

    /// Location of the named-image storage directory.
    #[arg(short, long = "storage", value_name = "DIR")]
    storage: Option<PathBuf>,

    /// Mount the image read-write (avoid).
    #[arg(short, long = "write")]
    write: bool,

    /// Overlay a read-write tmpfs of SIZE on top of a read-only image.
    #[arg(short = 'W', long = "write-fake", value_name = "SIZE")]
    write_fake: Option<Option<String>>,

    /// Exit 0 if FEAT is compiled into this build, 1 otherwise.
    #[arg(long = "feature", value_name = "FEAT")]
    feature: Option<String>,

    /// Be more verbose (repeatable).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Print less output (repeatable).
    #[arg(short, long, action = clap::ArgAction::Count)]
    quiet: u8,

    /// Image reference: a directory, a SquashFS file, or a name previously
    /// pulled into the storage directory.
    img_ref: Option<String>,

    /// Command and arguments to run inside the container.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

/// Features always compiled into this build; `--feature` checks against
/// this list instead of `#[cfg]`-gated build variants, since this crate
/// doesn't offer the original's optional-compilation matrix.
const COMPILED_FEATURES: &[&str] = &["squash", "seccomp"];

fn main() {
    if let Err(e) = run() {
        platform::warnings::reprint();
        eprintln!("ch-run: error: {}", platform::assert::render_chain(&e));
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    let level = match args.verbose as i32 - args.quiet as i32 {
        i32::MIN..=-1 => log::LevelFilter::Error,
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new().filter_level(level).init();

    platform::warnings::init().context("can't initialize warnings buffer")?;

    if let Some(feat) = &args.feature {
        std::process::exit(if COMPILED_FEATURES.contains(&feat.as_str()) { 0 } else { 1 });
    }

    let username = std::env::var("USER").context("$USER not set")?;

    let Some(img_ref) = args.img_ref.clone() else {
        bail!("usage: ch-run [OPTION...] IMAGE -- COMMAND [ARG...]\nIMAGE and/or COMMAND not specified");
    };
    if args.command.is_empty() {
        bail!("usage: ch-run [OPTION...] IMAGE -- COMMAND [ARG...]\nIMAGE and/or COMMAND not specified");
    }

    let storage_dir = args
        .storage
        .clone()
        .or_else(|| std::env::var_os("CH_IMAGE_STORAGE").map(PathBuf::from))
        .or_else(|| dirs::data_dir().map(|d| d.join("ch-run")))
        .context("can't determine storage directory; pass --storage")?;

    let image_type = store::image_type(&img_ref, &storage_dir)
        .unwrap_or(if PathBuf::from(&img_ref).is_dir() { ImageType::Directory } else { ImageType::None });

    let newroot = match image_type {
        ImageType::Directory => platform::path::canonicalize(&PathBuf::from(&img_ref))?,
        ImageType::Name => store::img_name2path(&img_ref, &storage_dir),
        ImageType::Squash => args.mount.clone().unwrap_or_else(|| {
            PathBuf::from("/var/tmp").join(format!("ch-run_sqfs.{}", std::process::id()))
        }),
        ImageType::None => bail!("unknown image type: {img_ref}"),
    };

    if image_type != ImageType::Squash && args.mount.is_some() {
        log::warn!("--mount invalid with this image type, ignoring");
    }
    if image_type == ImageType::Name && args.write {
        bail!("--write invalid when running by name");
    }

    let mut binds = Vec::new();
    for spec in &args.bind {
        binds.push(parse_bind(spec)?);
    }

    const WRITE_FAKE_DEFAULT: &str = "12%";
    let overlay_size = match &args.write_fake {
        Some(Some(size)) => Some(size.clone()),
        Some(None) => Some(WRITE_FAKE_DEFAULT.to_string()),
        None if args.home => Some(WRITE_FAKE_DEFAULT.to_string()),
        None => None,
    };

    let host_home = if args.home { std::env::var_os("HOME").map(PathBuf::from) } else { None };

    let join = JoinConfig {
        join: args.join || args.join_ct.is_some() || args.join_tag.is_some(),
        join_ct: args.join_ct.unwrap_or(0),
        join_pid: args.join_pid,
        join_tag: args.join_tag.clone().unwrap_or_default(),
    };

    let mut cfg = ContainerConfig {
        binds,
        container_uid: args.uid.unwrap_or_else(|| rustix::process::geteuid().as_raw()),
        container_gid: args.gid.unwrap_or_else(|| rustix::process::getegid().as_raw()),
        env_expand: !args.env_no_expand,
        hooks_prestart: Vec::new(),
        host_home,
        img_ref: img_ref.clone(),
        newroot,
        image_type,
        join,
        overlay_size,
        private_passwd: args.no_passwd,
        private_tmp: args.private_tmp,
        writable: args.write,
        ldconfigs: Vec::new(),
        initial_dir: args.cd.clone(),
        seccomp: args.seccomp,
        username: username.clone(),
    };

    cfg.validate()?;

    install_env_hooks(&mut cfg, &args)?;

    if cfg.seccomp {
        let hook = hooks::Hook::new("seccomp", |_cfg: &mut ContainerConfig| {
            seccomp::install().context("can't install seccomp filter")
        });
        hooks::add(&mut cfg.hooks_prestart, hooks::HookDup::Skip, hook)?;
    }

    let cdi_dirs = std::env::var("CH_RUN_CDI_DIRS").unwrap_or_else(|_| "/etc/cdi:/var/run/cdi".to_string());
    apply_cdi_manifests(&mut cfg, &cdi_dirs)?;

    log::debug!("image: {}", cfg.img_ref);
    log::debug!("storage: {}", storage_dir.display());
    log::debug!("newroot: {}", cfg.newroot.display());
    log::debug!("container uid: {}", cfg.container_uid);
    log::debug!("container gid: {}", cfg.container_gid);
    log::debug!("join: {:?}", cfg.join);

    // Pre-start hooks, including the seccomp install above, only run for a
    // `--join` winner (or a non-joining run); a loser joins the winner's
    // already-configured namespaces and skips them entirely, matching
    // `core.c::containerize`'s `if (!c->join || join.winner_p) hooks_run(c)`.
    container::containerize(&mut cfg)?;

    if let Some(dir) = &cfg.initial_dir {
        rustix::process::chdir(dir).with_context(|| format!("can't chdir: {}", dir.display()))?;
    }

    platform::warnings::reprint();

    // Unconditional hardening independent of --seccomp: block the exec'd
    // command from gaining privileges via setuid/file-capability binaries.
    // SAFETY: prctl with PR_SET_NO_NEW_PRIVS takes no pointer arguments.
    let rc = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    platform::assert::zero_or_errno(rc, "can't set no_new_privs")?;

    let mut command = args.command.into_iter();
    let program = command.next().expect("checked non-empty above");
    let err = std::process::Command::new(&program).args(command).exec();
    Err(err).with_context(|| format!("can't exec: {program}"))
}

/// Parse a `--bind` argument of the form `SRC[:DST]`.
fn parse_bind(spec: &str) -> Result<BindRequest> {
    let (src, dst) = match spec.split_once(':') {
        Some((src, dst)) => (src, dst),
        None => (spec, spec),
    };
    if !dst.starts_with('/') {
        bail!("bind destination must be absolute: {dst}");
    }
    Ok(BindRequest::new(src, dst, BindDependency::MakeDst))
}

/// Install the default environment hooks plus one per `--set-env`,
/// `--set-env0`, and `--unset-env` argument, in command-line order,
/// bracketed by the default front/end hooks per `ch-run.c::hooks_env_install`.
fn install_env_hooks(cfg: &mut ContainerConfig, args: &Args) -> Result<()> {
    let home_bound = cfg.host_home.is_some();
    hooks::add(&mut cfg.hooks_prestart, hooks::HookDup::Fail, hooks::default_front_hook(home_bound))?;

    for arg in &args.set_env {
        add_set_env_hook(cfg, arg, b'\n', cfg.env_expand)?;
    }
    for arg in &args.set_env0 {
        add_set_env_hook(cfg, arg, b'\0', cfg.env_expand)?;
    }
    for glob in &args.unset_env {
        let glob = glob.clone();
        let hook = hooks::Hook::new("env-unset", move |_cfg: &mut ContainerConfig| {
            unset_env_matching(&glob);
            Ok(())
        });
        hooks::add(&mut cfg.hooks_prestart, hooks::HookDup::Ok, hook)?;
    }

    hooks::add(&mut cfg.hooks_prestart, hooks::HookDup::Fail, hooks::default_end_hook())?;
    Ok(())
}

/// A direct `NAME=VALUE` argument is applied immediately (no `=` inside a
/// valid env var name means it must be a file path); otherwise `arg` is
/// read now, from the host, split on `delim`, and each line queued as a
/// hook so the actual `set_var` call happens during the pre-start pass.
fn add_set_env_hook(cfg: &mut ContainerConfig, arg: &str, delim: u8, expand: bool) -> Result<()> {
    if let Some((name, value)) = arg.split_once('=') {
        let name = name.to_string();
        let value = if expand { expand_vars(value) } else { value.to_string() };
        let hook = hooks::Hook::new("env-set-direct", move |_cfg: &mut ContainerConfig| {
            // SAFETY: hooks run single-threaded during container setup.
            unsafe { std::env::set_var(&name, &value) };
            Ok(())
        });
        hooks::add(&mut cfg.hooks_prestart, hooks::HookDup::Ok, hook)?;
        return Ok(());
    }

    let bytes = std::fs::read(arg).with_context(|| format!("can't read env file: {arg}"))?;
    let mut pairs = Vec::new();
    for line in bytes.split(|&b| b == delim) {
        if line.is_empty() {
            continue;
        }
        let line = std::str::from_utf8(line).with_context(|| format!("env file is not UTF-8: {arg}"))?;
        let Some((name, value)) = line.split_once('=') else {
            bail!("malformed env entry in {arg}: {line}");
        };
        let value = if expand { expand_vars(value) } else { value.to_string() };
        pairs.push((name.to_string(), value));
    }
    let hook = hooks::Hook::new("env-set-hfile", move |_cfg: &mut ContainerConfig| {
        for (name, value) in &pairs {
            // SAFETY: see above.
            unsafe { std::env::set_var(name, value) };
        }
        Ok(())
    });
    hooks::add(&mut cfg.hooks_prestart, hooks::HookDup::Ok, hook)
}

/// Expand `$NAME` and `${NAME}` references in `value` against the current
/// process environment, left to right, non-recursively. `$`, `{`, `}`, and
/// name characters are all ASCII, so byte offsets into the UTF-8 string are
/// safe to use as slice boundaries; only the unmatched fallback path copies
/// through `char`s to avoid splitting a multi-byte sequence.
fn expand_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let bytes = value.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' && i + 1 < bytes.len() {
            let (name, consumed) = if bytes[i + 1] == b'{' {
                match value[i + 2..].find('}') {
                    Some(p) => (&value[i + 2..i + 2 + p], i + 2 + p + 1 - i),
                    None => (&value[i + 1..i + 1], 1),
                }
            } else {
                let start = i + 1;
                let mut end = start;
                while end < bytes.len() && (bytes[end].is_ascii_alphanumeric() || bytes[end] == b'_') {
                    end += 1;
                }
                (&value[start..end], end - i)
            };
            if !name.is_empty() {
                out.push_str(&std::env::var(name).unwrap_or_default());
                i += consumed;
                continue;
            }
        }
        let ch = value[i..].chars().next().expect("i < bytes.len()");
        out.push(ch);
        i += ch.len_utf8();
    }
    out
}

/// Unset every environment variable whose name matches a `fnmatch(3)`-style
/// glob (only `*` and `?` are recognized, matching ch-run's actual usage).
fn unset_env_matching(glob: &str) {
    let names: Vec<String> = std::env::vars().map(|(k, _)| k).filter(|k| glob_match(glob, k)).collect();
    for name in names {
        // SAFETY: see add_set_env_hook.
        unsafe { std::env::remove_var(&name) };
    }
}

fn glob_match(pattern: &str, text: &str) -> bool {
    fn inner(p: &[u8], t: &[u8]) -> bool {
        match p.first() {
            None => t.is_empty(),
            Some(b'*') => inner(&p[1..], t) || (!t.is_empty() && inner(p, &t[1..])),
            Some(b'?') => !t.is_empty() && inner(&p[1..], &t[1..]),
            Some(&c) => t.first() == Some(&c) && inner(&p[1..], &t[1..]),
        }
    }
    inner(pattern.as_bytes(), text.as_bytes())
}

/// Look for CDI device-injection manifests under the colon-separated
/// directory list and fold any that parse into `cfg`. Missing directories
/// are silently skipped; a present-but-malformed manifest is fatal.
fn apply_cdi_manifests(cfg: &mut ContainerConfig, dirs_var: &str) -> Result<()> {
    for dir in dirs_var.split(':') {
        let dir = PathBuf::from(dir);
        let Ok(entries) = std::fs::read_dir(&dir) else { continue };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("can't read CDI manifest: {}", path.display()))?;
            let manifest = cdi::parse(&text).with_context(|| format!("can't parse CDI manifest: {}", path.display()))?;
            cdi::apply(cfg, manifest)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bind_defaults_dst_to_src() {
        let b = parse_bind("/data").unwrap();
        assert_eq!(b.src, PathBuf::from("/data"));
        assert_eq!(b.dst, PathBuf::from("/data"));
    }

    #[test]
    fn parse_bind_splits_src_and_dst() {
        let b = parse_bind("/data:/mnt/data").unwrap();
        assert_eq!(b.src, PathBuf::from("/data"));
        assert_eq!(b.dst, PathBuf::from("/mnt/data"));
    }

    #[test]
    fn parse_bind_rejects_relative_dst() {
        assert!(parse_bind("/data:mnt/data").is_err());
    }

    #[test]
    fn expand_vars_substitutes_braced_and_bare_names() {
        // SAFETY: test runs single-threaded within this process.
        unsafe { std::env::set_var("CH_RUN_TEST_VAR", "xyz") };
        assert_eq!(expand_vars("a-${CH_RUN_TEST_VAR}-b"), "a-xyz-b");
        assert_eq!(expand_vars("$CH_RUN_TEST_VAR!"), "xyz!");
    }

    #[test]
    fn glob_match_supports_star_and_question() {
        assert!(glob_match("SLURM_*", "SLURM_JOB_ID"));
        assert!(!glob_match("SLURM_*", "PATH"));
        assert!(glob_match("A?C", "ABC"));
        assert!(!glob_match("A?C", "ABBC"));
    }
}
