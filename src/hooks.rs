//! Pre-start hook registry: an ordered list of named callbacks run once,
//! immediately before the pivot, then discarded.

use anyhow::{Result, bail};

use crate::config::ContainerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookDup {
    /// Always append, even if a hook of the same name already exists.
    Ok,
    /// Silently do nothing if a hook of the same name already exists.
    Skip,
    /// Fatal error if a hook of the same name already exists.
    Fail,
}

/// A named pre-start callback. `f` may mutate `cfg.binds`, the environment,
/// or install additional syscall filters, but must not touch namespaces.
pub struct Hook {
    pub name: &'static str,
    f: Box<dyn FnOnce(&mut ContainerConfig) -> Result<()>>,
}

impl Hook {
    pub fn new(name: &'static str, f: impl FnOnce(&mut ContainerConfig) -> Result<()> + 'static) -> Self {
        Self { name, f: Box::new(f) }
    }
}

/// Append `hook` to `list` according to `dup`'s duplicate policy.
pub fn add(list: &mut Vec<Hook>, dup: HookDup, hook: Hook) -> Result<()> {
    if matches!(dup, HookDup::Skip | HookDup::Fail) {
        if let Some(existing) = list.iter().find(|h| h.name == hook.name) {
            let _ = existing;
            match dup {
                HookDup::Skip => return Ok(()),
                HookDup::Fail => bail!("invalid duplicate hook: {}", hook.name),
                HookDup::Ok => unreachable!(),
            }
        }
    }
    list.push(hook);
    Ok(())
}

/// Run every hook in `cfg.hooks_prestart` in insertion order, passing `cfg`
/// to each, then clear the list.
pub fn run(cfg: &mut ContainerConfig) -> Result<()> {
    let hooks = std::mem::take(&mut cfg.hooks_prestart);
    let hook_ct = hooks.len();
    for (i, hook) in hooks.into_iter().enumerate() {
        log::debug!("calling hook {}/{}: {}", i + 1, hook_ct, hook.name);
        (hook.f)(cfg)?;
    }
    Ok(())
}

/// Default front hook: sets `HOME`, appends `/bin` to `PATH`, unsets
/// `TMPDIR`. Installed before any user-supplied environment edits.
pub fn default_front_hook(home_bound: bool) -> Hook {
    Hook::new("default-env-front", move |cfg: &mut ContainerConfig| {
        let home = if home_bound {
            format!("/home/{}", cfg.username)
        } else if cfg.container_uid == 0 {
            "/root".to_string()
        } else {
            "/".to_string()
        };
        // SAFETY: single-threaded at this point in the launcher lifecycle
        // (pre-start hooks run before the user command is spawned and
        // before any additional threads are created).
        unsafe {
            std::env::set_var("HOME", &home);
        }
        let path = std::env::var("PATH").unwrap_or_default();
        let new_path = if path.is_empty() { "/bin".to_string() } else { format!("{path}:/bin") };
        unsafe {
            std::env::set_var("PATH", new_path);
            std::env::remove_var("TMPDIR");
        }
        Ok(())
    })
}

/// Default end hook: sets the running-marker variable so scripts inside the
/// container can detect they are running under ch-run.
pub fn default_end_hook() -> Hook {
    Hook::new("default-env-end", |_cfg: &mut ContainerConfig| {
        // SAFETY: see default_front_hook.
        unsafe {
            std::env::set_var("CH_RUNNING", "1");
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_config() -> ContainerConfig {
        ContainerConfig {
            binds: vec![],
            container_uid: 1000,
            container_gid: 1000,
            env_expand: false,
            hooks_prestart: vec![],
            host_home: None,
            img_ref: "img".into(),
            newroot: "/tmp".into(),
            image_type: crate::config::ImageType::Directory,
            join: Default::default(),
            overlay_size: None,
            private_passwd: false,
            private_tmp: false,
            writable: false,
            ldconfigs: vec![],
            initial_dir: None,
            seccomp: false,
            username: "charlie".into(),
        }
    }

    #[test]
    fn duplicate_skip_keeps_first() {
        let mut list = vec![];
        add(&mut list, HookDup::Ok, Hook::new("a", |_| Ok(()))).unwrap();
        add(&mut list, HookDup::Skip, Hook::new("a", |_| Ok(()))).unwrap();
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn duplicate_fail_errors() {
        let mut list = vec![];
        add(&mut list, HookDup::Ok, Hook::new("a", |_| Ok(()))).unwrap();
        let err = add(&mut list, HookDup::Fail, Hook::new("a", |_| Ok(())));
        assert!(err.is_err());
    }

    #[test]
    fn hooks_run_in_order_and_clear() {
        let mut cfg = empty_config();
        add(&mut cfg.hooks_prestart, HookDup::Ok, Hook::new("set-uid", |c| {
            c.container_uid = 42;
            Ok(())
        }))
        .unwrap();
        run(&mut cfg).unwrap();
        assert_eq!(cfg.container_uid, 42);
        assert!(cfg.hooks_prestart.is_empty());
    }
}
