//! CDI-style device-injection manifest parsing.
//!
//! The original's JSON-consuming paths are treated as opaque input here:
//! we parse a flat object describing environment variables, extra bind
//! mounts, and dynamic-linker directories to register, and hand the
//! result to the container builder as ordinary [`crate::hooks::Hook`]
//! edits. No schema validation beyond what `serde` enforces structurally.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::config::{BindDependency, BindRequest, ContainerConfig};

#[derive(Debug, Deserialize, Default)]
pub struct Manifest {
    #[serde(default)]
    pub env: Vec<EnvEdit>,
    #[serde(default)]
    pub binds: Vec<BindEdit>,
    #[serde(default)]
    pub ldconfig_dirs: Vec<PathBuf>,
}

#[derive(Debug, Deserialize)]
pub struct EnvEdit {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Deserialize)]
pub struct BindEdit {
    pub source: PathBuf,
    pub dest: PathBuf,
    #[serde(default)]
    pub optional: bool,
}

/// Parse a manifest from its JSON text.
pub fn parse(text: &str) -> Result<Manifest> {
    serde_json::from_str(text).context("can't parse device-injection manifest")
}

/// Fold a parsed manifest's edits into the container configuration: extra
/// binds are appended to `cfg.binds`; `ldconfig_dirs` are appended for the
/// dynamic-linker-cache hook (§4.6); environment edits are applied via a
/// dedicated pre-start hook so they run in the same pass as the
/// default front/end hooks, in manifest order.
pub fn apply(cfg: &mut ContainerConfig, manifest: Manifest) -> Result<()> {
    for edit in &manifest.binds {
        let dep = if edit.optional { BindDependency::Optional } else { BindDependency::Required };
        cfg.binds.push(BindRequest::new(edit.source.clone(), edit.dest.clone(), dep));
    }
    cfg.ldconfigs.extend(manifest.ldconfig_dirs.iter().cloned());

    if !manifest.env.is_empty() {
        let hook = crate::hooks::Hook::new("cdi-env", move |_cfg: &mut ContainerConfig| {
            for edit in &manifest.env {
                // SAFETY: hooks run single-threaded during container setup,
                // before the user command is spawned.
                unsafe {
                    std::env::set_var(&edit.name, &edit.value);
                }
            }
            Ok(())
        });
        crate::hooks::add(&mut cfg.hooks_prestart, crate::hooks::HookDup::Ok, hook)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flat_manifest() {
        let text = r#"{
            "env": [{"name": "FOO", "value": "bar"}],
            "binds": [{"source": "/dev/nvidia0", "dest": "/dev/nvidia0", "optional": true}],
            "ldconfig_dirs": ["/usr/lib/x86_64-linux-gnu"]
        }"#;
        let manifest = parse(text).unwrap();
        assert_eq!(manifest.env.len(), 1);
        assert_eq!(manifest.binds.len(), 1);
        assert_eq!(manifest.ldconfig_dirs.len(), 1);
    }

    #[test]
    fn missing_fields_default_to_empty() {
        let manifest = parse("{}").unwrap();
        assert!(manifest.env.is_empty());
        assert!(manifest.binds.is_empty());
        assert!(manifest.ldconfig_dirs.is_empty());
    }
}
