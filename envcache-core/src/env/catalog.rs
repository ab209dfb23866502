//! Discovery of installed environments.
//!
//! There is no manifest: a directory below `target=<target>/` counts as an
//! environment when it holds an executable `usr/bin/as`.

use std::fs;
use std::path::Path;

use nix::unistd::{access, AccessFlags};
use tracing::{debug, info};

use super::{EnvironmentId, TARGET_PREFIX};

/// Relative path probed to decide whether a toolchain tree is complete.
pub const TOOLCHAIN_PROBE: &str = "usr/bin/as";

/// List installed environments below `basedir`. Order is unspecified.
///
/// Unreadable directories contribute nothing.
pub fn list(basedir: &Path) -> Vec<EnvironmentId> {
    let mut envs = Vec::new();

    let entries = match fs::read_dir(basedir) {
        Ok(entries) => entries,
        Err(e) => {
            info!(basedir = %basedir.display(), error = %e, "Can't open environment dir");
            return envs;
        }
    };

    for entry in entries.flatten() {
        let dirname = entry.file_name();
        let Some(dirname) = dirname.to_str() else {
            continue;
        };
        if dirname.starts_with('.') {
            continue;
        }
        if let Some(target) = dirname.strip_prefix(TARGET_PREFIX) {
            list_target(target, &entry.path(), &mut envs);
        }
    }

    debug!(count = envs.len(), "Listed environments");
    envs
}

fn list_target(target: &str, target_dir: &Path, envs: &mut Vec<EnvironmentId>) {
    let Ok(entries) = fs::read_dir(target_dir) else {
        return;
    };

    for entry in entries.flatten() {
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        if access(&entry.path().join(TOOLCHAIN_PROBE), AccessFlags::X_OK).is_ok() {
            envs.push(EnvironmentId::new(target, name));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn add_tool(dir: &Path, rel: &str, mode: u32) {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"#!/bin/sh\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
    }

    #[test]
    fn test_list_finds_complete_environments() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path();
        add_tool(&base.join("target=x86_64/env1"), TOOLCHAIN_PROBE, 0o755);
        add_tool(&base.join("target=x86_64/env2"), TOOLCHAIN_PROBE, 0o755);
        add_tool(&base.join("target=aarch64/env3"), TOOLCHAIN_PROBE, 0o755);
        // incomplete: no assembler
        fs::create_dir_all(base.join("target=x86_64/partial/usr/bin")).unwrap();
        // tmp dir created after installs
        fs::create_dir_all(base.join("target=x86_64/tmp")).unwrap();

        let found: BTreeSet<_> = list(base).into_iter().collect();
        let expected: BTreeSet<_> = [
            EnvironmentId::new("x86_64", "env1"),
            EnvironmentId::new("x86_64", "env2"),
            EnvironmentId::new("aarch64", "env3"),
        ]
        .into_iter()
        .collect();
        assert_eq!(found, expected);
    }

    #[test]
    fn test_list_skips_non_target_and_hidden_dirs() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path();
        add_tool(&base.join("native/env"), TOOLCHAIN_PROBE, 0o755);
        add_tool(&base.join(".target=x86_64/env"), TOOLCHAIN_PROBE, 0o755);
        add_tool(&base.join("other/env"), TOOLCHAIN_PROBE, 0o755);

        assert!(list(base).is_empty());
    }

    #[test]
    fn test_list_requires_executable_probe() {
        let tmp = TempDir::new().unwrap();
        add_tool(&tmp.path().join("target=x86_64/env1"), TOOLCHAIN_PROBE, 0o644);
        assert!(list(tmp.path()).is_empty());
    }

    #[test]
    fn test_list_missing_base_is_empty() {
        let tmp = TempDir::new().unwrap();
        assert!(list(&tmp.path().join("missing")).is_empty());
    }

    #[test]
    fn test_list_empty_target_name() {
        let tmp = TempDir::new().unwrap();
        add_tool(&tmp.path().join("target=/env1"), TOOLCHAIN_PROBE, 0o755);
        assert_eq!(list(tmp.path()), vec![EnvironmentId::new("", "env1")]);
    }
}
