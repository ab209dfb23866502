//! Eviction of installed environments and native tarballs.

use std::fs;
use std::io;
use std::path::Path;

use tracing::{error, info, warn};

use super::{target_dir, tree, EnvironmentId};
use crate::config::EnvConfig;
use crate::executor::{describe_status, IsolatedTask};

/// Deletes environment trees, reporting reclaimed bytes.
#[derive(Debug, Clone)]
pub struct EnvironmentRemover {
    config: EnvConfig,
}

impl EnvironmentRemover {
    pub fn new(config: EnvConfig) -> Self {
        Self { config }
    }

    /// Remove one environment. Returns its size before removal, or 0 when
    /// the removal process could not be run to completion.
    pub fn remove(&self, id: &EnvironmentId) -> u64 {
        let size = self.remove_tree(&id.dir(&self.config.basedir));
        info!(env = %id, size, "Removed environment");
        size
    }

    /// Remove every environment of `target`, including its `target=` dir.
    pub fn remove_target(&self, target: &str) -> u64 {
        let size = self.remove_tree(&target_dir(&self.config.basedir, target));
        info!(target, size, "Removed target");
        size
    }

    fn remove_tree(&self, dir: &Path) -> u64 {
        let size = tree::sum_dir(dir);

        // Extracted trees keep the peer's modes; a read-only directory
        // would otherwise stop rm for anyone but root.
        tree::make_removable(dir);

        // `--` keeps a name starting with '-' from being parsed as a flag
        let spawned = IsolatedTask::new(&self.config.tools.rm)
            .args(["-rf", "--"])
            .arg(dir)
            .default_signals()
            .spawn();

        let mut task = match spawned {
            Ok(task) => task,
            Err(e) => {
                error!(dir = %dir.display(), error = %e, "Failed to fork rm");
                return 0;
            }
        };

        match task.wait() {
            Ok(status) if status.code().is_some() => {
                if !status.success() {
                    warn!(dir = %dir.display(), status = %describe_status(status), "rm reported failure");
                }
                size
            }
            Ok(status) => {
                // killed: assume nothing was freed
                warn!(dir = %dir.display(), status = %describe_status(status), "rm did not finish");
                0
            }
            Err(e) => {
                error!(dir = %dir.display(), error = %e, "Failed to wait for rm");
                0
            }
        }
    }
}

/// Delete a native environment tarball, returning its former size.
///
/// An empty path or a missing file yields 0.
pub fn remove_native(path: &Path) -> u64 {
    if path.as_os_str().is_empty() {
        return 0;
    }

    let size = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) => {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "stat of native environment failed");
            }
            return 0;
        }
    };

    if let Err(e) = fs::remove_file(path) {
        error!(path = %path.display(), error = %e, "unlink failed");
    }
    size
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::test_support::test_config;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    #[test]
    fn test_remove_returns_size_and_deletes() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(tmp.path());
        if !config.tools.rm.exists() {
            return;
        }
        let id = EnvironmentId::new("x86_64", "env1");
        let dir = id.dir(tmp.path());
        fs::create_dir_all(dir.join("usr/bin")).unwrap();
        fs::write(dir.join("usr/bin/as"), vec![0u8; 300]).unwrap();
        fs::write(dir.join("README"), vec![0u8; 12]).unwrap();

        let remover = EnvironmentRemover::new(config);
        assert_eq!(remover.remove(&id), 312);
        assert!(!dir.exists());
        assert!(id.target_dir(tmp.path()).exists());
    }

    #[test]
    fn test_remove_with_read_only_directories() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(tmp.path());
        if !config.tools.rm.exists() {
            return;
        }
        let id = EnvironmentId::new("x86_64", "ro");
        let dir = id.dir(tmp.path());
        fs::create_dir_all(dir.join("usr/bin")).unwrap();
        fs::write(dir.join("usr/bin/as"), vec![0u8; 100]).unwrap();
        fs::set_permissions(dir.join("usr/bin"), fs::Permissions::from_mode(0o555)).unwrap();
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o555)).unwrap();

        assert_eq!(EnvironmentRemover::new(config).remove(&id), 100);
        assert!(!dir.exists());
    }

    #[test]
    fn test_remove_dash_name() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(tmp.path());
        if !config.tools.rm.exists() {
            return;
        }
        let id = EnvironmentId::new("x86_64", "-rf");
        fs::create_dir_all(id.dir(tmp.path())).unwrap();
        fs::write(id.dir(tmp.path()).join("f"), b"abc").unwrap();

        assert_eq!(EnvironmentRemover::new(config).remove(&id), 3);
        assert!(!id.dir(tmp.path()).exists());
    }

    #[test]
    fn test_remove_missing_environment() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(tmp.path());
        if !config.tools.rm.exists() {
            return;
        }
        let remover = EnvironmentRemover::new(config);
        assert_eq!(remover.remove(&EnvironmentId::new("x86_64", "nope")), 0);
    }

    #[test]
    fn test_remove_without_rm_tool_reports_zero() {
        let tmp = TempDir::new().unwrap();
        let mut config = test_config(tmp.path());
        config.tools.rm = tmp.path().join("no-such-rm");
        let id = EnvironmentId::new("x86_64", "env1");
        fs::create_dir_all(id.dir(tmp.path())).unwrap();
        fs::write(id.dir(tmp.path()).join("f"), b"abc").unwrap();

        assert_eq!(EnvironmentRemover::new(config).remove(&id), 0);
        assert!(id.dir(tmp.path()).exists());
    }

    #[test]
    fn test_remove_target() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(tmp.path());
        if !config.tools.rm.exists() {
            return;
        }
        for name in ["a", "b"] {
            let dir = EnvironmentId::new("arm", name).dir(tmp.path());
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("f"), b"12345").unwrap();
        }

        assert_eq!(EnvironmentRemover::new(config).remove_target("arm"), 10);
        assert!(!target_dir(tmp.path(), "arm").exists());
    }

    #[test]
    fn test_remove_native() {
        let tmp = TempDir::new().unwrap();
        let tarball = tmp.path().join("native.tar.gz");
        fs::write(&tarball, vec![1u8; 42]).unwrap();

        assert_eq!(remove_native(&tarball), 42);
        assert!(!tarball.exists());
        assert_eq!(remove_native(&tarball), 0);
        assert_eq!(remove_native(Path::new("")), 0);
    }
}
