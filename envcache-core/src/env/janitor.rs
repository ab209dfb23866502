//! Cache directory reset on daemon startup.

use std::fs::{self, DirBuilder, Permissions};
use std::io;
use std::os::unix::fs::{chown, DirBuilderExt, PermissionsExt};
use std::path::Path;

use nix::unistd::{access, AccessFlags};
use tracing::{error, info, warn};

use super::tree;
use crate::error::{EnvError, Result};

/// Mode of the base directory: owner and group rwx, others r-x.
pub const BASEDIR_MODE: u32 = 0o775;

/// Wipe everything below `basedir` and hand the (re)created directory to
/// the build identity.
///
/// A base directory that does not exist yet is simply created, and one the
/// daemon cannot read is left uncleared but still handed over. Any failure
/// while clearing aborts the reset.
pub fn reset(basedir: &Path, uid: u32, gid: u32) -> Result<()> {
    match fs::symlink_metadata(basedir) {
        Ok(_) if access(basedir, AccessFlags::R_OK).is_err() => {
            warn!(basedir = %basedir.display(), "Environment dir not readable, skipping cleanup");
        }
        Ok(_) => {
            tree::clear_dir(basedir).map_err(|e| {
                error!(basedir = %basedir.display(), "Failed to clean up environment dir");
                EnvError::io("clean up", basedir, e)
            })?;
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(EnvError::io("stat", basedir, e)),
    }

    if let Err(e) = DirBuilder::new().mode(0o755).create(basedir) {
        match e.kind() {
            io::ErrorKind::AlreadyExists => {}
            io::ErrorKind::PermissionDenied => {
                error!(basedir = %basedir.display(), "Permission denied on mkdir");
                return Err(EnvError::PermissionDenied(basedir.to_path_buf()));
            }
            _ => {
                error!(basedir = %basedir.display(), error = %e, "mkdir of environment dir failed");
                return Err(EnvError::io("mkdir", basedir, e));
            }
        }
    }

    chown(basedir, Some(uid), Some(gid))
        .and_then(|()| fs::set_permissions(basedir, Permissions::from_mode(BASEDIR_MODE)))
        .map_err(|e| {
            error!(basedir = %basedir.display(), error = %e, "chown/chmod of environment dir failed");
            EnvError::io("chown/chmod", basedir, e)
        })?;

    info!(basedir = %basedir.display(), uid, gid, "Environment cache reset");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::MetadataExt;
    use tempfile::TempDir;

    fn current_ids() -> (u32, u32) {
        (
            nix::unistd::getuid().as_raw(),
            nix::unistd::getgid().as_raw(),
        )
    }

    #[test]
    fn test_reset_empties_and_fixes_ownership() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().join("envs");
        fs::create_dir_all(base.join("target=x86_64/env1/usr/bin")).unwrap();
        fs::write(base.join("target=x86_64/env1/usr/bin/as"), b"as").unwrap();
        fs::write(base.join("stray"), b"x").unwrap();
        let (uid, gid) = current_ids();

        reset(&base, uid, gid).unwrap();

        let meta = fs::metadata(&base).unwrap();
        assert!(meta.is_dir());
        assert_eq!(fs::read_dir(&base).unwrap().count(), 0);
        assert_eq!(meta.uid(), uid);
        assert_eq!(meta.gid(), gid);
        assert_eq!(meta.mode() & 0o7777, BASEDIR_MODE);
    }

    #[test]
    fn test_reset_creates_missing_basedir() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().join("fresh");
        let (uid, gid) = current_ids();

        reset(&base, uid, gid).unwrap();

        let meta = fs::metadata(&base).unwrap();
        assert!(meta.is_dir());
        assert_eq!(meta.mode() & 0o7777, BASEDIR_MODE);
    }

    #[test]
    fn test_reset_fails_when_parent_missing() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().join("a/b/c");
        let (uid, gid) = current_ids();

        assert!(reset(&base, uid, gid).is_err());
    }

    #[test]
    fn test_reset_skips_cleanup_of_unreadable_basedir() {
        if nix::unistd::getuid().is_root() {
            return;
        }
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().join("envs");
        fs::create_dir_all(&base).unwrap();
        fs::write(base.join("stray"), b"x").unwrap();
        fs::set_permissions(&base, Permissions::from_mode(0o000)).unwrap();
        let (uid, gid) = current_ids();

        reset(&base, uid, gid).unwrap();

        let meta = fs::metadata(&base).unwrap();
        assert_eq!(meta.mode() & 0o7777, BASEDIR_MODE);
        assert!(base.join("stray").exists());
    }
}
