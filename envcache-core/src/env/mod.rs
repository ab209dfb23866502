//! Environment lifecycle management
//!
//! An environment is a toolchain tree installed under
//! `basedir/target=<target>/<name>` and used as a chroot for remote compile
//! jobs. The submodules cover accounting, discovery, installation,
//! verification and eviction of those trees, plus the native tarball built
//! from the node's own compiler.

pub mod catalog;
pub mod installer;
pub mod janitor;
pub mod native;
pub mod remover;
pub mod sniff;
pub mod tree;
pub mod verifier;

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{EnvError, Result};

/// Prefix of per-target directories below the base directory.
pub const TARGET_PREFIX: &str = "target=";

/// Subdirectory of the base directory holding native tarballs.
pub const NATIVE_DIR: &str = "native";

/// Identifies an installed environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EnvironmentId {
    pub target: String,
    pub name: String,
}

impl EnvironmentId {
    pub fn new(target: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            name: name.into(),
        }
    }

    /// `basedir/target=<target>`
    pub fn target_dir(&self, basedir: &Path) -> PathBuf {
        target_dir(basedir, &self.target)
    }

    /// `basedir/target=<target>/<name>`
    pub fn dir(&self, basedir: &Path) -> PathBuf {
        self.target_dir(basedir).join(&self.name)
    }
}

impl fmt::Display for EnvironmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.target, self.name)
    }
}

pub fn target_dir(basedir: &Path, target: &str) -> PathBuf {
    basedir.join(format!("{TARGET_PREFIX}{target}"))
}

/// Reject names that could escape the target directory.
///
/// Only printable, non-whitespace ASCII other than `/` is accepted, and the
/// directory aliases `.` and `..` are refused.
pub fn validate_name(name: &str) -> Result<()> {
    let legal = !matches!(name, "" | "." | "..")
        && name
            .bytes()
            .all(|b| b.is_ascii_graphic() && b != b'/');
    if legal {
        Ok(())
    } else {
        Err(EnvError::IllegalName(name.to_string()))
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_paths() {
        let id = EnvironmentId::new("x86_64", "abc");
        let base = Path::new("/var/cache/envcache");
        assert_eq!(
            id.target_dir(base),
            PathBuf::from("/var/cache/envcache/target=x86_64")
        );
        assert_eq!(
            id.dir(base),
            PathBuf::from("/var/cache/envcache/target=x86_64/abc")
        );
        assert_eq!(id.to_string(), "x86_64/abc");
    }

    #[test]
    fn test_validate_name_accepts_printable() {
        assert!(validate_name("abc").is_ok());
        assert!(validate_name("0123abcdef.tar.gz").is_ok());
        assert!(validate_name("...").is_ok());
    }

    #[test]
    fn test_validate_name_rejects() {
        for bad in ["", ".", "..", "a/b", "/", "a b", "tab\there", "nl\n", "\u{7f}", "é", "\0"] {
            assert!(
                matches!(validate_name(bad), Err(EnvError::IllegalName(_))),
                "{bad:?} should be rejected"
            );
        }
    }
}
