//! Daemon configuration for the environment cache.
//!
//! Every field has a default, so a config file only needs to name what
//! differs. Tool locations are configurable mostly so tests and unusual
//! distributions can point at other binaries.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Configuration consumed by every environment operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvConfig {
    /// Root of the environment cache.
    pub basedir: PathBuf,
    /// Unprivileged identity owning the cache and running all tools.
    pub build_uid: u32,
    pub build_gid: u32,
    /// Niceness increment applied to the tarball extractor.
    pub extract_niceness: i32,
    /// How long to wait for the first chunk of an environment transfer.
    pub first_chunk_timeout_secs: u64,
    /// Executable inside an environment run to verify it, relative to the
    /// environment root.
    pub verify_marker: PathBuf,
    pub tools: ToolPaths,
}

/// Host binaries invoked by the environment operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    pub tar: PathBuf,
    pub rm: PathBuf,
    /// Packaging helper invoked with `--build-native`.
    pub create_env: PathBuf,
    pub gcc: PathBuf,
    pub gxx: PathBuf,
    pub clang: PathBuf,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            basedir: PathBuf::from("/var/cache/envcache"),
            build_uid: 65534,
            build_gid: 65534,
            extract_niceness: 5,
            first_chunk_timeout_secs: 30,
            verify_marker: PathBuf::from("bin/true"),
            tools: ToolPaths::default(),
        }
    }
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            tar: PathBuf::from("/bin/tar"),
            rm: PathBuf::from("/bin/rm"),
            create_env: PathBuf::from("/usr/libexec/envcache/envcache-create-env"),
            gcc: PathBuf::from("/usr/bin/gcc"),
            gxx: PathBuf::from("/usr/bin/g++"),
            clang: PathBuf::from("/usr/bin/clang"),
        }
    }
}

impl EnvConfig {
    /// Load a JSON configuration file and validate it.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.basedir.is_absolute() {
            bail!("basedir must be absolute: {}", self.basedir.display());
        }
        if !(0..=19).contains(&self.extract_niceness) {
            bail!("extract_niceness must be within 0..=19, got {}", self.extract_niceness);
        }
        if self.verify_marker.is_absolute() {
            bail!(
                "verify_marker must be relative to the environment: {}",
                self.verify_marker.display()
            );
        }
        if self.build_uid == 0 {
            bail!("build_uid must not be root");
        }
        Ok(())
    }

    pub fn first_chunk_timeout(&self) -> Duration {
        Duration::from_secs(self.first_chunk_timeout_secs)
    }

    pub fn native_dir(&self) -> PathBuf {
        self.basedir.join(crate::env::NATIVE_DIR)
    }
}
