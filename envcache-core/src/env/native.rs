//! Native environment construction
//!
//! Packages the node's own compiler into a tarball under `basedir/native/`
//! by running the packaging helper as the build identity. The helper writes
//! the produced file name, newline terminated, to descriptor 5 just before
//! exiting; [`NativeEnvironmentBuilder::finish`] reads it until EOF.
//!
//! A built tarball stays valid as long as the compiler binaries keep the
//! modification times captured in its [`CompilerFingerprint`].

use std::ffi::OsStr;
use std::fs::{self, DirBuilder, File, Permissions};
use std::io::{self, Read};
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{chown, DirBuilderExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use nix::unistd::{access, AccessFlags};
use tracing::{debug, error, info, warn};

use super::validate_name;
use crate::config::{EnvConfig, ToolPaths};
use crate::engine::isolation::JailConfig;
use crate::error::{EnvError, Result};
use crate::executor::{cloexec_pipe, describe_status, IsolatedTask, TaskHandle};

/// Descriptor on which the helper reports the tarball name.
pub const RESULT_FD: RawFd = 5;

const NATIVE_DIR_MODE: u32 = 0o775;

/// Compiler family to package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompilerKind {
    #[default]
    Gcc,
    Clang,
}

impl CompilerKind {
    /// `"clang"` selects clang; anything else means gcc.
    pub fn parse(name: &str) -> Self {
        if name == "clang" {
            Self::Clang
        } else {
            Self::Gcc
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gcc => "gcc",
            Self::Clang => "clang",
        }
    }

    /// Binaries that must be present and executable to build this kind.
    fn required_binaries(self, tools: &ToolPaths) -> Vec<&Path> {
        match self {
            Self::Gcc => vec![tools.gcc.as_path(), tools.gxx.as_path()],
            Self::Clang => vec![tools.clang.as_path()],
        }
    }
}

/// Modification times of the host compilers, 0 where a binary is missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompilerFingerprint {
    pub gcc: i64,
    pub gxx: i64,
    pub clang: i64,
}

impl CompilerFingerprint {
    pub fn capture(tools: &ToolPaths) -> Self {
        Self {
            gcc: mtime(&tools.gcc),
            gxx: mtime(&tools.gxx),
            clang: mtime(&tools.clang),
        }
    }

    /// False as soon as any compiler changed, appeared or disappeared.
    pub fn is_current(&self, tools: &ToolPaths) -> bool {
        *self == Self::capture(tools)
    }
}

fn mtime(path: &Path) -> i64 {
    fs::metadata(path).map_or(0, |meta| meta.mtime())
}

/// A packaging run in progress.
#[derive(Debug)]
pub struct NativeBuild {
    task: TaskHandle,
    output: File,
    native_dir: PathBuf,
    fingerprint: CompilerFingerprint,
}

/// Result of a successful native build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeTarball {
    pub path: PathBuf,
    pub size: u64,
    pub fingerprint: CompilerFingerprint,
}

#[derive(Debug, Clone)]
pub struct NativeEnvironmentBuilder {
    config: EnvConfig,
}

impl NativeEnvironmentBuilder {
    pub fn new(config: EnvConfig) -> Self {
        Self { config }
    }

    /// Start packaging the local `kind` compiler plus `extra_files`.
    ///
    /// Returns `Ok(None)` when the compiler is not installed.
    pub fn begin(&self, kind: CompilerKind, extra_files: &[PathBuf]) -> Result<Option<NativeBuild>> {
        let tools = &self.config.tools;
        let missing = kind
            .required_binaries(tools)
            .into_iter()
            .find(|bin| access(*bin, AccessFlags::X_OK).is_err());
        if let Some(bin) = missing {
            info!(compiler = kind.as_str(), missing = %bin.display(), "Native environment unavailable");
            return Ok(None);
        }

        let fingerprint = CompilerFingerprint::capture(tools);
        let native_dir = self.config.native_dir();
        self.prepare_native_dir(&native_dir)?;

        let (read, write) = cloexec_pipe().map_err(|e| EnvError::io("pipe", &native_dir, e))?;
        let jail = JailConfig::identity(self.config.build_uid, self.config.build_gid)
            .with_workdir(&native_dir)
            .map_err(|e| EnvError::io("workdir", &native_dir, e))?;

        let task = IsolatedTask::new(&tools.create_env)
            .arg("--build-native")
            .arg(kind.as_str())
            .args(extra_files)
            .jail(jail)
            .quiet_stdout()
            .output_fd(write, RESULT_FD)
            .spawn()
            .map_err(|e| {
                error!(helper = %tools.create_env.display(), error = %e, "Failed to start packaging helper");
                EnvError::Spawn {
                    program: tools.create_env.display().to_string(),
                    source: e,
                }
            })?;

        info!(compiler = kind.as_str(), pid = %task.pid(), "Building native environment");
        Ok(Some(NativeBuild {
            task,
            output: File::from(read),
            native_dir,
            fingerprint,
        }))
    }

    fn prepare_native_dir(&self, native_dir: &Path) -> Result<()> {
        match DirBuilder::new().mode(NATIVE_DIR_MODE).create(native_dir) {
            Err(e) if e.kind() != io::ErrorKind::AlreadyExists => {
                return Err(EnvError::io("mkdir", native_dir, e));
            }
            _ => {}
        }

        chown(native_dir, Some(self.config.build_uid), Some(self.config.build_gid))
            .and_then(|()| fs::set_permissions(native_dir, Permissions::from_mode(NATIVE_DIR_MODE)))
            .map_err(|e| {
                error!(dir = %native_dir.display(), error = %e, "chown/chmod failed");
                if let Err(e) = fs::remove_dir(native_dir) {
                    warn!(dir = %native_dir.display(), error = %e, "rmdir failed");
                }
                EnvError::io("chown/chmod", native_dir, e)
            })
    }

    /// Wait for the helper to close its result descriptor and locate the
    /// tarball it produced.
    ///
    /// Returns `None` when nothing was produced; the then empty native
    /// directory is removed.
    pub fn finish(&self, mut build: NativeBuild) -> Option<NativeTarball> {
        let mut reported = Vec::new();
        if let Err(e) = build.output.read_to_end(&mut reported) {
            warn!(error = %e, "Reading helper output failed");
        }
        drop(build.output);

        match build.task.wait() {
            Ok(status) if !status.success() => {
                warn!(status = %describe_status(status), "Packaging helper failed");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to wait for packaging helper"),
        }

        let line = reported
            .split(|b| *b == b'\n')
            .next()
            .unwrap_or_default();
        let name = OsStr::from_bytes(line);
        debug!(name = ?name, "Native environment reported");

        let produced = name
            .to_str()
            .filter(|name| validate_name(name).is_ok())
            .map(|name| build.native_dir.join(name))
            .and_then(|path| fs::metadata(&path).ok().map(|meta| (path, meta.len())));

        match produced {
            Some((path, size)) => {
                info!(path = %path.display(), size, "Native environment built");
                Some(NativeTarball {
                    path,
                    size,
                    fingerprint: build.fingerprint,
                })
            }
            None => {
                if let Err(e) = fs::remove_dir(&build.native_dir) {
                    warn!(dir = %build.native_dir.display(), error = %e, "rmdir failed");
                }
                None
            }
        }
    }
}
