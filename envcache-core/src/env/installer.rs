//! Installation of peer-supplied environment tarballs.
//!
//! ```text
//! AwaitingFirstChunk ──begin──▶ Extracting (PendingInstall) ──finish──▶ Done(size) | Failed
//! ```
//!
//! `begin` validates the request, waits for the first file chunk, creates
//! the environment directory exclusively and starts `tar` as the build
//! identity reading from a pipe. The caller streams the rest of the
//! transfer through the returned [`PendingInstall`] and hands it back to
//! `finish`, which reaps the extractor and accounts the installed tree.

use std::fs::{self, DirBuilder, Permissions};
use std::io::{self, Write};
use std::os::unix::fs::{chown, DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::process::ChildStdin;
use std::time::Duration;

use nix::errno::Errno;
use nix::unistd::Pid;
use tracing::{debug, error, info, warn};

use super::remover::EnvironmentRemover;
use super::sniff::Compression;
use super::{tree, validate_name, EnvironmentId};
use crate::channel::{Channel, Message};
use crate::config::EnvConfig;
use crate::engine::isolation::{JailConfig, JailFailure, JailStep};
use crate::error::{EnvError, Result};
use crate::executor::{describe_status, IsolatedTask, TaskHandle};

/// Mode of target and environment directories.
const ENV_DIR_MODE: u32 = 0o770;

/// Mode of the per-environment scratch directory: world-writable, sticky.
const TMP_DIR_MODE: u32 = 0o1777;

/// An extraction in progress.
///
/// Hand it back to [`EnvironmentInstaller::finish`]. Dropping it instead
/// kills the extractor and removes the partial environment.
#[derive(Debug)]
pub struct PendingInstall {
    id: EnvironmentId,
    remover: EnvironmentRemover,
    install_dir: PathBuf,
    task: TaskHandle,
    stdin: Option<ChildStdin>,
    first_chunk: Vec<u8>,
    compression: Compression,
    broken: bool,
    reaped: bool,
}

impl PendingInstall {
    pub fn id(&self) -> &EnvironmentId {
        &self.id
    }

    pub fn pid(&self) -> Pid {
        self.task.pid()
    }

    pub fn install_dir(&self) -> &Path {
        &self.install_dir
    }

    /// The first chunk received from the peer. It has not been written to
    /// the extractor yet.
    pub fn first_chunk(&self) -> &[u8] {
        &self.first_chunk
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// Write a chunk of the tarball to the extractor.
    ///
    /// Once a write fails the install is marked broken and
    /// [`EnvironmentInstaller::finish`] will report failure.
    pub fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(EnvError::BrokenPipe);
        };
        match stdin.write_all(data) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.broken = true;
                self.stdin = None;
                if e.kind() == io::ErrorKind::BrokenPipe {
                    warn!(env = %self.id, "Extractor closed its input");
                    Err(EnvError::BrokenPipe)
                } else {
                    Err(EnvError::io("write to extractor", &self.install_dir, e))
                }
            }
        }
    }

    /// Write the first chunk, then every following chunk from `channel`
    /// until the end of the transfer. Returns the number of bytes written.
    pub fn feed(&mut self, channel: &mut dyn Channel, timeout: Duration) -> Result<u64> {
        let first = std::mem::take(&mut self.first_chunk);
        self.write_chunk(&first)?;
        let mut written = first.len() as u64;

        loop {
            match channel.get_msg(timeout) {
                Some(Message::FileChunk(data)) => {
                    self.write_chunk(&data)?;
                    written += data.len() as u64;
                }
                Some(Message::End) => break,
                Some(other) => {
                    self.broken = true;
                    return Err(EnvError::UnexpectedMessage(other.kind().to_string()));
                }
                None => {
                    self.broken = true;
                    return Err(EnvError::NoMessage);
                }
            }
        }

        debug!(env = %self.id, bytes = written, "Transfer complete");
        Ok(written)
    }
}

/// Installs environments received over a [`Channel`].
#[derive(Debug, Clone)]
pub struct EnvironmentInstaller {
    config: EnvConfig,
}

impl EnvironmentInstaller {
    pub fn new(config: EnvConfig) -> Self {
        Self { config }
    }

    /// Start installing `id` from the transfer arriving on `channel`.
    ///
    /// Illegal names are rejected before anything touches the filesystem.
    /// An existing environment directory is never reused or overwritten.
    pub fn begin(&self, id: &EnvironmentId, channel: &mut dyn Channel) -> Result<PendingInstall> {
        for part in [&id.target, &id.name] {
            if let Err(e) = validate_name(part) {
                error!(env = ?part, "Illegal name for environment - rejecting");
                return Err(e);
            }
        }

        let first_chunk = match channel.get_msg(self.config.first_chunk_timeout()) {
            Some(Message::FileChunk(data)) => data,
            Some(other) => {
                debug!(kind = other.kind(), "Expected first file chunk");
                return Err(EnvError::UnexpectedMessage(other.kind().to_string()));
            }
            None => {
                debug!("Expected first file chunk, got nothing");
                return Err(EnvError::NoMessage);
            }
        };
        let compression = Compression::sniff(&first_chunk);

        let uid = self.config.build_uid;
        let gid = self.config.build_gid;
        let target_dir = id.target_dir(&self.config.basedir);
        create_owned_dir(&target_dir, uid, gid, false)?;

        // The exclusive create of this directory is the only guard against
        // two concurrent installs of the same environment.
        let install_dir = id.dir(&self.config.basedir);
        create_owned_dir(&install_dir, uid, gid, true)?;

        let spawned = IsolatedTask::new(&self.config.tools.tar)
            .arg("-xC")
            .arg(&install_dir)
            .args(compression.tar_flag())
            .jail(JailConfig::identity(uid, gid))
            .stdin_pipe()
            .niceness(self.config.extract_niceness)
            .default_signals()
            .spawn();

        let mut task = match spawned {
            Ok(task) => task,
            Err(e) => {
                error!(env = %id, error = %e, "Failed to run tar");
                if let Err(e) = fs::remove_dir(&install_dir) {
                    warn!(dir = %install_dir.display(), error = %e, "Failed to remove empty environment dir");
                }
                return Err(EnvError::Spawn {
                    program: self.config.tools.tar.display().to_string(),
                    source: e,
                });
            }
        };

        info!(env = %id, pid = %task.pid(), ?compression, "Extracting environment");
        let stdin = task.take_stdin();

        Ok(PendingInstall {
            id: id.clone(),
            remover: EnvironmentRemover::new(self.config.clone()),
            install_dir,
            task,
            stdin,
            first_chunk,
            compression,
            broken: false,
            reaped: false,
        })
    }

    /// Wait for the extractor and return the installed size in bytes.
    ///
    /// A failed extraction removes the partial environment.
    pub fn finish(&self, mut pending: PendingInstall) -> Result<u64> {
        drop(pending.stdin.take());

        let waited = pending.task.wait();
        pending.reaped = true;

        let failure = match waited {
            Ok(status) if status.success() && !pending.broken => None,
            Ok(_) if pending.broken => Some(EnvError::BrokenPipe),
            Ok(status) => match status.code().and_then(JailStep::from_exit_code) {
                Some(step) => {
                    error!(env = %pending.id, %step, "Extractor could not enter its jail");
                    // the child's errno does not survive its exit
                    Some(EnvError::Fatal(JailFailure {
                        step,
                        errno: Errno::UnknownErrno,
                    }))
                }
                None => {
                    error!(env = %pending.id, status = %describe_status(status), "Extraction failed");
                    Some(EnvError::ExtractFailed(status.code()))
                }
            },
            Err(e) => Some(EnvError::io("wait for extractor", &pending.install_dir, e)),
        };

        if let Some(err) = failure {
            pending.remover.remove(&pending.id);
            return Err(err);
        }

        let tmp = pending.install_dir.join("tmp");
        if let Err(e) = setup_tmp(&tmp, self.config.build_uid, self.config.build_gid) {
            warn!(dir = %tmp.display(), error = %e, "Failed to set up tmp dir");
        }

        let size = tree::sum_dir(&pending.install_dir);
        info!(env = %pending.id, size, "Environment installed");
        Ok(size)
    }
}

impl Drop for PendingInstall {
    fn drop(&mut self) {
        if self.reaped {
            return;
        }
        warn!(env = %self.id, pid = %self.task.pid(), "Abandoned install, killing extractor");
        drop(self.stdin.take());
        let _ = self.task.kill();
        if let Err(e) = self.task.wait() {
            error!(env = %self.id, error = %e, "Failed to reap extractor");
        }
        self.remover.remove(&self.id);
    }
}

/// Create `dir` owned by the build identity with [`ENV_DIR_MODE`].
///
/// With `exclusive` an existing directory is an error.
fn create_owned_dir(dir: &Path, uid: u32, gid: u32, exclusive: bool) -> Result<()> {
    match DirBuilder::new().mode(ENV_DIR_MODE).create(dir) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists && !exclusive => {}
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            error!(dir = %dir.display(), "Environment already exists");
            return Err(EnvError::AlreadyInstalled(dir.to_path_buf()));
        }
        Err(e) => {
            error!(dir = %dir.display(), error = %e, "mkdir failed");
            return Err(EnvError::io("mkdir", dir, e));
        }
    }

    chown(dir, Some(uid), Some(gid))
        .and_then(|()| fs::set_permissions(dir, Permissions::from_mode(ENV_DIR_MODE)))
        .map_err(|e| {
            error!(dir = %dir.display(), error = %e, "chown/chmod failed");
            if exclusive {
                let _ = fs::remove_dir(dir);
            }
            EnvError::io("chown/chmod", dir, e)
        })
}

fn setup_tmp(tmp: &Path, uid: u32, gid: u32) -> io::Result<()> {
    match DirBuilder::new().mode(TMP_DIR_MODE).create(tmp) {
        Err(e) if e.kind() != io::ErrorKind::AlreadyExists => return Err(e),
        _ => {}
    }
    chown(tmp, Some(uid), Some(gid))?;
    fs::set_permissions(tmp, Permissions::from_mode(TMP_DIR_MODE))
}
