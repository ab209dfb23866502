//! Error types shared by the environment cache operations.
//!
//! Recoverable failures (filesystem, process, protocol) are [`EnvError`]
//! values. A failed privilege transition is carried as [`EnvError::Fatal`]
//! so callers can tell it apart; inside a forked child the same failure is
//! never returned at all but turned into an immediate exit.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::engine::isolation::JailFailure;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EnvError>;

#[derive(Debug, Error)]
pub enum EnvError {
    /// A filesystem call failed on `path`.
    #[error("{op} failed on {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Creating the cache directory was refused by the kernel.
    #[error("permission denied creating {0}")]
    PermissionDenied(PathBuf),

    /// The environment name is empty or contains a disallowed byte.
    #[error("illegal environment name {0:?}")]
    IllegalName(String),

    /// Target or name was empty where both are required.
    #[error("target or environment name empty")]
    EmptyArgument,

    /// The channel produced nothing within the first-message timeout.
    #[error("no message received from peer")]
    NoMessage,

    /// The first message was not a file chunk.
    #[error("expected first file chunk, got {0}")]
    UnexpectedMessage(String),

    /// The environment directory already exists.
    #[error("environment already installed at {0}")]
    AlreadyInstalled(PathBuf),

    /// Spawning a child process failed.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The extractor exited unsuccessfully (or died on a signal).
    #[error("extractor failed with exit code {0:?}")]
    ExtractFailed(Option<i32>),

    /// The extractor went away while chunks were still being streamed.
    #[error("extractor closed its input early")]
    BrokenPipe,

    /// A privilege transition failed; never downgraded to a sentinel.
    #[error("jail setup failed: {0}")]
    Fatal(#[from] JailFailure),
}

impl EnvError {
    pub(crate) fn io(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            op,
            path: path.into(),
            source,
        }
    }

    /// True for failures that must terminate the affected process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}
