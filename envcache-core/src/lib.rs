//! Envcache Core - toolchain environment cache for compile-farm workers
//!
//! Manages the per-toolchain sandboxes ("environments") a distributed
//! compilation daemon runs remote jobs in: size accounting, discovery,
//! installation from a peer's tarball, native toolchain packaging, jailing,
//! verification and eviction.
//!
//! # Trust boundaries:
//! - Environment content is only ever read or written by child processes
//!   running as the unprivileged build identity
//! - Every chroot/identity transition happens in a forked child; a failure
//!   there ends the child with a reserved exit code
//! - Requests are validated before the filesystem is touched

pub mod channel;
pub mod config;
pub mod engine;
pub mod env;
pub mod error;
pub mod executor;

pub use channel::{Channel, FileChannel, Message};
pub use config::{EnvConfig, ToolPaths};
pub use engine::isolation::{JailConfig, JailFailure, JailStep};
pub use env::catalog;
pub use env::installer::{EnvironmentInstaller, PendingInstall};
pub use env::native::{
    CompilerFingerprint, CompilerKind, NativeBuild, NativeEnvironmentBuilder, NativeTarball,
};
pub use env::remover::{remove_native, EnvironmentRemover};
pub use env::sniff::Compression;
pub use env::verifier::EnvironmentVerifier;
pub use env::EnvironmentId;
pub use error::{EnvError, Result};
pub use executor::{IsolatedTask, TaskHandle};

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `default_level`. Calling this more than
/// once keeps the first subscriber.
pub fn init_logging(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
