//! Sanity check of an installed environment.
//!
//! The environment's own `bin/true` is run inside a fresh jail rooted at the
//! environment. If the tree is missing its loader or libraries, or the jail
//! cannot be entered, the check fails.

use std::path::Path;

use nix::unistd::{access, AccessFlags};
use tracing::{debug, error, warn};

use super::EnvironmentId;
use crate::channel::{report_status, Channel};
use crate::config::EnvConfig;
use crate::engine::isolation::{JailConfig, JailStep};
use crate::executor::{describe_status, IsolatedTask};

#[derive(Debug, Clone)]
pub struct EnvironmentVerifier {
    config: EnvConfig,
}

impl EnvironmentVerifier {
    pub fn new(config: EnvConfig) -> Self {
        Self { config }
    }

    /// Returns true iff the marker executable ran successfully inside the
    /// jailed environment. Failures are reported to `channel`.
    pub fn verify(&self, channel: &mut dyn Channel, id: &EnvironmentId) -> bool {
        if id.target.is_empty() || id.name.is_empty() {
            report_status(channel, "verify_env: target or env empty");
            error!(target = %id.target, name = %id.name, "verify: target or env empty");
            return false;
        }

        let dir = id.dir(&self.config.basedir);
        let marker = dir.join(&self.config.verify_marker);
        if access(&marker, AccessFlags::X_OK).is_err() {
            report_status(
                channel,
                &format!(
                    "{} is not executable, installed environment removed?",
                    marker.display()
                ),
            );
            error!(env = %id, "No environment to verify");
            return false;
        }

        let jail = match JailConfig::chroot(&dir, self.config.build_uid, self.config.build_gid) {
            Ok(jail) => jail,
            Err(e) => {
                error!(dir = %dir.display(), error = %e, "Unusable environment path");
                return false;
            }
        };

        let program = Path::new("/").join(&self.config.verify_marker);
        let mut task = match IsolatedTask::new(&program).jail(jail).spawn() {
            Ok(task) => task,
            Err(e) => {
                error!(env = %id, error = %e, "fork failed");
                report_status(channel, "verify_env: failed to start verification");
                return false;
            }
        };

        match task.wait() {
            Ok(status) if status.success() => {
                debug!(env = %id, "Environment verified");
                true
            }
            Ok(status) => {
                match status.code().and_then(JailStep::from_exit_code) {
                    Some(step) => {
                        report_status(channel, &step.status_message(&dir));
                        error!(env = %id, %step, "Jail setup failed");
                    }
                    None => {
                        warn!(env = %id, status = %describe_status(status), "Environment failed verification");
                    }
                }
                false
            }
            Err(e) => {
                error!(env = %id, error = %e, "Failed to wait for verification");
                false
            }
        }
    }
}
