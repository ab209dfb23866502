//! Privilege Jail
//!
//! Every piece of environment content is touched only by a child process that
//! has first been put through this jail: namespace isolation, an optional
//! chroot into the environment directory, and a permanent drop to the
//! unprivileged build identity.
//!
//! # Security Model:
//! ```text
//! daemon (root)  ──fork──▶  child: unshare ─▶ chdir ─▶ chroot ─▶ setgroups/setgid/setuid ─▶ exec
//!                                                  any hard failure ─▶ _exit(reserved code)
//! ```
//!
//! The sequence is described by an immutable [`JailConfig`] and executed by
//! [`apply`] against a [`Syscalls`] layer, so the ordering and failure
//! handling can be exercised with a fake kernel. [`enter`] is the variant
//! used between fork and exec: it never returns on failure.
//!
//! Nothing in this module allocates or logs on the apply path. Paths are
//! converted to `CString` when the configuration is built, in the parent.

use std::ffi::{CStr, CString};
use std::fmt;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use nix::errno::Errno;
use nix::sched::CloneFlags;
use nix::unistd::{Gid, Uid};
use thiserror::Error;

/// Namespace kinds the jail tries to leave, one at a time if the combined
/// request is refused.
const NAMESPACE_KINDS: [CloneFlags; 6] = [
    CloneFlags::CLONE_NEWIPC,
    CloneFlags::CLONE_NEWNET,
    CloneFlags::CLONE_NEWNS,
    CloneFlags::CLONE_NEWPID,
    CloneFlags::CLONE_NEWUTS,
    CloneFlags::CLONE_NEWUSER,
];

/// A step of the jail sequence that can fail hard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JailStep {
    /// `chdir` into the jail root before `chroot`.
    Chdir,
    /// `chroot` into the jail root.
    Chroot,
    /// Clearing supplementary groups.
    SetGroups,
    /// Switching to the build gid.
    SetGid,
    /// Switching to the build uid.
    SetUid,
    /// A chroot jail was requested by a process that is not root.
    NotPrivileged,
    /// `chdir` into the working directory after the identity drop.
    Workdir,
}

impl JailStep {
    /// Exit code reserved for a child that died at this step.
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::Workdir => 140,
            Self::SetUid => 142,
            Self::SetGroups | Self::SetGid => 143,
            Self::Chroot => 144,
            Self::Chdir => 145,
            Self::NotPrivileged => 146,
        }
    }

    /// Decode a child's exit code back into the step that killed it.
    ///
    /// 143 is shared by `setgroups` and `setgid`; it decodes to
    /// [`JailStep::SetGroups`].
    pub fn from_exit_code(code: i32) -> Option<Self> {
        match code {
            140 => Some(Self::Workdir),
            142 => Some(Self::SetUid),
            143 => Some(Self::SetGroups),
            144 => Some(Self::Chroot),
            145 => Some(Self::Chdir),
            146 => Some(Self::NotPrivileged),
            _ => None,
        }
    }

    /// Human-readable status line sent to a peer when this step failed
    /// while jailing into `dir`.
    pub fn status_message(self, dir: &Path) -> String {
        match self {
            Self::Chdir => format!("chdir to {} failed", dir.display()),
            Self::Chroot => format!("chroot {} failed", dir.display()),
            Self::SetGroups => "setgroups failed".to_string(),
            Self::SetGid => "setgid failed".to_string(),
            Self::SetUid => "setuid failed".to_string(),
            Self::NotPrivileged => "cannot chroot to environment".to_string(),
            Self::Workdir => format!("chdir to {} failed", dir.display()),
        }
    }
}

impl fmt::Display for JailStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Chdir => "chdir",
            Self::Chroot => "chroot",
            Self::SetGroups => "setgroups",
            Self::SetGid => "setgid",
            Self::SetUid => "setuid",
            Self::NotPrivileged => "privilege check",
            Self::Workdir => "chdir (workdir)",
        };
        f.write_str(name)
    }
}

/// A hard jail failure. Inside a child this is always fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{step} failed: {errno}")]
pub struct JailFailure {
    pub step: JailStep,
    pub errno: Errno,
}

impl JailFailure {
    fn new(step: JailStep, errno: Errno) -> Self {
        Self { step, errno }
    }

    pub const fn exit_code(&self) -> i32 {
        self.step.exit_code()
    }
}

/// How the jailed process relates to the build identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityPolicy {
    /// Capabilities are already constrained by the platform; keep ids.
    Keep,
    /// Drop to the build identity unless already running as it. `setuid` is
    /// only attempted when the effective uid is root.
    DropIfNeeded,
    /// Always drop; the caller must be root.
    DropRequired,
}

/// Real and effective ids of the calling process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub uid: Uid,
    pub euid: Uid,
    pub gid: Gid,
    pub egid: Gid,
}

impl Identity {
    fn is(&self, uid: Uid, gid: Gid) -> bool {
        self.uid == uid && self.euid == uid && self.gid == gid && self.egid == gid
    }
}

/// Immutable description of a jail.
#[derive(Debug, Clone)]
pub struct JailConfig {
    namespaces: CloneFlags,
    root: Option<CString>,
    workdir: Option<CString>,
    uid: Uid,
    gid: Gid,
    identity: IdentityPolicy,
}

impl JailConfig {
    /// A full chroot jail into `root` with the default namespace set.
    pub fn chroot(root: &Path, uid: u32, gid: u32) -> io::Result<Self> {
        let identity = IdentityPolicy::DropRequired;
        Ok(Self {
            namespaces: default_namespaces(identity),
            root: Some(path_to_cstring(root)?),
            workdir: None,
            uid: Uid::from_raw(uid),
            gid: Gid::from_raw(gid),
            identity,
        })
    }

    /// Identity drop only: no namespaces, no chroot.
    pub fn identity(uid: u32, gid: u32) -> Self {
        Self {
            namespaces: CloneFlags::empty(),
            root: None,
            workdir: None,
            uid: Uid::from_raw(uid),
            gid: Gid::from_raw(gid),
            identity: IdentityPolicy::DropIfNeeded,
        }
    }

    /// Change into `dir` once the identity has been dropped.
    pub fn with_workdir(mut self, dir: &Path) -> io::Result<Self> {
        self.workdir = Some(path_to_cstring(dir)?);
        Ok(self)
    }

    pub fn with_namespaces(mut self, namespaces: CloneFlags) -> Self {
        self.namespaces = namespaces;
        self
    }

    pub fn with_policy(mut self, identity: IdentityPolicy) -> Self {
        self.identity = identity;
        self
    }

    pub fn namespaces(&self) -> CloneFlags {
        self.namespaces
    }

    pub fn root(&self) -> Option<&CStr> {
        self.root.as_deref()
    }

    pub fn policy(&self) -> IdentityPolicy {
        self.identity
    }

    pub fn uid(&self) -> Uid {
        self.uid
    }

    pub fn gid(&self) -> Gid {
        self.gid
    }
}

/// Namespace set unshared for a given identity policy.
///
/// A new user namespace leaves the process without uid/gid mappings, after
/// which `setgroups`/`setgid` cannot succeed, so it is only requested when
/// the ids are kept.
pub fn default_namespaces(identity: IdentityPolicy) -> CloneFlags {
    let all = NAMESPACE_KINDS
        .iter()
        .fold(CloneFlags::empty(), |acc, flag| acc | *flag);
    match identity {
        IdentityPolicy::Keep => all,
        IdentityPolicy::DropIfNeeded | IdentityPolicy::DropRequired => {
            all - CloneFlags::CLONE_NEWUSER
        }
    }
}

fn path_to_cstring(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

/// The kernel calls the jail sequence is built from.
pub trait Syscalls {
    fn unshare(&self, flags: CloneFlags) -> nix::Result<()>;
    fn chdir(&self, dir: &CStr) -> nix::Result<()>;
    fn chroot(&self, dir: &CStr) -> nix::Result<()>;
    /// Clear all supplementary groups.
    fn clear_groups(&self) -> nix::Result<()>;
    fn setgid(&self, gid: Gid) -> nix::Result<()>;
    fn setuid(&self, uid: Uid) -> nix::Result<()>;
    fn identity(&self) -> Identity;
}

/// [`Syscalls`] backed by the running kernel.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinuxSyscalls;

impl Syscalls for LinuxSyscalls {
    fn unshare(&self, flags: CloneFlags) -> nix::Result<()> {
        nix::sched::unshare(flags)
    }

    fn chdir(&self, dir: &CStr) -> nix::Result<()> {
        nix::unistd::chdir(dir)
    }

    fn chroot(&self, dir: &CStr) -> nix::Result<()> {
        nix::unistd::chroot(dir)
    }

    fn clear_groups(&self) -> nix::Result<()> {
        nix::unistd::setgroups(&[])
    }

    fn setgid(&self, gid: Gid) -> nix::Result<()> {
        nix::unistd::setgid(gid)
    }

    fn setuid(&self, uid: Uid) -> nix::Result<()> {
        nix::unistd::setuid(uid)
    }

    fn identity(&self) -> Identity {
        Identity {
            uid: nix::unistd::getuid(),
            euid: nix::unistd::geteuid(),
            gid: nix::unistd::getgid(),
            egid: nix::unistd::getegid(),
        }
    }
}

/// Run the jail sequence described by `config`.
///
/// Namespace isolation is best effort. Every later step is mandatory and the
/// first failure is returned without attempting the remaining steps.
pub fn apply<S: Syscalls + ?Sized>(config: &JailConfig, sys: &S) -> Result<(), JailFailure> {
    // Ids are sampled before unsharing; a new user namespace would hide them.
    let ids = sys.identity();

    if config.identity == IdentityPolicy::DropRequired && !ids.uid.is_root() {
        return Err(JailFailure::new(JailStep::NotPrivileged, Errno::EPERM));
    }

    unshare_best_effort(config.namespaces, sys);

    if let Some(root) = config.root.as_deref() {
        // chdir first, or the chroot leaves cwd outside the new root
        sys.chdir(root)
            .map_err(|e| JailFailure::new(JailStep::Chdir, e))?;
        sys.chroot(root)
            .map_err(|e| JailFailure::new(JailStep::Chroot, e))?;
    }

    match config.identity {
        IdentityPolicy::Keep => {}
        IdentityPolicy::DropIfNeeded => {
            if !ids.is(config.uid, config.gid) {
                drop_identity(config, sys, ids.euid.is_root())?;
            }
        }
        IdentityPolicy::DropRequired => drop_identity(config, sys, true)?,
    }

    if let Some(dir) = config.workdir.as_deref() {
        sys.chdir(dir)
            .map_err(|e| JailFailure::new(JailStep::Workdir, e))?;
    }

    Ok(())
}

fn unshare_best_effort<S: Syscalls + ?Sized>(flags: CloneFlags, sys: &S) {
    if flags.is_empty() || sys.unshare(flags).is_ok() {
        return;
    }
    for kind in NAMESPACE_KINDS {
        if flags.contains(kind) {
            let _ = sys.unshare(kind);
        }
    }
}

fn drop_identity<S: Syscalls + ?Sized>(
    config: &JailConfig,
    sys: &S,
    set_uid: bool,
) -> Result<(), JailFailure> {
    sys.clear_groups()
        .map_err(|e| JailFailure::new(JailStep::SetGroups, e))?;
    sys.setgid(config.gid)
        .map_err(|e| JailFailure::new(JailStep::SetGid, e))?;
    if set_uid {
        sys.setuid(config.uid)
            .map_err(|e| JailFailure::new(JailStep::SetUid, e))?;
    }
    Ok(())
}

/// Enter the jail from a freshly forked child.
///
/// Returns only when every mandatory step succeeded. On failure the process
/// terminates immediately with the step's reserved exit code; nothing after
/// a failed privilege drop may run.
///
/// # Safety
/// Must only be called in a single-threaded child between fork and exec.
pub unsafe fn enter(config: &JailConfig) {
    if let Err(failure) = apply(config, &LinuxSyscalls) {
        libc::_exit(failure.exit_code());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::path::PathBuf;

    struct FakeKernel {
        ids: Identity,
        fail: Option<&'static str>,
        refuse_combined_unshare: bool,
        calls: RefCell<Vec<String>>,
    }

    impl FakeKernel {
        fn new(uid: u32, gid: u32) -> Self {
            Self {
                ids: Identity {
                    uid: Uid::from_raw(uid),
                    euid: Uid::from_raw(uid),
                    gid: Gid::from_raw(gid),
                    egid: Gid::from_raw(gid),
                },
                fail: None,
                refuse_combined_unshare: false,
                calls: RefCell::new(Vec::new()),
            }
        }

        fn failing(mut self, call: &'static str) -> Self {
            self.fail = Some(call);
            self
        }

        fn record(&self, call: &'static str, detail: String) -> nix::Result<()> {
            self.calls.borrow_mut().push(format!("{call}{detail}"));
            if self.fail == Some(call) {
                Err(Errno::EPERM)
            } else {
                Ok(())
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.borrow().clone()
        }
    }

    impl Syscalls for FakeKernel {
        fn unshare(&self, flags: CloneFlags) -> nix::Result<()> {
            if self.refuse_combined_unshare && flags.bits().count_ones() > 1 {
                self.calls.borrow_mut().push("unshare(all)".to_string());
                return Err(Errno::EINVAL);
            }
            self.record("unshare", String::new())
        }

        fn chdir(&self, dir: &CStr) -> nix::Result<()> {
            self.record("chdir", format!(" {}", dir.to_string_lossy()))
        }

        fn chroot(&self, dir: &CStr) -> nix::Result<()> {
            self.record("chroot", format!(" {}", dir.to_string_lossy()))
        }

        fn clear_groups(&self) -> nix::Result<()> {
            self.record("setgroups", String::new())
        }

        fn setgid(&self, gid: Gid) -> nix::Result<()> {
            self.record("setgid", format!(" {gid}"))
        }

        fn setuid(&self, uid: Uid) -> nix::Result<()> {
            self.record("setuid", format!(" {uid}"))
        }

        fn identity(&self) -> Identity {
            self.ids
        }
    }

    fn env_dir() -> PathBuf {
        PathBuf::from("/cache/target=x86_64/env1")
    }

    #[test]
    fn test_chroot_jail_sequence_as_root() {
        let kernel = FakeKernel::new(0, 0);
        let config = JailConfig::chroot(&env_dir(), 1000, 1000).unwrap();

        apply(&config, &kernel).unwrap();

        assert_eq!(
            kernel.calls(),
            vec![
                "unshare",
                "chdir /cache/target=x86_64/env1",
                "chroot /cache/target=x86_64/env1",
                "setgroups",
                "setgid 1000",
                "setuid 1000",
            ]
        );
    }

    #[test]
    fn test_chroot_jail_refused_without_root() {
        let kernel = FakeKernel::new(1000, 1000);
        let config = JailConfig::chroot(&env_dir(), 1000, 1000).unwrap();

        let failure = apply(&config, &kernel).unwrap_err();

        assert_eq!(failure.step, JailStep::NotPrivileged);
        assert_eq!(failure.exit_code(), 146);
        assert!(kernel.calls().is_empty());
    }

    #[test]
    fn test_chroot_failure_stops_before_identity_drop() {
        let kernel = FakeKernel::new(0, 0).failing("chroot");
        let config = JailConfig::chroot(&env_dir(), 1000, 1000).unwrap();

        let failure = apply(&config, &kernel).unwrap_err();

        assert_eq!(failure.step, JailStep::Chroot);
        assert_eq!(failure.exit_code(), 144);
        assert!(!kernel.calls().iter().any(|c| c.starts_with("set")));
    }

    #[test]
    fn test_setgid_failure_never_reaches_setuid() {
        let kernel = FakeKernel::new(0, 0).failing("setgid");
        let config = JailConfig::chroot(&env_dir(), 1000, 1000).unwrap();

        let failure = apply(&config, &kernel).unwrap_err();

        assert_eq!(failure.step, JailStep::SetGid);
        assert_eq!(failure.exit_code(), 143);
        assert!(!kernel.calls().iter().any(|c| c.starts_with("setuid")));
    }

    #[test]
    fn test_setuid_failure_code() {
        let kernel = FakeKernel::new(0, 0).failing("setuid");
        let config = JailConfig::chroot(&env_dir(), 1000, 1000).unwrap();

        let failure = apply(&config, &kernel).unwrap_err();
        assert_eq!(failure.exit_code(), 142);
    }

    #[test]
    fn test_unshare_failure_is_ignored() {
        let kernel = FakeKernel::new(0, 0).failing("unshare");
        let config = JailConfig::chroot(&env_dir(), 1000, 1000).unwrap();

        assert!(apply(&config, &kernel).is_ok());
    }

    #[test]
    fn test_unshare_falls_back_to_single_kinds() {
        let mut kernel = FakeKernel::new(0, 0);
        kernel.refuse_combined_unshare = true;
        let config = JailConfig::chroot(&env_dir(), 1000, 1000).unwrap();

        apply(&config, &kernel).unwrap();

        let unshares = kernel
            .calls()
            .iter()
            .filter(|c| c.as_str() == "unshare")
            .count();
        assert_eq!(unshares, 5);
    }

    #[test]
    fn test_identity_drop_skipped_when_already_build_user() {
        let kernel = FakeKernel::new(1000, 1000);
        let config = JailConfig::identity(1000, 1000)
            .with_workdir(Path::new("/cache/native"))
            .unwrap();

        apply(&config, &kernel).unwrap();

        assert_eq!(kernel.calls(), vec!["chdir /cache/native"]);
    }

    #[test]
    fn test_identity_drop_without_root_skips_setuid() {
        let kernel = FakeKernel::new(1000, 1000);
        let config = JailConfig::identity(2000, 2000);

        apply(&config, &kernel).unwrap();

        assert_eq!(kernel.calls(), vec!["setgroups", "setgid 2000"]);
    }

    #[test]
    fn test_identity_drop_as_root_then_workdir() {
        let kernel = FakeKernel::new(0, 0);
        let config = JailConfig::identity(1000, 1000)
            .with_workdir(Path::new("/cache/native"))
            .unwrap();

        apply(&config, &kernel).unwrap();

        assert_eq!(
            kernel.calls(),
            vec!["setgroups", "setgid 1000", "setuid 1000", "chdir /cache/native"]
        );
    }

    #[test]
    fn test_workdir_failure_code() {
        let kernel = FakeKernel::new(1000, 1000).failing("chdir");
        let config = JailConfig::identity(1000, 1000)
            .with_workdir(Path::new("/missing"))
            .unwrap();

        let failure = apply(&config, &kernel).unwrap_err();
        assert_eq!(failure.step, JailStep::Workdir);
        assert_eq!(failure.exit_code(), 140);
    }

    #[test]
    fn test_keep_policy_only_chroots() {
        let kernel = FakeKernel::new(1000, 1000);
        let config = JailConfig::chroot(&env_dir(), 1000, 1000)
            .unwrap()
            .with_policy(IdentityPolicy::Keep);

        apply(&config, &kernel).unwrap();

        assert!(kernel.calls().iter().all(|c| !c.starts_with("set")));
    }

    #[test]
    fn test_default_namespaces() {
        let dropping = default_namespaces(IdentityPolicy::DropRequired);
        assert!(dropping.contains(CloneFlags::CLONE_NEWNET));
        assert!(dropping.contains(CloneFlags::CLONE_NEWIPC));
        assert!(!dropping.contains(CloneFlags::CLONE_NEWUSER));
        assert!(default_namespaces(IdentityPolicy::Keep).contains(CloneFlags::CLONE_NEWUSER));
    }

    #[test]
    fn test_exit_codes_decode() {
        for step in [
            JailStep::Chdir,
            JailStep::Chroot,
            JailStep::SetGroups,
            JailStep::SetUid,
            JailStep::NotPrivileged,
            JailStep::Workdir,
        ] {
            assert_eq!(JailStep::from_exit_code(step.exit_code()), Some(step));
        }
        assert_eq!(JailStep::from_exit_code(0), None);
        assert_eq!(JailStep::from_exit_code(1), None);
    }

    #[test]
    fn test_status_messages() {
        let dir = env_dir();
        assert_eq!(
            JailStep::Chroot.status_message(&dir),
            "chroot /cache/target=x86_64/env1 failed"
        );
        assert_eq!(
            JailStep::NotPrivileged.status_message(&dir),
            "cannot chroot to environment"
        );
    }
}
