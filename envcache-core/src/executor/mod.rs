//! Isolated Task - one OS process per untrusted execution
//!
//! Extraction, packaging, removal and verification all follow the same
//! pattern: fork, put the child through the jail, exec a tool, wait. This
//! module expresses that as a builder ([`IsolatedTask`]) and a handle
//! ([`TaskHandle`]) so the environment operations never touch raw
//! fork/exec primitives.
//!
//! Descriptors created here are close-on-exec; only stdio and an explicitly
//! mapped output descriptor survive into the child.

use std::ffi::OsString;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::signal::{self, SigHandler, Signal};
use nix::unistd::{dup2, Pid};
use tracing::debug;

use crate::engine::isolation::{self, JailConfig};

const ETXTBSY_RETRIES: u32 = 5;

/// Builder for a child process that runs behind a jail.
#[derive(Debug)]
pub struct IsolatedTask {
    program: OsString,
    args: Vec<OsString>,
    jail: Option<JailConfig>,
    stdin_pipe: bool,
    quiet_stdout: bool,
    output_fd: Option<(OwnedFd, RawFd)>,
    niceness: i32,
    default_signals: bool,
}

impl IsolatedTask {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            jail: None,
            stdin_pipe: false,
            quiet_stdout: false,
            output_fd: None,
            niceness: 0,
            default_signals: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Apply `config` in the child before exec.
    pub fn jail(mut self, config: JailConfig) -> Self {
        self.jail = Some(config);
        self
    }

    /// Connect the child's stdin to a pipe held by the handle.
    pub fn stdin_pipe(mut self) -> Self {
        self.stdin_pipe = true;
        self
    }

    /// Send the child's stdout to `/dev/null`.
    pub fn quiet_stdout(mut self) -> Self {
        self.quiet_stdout = true;
        self
    }

    /// Hand the write end `fd` to the child as descriptor `target`.
    /// The parent's copy is closed once the child has been spawned.
    pub fn output_fd(mut self, fd: OwnedFd, target: RawFd) -> Self {
        self.output_fd = Some((fd, target));
        self
    }

    /// Lower the child's scheduling priority by `niceness`.
    pub fn niceness(mut self, niceness: i32) -> Self {
        self.niceness = niceness;
        self
    }

    /// Reset SIGPIPE and SIGCHLD to their default dispositions in the child.
    pub fn default_signals(mut self) -> Self {
        self.default_signals = true;
        self
    }

    /// Fork and exec the task.
    pub fn spawn(self) -> io::Result<TaskHandle> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.stdin(if self.stdin_pipe {
            Stdio::piped()
        } else {
            Stdio::inherit()
        });
        if self.quiet_stdout {
            cmd.stdout(Stdio::null());
        }

        let jail = self.jail;
        let output = self.output_fd.as_ref().map(|(fd, target)| (fd.as_raw_fd(), *target));
        let niceness = self.niceness;
        let default_signals = self.default_signals;

        // SAFETY: the closure runs between fork and exec and only makes
        // async-signal-safe calls; the jail config was fully built (and its
        // paths converted) in the parent.
        unsafe {
            cmd.pre_exec(move || {
                if default_signals {
                    let _ = signal::signal(Signal::SIGCHLD, SigHandler::SigDfl);
                    let _ = signal::signal(Signal::SIGPIPE, SigHandler::SigDfl);
                }
                if let Some(config) = jail.as_ref() {
                    isolation::enter(config);
                }
                if let Some((fd, target)) = output {
                    if fd == target {
                        fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty()))?;
                    } else {
                        dup2(fd, target)?;
                    }
                }
                if niceness != 0 {
                    // failure only leaves the priority unchanged
                    let _ = libc::nice(niceness);
                }
                Ok(())
            });
        }

        let child = spawn_retrying(&mut cmd)?;
        debug!(program = ?self.program, pid = child.id(), "Spawned isolated task");

        // Dropping our copy of the output fd lets the reader see EOF once
        // the child exits.
        drop(self.output_fd);

        Ok(TaskHandle { child })
    }
}

/// A freshly written executable can briefly report ETXTBSY while another
/// thread's fork still holds it open for writing.
fn spawn_retrying(cmd: &mut Command) -> io::Result<Child> {
    let mut attempts = 0;
    loop {
        match cmd.spawn() {
            Err(e) if e.raw_os_error() == Some(libc::ETXTBSY) && attempts < ETXTBSY_RETRIES => {
                attempts += 1;
                thread::sleep(Duration::from_millis(10));
            }
            other => return other,
        }
    }
}

/// Handle on a running isolated task.
#[derive(Debug)]
pub struct TaskHandle {
    child: Child,
}

impl TaskHandle {
    pub fn pid(&self) -> Pid {
        Pid::from_raw(self.child.id() as i32)
    }

    /// Take the write end of the child's stdin pipe, if one was requested.
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.child.stdin.take()
    }

    /// Block until the child exits. Interrupted waits are retried.
    pub fn wait(&mut self) -> io::Result<ExitStatus> {
        drop(self.child.stdin.take());
        loop {
            match self.child.wait() {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => return other,
            }
        }
    }

    pub fn kill(&mut self) -> io::Result<()> {
        self.child.kill()
    }
}

/// Short description of how a child ended, for log lines.
pub fn describe_status(status: ExitStatus) -> String {
    match (status.code(), status.signal()) {
        (Some(code), _) => format!("exit code {code}"),
        (None, Some(sig)) => format!("signal {sig}"),
        _ => "unknown status".to_string(),
    }
}

/// Create a close-on-exec pipe, returning `(read, write)`.
pub fn cloexec_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    use nix::fcntl::OFlag;
    use std::os::fd::FromRawFd;

    let (read, write) = nix::unistd::pipe2(OFlag::O_CLOEXEC)?;
    // SAFETY: pipe2 just returned these descriptors and nothing else owns them.
    Ok(unsafe { (OwnedFd::from_raw_fd(read), OwnedFd::from_raw_fd(write)) })
}
