//! Forked child processes and their exit statuses

use crate::errors::{RecordError, Result, syscall};
use crate::logging::report_error;
use log::{debug, error};
use nix::sys::signal::{SigSet, SigmaskHow, Signal, pthread_sigmask};
use nix::sys::wait::WaitStatus;
use nix::unistd::{ForkResult, Pid, fork};
use std::panic::{self, AssertUnwindSafe};

/// Signals a supervisor takes over from their default dispositions
pub const SUPERVISED_SIGNALS: [Signal; 5] = [
    Signal::SIGCHLD,
    Signal::SIGHUP,
    Signal::SIGTERM,
    Signal::SIGINT,
    Signal::SIGQUIT,
];

pub(crate) fn supervised_sigset() -> SigSet {
    let mut set = SigSet::empty();
    for signal in SUPERVISED_SIGNALS {
        set.add(signal);
    }
    set
}

/// Put the supervised signals back to normal delivery in a new child
pub(crate) fn restore_signal_mask() -> Result<()> {
    pthread_sigmask(SigmaskHow::SIG_UNBLOCK, Some(&supervised_sigset()), None)
        .map_err(syscall("pthread_sigmask"))
}

/// Exit code a parent reports for a child wait status
///
/// Returns `None` while the child is still running or merely stopped.
pub fn exit_code(status: WaitStatus) -> Option<i32> {
    match status {
        WaitStatus::Exited(_, code) => Some(code),
        WaitStatus::Signaled(_, signal, _) => Some(128 + signal as i32),
        _ => None,
    }
}

/// Run a child body to completion and turn its outcome into an exit code
///
/// Errors are printed on stderr and panics are contained, so the caller can
/// always terminate the process with the returned code.
pub fn run_child_body<F>(name: &str, body: F) -> i32
where
    F: FnOnce() -> Result<i32>,
{
    match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(Ok(code)) => code,
        Ok(Err(err)) => {
            error!("{} failed: {}", name, err);
            report_error(&err);
            1
        }
        Err(_) => {
            error!("{} panicked", name);
            1
        }
    }
}

/// Handle to a direct child process
#[derive(Debug, Clone)]
pub struct ChildProcess {
    name: String,
    pid: Pid,
}

impl ChildProcess {
    /// Fork and run `body` in the child, which exits with the body's status
    ///
    /// The child never returns into the caller's code.
    pub fn spawn<F>(name: &str, body: F) -> Result<Self>
    where
        F: FnOnce() -> Result<i32>,
    {
        // SAFETY: the child only runs `body` and then exits.
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => {
                debug!("Forked {} as pid {}", name, child);
                Ok(Self {
                    name: name.to_string(),
                    pid: child,
                })
            }
            Ok(ForkResult::Child) => {
                let code = run_child_body(name, || {
                    restore_signal_mask()?;
                    body()
                });
                std::process::exit(code)
            }
            Err(e) => Err(RecordError::Syscall(format!(
                "fork for {} failed: {}",
                name, e
            ))),
        }
    }

    /// Wrap a child created some other way, such as `clone`
    pub fn from_pid(name: &str, pid: Pid) -> Self {
        Self {
            name: name.to_string(),
            pid,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
