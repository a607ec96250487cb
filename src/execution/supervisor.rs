//! Single-threaded supervisor: child processes, signals and I/O readiness
//!
//! Every process in a session runs exactly one `Supervisor`. It forks the
//! children it is responsible for, blocks the supervised signals and reads them
//! through a signalfd, and dispatches readiness events to registered
//! [`IoSource`]s. Forked children start with fresh state and never touch their
//! parent's supervisor.

use super::process::{ChildProcess, exit_code, supervised_sigset};
use crate::errors::{RecordError, Result, syscall};
use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::signal::{SigSet, SigmaskHow, Signal, kill, pthread_sigmask};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::os::fd::{AsFd, BorrowedFd, RawFd};
use std::time::Instant;

/// Poll timeout; bounds the latency of a missed SIGCHLD
const POLL_INTERVAL_MS: u16 = 250;

/// Whether a source stays registered after handling an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Remove,
}

/// A file descriptor the supervisor polls on behalf of a handler
pub trait IoSource {
    fn raw_fd(&self) -> RawFd;

    /// Events to wait for; an empty set pauses the source
    fn interest(&self) -> PollFlags {
        PollFlags::POLLIN
    }

    /// Handle readiness. New sources may be handed to `registrar`.
    fn on_ready(&mut self, events: PollFlags, registrar: &mut Registrar) -> Result<Flow>;

    fn name(&self) -> &str {
        "io"
    }

    /// Whether the source has outlived its deadline; expired sources are dropped
    fn expired(&self, _now: Instant) -> bool {
        false
    }
}

/// Collects sources created while handling an event
#[derive(Default)]
pub struct Registrar {
    pending: Vec<Box<dyn IoSource>>,
}

impl Registrar {
    pub fn register_io(&mut self, source: Box<dyn IoSource>) {
        self.pending.push(source);
    }
}

struct WatchedChild {
    process: ChildProcess,
    status: Option<i32>,
    /// SIGHUP was sent as part of shutdown
    hung_up: bool,
    /// The child died of SIGHUP rather than exiting on its own
    killed_by_hangup: bool,
}

pub struct Supervisor {
    signals: SignalFd,
    previous_mask: SigSet,
    sources: Vec<Box<dyn IoSource>>,
    children: Vec<WatchedChild>,
    failure: Option<RecordError>,
    shutting_down: bool,
}

impl Supervisor {
    /// Take over the supervised signals for the calling thread
    pub fn new() -> Result<Self> {
        let mask = supervised_sigset();
        let mut previous_mask = SigSet::empty();
        pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&mask), Some(&mut previous_mask))
            .map_err(syscall("pthread_sigmask"))?;

        let signals = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
            .map_err(syscall("signalfd"))?;

        Ok(Self {
            signals,
            previous_mask,
            sources: Vec::new(),
            children: Vec::new(),
            failure: None,
            shutting_down: false,
        })
    }

    /// Fork a child running `body`; the supervisor waits for it in `run`
    pub fn add_child_process<F>(&mut self, name: &str, body: F) -> Result<Pid>
    where
        F: FnOnce() -> Result<i32>,
    {
        let child = ChildProcess::spawn(name, body)?;
        Ok(self.add_existing_child(child))
    }

    /// Supervise a child that was created elsewhere
    pub fn add_existing_child(&mut self, child: ChildProcess) -> Pid {
        let pid = child.pid();
        self.children.push(WatchedChild {
            process: child,
            status: None,
            hung_up: false,
            killed_by_hangup: false,
        });
        pid
    }

    pub fn register_io(&mut self, source: Box<dyn IoSource>) {
        debug!("Registered {} on fd {}", source.name(), source.raw_fd());
        self.sources.push(source);
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Dispatch events until the supervised work is finished
    ///
    /// With children, runs until every child has exited. Without children,
    /// runs until every source has deregistered or a shutdown signal arrives.
    /// The first failure ends the loop and is returned once children are gone.
    pub fn run(mut self) -> Result<i32> {
        loop {
            self.reap_children();
            if self.finished() {
                break;
            }

            let ready = match self.wait_for_events() {
                Ok(ready) => ready,
                Err(e) => {
                    self.fail(e);
                    continue;
                }
            };

            let mut signal_ready = false;
            let mut handled = Vec::new();
            for (slot, events) in ready {
                match slot {
                    None => signal_ready = true,
                    Some(index) => handled.push((index, events)),
                }
            }

            if signal_ready {
                self.drain_signals();
            }
            if !self.shutting_down {
                self.dispatch(handled);
                self.expire_sources();
            }
        }

        self.sources.clear();
        match self.failure.take() {
            Some(err) => Err(err),
            None => Ok(0),
        }
    }

    fn finished(&self) -> bool {
        if self.children.is_empty() {
            self.shutting_down || self.sources.is_empty()
        } else {
            self.children.iter().all(|c| c.status.is_some())
        }
    }

    /// Poll the signalfd and active sources. `None` marks the signalfd.
    fn wait_for_events(&self) -> Result<Vec<(Option<usize>, PollFlags)>> {
        let mut slots: Vec<Option<usize>> = vec![None];
        let mut fds = vec![PollFd::new(self.signals.as_fd(), PollFlags::POLLIN)];

        if !self.shutting_down {
            for (index, source) in self.sources.iter().enumerate() {
                let interest = source.interest();
                if interest.is_empty() {
                    continue;
                }
                // SAFETY: the source owns the descriptor and outlives this poll.
                let fd = unsafe { BorrowedFd::borrow_raw(source.raw_fd()) };
                fds.push(PollFd::new(fd, interest));
                slots.push(Some(index));
            }
        }

        match poll(&mut fds, PollTimeout::from(POLL_INTERVAL_MS)) {
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok(Vec::new()),
            Err(e) => return Err(RecordError::Syscall(format!("poll failed: {}", e))),
        }

        Ok(slots
            .into_iter()
            .zip(fds.iter())
            .filter_map(|(slot, fd)| {
                fd.revents()
                    .filter(|events| !events.is_empty())
                    .map(|events| (slot, events))
            })
            .collect())
    }

    fn drain_signals(&mut self) {
        loop {
            match self.signals.read_signal() {
                Ok(Some(info)) => match Signal::try_from(info.ssi_signo as i32) {
                    Ok(Signal::SIGCHLD) => {}
                    Ok(signal) => {
                        info!("Received {}, shutting down", signal);
                        self.begin_shutdown();
                    }
                    Err(_) => warn!("Ignoring unknown signal {}", info.ssi_signo),
                },
                Ok(None) | Err(Errno::EAGAIN) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    self.fail(RecordError::Syscall(format!("signalfd read failed: {}", e)));
                    break;
                }
            }
        }
    }

    fn dispatch(&mut self, ready: Vec<(usize, PollFlags)>) {
        let mut registrar = Registrar::default();
        let mut removed = Vec::new();

        for (index, events) in ready {
            if self.failure.is_some() {
                break;
            }
            let source = &mut self.sources[index];
            match source.on_ready(events, &mut registrar) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Remove) => {
                    debug!("Deregistered {}", source.name());
                    removed.push(index);
                }
                Err(e) => {
                    error!("{} failed: {}", source.name(), e);
                    self.fail(e);
                }
            }
        }

        removed.sort_unstable_by(|a, b| b.cmp(a));
        for index in removed {
            self.sources.remove(index);
        }

        if self.failure.is_none() {
            self.sources.append(&mut registrar.pending);
        }
    }

    fn expire_sources(&mut self) {
        let now = Instant::now();
        self.sources.retain(|source| {
            let expired = source.expired(now);
            if expired {
                debug!("Dropped expired {}", source.name());
            }
            !expired
        });
    }

    fn reap_children(&mut self) {
        let mut exited = Vec::new();

        for (index, child) in self.children.iter_mut().enumerate() {
            if child.status.is_some() {
                continue;
            }
            let pid = child.process.pid();
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {}
                Ok(status) => {
                    if let Some(code) = exit_code(status) {
                        child.status = Some(code);
                        child.killed_by_hangup =
                            matches!(status, WaitStatus::Signaled(_, Signal::SIGHUP, _));
                        exited.push(index);
                    }
                }
                Err(Errno::EINTR) => {}
                Err(Errno::ECHILD) => {
                    warn!("{} (pid {}) was reaped elsewhere", child.process.name(), pid);
                    child.status = Some(1);
                    exited.push(index);
                }
                Err(e) => {
                    child.status = Some(1);
                    exited.push(index);
                    warn!("waitpid on {} failed: {}", pid, e);
                }
            }
        }

        for index in exited {
            self.child_exited(index);
        }
    }

    fn child_exited(&mut self, index: usize) {
        let child = &self.children[index];
        let pid = child.process.pid();
        let status = child.status.unwrap_or(1);

        if status == 0 {
            info!("{} (pid {}) exited", child.process.name(), pid);
        } else if child.hung_up && child.killed_by_hangup {
            debug!(
                "{} (pid {}) ended with status {} after hangup",
                child.process.name(),
                pid,
                status
            );
        } else {
            error!(
                "{} (pid {}) exited with status {}",
                child.process.name(),
                pid,
                status
            );
            self.fail(RecordError::ChildProcessFailure {
                pid: pid.as_raw(),
                status,
            });
        }

        self.begin_shutdown();
    }

    fn fail(&mut self, err: RecordError) {
        if self.failure.is_none() {
            self.failure = Some(err);
        }
        self.begin_shutdown();
    }

    /// Stop dispatching I/O and hang up every child still running
    fn begin_shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;

        for child in self.children.iter_mut().filter(|c| c.status.is_none()) {
            let pid = child.process.pid();
            match kill(pid, Signal::SIGHUP) {
                Ok(()) | Err(Errno::ESRCH) => child.hung_up = true,
                Err(e) => warn!("Failed to hang up pid {}: {}", pid, e),
            }
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        // Consume pending signals so unblocking cannot deliver a late SIGHUP.
        while let Ok(Some(_)) = self.signals.read_signal() {}
        let _ = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&self.previous_mask), None);
    }
}
