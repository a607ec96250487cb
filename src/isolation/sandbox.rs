//! The sandboxed subtree: a cloned process in its own network namespace
//!
//! The parent gets the child's pid as soon as `clone` returns and finishes
//! host-side plumbing with it. The child prepares what still needs root,
//! then waits on a [`SetupGate`] until the parent releases it, and only then
//! drops privileges and starts the interactive shell.

use super::privilege::{Credentials, PrivilegeBoundary};
use crate::errors::{RecordError, Result};
use crate::execution::{ChildProcess, Supervisor, UserEnvironment, exec_shell, run_child_body};
use crate::network::SystemRunner;
use crate::network::netns::bring_up_loopback;
use crate::proxy::DnsProxy;
use log::{debug, info};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sched::{CloneFlags, clone};
use nix::sys::signal::Signal;
use nix::unistd::{Pid, pipe2, read, write};
use std::net::{Ipv4Addr, SocketAddr};
use std::os::fd::{AsRawFd, OwnedFd};

const CHILD_STACK_SIZE: usize = 8 * 1024 * 1024;

/// Lifecycle of the sandbox process, in the only order it may happen
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SandboxState {
    Created,
    NetworkConfigured,
    PrivilegesDropped,
    Running,
    Terminated,
}

impl SandboxState {
    pub fn successor(self) -> Option<SandboxState> {
        match self {
            SandboxState::Created => Some(SandboxState::NetworkConfigured),
            SandboxState::NetworkConfigured => Some(SandboxState::PrivilegesDropped),
            SandboxState::PrivilegesDropped => Some(SandboxState::Running),
            SandboxState::Running => Some(SandboxState::Terminated),
            SandboxState::Terminated => None,
        }
    }

    /// Move to `next`, which must be the immediate successor
    pub fn advance(&mut self, next: SandboxState) -> Result<()> {
        if self.successor() != Some(next) {
            return Err(RecordError::SetupOrder(format!(
                "sandbox cannot move from {:?} to {:?}",
                self, next
            )));
        }
        debug!("Sandbox {:?} -> {:?}", self, next);
        *self = next;
        Ok(())
    }
}

/// One-shot pipe that holds a child until its parent finishes setup
pub struct SetupGate {
    reader: OwnedFd,
}

/// Parent half of a [`SetupGate`]; dropping it unreleased aborts the child
pub struct GateRelease {
    writer: OwnedFd,
}

pub fn setup_gate() -> Result<(GateRelease, SetupGate)> {
    let (reader, writer) =
        pipe2(OFlag::O_CLOEXEC).map_err(|e| RecordError::Syscall(format!("pipe2 failed: {}", e)))?;
    Ok((GateRelease { writer }, SetupGate { reader }))
}

impl SetupGate {
    /// Block until released; fails if the parent gave up
    pub fn wait(self) -> Result<()> {
        let mut byte = [0u8; 1];
        loop {
            match read(self.reader.as_raw_fd(), &mut byte) {
                Ok(1) => return Ok(()),
                Ok(_) => {
                    return Err(RecordError::Device(
                        "host-side setup aborted before the sandbox was released".to_string(),
                    ));
                }
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(RecordError::Syscall(format!("setup gate read failed: {}", e))),
            }
        }
    }
}

impl GateRelease {
    pub fn release(self) -> Result<()> {
        loop {
            match write(&self.writer, &[1u8]) {
                Ok(_) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    return Err(RecordError::Syscall(format!(
                        "setup gate release failed: {}",
                        e
                    )));
                }
            }
        }
    }
}

/// Everything the sandbox process needs, captured by value before `clone`
#[derive(Debug, Clone)]
pub struct SandboxPlan {
    /// Resolver the shell's DNS configuration points at
    pub nameserver: Ipv4Addr,
    /// Host-side DNS proxy listeners, reachable through the link pair
    pub dns_udp: SocketAddr,
    pub dns_tcp: SocketAddr,
    pub shell: String,
    pub prompt_prefix: String,
    pub environment: UserEnvironment,
    pub credentials: Credentials,
}

/// Handle to a spawned sandbox that has not been released yet
pub struct NamespaceSandbox {
    pid: Pid,
    gate: GateRelease,
}

impl NamespaceSandbox {
    /// Clone the sandbox process and return without waiting for it
    pub fn spawn(plan: SandboxPlan, isolate_network: bool) -> Result<Self> {
        Self::spawn_with(isolate_network, move |gate| {
            run_sandbox(plan, isolate_network, gate)
        })
    }

    /// Clone a child running `body`, which receives the setup gate
    pub fn spawn_with<F>(isolate_network: bool, body: F) -> Result<Self>
    where
        F: FnOnce(SetupGate) -> Result<i32>,
    {
        let (release, gate) = setup_gate()?;
        let release_fd = release.writer.as_raw_fd();
        let flags = if isolate_network {
            CloneFlags::CLONE_NEWNET
        } else {
            CloneFlags::empty()
        };

        let mut stack = vec![0u8; CHILD_STACK_SIZE];
        let mut pending = Some((gate, body));
        let callback = Box::new(move || -> isize {
            let code = match pending.take() {
                Some((gate, body)) => {
                    let _ = nix::unistd::close(release_fd);
                    run_child_body("sandbox", move || {
                        crate::execution::process::restore_signal_mask()?;
                        body(gate)
                    })
                }
                None => 1,
            };
            std::process::exit(code)
        });

        // SAFETY: the child runs on its own stack in a copy of our address
        // space and leaves only through `exit`.
        let pid = unsafe {
            clone(
                callback,
                &mut stack,
                flags,
                Some(Signal::SIGCHLD as i32),
            )
        }
        .map_err(|e| RecordError::Syscall(format!("clone failed: {}", e)))?;

        info!(
            "Spawned sandbox pid {}{}",
            pid,
            if isolate_network {
                " in a new network namespace"
            } else {
                ""
            }
        );
        Ok(Self { pid, gate: release })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Let the sandbox continue past host-side setup and hand it over for supervision
    pub fn release(self) -> Result<ChildProcess> {
        self.gate.release()?;
        debug!("Released sandbox pid {}", self.pid);
        Ok(ChildProcess::from_pid("sandbox", self.pid))
    }
}

/// Body of the sandbox process
fn run_sandbox(plan: SandboxPlan, isolate_network: bool, gate: SetupGate) -> Result<i32> {
    let mut state = SandboxState::Created;

    let mut dns_inside = None;
    if isolate_network {
        bring_up_loopback(&SystemRunner::new())?;
        dns_inside = DnsProxy::maybe_proxy(plan.nameserver, plan.dns_udp, plan.dns_tcp)?;
    }
    state.advance(SandboxState::NetworkConfigured)?;

    gate.wait()?;

    PrivilegeBoundary::new(plan.credentials).drop_privileges()?;
    state.advance(SandboxState::PrivilegesDropped)?;

    let mut supervisor = Supervisor::new()?;
    let environment = plan.environment.with_prompt_prefix(&plan.prompt_prefix);
    let shell = plan.shell;
    supervisor.add_child_process("shell", move || match exec_shell(&shell, &environment)? {})?;
    if let Some(dns) = dns_inside {
        dns.register_handlers(&mut supervisor);
    }
    state.advance(SandboxState::Running)?;

    let result = supervisor.run();
    state.advance(SandboxState::Terminated)?;
    result
}
