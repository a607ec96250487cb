//! Helpers that act inside a particular network namespace

use super::runner::{CommandRunner, argv};
use crate::errors::{RecordError, Result, syscall};
use log::{debug, warn};
use nix::sched::{CloneFlags, setns};
use nix::unistd::Pid;
use std::fs::File;
use std::net::Ipv4Addr;

fn namespace_file(path: &str) -> Result<File> {
    File::open(path)
        .map_err(|e| RecordError::Device(format!("cannot open namespace {}: {}", path, e)))
}

/// Run `f` with the calling thread inside the network namespace of `pid`
///
/// The original namespace is restored before returning, whether `f` succeeded or not.
pub fn in_network_namespace<T>(pid: Pid, f: impl FnOnce() -> Result<T>) -> Result<T> {
    let original = namespace_file("/proc/self/ns/net")?;
    let target = namespace_file(&format!("/proc/{}/ns/net", pid))?;

    setns(&target, CloneFlags::CLONE_NEWNET).map_err(syscall("setns into sandbox"))?;
    debug!("entered network namespace of pid {}", pid);

    let result = f();

    if let Err(e) = setns(&original, CloneFlags::CLONE_NEWNET) {
        // Continuing in the sandbox namespace would put every later host-side
        // change in the wrong place.
        warn!("failed to return to host network namespace: {}", e);
        return Err(syscall("setns back to host")(e));
    }
    debug!("returned to host network namespace");

    result
}

/// Bring up the loopback device of the current namespace
pub fn bring_up_loopback(runner: &dyn CommandRunner) -> Result<()> {
    runner
        .run(&argv(["ip", "link", "set", "dev", "lo", "up"]))
        .map_err(RecordError::Device)
}

/// Route everything in the current namespace through `gateway`
pub fn add_default_route(runner: &dyn CommandRunner, gateway: Ipv4Addr) -> Result<()> {
    runner
        .run(&argv([
            "ip".to_string(),
            "route".to_string(),
            "add".to_string(),
            "default".to_string(),
            "via".to_string(),
            gateway.to_string(),
        ]))
        .map_err(RecordError::Device)
}
