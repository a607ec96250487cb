//! Virtual ethernet pair spanning the host and the sandbox namespace

use super::runner::{CommandRunner, argv};
use crate::errors::{RecordError, Result};
use log::{debug, info, warn};
use nix::unistd::{Pid, getpid};
use std::net::Ipv4Addr;
use std::rc::Rc;

/// Longest interface name the kernel accepts (IFNAMSIZ - 1)
pub const MAX_DEVICE_NAME: usize = 15;

/// Check a device name against kernel naming rules
pub fn validate_device_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_DEVICE_NAME {
        return Err(RecordError::Device(format!(
            "invalid device name {:?}: must be 1-{} bytes",
            name, MAX_DEVICE_NAME
        )));
    }
    if name.contains(|c: char| c == '/' || c == ':' || c.is_whitespace()) {
        return Err(RecordError::Device(format!(
            "invalid device name {:?}: contains a forbidden character",
            name
        )));
    }
    Ok(())
}

/// Bring a device up with point-to-point addressing to `peer`
///
/// Runs in whatever network namespace the calling thread is in.
pub fn assign_address(
    runner: &dyn CommandRunner,
    device: &str,
    local: Ipv4Addr,
    peer: Ipv4Addr,
) -> Result<()> {
    info!("Assigning {} peer {} on {}", local, peer, device);

    runner
        .run(&argv([
            "ip".to_string(),
            "addr".to_string(),
            "add".to_string(),
            local.to_string(),
            "peer".to_string(),
            peer.to_string(),
            "dev".to_string(),
            device.to_string(),
        ]))
        .map_err(RecordError::Device)?;

    runner
        .run(&argv(["ip", "link", "set", "dev", device, "up"]))
        .map_err(RecordError::Device)
}

/// A pair of linked veth devices created in the host namespace
///
/// Dropping the pair deletes it unless one end was handed to a namespace whose
/// teardown destroys both ends, or unless the drop happens in a forked copy of
/// the creating process.
pub struct VirtualLinkPair {
    runner: Rc<dyn CommandRunner>,
    host_end: String,
    peer_end: String,
    externally_owned: bool,
    released: bool,
    owner: Pid,
}

impl VirtualLinkPair {
    /// Create both ends atomically in the current namespace
    pub fn create(runner: Rc<dyn CommandRunner>, host_end: &str, peer_end: &str) -> Result<Self> {
        validate_device_name(host_end)?;
        validate_device_name(peer_end)?;
        if host_end == peer_end {
            return Err(RecordError::Device(format!(
                "veth ends must have distinct names, got {} twice",
                host_end
            )));
        }

        info!("Creating veth pair: {} <-> {}", host_end, peer_end);
        runner
            .run(&argv([
                "ip", "link", "add", host_end, "type", "veth", "peer", "name", peer_end,
            ]))
            .map_err(RecordError::Device)?;

        Ok(Self {
            runner,
            host_end: host_end.to_string(),
            peer_end: peer_end.to_string(),
            externally_owned: false,
            released: false,
            owner: getpid(),
        })
    }

    /// Name of the end that stays on the host
    pub fn host_end(&self) -> &str {
        &self.host_end
    }

    /// Name of the end that is handed to the sandbox
    pub fn peer_end(&self) -> &str {
        &self.peer_end
    }

    /// Assign point-to-point addressing to one end of this pair
    pub fn assign(&self, device: &str, local: Ipv4Addr, peer: Ipv4Addr) -> Result<()> {
        self.ensure_member(device)?;
        assign_address(self.runner.as_ref(), device, local, peer)
    }

    /// Move one end into the network namespace of `target`
    pub fn move_to_namespace(&self, device: &str, target: Pid) -> Result<()> {
        self.ensure_member(device)?;
        info!("Moving {} into network namespace of pid {}", device, target);

        self.runner
            .run(&argv([
                "ip".to_string(),
                "link".to_string(),
                "set".to_string(),
                "dev".to_string(),
                device.to_string(),
                "netns".to_string(),
                target.to_string(),
            ]))
            .map_err(RecordError::Device)
    }

    /// The kernel will destroy both ends when the sandbox namespace dies
    pub fn mark_externally_owned(&mut self) {
        debug!(
            "veth pair {} <-> {} now owned by namespace teardown",
            self.host_end, self.peer_end
        );
        self.externally_owned = true;
    }

    pub fn is_externally_owned(&self) -> bool {
        self.externally_owned
    }

    /// Delete the pair if this process still owns it; later calls do nothing
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        if self.externally_owned || getpid() != self.owner {
            return;
        }

        // Deleting one end removes its peer. A missing device means the
        // kernel already tore the pair down.
        if let Err(e) = self
            .runner
            .run(&argv(["ip", "link", "del", self.host_end.as_str()]))
        {
            warn!("veth pair {} not deleted: {}", self.host_end, e);
        } else {
            debug!("veth pair {} deleted", self.host_end);
        }
    }

    fn ensure_member(&self, device: &str) -> Result<()> {
        if device == self.host_end || device == self.peer_end {
            Ok(())
        } else {
            Err(RecordError::Device(format!(
                "{} is not part of veth pair {} <-> {}",
                device, self.host_end, self.peer_end
            )))
        }
    }
}

impl Drop for VirtualLinkPair {
    fn drop(&mut self) {
        self.release();
    }
}
