//! Host probes used before and during session setup

use crate::errors::{RecordError, Result};
#[cfg(test)]
use std::cell::Cell;
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;

use nix::unistd::{Uid, User};

const IP_FORWARD_PATH: &str = "/proc/sys/net/ipv4/ip_forward";
const FALLBACK_SHELL: &str = "/bin/sh";

#[cfg(test)]
thread_local! {
    static ROOT_OVERRIDE: Cell<Option<bool>> = const { Cell::new(None) };
}

/// Check if running with an effective uid of root
pub fn is_root() -> bool {
    #[cfg(test)]
    {
        if let Some(value) = ROOT_OVERRIDE.with(|cell| cell.get()) {
            return value;
        }
    }

    nix::unistd::geteuid().is_root()
}

/// Ensure we have root privileges
pub fn require_root() -> Result<()> {
    if !is_root() {
        Err(RecordError::Requirement(
            "recordshell must run with root privileges (setuid root or sudo)".to_string(),
        ))
    } else {
        Ok(())
    }
}

/// Whether the kernel forwards IPv4 packets between interfaces
pub fn ip_forwarding_enabled(path: &Path) -> bool {
    fs::read_to_string(path)
        .map(|content| content.trim() == "1")
        .unwrap_or(false)
}

/// Verify everything the session needs from the host before touching it
pub fn check_requirements() -> Result<()> {
    require_root()?;

    if !ip_forwarding_enabled(Path::new(IP_FORWARD_PATH)) {
        return Err(RecordError::Requirement(format!(
            "IP forwarding is disabled; enable it with `sysctl -w net.ipv4.ip_forward=1` ({})",
            IP_FORWARD_PATH
        )));
    }

    Ok(())
}

/// Extract the first IPv4 `nameserver` entry from resolv.conf content
pub fn parse_nameserver(content: &str) -> Option<Ipv4Addr> {
    content
        .lines()
        .map(|line| line.split('#').next().unwrap_or("").trim())
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            match (fields.next(), fields.next()) {
                (Some("nameserver"), Some(addr)) => addr.parse::<Ipv4Addr>().ok(),
                _ => None,
            }
        })
        .next()
}

/// First nameserver configured on the host
pub fn first_nameserver(resolv_conf: &Path) -> Result<Ipv4Addr> {
    let content = fs::read_to_string(resolv_conf).map_err(|e| {
        RecordError::Requirement(format!("cannot read {}: {}", resolv_conf.display(), e))
    })?;

    parse_nameserver(&content).ok_or_else(|| {
        RecordError::Requirement(format!(
            "no IPv4 nameserver found in {}",
            resolv_conf.display()
        ))
    })
}

/// Login shell of the given user, falling back to /bin/sh
pub fn login_shell(uid: u32) -> String {
    match User::from_uid(Uid::from_raw(uid)) {
        Ok(Some(user)) if !user.shell.as_os_str().is_empty() => {
            user.shell.to_string_lossy().into_owned()
        }
        _ => FALLBACK_SHELL.to_string(),
    }
}

#[cfg(test)]
pub fn set_root_override(value: Option<bool>) {
    ROOT_OVERRIDE.with(|cell| cell.set(value));
}
