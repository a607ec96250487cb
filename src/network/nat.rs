//! NAT and DNAT rules redirecting sandbox traffic
//!
//! Each rule is a guard: it is appended on install and deleted when the guard
//! is released or dropped, on success and error paths alike.

use super::runner::{CommandRunner, argv};
use crate::errors::{RecordError, Result};
use ipnetwork::Ipv4Network;
use log::{debug, info, warn};
use nix::unistd::{Pid, getpid};
use std::net::SocketAddrV4;
use std::rc::Rc;

const NAT_TABLE: &str = "nat";

/// An iptables rule owned by the process that appended it
pub struct InstalledRule {
    runner: Rc<dyn CommandRunner>,
    chain: &'static str,
    args: Vec<String>,
    owner: Pid,
    released: bool,
}

impl InstalledRule {
    fn install(runner: Rc<dyn CommandRunner>, chain: &'static str, args: Vec<String>) -> Result<Self> {
        let check = Self::command("-C", chain, &args);
        let exists = runner
            .execute(&check)
            .map_err(|e| RecordError::Syscall(format!("iptables could not be started: {}", e)))?
            .success;
        if exists {
            return Err(RecordError::RuleConflict(format!(
                "{} {}",
                chain,
                args.join(" ")
            )));
        }

        runner
            .run(&Self::command("-A", chain, &args))
            .map_err(RecordError::Syscall)?;
        debug!("iptables rule appended to {}: {}", chain, args.join(" "));

        Ok(Self {
            runner,
            chain,
            args,
            owner: getpid(),
            released: false,
        })
    }

    fn command(action: &str, chain: &str, args: &[String]) -> Vec<String> {
        let mut command = argv(["iptables", "-t", NAT_TABLE, action, chain]);
        command.extend(args.iter().cloned());
        command
    }

    /// Chain the rule lives in
    pub fn chain(&self) -> &str {
        self.chain
    }

    /// Rule arguments after the chain name
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Delete the rule; subsequent calls and drops do nothing
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        // Forked children carry a copy of this guard but never own the rule.
        if getpid() != self.owner {
            return;
        }

        match self
            .runner
            .run(&Self::command("-D", self.chain, &self.args))
        {
            Ok(()) => debug!("iptables rule removed from {}", self.chain),
            Err(e) => warn!("iptables rule in {} not removed: {}", self.chain, e),
        }
    }
}

impl Drop for InstalledRule {
    fn drop(&mut self) {
        self.release();
    }
}

/// Masquerade rule for traffic leaving the sandbox subnet
pub struct NatRule {
    rule: InstalledRule,
    subnet: Ipv4Network,
}

impl NatRule {
    pub fn subnet(&self) -> Ipv4Network {
        self.subnet
    }

    pub fn rule(&self) -> &InstalledRule {
        &self.rule
    }

    pub fn release(&mut self) {
        self.rule.release();
    }
}

/// Redirect of every inbound TCP connection on an interface to the recording proxy
pub struct DnatRule {
    rule: InstalledRule,
    target: SocketAddrV4,
    interface: String,
}

impl DnatRule {
    pub fn target(&self) -> SocketAddrV4 {
        self.target
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn rule(&self) -> &InstalledRule {
        &self.rule
    }

    pub fn release(&mut self) {
        self.rule.release();
    }
}

/// Installs the translation rules for one session
///
/// Every rule carries a comment naming the session, so rules from concurrent
/// sessions never compare equal and leftovers are attributable.
pub struct TrafficRedirector {
    runner: Rc<dyn CommandRunner>,
    tag: String,
}

impl TrafficRedirector {
    pub fn new(runner: Rc<dyn CommandRunner>, tag: impl Into<String>) -> Self {
        Self {
            runner,
            tag: tag.into(),
        }
    }

    /// Session tag attached to every rule as an iptables comment
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Masquerade packets from `internal_subnet` as the host's outbound address
    pub fn install_nat(&self, internal_subnet: Ipv4Network) -> Result<NatRule> {
        info!("Installing NAT for {}", internal_subnet);

        let args = argv([
            "-s".to_string(),
            internal_subnet.to_string(),
            "-m".to_string(),
            "comment".to_string(),
            "--comment".to_string(),
            self.tag.clone(),
            "-j".to_string(),
            "MASQUERADE".to_string(),
        ]);

        Ok(NatRule {
            rule: InstalledRule::install(Rc::clone(&self.runner), "POSTROUTING", args)?,
            subnet: internal_subnet,
        })
    }

    /// Rewrite the destination of every TCP connection arriving on `interface`
    ///
    /// The original destination is not matched, so any address the sandbox
    /// dials lands on `redirect_target`.
    pub fn install_dnat(&self, redirect_target: SocketAddrV4, interface: &str) -> Result<DnatRule> {
        info!(
            "Installing DNAT on {} to {}",
            interface, redirect_target
        );

        let args = argv([
            "-i".to_string(),
            interface.to_string(),
            "-p".to_string(),
            "tcp".to_string(),
            "-m".to_string(),
            "comment".to_string(),
            "--comment".to_string(),
            self.tag.clone(),
            "-j".to_string(),
            "DNAT".to_string(),
            "--to-destination".to_string(),
            redirect_target.to_string(),
        ]);

        Ok(DnatRule {
            rule: InstalledRule::install(Rc::clone(&self.runner), "PREROUTING", args)?,
            target: redirect_target,
            interface: interface.to_string(),
        })
    }
}
