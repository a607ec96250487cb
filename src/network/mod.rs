//! Network layer: host-side plumbing between the sandbox and the recorder
//!
//! This module owns every piece of kernel network state a session creates.
//!
//! # Features
//!
//! - **Address allocation**: disjoint `/24` subnets that avoid host interfaces
//! - **Veth pairs**: one end on the host, one end in the sandbox namespace
//! - **Traffic redirection**: outbound masquerade and inbound TCP DNAT
//! - **Namespace helpers**: run configuration inside another process's namespace
//!
//! # Examples
//!
//! ```ignore
//! use recordshell::network::{AddressAllocator, SystemRunner, VirtualLinkPair};
//! use std::rc::Rc;
//!
//! let (egress, ingress) = AddressAllocator::from_host()?.allocate_pair(1)?;
//! let pair = VirtualLinkPair::create(Rc::new(SystemRunner::new()), "veth-1", "veth-i1")?;
//! pair.assign("veth-1", egress.address, ingress.address)?;
//! ```

pub mod address;
pub mod nat;
pub mod netns;
pub mod runner;
pub mod veth;

pub use address::{AddressAllocator, Allocation};
pub use nat::{DnatRule, InstalledRule, NatRule, TrafficRedirector};
pub use runner::{CommandOutput, CommandRunner, SystemRunner};
pub use veth::VirtualLinkPair;

#[cfg(test)]
mod tests;
