//! Private subnet allocation for the veth pair
//!
//! Candidates are `/24` networks inside the shared address space
//! `100.64.<octet>.0/24`. A candidate is free when it overlaps none of the
//! networks already assigned to host interfaces.

use crate::errors::{RecordError, Result};
use ipnetwork::Ipv4Network;
use log::debug;
use nix::ifaddrs::getifaddrs;
use std::net::Ipv4Addr;

const SUBNET_PREFIX: u8 = 24;
const MAX_OCTET: u16 = 255;

/// A leased subnet and the address handed to the local end inside it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// The whole subnet reserved for this end
    pub subnet: Ipv4Network,
    /// Address assigned to the device
    pub address: Ipv4Addr,
    /// Third octet the subnet was found at; pass `octet + 1` as the next hint
    pub octet: u16,
}

impl Allocation {
    /// Hint to use for the next allocation in the same session
    pub fn next_hint(&self) -> u16 {
        self.octet + 1
    }
}

/// Picks subnets that do not collide with the host's interfaces
#[derive(Debug, Clone, Default)]
pub struct AddressAllocator {
    assigned: Vec<Ipv4Network>,
}

impl AddressAllocator {
    /// Allocator over an explicit set of already-assigned networks
    pub fn new(assigned: Vec<Ipv4Network>) -> Self {
        Self { assigned }
    }

    /// Allocator seeded with every IPv4 network currently on a host interface
    pub fn from_host() -> Result<Self> {
        let addrs = getifaddrs()
            .map_err(|e| RecordError::Device(format!("getifaddrs failed: {}", e)))?;

        let mut assigned = Vec::new();
        for ifaddr in addrs {
            let Some(address) = ifaddr.address.as_ref().and_then(|a| a.as_sockaddr_in()) else {
                continue;
            };
            let ip = Ipv4Addr::from(address.ip());
            let prefix = ifaddr
                .netmask
                .as_ref()
                .and_then(|m| m.as_sockaddr_in())
                .map(|m| u32::from(Ipv4Addr::from(m.ip())).count_ones() as u8)
                .unwrap_or(32);

            if let Ok(network) = Ipv4Network::new(ip, prefix) {
                debug!("host interface {} has {}", ifaddr.interface_name, network);
                assigned.push(network);
            }
        }

        Ok(Self { assigned })
    }

    /// Networks treated as taken
    pub fn assigned(&self) -> &[Ipv4Network] {
        &self.assigned
    }

    /// Mark a network as taken
    pub fn reserve(&mut self, network: Ipv4Network) {
        self.assigned.push(network);
    }

    /// Find the first free subnet at or above `start_hint`
    pub fn allocate(&self, start_hint: u16) -> Result<Allocation> {
        let start = start_hint.max(1);

        for octet in start..=MAX_OCTET {
            let subnet = Self::candidate(octet)?;
            if self.assigned.iter().any(|taken| taken.overlaps(subnet)) {
                continue;
            }

            let address = subnet.nth(1).ok_or_else(|| {
                RecordError::InvalidConfig(format!("subnet {} has no host addresses", subnet))
            })?;

            debug!("allocated {} (address {})", subnet, address);
            return Ok(Allocation {
                subnet,
                address,
                octet,
            });
        }

        Err(RecordError::AllocationExhausted {
            start: start_hint,
            probes: (MAX_OCTET + 1).saturating_sub(start),
        })
    }

    /// Allocate two disjoint subnets, the second strictly above the first
    pub fn allocate_pair(&self, start_hint: u16) -> Result<(Allocation, Allocation)> {
        let first = self.allocate(start_hint)?;
        let second = self.allocate(first.next_hint())?;
        Ok((first, second))
    }

    fn candidate(octet: u16) -> Result<Ipv4Network> {
        let third = u8::try_from(octet)
            .map_err(|_| RecordError::InvalidConfig(format!("octet {} out of range", octet)))?;
        Ipv4Network::new(Ipv4Addr::new(100, 64, third, 0), SUBNET_PREFIX)
            .map_err(|e| RecordError::InvalidConfig(format!("bad candidate subnet: {}", e)))
    }
}
