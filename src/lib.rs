//! recordshell: record the network traffic of an interactive shell
//!
//! Launches a shell inside a fresh network namespace wired to the host with a
//! veth pair. Outbound traffic is masqueraded, every TCP connection is
//! redirected to a recording proxy, and DNS is forwarded through a proxy of
//! its own. Each recorded exchange lands as one file in a storage directory.
//!
//! # Modules
//!
//! - **network**: address allocation, veth pairs, NAT/DNAT rules
//! - **isolation**: namespace sandbox and privilege boundary
//! - **execution**: supervisors, child processes, shell launch
//! - **proxy**: DNS and recording TCP proxies
//! - **storage**: storage directory and record files
//! - **controller**: session configuration and orchestration
//!
//! # Example
//!
//! ```ignore
//! use recordshell::{RecordShellBuilder, UserEnvironment};
//!
//! let environment = UserEnvironment::capture_and_clear();
//! let mut session = RecordShellBuilder::new("recording").build(environment)?;
//! let status = session.run()?;
//! ```

// Core modules
pub mod cli;
pub mod errors;
pub mod logging;
pub mod utils;

// Layered modules
pub mod execution;
pub mod isolation;
pub mod network;
pub mod proxy;
pub mod storage;

// Main controller
pub mod controller;

// Public API
pub use controller::{RecordShell, RecordShellBuilder, RecordShellConfig, SetupSequence, SetupStep};
pub use errors::{RecordError, Result};
pub use execution::{Supervisor, UserEnvironment};
pub use isolation::{NamespaceSandbox, PrivilegeBoundary};
pub use network::{AddressAllocator, TrafficRedirector, VirtualLinkPair};
pub use storage::StorageDirectory;

#[cfg(test)]
pub mod test_support;
