//! Isolation layer: network namespace sandbox + privilege separation
//!
//! # Features
//!
//! - **Namespace sandbox**: `clone` into a fresh network namespace, held at a
//!   setup gate until host-side plumbing is complete
//! - **Privilege boundary**: one-shot, verified drop to the invoking user
//!
//! # Examples
//!
//! ```ignore
//! use recordshell::isolation::{NamespaceSandbox, SandboxPlan};
//!
//! let sandbox = NamespaceSandbox::spawn(plan, true)?;
//! // move a device into sandbox.pid()'s namespace ...
//! let child = sandbox.release()?;
//! ```

pub mod privilege;
pub mod sandbox;
pub use privilege::{Credentials, PrivilegeBoundary, PrivilegeState};
pub use sandbox::{NamespaceSandbox, SandboxPlan, SandboxState, SetupGate};
