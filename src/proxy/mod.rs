//! Recording proxies: DNS forwarding and transparent TCP recording
//!
//! Both proxies bind their listeners while the process is still privileged
//! and later hand their sockets to a [`Supervisor`](crate::execution::Supervisor)
//! through `register_handlers`.
//!
//! # Examples
//!
//! ```ignore
//! use recordshell::proxy::{DnsProxy, HttpProxy};
//!
//! let dns = DnsProxy::new(listen, upstream, upstream)?;
//! let http = HttpProxy::new(listen, storage)?;
//! let redirect_target = http.local_addr()?;
//! ```

pub mod dns;
pub mod http;
pub mod relay;
pub use dns::DnsProxy;
pub use http::{DestinationLookup, HttpProxy, KernelDestinationLookup};
pub use relay::{Relay, Transcript};
