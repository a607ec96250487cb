//! DNS proxy: forwards UDP queries and relays TCP connections to a resolver

use super::relay::{AcceptBackoff, Relay, connect_nonblocking};
use crate::errors::{RecordError, Result};
use crate::execution::{Flow, IoSource, Registrar, Supervisor};
use log::{debug, info, warn};
use nix::poll::PollFlags;
use std::io::ErrorKind;
use std::net::{
    Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, TcpListener, UdpSocket,
};
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Largest datagram accepted from clients or the resolver
const MAX_DATAGRAM: usize = 65535;

/// Port the in-namespace instance listens on
pub const DNS_PORT: u16 = 53;

/// How long a forwarded UDP query waits for the resolver before it is dropped
pub const UDP_ANSWER_TIMEOUT: Duration = Duration::from_secs(10);

pub struct DnsProxy {
    udp_listener: UdpSocket,
    tcp_listener: TcpListener,
    udp_target: SocketAddr,
    tcp_target: SocketAddr,
    udp_timeout: Duration,
}

impl DnsProxy {
    /// Bind UDP and TCP listeners at `listen`; port 0 picks a port per protocol
    pub fn new(listen: SocketAddrV4, udp_target: SocketAddr, tcp_target: SocketAddr) -> Result<Self> {
        let udp_listener = UdpSocket::bind(listen)
            .map_err(|e| RecordError::Proxy(format!("cannot bind DNS UDP {}: {}", listen, e)))?;
        let tcp_listener = TcpListener::bind(listen)
            .map_err(|e| RecordError::Proxy(format!("cannot bind DNS TCP {}: {}", listen, e)))?;
        udp_listener.set_nonblocking(true)?;
        tcp_listener.set_nonblocking(true)?;

        let proxy = Self {
            udp_listener,
            tcp_listener,
            udp_target,
            tcp_target,
            udp_timeout: UDP_ANSWER_TIMEOUT,
        };
        info!(
            "DNS proxy on udp {} tcp {} forwarding to {}",
            proxy.udp_listener_addr()?,
            proxy.tcp_listener_addr()?,
            udp_target
        );
        Ok(proxy)
    }

    /// An instance reachable inside a fresh namespace when the resolver is local
    ///
    /// A loopback nameserver is unreachable from inside a new network
    /// namespace, so queries to it are answered by a proxy bound at the same
    /// address that forwards to the given targets.
    pub fn maybe_proxy(
        nameserver: Ipv4Addr,
        udp_target: SocketAddr,
        tcp_target: SocketAddr,
    ) -> Result<Option<Self>> {
        if !nameserver.is_loopback() {
            return Ok(None);
        }
        Self::new(SocketAddrV4::new(nameserver, DNS_PORT), udp_target, tcp_target).map(Some)
    }

    /// Override how long unanswered UDP queries are kept
    pub fn with_udp_timeout(mut self, timeout: Duration) -> Self {
        self.udp_timeout = timeout;
        self
    }

    pub fn udp_listener_addr(&self) -> Result<SocketAddr> {
        Ok(self.udp_listener.local_addr()?)
    }

    pub fn tcp_listener_addr(&self) -> Result<SocketAddr> {
        Ok(self.tcp_listener.local_addr()?)
    }

    pub fn register_handlers(self, supervisor: &mut Supervisor) {
        let udp_listener = Rc::new(self.udp_listener);
        supervisor.register_io(Box::new(UdpQueries {
            listener: udp_listener,
            target: self.udp_target,
            timeout: self.udp_timeout,
        }));
        supervisor.register_io(Box::new(TcpQueries {
            listener: self.tcp_listener,
            target: self.tcp_target,
            backoff: AcceptBackoff::default(),
        }));
    }
}

fn unspecified_for(target: SocketAddr) -> SocketAddr {
    match target {
        SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
    }
}

struct UdpQueries {
    listener: Rc<UdpSocket>,
    target: SocketAddr,
    timeout: Duration,
}

impl UdpQueries {
    fn forward(&self, query: &[u8], client: SocketAddr) -> Result<UdpAnswer> {
        let upstream = UdpSocket::bind(unspecified_for(self.target))?;
        upstream.connect(self.target)?;
        upstream.set_nonblocking(true)?;
        upstream.send(query)?;
        Ok(UdpAnswer {
            upstream,
            listener: self.listener.clone(),
            client,
            deadline: Instant::now() + self.timeout,
        })
    }
}

impl IoSource for UdpQueries {
    fn raw_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    fn on_ready(&mut self, _events: PollFlags, registrar: &mut Registrar) -> Result<Flow> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            match self.listener.recv_from(&mut buf) {
                Ok((n, client)) => match self.forward(&buf[..n], client) {
                    Ok(answer) => {
                        debug!("DNS query from {} ({} bytes)", client, n);
                        registrar.register_io(Box::new(answer));
                    }
                    Err(e) => warn!("Dropping DNS query from {}: {}", client, e),
                },
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(Flow::Continue),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(RecordError::Proxy(format!("DNS UDP receive failed: {}", e)));
                }
            }
        }
    }

    fn name(&self) -> &str {
        "dns udp listener"
    }
}

/// One outstanding UDP query waiting for the resolver's answer
struct UdpAnswer {
    upstream: UdpSocket,
    listener: Rc<UdpSocket>,
    client: SocketAddr,
    deadline: Instant,
}

impl IoSource for UdpAnswer {
    fn raw_fd(&self) -> RawFd {
        self.upstream.as_raw_fd()
    }

    fn on_ready(&mut self, _events: PollFlags, _registrar: &mut Registrar) -> Result<Flow> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        match self.upstream.recv(&mut buf) {
            Ok(n) => {
                if let Err(e) = self.listener.send_to(&buf[..n], self.client) {
                    warn!("Cannot return DNS answer to {}: {}", self.client, e);
                }
                Ok(Flow::Remove)
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {
                Ok(Flow::Continue)
            }
            Err(e) => {
                debug!("DNS upstream error for {}: {}", self.client, e);
                Ok(Flow::Remove)
            }
        }
    }

    fn name(&self) -> &str {
        "dns udp exchange"
    }

    fn expired(&self, now: Instant) -> bool {
        if now < self.deadline {
            return false;
        }
        debug!("No DNS answer for {} before the deadline", self.client);
        true
    }
}

struct TcpQueries {
    listener: TcpListener,
    target: SocketAddr,
    backoff: AcceptBackoff,
}

impl IoSource for TcpQueries {
    fn raw_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    fn interest(&self) -> PollFlags {
        self.backoff.interest(Instant::now())
    }

    fn on_ready(&mut self, _events: PollFlags, registrar: &mut Registrar) -> Result<Flow> {
        loop {
            let (client, peer) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(Flow::Continue),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("DNS TCP accept failed: {}", e);
                    self.backoff.pause(Instant::now());
                    return Ok(Flow::Continue);
                }
            };

            match connect_nonblocking(self.target)
                .and_then(|(server, connected)| Relay::new(client, server, connected))
            {
                Ok(relay) => {
                    debug!("DNS TCP connection from {}", peer);
                    relay.label(format!("dns {} -> {}", peer, self.target)).register(registrar);
                }
                Err(e) => warn!("Dropping DNS TCP connection from {}: {}", peer, e),
            }
        }
    }

    fn name(&self) -> &str {
        "dns tcp listener"
    }
}
