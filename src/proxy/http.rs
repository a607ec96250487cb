//! Transparent TCP proxy that records every redirected connection

use super::relay::{AcceptBackoff, Relay, Transcript, connect_nonblocking};
use crate::errors::{RecordError, Result};
use crate::execution::{Flow, IoSource, Registrar, Supervisor};
use crate::storage::{StorageDirectory, TrafficRecord};
use log::{debug, info, warn};
use nix::poll::PollFlags;
use nix::sys::socket::{getsockopt, sockopt::OriginalDst};
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;
use std::time::Instant;

/// Recovers where a redirected connection was originally headed
pub trait DestinationLookup {
    fn original_destination(&self, stream: &TcpStream) -> Result<SocketAddr>;
}

/// Reads the pre-DNAT destination from conntrack via `SO_ORIGINAL_DST`
#[derive(Debug, Default, Clone, Copy)]
pub struct KernelDestinationLookup;

impl DestinationLookup for KernelDestinationLookup {
    fn original_destination(&self, stream: &TcpStream) -> Result<SocketAddr> {
        let raw = getsockopt(stream, OriginalDst)
            .map_err(|e| RecordError::Proxy(format!("SO_ORIGINAL_DST failed: {}", e)))?;
        let address = Ipv4Addr::from(u32::from_be(raw.sin_addr.s_addr));
        let port = u16::from_be(raw.sin_port);
        Ok(SocketAddr::V4(SocketAddrV4::new(address, port)))
    }
}

pub struct HttpProxy {
    listener: TcpListener,
    storage: StorageDirectory,
    lookup: Rc<dyn DestinationLookup>,
}

impl HttpProxy {
    pub fn new(listen: SocketAddrV4, storage: StorageDirectory) -> Result<Self> {
        Self::with_lookup(listen, storage, Rc::new(KernelDestinationLookup))
    }

    pub fn with_lookup(
        listen: SocketAddrV4,
        storage: StorageDirectory,
        lookup: Rc<dyn DestinationLookup>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(listen)
            .map_err(|e| RecordError::Proxy(format!("cannot bind HTTP proxy {}: {}", listen, e)))?;
        listener.set_nonblocking(true)?;
        info!("HTTP proxy listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            storage,
            lookup,
        })
    }

    /// Listener address; this is the redirect target for DNAT
    pub fn local_addr(&self) -> Result<SocketAddrV4> {
        match self.listener.local_addr()? {
            SocketAddr::V4(addr) => Ok(addr),
            SocketAddr::V6(addr) => Err(RecordError::Proxy(format!(
                "HTTP proxy bound to unexpected address {}",
                addr
            ))),
        }
    }

    pub fn storage(&self) -> &StorageDirectory {
        &self.storage
    }

    pub fn register_handlers(self, supervisor: &mut Supervisor) -> Result<()> {
        let own_address = SocketAddr::V4(self.local_addr()?);
        supervisor.register_io(Box::new(Acceptor {
            listener: self.listener,
            own_address,
            storage: Rc::new(self.storage),
            lookup: self.lookup,
            backoff: AcceptBackoff::default(),
        }));
        Ok(())
    }
}

struct Acceptor {
    listener: TcpListener,
    own_address: SocketAddr,
    storage: Rc<StorageDirectory>,
    lookup: Rc<dyn DestinationLookup>,
    backoff: AcceptBackoff,
}

impl Acceptor {
    fn relay(&self, client: TcpStream, peer: SocketAddr) -> Result<Relay> {
        let destination = self.lookup.original_destination(&client)?;
        if destination == self.own_address {
            return Err(RecordError::Proxy(format!(
                "{} connected to the proxy itself",
                peer
            )));
        }

        let (server, connected) = connect_nonblocking(destination)?;
        let storage = self.storage.clone();
        let hook = Box::new(move |transcript: Transcript| -> Result<()> {
            let record =
                TrafficRecord::new(peer, destination, transcript.request, transcript.response);
            storage.write_record(&record).map(|_| ())
        });

        Ok(Relay::new(client, server, connected)?
            .label(format!("{} -> {}", peer, destination))
            .record(hook))
    }
}

impl IoSource for Acceptor {
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
                    warn!("HTTP proxy accept failed: {}", e);
                    self.backoff.pause(Instant::now());
                    return Ok(Flow::Continue);
                }
            };

            match self.relay(client, peer) {
                Ok(relay) => {
                    debug!("Recording connection from {}", peer);
                    relay.register(registrar);
                }
                Err(e) => warn!("Dropping connection from {}: {}", peer, e),
            }
        }
    }

    fn name(&self) -> &str {
        "http listener"
    }
}
