//! Non-blocking bidirectional TCP relay
//!
//! A relay is driven by two [`IoSource`]s, one per socket, sharing one state.
//! Each direction buffers at most [`RELAY_BUFFER`] bytes; a full buffer pauses
//! reading from its source socket until the other side drains it. End of
//! stream is forwarded as a write shutdown once the buffer is drained.

use crate::errors::{RecordError, Result};
use crate::execution::{Flow, IoSource, Registrar};
use log::{debug, warn};
use nix::poll::PollFlags;
use std::cell::RefCell;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;
use std::time::{Duration, Instant};

pub const RELAY_BUFFER: usize = 64 * 1024;

/// Pause after an accept error other than `WouldBlock`
pub const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Keeps a listener out of the poll set for a while after a failed accept
///
/// Errors such as `EMFILE` leave the pending connection queued, so the
/// listener stays readable until a descriptor frees up.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptBackoff {
    until: Option<Instant>,
}

impl AcceptBackoff {
    pub fn pause(&mut self, now: Instant) {
        self.until = Some(now + ACCEPT_BACKOFF);
    }

    pub fn interest(&self, now: Instant) -> PollFlags {
        match self.until {
            Some(until) if now < until => PollFlags::empty(),
            _ => PollFlags::POLLIN,
        }
    }
}

/// Bytes seen in each direction of a recorded connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transcript {
    pub request: Vec<u8>,
    pub response: Vec<u8>,
}

/// Called once when a relay finishes cleanly
pub type CompletionHook = Box<dyn FnOnce(Transcript) -> Result<()>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Client,
    Server,
}

#[derive(Default)]
struct Direction {
    buffer: Vec<u8>,
    read_closed: bool,
    write_closed: bool,
}

impl Direction {
    fn wants_read(&self) -> bool {
        !self.read_closed && self.buffer.len() < RELAY_BUFFER
    }

    fn finished(&self) -> bool {
        self.read_closed && self.buffer.is_empty() && self.write_closed
    }
}

struct RelayState {
    label: String,
    client: TcpStream,
    server: TcpStream,
    upstream_connected: bool,
    to_server: Direction,
    to_client: Direction,
    transcript: Option<Transcript>,
    on_complete: Option<CompletionHook>,
    failed: bool,
}

impl RelayState {
    fn stream(&self, side: Side) -> &TcpStream {
        match side {
            Side::Client => &self.client,
            Side::Server => &self.server,
        }
    }

    fn finished(&self) -> bool {
        self.to_server.finished() && self.to_client.finished()
    }

    /// (bytes read from `side`, bytes written to `side`)
    fn directions(&mut self, side: Side) -> (&mut Direction, &mut Direction) {
        match side {
            Side::Client => (&mut self.to_server, &mut self.to_client),
            Side::Server => (&mut self.to_client, &mut self.to_server),
        }
    }

    fn connected(&self, side: Side) -> bool {
        side == Side::Client || self.upstream_connected
    }

    fn interest(&self, side: Side) -> PollFlags {
        if self.finished() {
            return PollFlags::POLLIN;
        }
        if !self.connected(side) {
            return PollFlags::POLLOUT;
        }

        let (inbound, outbound) = match side {
            Side::Client => (&self.to_server, &self.to_client),
            Side::Server => (&self.to_client, &self.to_server),
        };
        let mut flags = PollFlags::empty();
        if inbound.wants_read() {
            flags |= PollFlags::POLLIN;
        }
        if !outbound.buffer.is_empty() {
            flags |= PollFlags::POLLOUT;
        }
        flags
    }

    fn fail(&mut self, reason: &str) {
        debug!("{}: closing after {}", self.label, reason);
        self.failed = true;
        let _ = self.client.shutdown(Shutdown::Both);
        let _ = self.server.shutdown(Shutdown::Both);
        for direction in [&mut self.to_server, &mut self.to_client] {
            direction.buffer.clear();
            direction.read_closed = true;
            direction.write_closed = true;
        }
    }

    fn finish_connect(&mut self) {
        let outcome = match self.server.take_error() {
            Ok(None) => self.server.peer_addr().map(|_| ()),
            Ok(Some(e)) | Err(e) => Err(e),
        };
        match outcome {
            Ok(()) => {
                debug!("{}: upstream connected", self.label);
                self.upstream_connected = true;
            }
            Err(e) => {
                debug!("{}: upstream connect failed: {}", self.label, e);
                self.fail("upstream connect failure");
            }
        }
    }

    fn read_from(&mut self, side: Side) {
        let mut chunk = [0u8; 16 * 1024];
        let room = {
            let (inbound, _) = self.directions(side);
            if !inbound.wants_read() {
                return;
            }
            (RELAY_BUFFER - inbound.buffer.len()).min(chunk.len())
        };

        let result = match side {
            Side::Client => (&self.client).read(&mut chunk[..room]),
            Side::Server => (&self.server).read(&mut chunk[..room]),
        };
        match result {
            Ok(0) => {
                let (inbound, _) = self.directions(side);
                inbound.read_closed = true;
            }
            Ok(n) => {
                let bytes = &chunk[..n];
                if let Some(transcript) = self.transcript.as_mut() {
                    match side {
                        Side::Client => transcript.request.extend_from_slice(bytes),
                        Side::Server => transcript.response.extend_from_slice(bytes),
                    }
                }
                let (inbound, _) = self.directions(side);
                inbound.buffer.extend_from_slice(bytes);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                debug!("{}: read error: {}", self.label, e);
                self.fail("read error");
            }
        }
    }

    fn write_to(&mut self, side: Side) {
        let result = {
            let pending = match side {
                Side::Client => &self.to_client.buffer,
                Side::Server => &self.to_server.buffer,
            };
            if pending.is_empty() {
                return;
            }
            self.stream(side).write(pending)
        };
        match result {
            Ok(n) => {
                let (_, outbound) = self.directions(side);
                outbound.buffer.drain(..n);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                debug!("{}: write error: {}", self.label, e);
                self.fail("write error");
            }
        }
    }

    /// Forward end of stream once everything read before it was written
    fn propagate_shutdown(&mut self) {
        for destination in [Side::Server, Side::Client] {
            if !self.connected(destination) {
                continue;
            }
            let direction = match destination {
                Side::Server => &mut self.to_server,
                Side::Client => &mut self.to_client,
            };
            if direction.read_closed && direction.buffer.is_empty() && !direction.write_closed {
                direction.write_closed = true;
                let stream = match destination {
                    Side::Server => &self.server,
                    Side::Client => &self.client,
                };
                if let Err(e) = stream.shutdown(Shutdown::Write)
                    && e.kind() != ErrorKind::NotConnected
                {
                    debug!("{}: shutdown failed: {}", self.label, e);
                }
            }
        }
    }

    fn complete(&mut self) -> Result<()> {
        let Some(hook) = self.on_complete.take() else {
            return Ok(());
        };
        if self.failed {
            return Ok(());
        }
        debug!("{}: finished", self.label);
        hook(self.transcript.take().unwrap_or_default())
    }
}

/// One socket of a relay, registered with a supervisor
pub struct RelayEndpoint {
    state: Rc<RefCell<RelayState>>,
    side: Side,
    fd: RawFd,
}

impl IoSource for RelayEndpoint {
    fn raw_fd(&self) -> RawFd {
        self.fd
    }

    fn interest(&self) -> PollFlags {
        self.state.borrow().interest(self.side)
    }

    fn on_ready(&mut self, events: PollFlags, _registrar: &mut Registrar) -> Result<Flow> {
        let mut state = self.state.borrow_mut();
        if state.finished() {
            state.complete()?;
            return Ok(Flow::Remove);
        }

        if !state.connected(self.side) {
            state.finish_connect();
        } else {
            if events.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR) {
                state.read_from(self.side);
            }
            if events.contains(PollFlags::POLLOUT) {
                state.write_to(self.side);
            }
        }
        state.propagate_shutdown();

        if state.finished() {
            state.complete()?;
            return Ok(Flow::Remove);
        }
        Ok(Flow::Continue)
    }

    fn name(&self) -> &str {
        match self.side {
            Side::Client => "relay client",
            Side::Server => "relay upstream",
        }
    }
}

/// Builder for the two endpoints of a relay
pub struct Relay {
    state: RelayState,
}

impl Relay {
    /// Relay between an accepted client and an upstream connection
    ///
    /// `upstream_connected` is false for a non-blocking connect still in
    /// progress; the upstream endpoint then waits for writability first.
    pub fn new(client: TcpStream, server: TcpStream, upstream_connected: bool) -> Result<Self> {
        client.set_nonblocking(true)?;
        server.set_nonblocking(true)?;
        let label = match (client.peer_addr(), server.peer_addr()) {
            (Ok(c), Ok(s)) => format!("{} -> {}", c, s),
            (Ok(c), Err(_)) => format!("{} -> (connecting)", c),
            _ => "relay".to_string(),
        };

        Ok(Self {
            state: RelayState {
                label,
                client,
                server,
                upstream_connected,
                to_server: Direction::default(),
                to_client: Direction::default(),
                transcript: None,
                on_complete: None,
                failed: false,
            },
        })
    }

    /// Keep a copy of both byte streams and pass it to `hook` on completion
    pub fn record(mut self, hook: CompletionHook) -> Self {
        self.state.transcript = Some(Transcript::default());
        self.state.on_complete = Some(hook);
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.state.label = label.into();
        self
    }

    /// Hand both endpoints to the supervisor
    pub fn register(self, registrar: &mut Registrar) {
        for source in self.into_endpoints() {
            registrar.register_io(source);
        }
    }

    pub fn into_endpoints(self) -> [Box<dyn IoSource>; 2] {
        let client_fd = self.state.client.as_raw_fd();
        let server_fd = self.state.server.as_raw_fd();
        let state = Rc::new(RefCell::new(self.state));
        [
            Box::new(RelayEndpoint {
                state: state.clone(),
                side: Side::Client,
                fd: client_fd,
            }),
            Box::new(RelayEndpoint {
                state,
                side: Side::Server,
                fd: server_fd,
            }),
        ]
    }
}

/// Start a non-blocking TCP connection to `target`
///
/// Returns the stream and whether the connection already completed.
pub fn connect_nonblocking(target: SocketAddr) -> Result<(TcpStream, bool)> {
    use nix::errno::Errno;
    use nix::sys::socket::{
        AddressFamily, SockFlag, SockType, SockaddrIn, SockaddrIn6, connect, socket,
    };

    let family = match target {
        SocketAddr::V4(_) => AddressFamily::Inet,
        SocketAddr::V6(_) => AddressFamily::Inet6,
    };
    let fd = socket(
        family,
        SockType::Stream,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        None,
    )
    .map_err(|e| RecordError::Proxy(format!("socket for {} failed: {}", target, e)))?;

    let result = match target {
        SocketAddr::V4(v4) => connect(fd.as_raw_fd(), &SockaddrIn::from(v4)),
        SocketAddr::V6(v6) => connect(fd.as_raw_fd(), &SockaddrIn6::from(v6)),
    };
    let connected = match result {
        Ok(()) => true,
        Err(Errno::EINPROGRESS) => false,
        Err(e) => {
            warn!("connect to {} failed: {}", target, e);
            return Err(RecordError::Proxy(format!(
                "connect to {} failed: {}",
                target, e
            )));
        }
    };

    Ok((TcpStream::from(fd), connected))
}
