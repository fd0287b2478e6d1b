//! Non-blocking single-socket wrapper used for both ends of a tunnel.
//!
//! A `Connection` never calls back into its owner. Readiness is routed to it
//! by the owner, and it answers with at most one [`ConnectionEvent`] per
//! notification. The token it registers under is the owner's handler
//! reference; clearing it removes every registration so no further
//! notifications can arrive for this socket.

use crate::poller::{Registry, Token};
use bytes::Bytes;
use log::{debug, trace};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};

pub const RECV_BUFFER_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Connected,
}

#[derive(Debug)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
    DataReceived(Bytes),
    Error(io::Error),
}

pub struct Connection {
    stream: Option<TcpStream>,
    state: ConnectionState,
    handler: Option<Token>,
    send_queue: VecDeque<Bytes>,
    queued_bytes: usize,
    reading_paused: bool,
    recv_buf: Box<[u8]>,
}

impl Connection {
    pub fn new() -> Self {
        Self {
            stream: None,
            state: ConnectionState::Closed,
            handler: None,
            send_queue: VecDeque::new(),
            queued_bytes: 0,
            reading_paused: false,
            recv_buf: vec![0u8; RECV_BUFFER_SIZE].into_boxed_slice(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.stream.as_ref().map(|s| s.as_raw_fd())
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.as_ref().and_then(|s| s.peer_addr().ok())
    }

    /// Bytes accepted by `send` but not yet written to the socket.
    pub fn pending_bytes(&self) -> usize {
        self.queued_bytes
    }

    pub fn is_reading_paused(&self) -> bool {
        self.reading_paused
    }

    /// Points the connection at a new handler token, moving any existing
    /// registrations over to it.
    pub fn set_event_handler(&mut self, registry: &mut Registry, handler: Token) -> io::Result<()> {
        self.handler = Some(handler);
        if let Some(fd) = self.raw_fd() {
            if !self.reading_paused {
                registry.register_for_read(fd, handler)?;
            }
            if self.wants_writable() {
                registry.register_for_write(fd, handler)?;
            }
        }
        Ok(())
    }

    /// Severs the connection from its handler: both interests are dropped so
    /// the poller can no longer reach it.
    pub fn clear_event_handler(&mut self, registry: &mut Registry) {
        self.handler = None;
        if let Some(fd) = self.raw_fd() {
            registry.deregister_for_read(fd);
            registry.deregister_for_write(fd);
        }
    }

    /// Stops read notifications. Data stays in the kernel buffer, so the
    /// sender is eventually throttled by TCP flow control.
    pub fn pause_reading(&mut self, registry: &mut Registry) {
        if self.reading_paused {
            return;
        }
        if let Some(fd) = self.raw_fd() {
            registry.deregister_for_read(fd);
            self.reading_paused = true;
            trace!("fd={} reading paused", fd);
        }
    }

    pub fn resume_reading(&mut self, registry: &mut Registry) -> io::Result<()> {
        if !self.reading_paused {
            return Ok(());
        }
        self.reading_paused = false;
        if let (Some(fd), Some(token)) = (self.raw_fd(), self.handler) {
            registry.register_for_read(fd, token)?;
            trace!("fd={} reading resumed", fd);
        }
        Ok(())
    }

    /// Adopts an accepted socket. The connection must be closed.
    pub fn accept_connection(&mut self, registry: &mut Registry, stream: TcpStream) -> io::Result<()> {
        if self.stream.is_some() {
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, "connection already in use"));
        }
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;

        let fd = stream.as_raw_fd();
        if let Some(token) = self.handler {
            registry.register_for_read(fd, token)?;
        }
        self.stream = Some(stream);
        self.state = ConnectionState::Connected;
        Ok(())
    }

    /// Starts a non-blocking connect. Completion is reported as
    /// [`ConnectionEvent::Connected`] from the first write readiness.
    pub fn connect(&mut self, registry: &mut Registry, addr: SocketAddr) -> io::Result<()> {
        if self.stream.is_some() {
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, "connection already in use"));
        }

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        match socket.connect(&SockAddr::from(addr)) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }

        let stream: TcpStream = socket.into();
        stream.set_nodelay(true)?;
        let fd = stream.as_raw_fd();
        if let Some(token) = self.handler {
            registry.register_for_read(fd, token)?;
            if let Err(e) = registry.register_for_write(fd, token) {
                registry.deregister_for_read(fd);
                return Err(e);
            }
        }

        self.stream = Some(stream);
        self.state = ConnectionState::Connecting;
        trace!("connecting fd={} to {}", fd, addr);
        Ok(())
    }

    /// Accepts `data` for delivery. What the socket does not take right away
    /// is queued and written on later write readiness, in order.
    pub fn send(&mut self, registry: &mut Registry, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }

        match self.state {
            ConnectionState::Closed => {
                Err(io::Error::new(io::ErrorKind::NotConnected, "send on closed connection"))
            }
            ConnectionState::Connecting => {
                self.enqueue(Bytes::copy_from_slice(data));
                Ok(data.len())
            }
            ConnectionState::Connected => {
                let mut written = 0;
                if self.send_queue.is_empty() {
                    written = self.write_direct(data)?;
                }
                if written < data.len() {
                    self.enqueue(Bytes::copy_from_slice(&data[written..]));
                    self.watch_writable(registry)?;
                }
                Ok(data.len())
            }
        }
    }

    pub fn handle_input(&mut self, _registry: &mut Registry) -> Option<ConnectionEvent> {
        let stream = self.stream.as_mut()?;
        match stream.read(&mut self.recv_buf) {
            Ok(0) => Some(ConnectionEvent::Disconnected),
            Ok(n) => Some(ConnectionEvent::DataReceived(Bytes::copy_from_slice(&self.recv_buf[..n]))),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted => None,
            Err(e) => Some(ConnectionEvent::Error(e)),
        }
    }

    pub fn handle_output(&mut self, registry: &mut Registry) -> Option<ConnectionEvent> {
        let stream = self.stream.as_ref()?;

        let mut event = None;
        if self.state == ConnectionState::Connecting {
            match stream.take_error() {
                Ok(Some(e)) | Err(e) => return Some(ConnectionEvent::Error(e)),
                Ok(None) => {}
            }
            match stream.peer_addr() {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::NotConnected => return None,
                Err(e) => return Some(ConnectionEvent::Error(e)),
            }
            self.state = ConnectionState::Connected;
            event = Some(ConnectionEvent::Connected);
        }

        if let Err(e) = self.drain_queue() {
            return Some(ConnectionEvent::Error(e));
        }
        if self.send_queue.is_empty() {
            if let Some(fd) = self.raw_fd() {
                registry.deregister_for_write(fd);
            }
        }
        event
    }

    /// Drops registrations and closes the socket. Queued bytes are discarded.
    pub fn shutdown(&mut self, registry: &mut Registry) {
        if let Some(stream) = self.stream.take() {
            let fd = stream.as_raw_fd();
            registry.deregister_for_read(fd);
            registry.deregister_for_write(fd);
            let _ = stream.shutdown(Shutdown::Both);
            debug!("connection fd={} shut down ({:?})", fd, self.state);
        }
        self.send_queue.clear();
        self.queued_bytes = 0;
        self.reading_paused = false;
        self.state = ConnectionState::Closed;
    }

    /// Writes whatever of the queue the socket takes without blocking, then
    /// shuts down.
    pub fn close_gracefully(&mut self, registry: &mut Registry) {
        if self.state == ConnectionState::Connected && !self.send_queue.is_empty() {
            if let Err(e) = self.drain_queue() {
                debug!("final drain failed: {}", e);
            }
            if !self.send_queue.is_empty() {
                debug!("dropping {} undelivered bytes on close", self.queued_bytes);
            }
        }
        self.shutdown(registry);
    }

    fn wants_writable(&self) -> bool {
        self.state == ConnectionState::Connecting || !self.send_queue.is_empty()
    }

    fn watch_writable(&self, registry: &mut Registry) -> io::Result<()> {
        if let (Some(fd), Some(token)) = (self.raw_fd(), self.handler) {
            registry.register_for_write(fd, token)?;
        }
        Ok(())
    }

    fn enqueue(&mut self, chunk: Bytes) {
        self.queued_bytes += chunk.len();
        self.send_queue.push_back(chunk);
    }

    fn write_direct(&mut self, data: &[u8]) -> io::Result<usize> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "no socket"));
        };
        let mut written = 0;
        while written < data.len() {
            match stream.write(&data[written..]) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "socket accepted no bytes")),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }

    fn drain_queue(&mut self) -> io::Result<()> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };
        while let Some(front) = self.send_queue.front_mut() {
            match stream.write(front) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "socket accepted no bytes")),
                Ok(n) => {
                    self.queued_bytes -= n;
                    if n == front.len() {
                        self.send_queue.pop_front();
                    } else {
                        let _ = front.split_to(n);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}
