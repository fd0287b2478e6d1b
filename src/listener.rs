use crate::error::ProxyError;
use crate::poller::{Registry, Token};
use log::{debug, error, info};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};

/// Upper bound of connections taken from the backlog per readiness event.
pub const MAX_ACCEPTS_PER_EVENT: usize = 32;

const LISTEN_BACKLOG: i32 = 1024;

pub trait AcceptHandler {
    fn on_accept(&mut self, registry: &mut Registry, stream: TcpStream, peer: SocketAddr);
}

pub struct Listener {
    socket: Option<TcpListener>,
    token: Token,
}

impl Listener {
    pub fn new(token: Token) -> Self {
        Self { socket: None, token }
    }

    pub fn initialise(&mut self, addr: SocketAddr, registry: &mut Registry) -> Result<(), ProxyError> {
        if self.socket.is_some() {
            return Err(ProxyError::Setup("listener already initialised".to_string()));
        }

        let listener = bind_listener(addr)
            .map_err(|e| ProxyError::Setup(format!("cannot listen on {}: {}", addr, e)))?;

        registry
            .register_for_read(listener.as_raw_fd(), self.token)
            .map_err(|e| ProxyError::Setup(format!("read registration failed for {}: {}", addr, e)))?;

        info!("Listening on {}", listener.local_addr().unwrap_or(addr));
        self.socket = Some(listener);
        Ok(())
    }

    pub fn finalise(&mut self, registry: &mut Registry) {
        if let Some(listener) = self.socket.take() {
            registry.deregister_for_read(listener.as_raw_fd());
            debug!("Listener on {:?} closed", listener.local_addr().ok());
        }
    }

    pub fn is_initialised(&self) -> bool {
        self.socket.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.socket.as_ref().map(|l| l.as_raw_fd())
    }

    /// Accepts up to [`MAX_ACCEPTS_PER_EVENT`] pending connections. Whatever is
    /// left stays in the backlog and keeps the descriptor readable for the
    /// next pass.
    pub fn handle_input_notification(
        &mut self,
        registry: &mut Registry,
        handler: &mut dyn AcceptHandler,
    ) -> usize {
        let Some(listener) = self.socket.as_ref() else {
            return 0;
        };

        let mut accepted = 0;
        while accepted < MAX_ACCEPTS_PER_EVENT {
            match listener.accept() {
                Ok((stream, peer)) => {
                    accepted += 1;
                    debug!("accept from {}", peer);
                    handler.on_accept(registry, stream, peer);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("accept failed: {}", e);
                    break;
                }
            }
        }
        accepted
    }
}

fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    #[cfg(not(any(target_os = "solaris", target_os = "illumos", target_os = "cygwin")))]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SockAddr::from(addr))?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(socket.into())
}
