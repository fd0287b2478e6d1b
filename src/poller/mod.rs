//! Readiness multiplexing.
//!
//! An [`EventPoller`] keeps at most one read and one write registration per
//! descriptor in its [`Registry`], waits for readiness and hands every ready
//! `(descriptor, direction)` to a [`NotificationHandler`]. Registrations map
//! to a [`Token`] rather than to the handler itself: the owner of the loop
//! decides which object a token belongs to, so nothing in the poller ever
//! holds a reference into the objects it wakes up.

mod select;

pub use select::SelectPoller;

use crate::error::ProxyError;
use std::collections::BTreeMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Opaque handler reference stored alongside a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(pub usize);

/// Receives readiness notifications. The registry is passed back in so that a
/// handler can add or drop interest while the poller is dispatching.
pub trait NotificationHandler {
    fn handle_input_notification(
        &mut self,
        registry: &mut Registry,
        fd: RawFd,
        token: Token,
    ) -> Result<(), ProxyError>;

    fn handle_output_notification(
        &mut self,
        registry: &mut Registry,
        fd: RawFd,
        token: Token,
    ) -> Result<(), ProxyError>;
}

/// Per-descriptor interest table.
#[derive(Debug, Default)]
pub struct Registry {
    read_handlers: BTreeMap<RawFd, Token>,
    write_handlers: BTreeMap<RawFd, Token>,
    fd_limit: Option<RawFd>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry whose descriptors must stay below `limit`.
    pub fn with_fd_limit(limit: RawFd) -> Self {
        Self {
            fd_limit: Some(limit),
            ..Self::default()
        }
    }

    pub fn register_for_read(&mut self, fd: RawFd, token: Token) -> io::Result<()> {
        self.check_fd(fd)?;
        self.read_handlers.insert(fd, token);
        Ok(())
    }

    pub fn register_for_write(&mut self, fd: RawFd, token: Token) -> io::Result<()> {
        self.check_fd(fd)?;
        self.write_handlers.insert(fd, token);
        Ok(())
    }

    /// Returns whether a registration was removed.
    pub fn deregister_for_read(&mut self, fd: RawFd) -> bool {
        self.read_handlers.remove(&fd).is_some()
    }

    pub fn deregister_for_write(&mut self, fd: RawFd) -> bool {
        self.write_handlers.remove(&fd).is_some()
    }

    pub fn find_for_read(&self, fd: RawFd) -> Option<Token> {
        self.read_handlers.get(&fd).copied()
    }

    pub fn find_for_write(&self, fd: RawFd) -> Option<Token> {
        self.write_handlers.get(&fd).copied()
    }

    /// Highest registered descriptor in either direction, `-1` when empty.
    pub fn max_fd(&self) -> RawFd {
        let max_read = self.read_handlers.keys().next_back().copied().unwrap_or(-1);
        let max_write = self.write_handlers.keys().next_back().copied().unwrap_or(-1);
        max_read.max(max_write)
    }

    pub fn read_fds(&self) -> impl Iterator<Item = RawFd> + '_ {
        self.read_handlers.keys().copied()
    }

    pub fn write_fds(&self) -> impl Iterator<Item = RawFd> + '_ {
        self.write_handlers.keys().copied()
    }

    pub fn write_count(&self) -> usize {
        self.write_handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_handlers.is_empty() && self.write_handlers.is_empty()
    }

    fn check_fd(&self, fd: RawFd) -> io::Result<()> {
        if fd < 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, format!("illegal descriptor {}", fd)));
        }
        if let Some(limit) = self.fd_limit {
            if fd >= limit {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("descriptor {} exceeds poller limit {}", fd, limit),
                ));
            }
        }
        Ok(())
    }
}

pub trait EventPoller {
    fn registry(&mut self) -> &mut Registry;

    /// Waits up to `max_wait` for readiness and dispatches each ready
    /// registration once. Returns the number of ready descriptors reported
    /// by the underlying selector.
    fn process_pending_events(
        &mut self,
        max_wait: Duration,
        handler: &mut dyn NotificationHandler,
    ) -> Result<usize, ProxyError>;

    /// Time spent waiting without any descriptor becoming ready.
    fn spare_time(&self) -> Duration;

    fn clear_spare_time(&mut self);

    fn register_for_read(&mut self, fd: RawFd, token: Token) -> io::Result<()> {
        self.registry().register_for_read(fd, token)
    }

    fn register_for_write(&mut self, fd: RawFd, token: Token) -> io::Result<()> {
        self.registry().register_for_write(fd, token)
    }

    fn deregister_for_read(&mut self, fd: RawFd) -> bool {
        self.registry().deregister_for_read(fd)
    }

    fn deregister_for_write(&mut self, fd: RawFd) -> bool {
        self.registry().deregister_for_write(fd)
    }
}
