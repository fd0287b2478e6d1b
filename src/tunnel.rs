//! Per-client tunnel: one local connection, one upstream connection to the
//! HTTP proxy, and the CONNECT handshake between them.
//!
//! Status moves `Closed -> Connecting -> Connected`, with `Error` reachable
//! from the two live states. Every failure tears the tunnel down on the spot
//! and is reported exactly once to the [`TunnelHandler`], which owns the
//! decision of when the object is reset and reused.

use crate::cache::Cache;
use crate::config::{Config, DEFAULT_CACHE_MEMORY_LIMIT, DEFAULT_MAX_HEADER_SIZE, DEFAULT_MAX_PENDING_BYTES, ServerAddr};
use crate::connection::{Connection, ConnectionEvent, ConnectionState};
use crate::error::ProxyError;
use crate::handshake::{self, Credentials, HandshakeOutcome, ResponseBuffer};
use crate::metrics::TunnelMetrics;
use crate::poller::{Registry, Token};
use log::{debug, error, info, warn};
use std::fmt;
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;

pub type TunnelId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Local = 0,
    Upstream = 1,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Local => write!(f, "local"),
            Side::Upstream => write!(f, "upstream"),
        }
    }
}

/// Registration token for one side of tunnel `id`. Ids start at 1 so no
/// tunnel token collides with `Token(0)`.
pub fn tunnel_token(id: TunnelId, side: Side) -> Token {
    Token((id << 1) | side as usize)
}

pub fn split_token(token: Token) -> (TunnelId, Side) {
    let side = if token.0 & 1 == 0 { Side::Local } else { Side::Upstream };
    (token.0 >> 1, side)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyStatus {
    Closed,
    Error,
    Connecting,
    Connected,
}

impl ProxyStatus {
    pub fn name(self) -> &'static str {
        match self {
            ProxyStatus::Closed => "Closed",
            ProxyStatus::Error => "Error",
            ProxyStatus::Connecting => "Connecting",
            ProxyStatus::Connected => "Connected",
        }
    }

    pub fn can_transition_to(self, to: ProxyStatus) -> bool {
        use ProxyStatus::*;
        matches!(
            (self, to),
            (_, Closed) | (Closed, Connecting) | (Connecting, Connected) | (Connecting, Error) | (Connected, Error)
        )
    }
}

/// Receives the single end-of-life report of a tunnel.
pub trait TunnelHandler {
    fn on_closed(&mut self, id: TunnelId);
    fn on_error(&mut self, id: TunnelId);
}

#[derive(Debug, Clone)]
pub struct TunnelSettings {
    pub max_header_size: usize,
    pub cache_memory_limit: usize,
    pub cache_dir: Option<PathBuf>,
    /// Unsent bytes one side may hold before the other side stops being read.
    pub max_pending_bytes: usize,
}

impl TunnelSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_header_size: config.max_header_size(),
            cache_memory_limit: config.cache_memory_limit(),
            cache_dir: config.cache_dir.clone(),
            max_pending_bytes: config.max_pending_bytes(),
        }
    }
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            max_header_size: DEFAULT_MAX_HEADER_SIZE,
            cache_memory_limit: DEFAULT_CACHE_MEMORY_LIMIT,
            cache_dir: None,
            max_pending_bytes: DEFAULT_MAX_PENDING_BYTES,
        }
    }
}

/// A failure and the connection it is attributed to.
struct Fault {
    side: Side,
    error: ProxyError,
}

impl Fault {
    fn on(side: Side) -> impl FnOnce(ProxyError) -> Fault {
        move |error| Fault { side, error }
    }

    fn io(side: Side) -> impl FnOnce(std::io::Error) -> Fault {
        move |e| Fault { side, error: ProxyError::Io(e) }
    }
}

enum Outcome {
    Closed,
    Failed,
}

pub struct ProxyTunnel {
    id: TunnelId,
    status: ProxyStatus,
    local: Connection,
    upstream: Connection,
    dest: Option<ServerAddr>,
    proxy_addr: Option<SocketAddr>,
    credentials: Option<Credentials>,
    response: ResponseBuffer,
    cache: Cache,
    max_pending: usize,
    reported: bool,
    metrics: Arc<TunnelMetrics>,
}

impl ProxyTunnel {
    pub fn new(settings: &TunnelSettings, metrics: Arc<TunnelMetrics>) -> Self {
        Self {
            id: 0,
            status: ProxyStatus::Closed,
            local: Connection::new(),
            upstream: Connection::new(),
            dest: None,
            proxy_addr: None,
            credentials: None,
            response: ResponseBuffer::new(settings.max_header_size),
            cache: Cache::new(settings.cache_memory_limit, settings.cache_dir.clone()),
            max_pending: settings.max_pending_bytes,
            reported: false,
            metrics,
        }
    }

    /// Id of the client currently served, 0 when idle.
    pub fn id(&self) -> TunnelId {
        self.id
    }

    pub fn status(&self) -> ProxyStatus {
        self.status
    }

    pub fn cached_bytes(&self) -> usize {
        self.cache.len()
    }

    pub fn set_dest_server(&mut self, dest: ServerAddr) {
        self.dest = Some(dest);
    }

    pub fn set_proxy_server(&mut self, addr: SocketAddr) {
        self.proxy_addr = Some(addr);
    }

    pub fn set_credentials(&mut self, credentials: Option<Credentials>) {
        self.credentials = credentials;
    }

    /// Takes over an accepted client and starts connecting to the proxy.
    /// On failure nothing stays registered and the client socket is closed.
    pub fn accept_local(&mut self, registry: &mut Registry, id: TunnelId, stream: TcpStream) -> Result<(), ProxyError> {
        if self.status != ProxyStatus::Closed || self.local.state() != ConnectionState::Closed {
            return Err(ProxyError::Connection(format!("tunnel {} is still in use", self.id)));
        }
        let proxy_addr = self
            .proxy_addr
            .ok_or_else(|| ProxyError::Connection("upstream proxy not configured".to_string()))?;
        if self.dest.is_none() {
            return Err(ProxyError::Connection("destination not configured".to_string()));
        }

        self.id = id;
        self.reported = false;
        self.response.reset();

        let accepted = self
            .local
            .set_event_handler(registry, tunnel_token(id, Side::Local))
            .and_then(|_| self.local.accept_connection(registry, stream));
        if let Err(e) = accepted {
            self.local.clear_event_handler(registry);
            self.local.shutdown(registry);
            warn!("[ProxyTunnel] accept failed: {}", e);
            return Err(ProxyError::Connection(format!("accept failed: {}", e)));
        }

        let connected = self
            .upstream
            .set_event_handler(registry, tunnel_token(id, Side::Upstream))
            .and_then(|_| self.upstream.connect(registry, proxy_addr));
        if let Err(e) = connected {
            self.local.clear_event_handler(registry);
            self.local.shutdown(registry);
            self.upstream.clear_event_handler(registry);
            self.upstream.shutdown(registry);
            warn!("[ProxyTunnel] connect to proxy {} failed: {}", proxy_addr, e);
            return Err(ProxyError::Connection(format!("connect to proxy {} failed: {}", proxy_addr, e)));
        }

        debug!("tunnel {} accepted {:?}, connecting to proxy {}", id, self.local.peer_addr(), proxy_addr);
        Ok(())
    }

    pub fn handle_input(&mut self, registry: &mut Registry, side: Side, handler: &mut dyn TunnelHandler) {
        if self.reported {
            return;
        }
        let event = match side {
            Side::Local => self.local.handle_input(registry),
            Side::Upstream => self.upstream.handle_input(registry),
        };
        if let Some(event) = event {
            self.dispatch(registry, side, event, handler);
        }
    }

    pub fn handle_output(&mut self, registry: &mut Registry, side: Side, handler: &mut dyn TunnelHandler) {
        if self.reported {
            return;
        }
        let event = match side {
            Side::Local => self.local.handle_output(registry),
            Side::Upstream => self.upstream.handle_output(registry),
        };
        if let Some(event) = event {
            self.dispatch(registry, side, event, handler);
        }
        if self.reported || self.status != ProxyStatus::Connected {
            return;
        }
        if let Err(fault) = self.regulate(registry, side) {
            self.fail(registry, fault, handler);
        }
    }

    /// Discards staged bytes, closes both connections and returns to a blank
    /// `Closed` tunnel. Safe to call in any state, any number of times.
    pub fn cleanup(&mut self, registry: &mut Registry) {
        self.cache.clear();
        self.local.clear_event_handler(registry);
        self.local.shutdown(registry);
        self.upstream.clear_event_handler(registry);
        self.upstream.shutdown(registry);
        self.enter(ProxyStatus::Closed);
        self.response.reset();
        self.id = 0;
        self.reported = false;
    }

    fn dispatch(&mut self, registry: &mut Registry, side: Side, event: ConnectionEvent, handler: &mut dyn TunnelHandler) {
        let result = match event {
            ConnectionEvent::Connected if side == Side::Upstream => self.on_upstream_connected(registry),
            ConnectionEvent::Connected => Ok(()),
            ConnectionEvent::DataReceived(data) => self.on_recv(registry, side, &data),
            ConnectionEvent::Disconnected => {
                self.on_disconnected(registry, side);
                self.report(handler, Outcome::Closed);
                Ok(())
            }
            ConnectionEvent::Error(e) => Err(Fault {
                side,
                error: ProxyError::Connection(format!("{} connection failed: {}", side, e)),
            }),
        };

        if let Err(fault) = result {
            self.fail(registry, fault, handler);
        }
    }

    fn fail(&mut self, registry: &mut Registry, fault: Fault, handler: &mut dyn TunnelHandler) {
        self.on_fault(registry, fault);
        self.report(handler, Outcome::Failed);
    }

    fn on_upstream_connected(&mut self, registry: &mut Registry) -> Result<(), Fault> {
        let Some(dest) = self.dest.as_ref() else {
            return Err(Fault {
                side: Side::Upstream,
                error: ProxyError::Handshake("destination not configured".to_string()),
            });
        };
        let request = handshake::build_connect_request(dest, self.credentials.as_ref());
        debug!("tunnel {} requesting CONNECT {}", self.id, dest);

        self.transition(ProxyStatus::Connecting).map_err(Fault::on(Side::Upstream))?;
        self.response.reset();
        self.upstream
            .send(registry, request.as_bytes())
            .map_err(Fault::io(Side::Upstream))?;
        Ok(())
    }

    fn on_recv(&mut self, registry: &mut Registry, side: Side, data: &[u8]) -> Result<(), Fault> {
        match side {
            Side::Local => self.on_local_data(registry, data),
            Side::Upstream => match self.status {
                ProxyStatus::Connecting => self.on_handshake_data(registry, data),
                ProxyStatus::Connected => {
                    if !self.local.is_connected() {
                        return Err(Fault {
                            side: Side::Upstream,
                            error: ProxyError::Connection("local client already closed".to_string()),
                        });
                    }
                    self.local.send(registry, data).map_err(Fault::io(Side::Local))?;
                    self.metrics.record_bytes_to_client(data.len());
                    self.regulate(registry, Side::Local)
                }
                status => Err(Fault {
                    side: Side::Upstream,
                    error: ProxyError::Handshake(format!("unexpected proxy data in status {}", status.name())),
                }),
            },
        }
    }

    fn on_local_data(&mut self, registry: &mut Registry, data: &[u8]) -> Result<(), Fault> {
        if self.status == ProxyStatus::Connected && self.cache.is_empty() {
            self.upstream.send(registry, data).map_err(Fault::io(Side::Upstream))?;
            self.metrics.record_bytes_to_upstream(data.len());
        } else {
            // Staged bytes go out first, so new ones queue up behind them.
            self.cache.cache(data).map_err(Fault::on(Side::Upstream))?;
            self.metrics.record_bytes_cached(data.len());
        }
        if self.status == ProxyStatus::Connected {
            self.regulate(registry, Side::Upstream)?;
        }
        Ok(())
    }

    fn on_handshake_data(&mut self, registry: &mut Registry, data: &[u8]) -> Result<(), Fault> {
        if let Err(e) = self.response.append(data) {
            error!("[ProxyTunnel] proxy response overflow. datalen={}", data.len());
            return Err(Fault { side: Side::Upstream, error: e });
        }

        match self.response.parse() {
            HandshakeOutcome::Incomplete => Ok(()),
            HandshakeOutcome::Established { trailing } => {
                self.transition(ProxyStatus::Connected).map_err(Fault::on(Side::Upstream))?;
                self.response.reset();
                self.metrics.increment_established();
                if let Some(dest) = self.dest.as_ref() {
                    info!("tunnel {} established to {}", self.id, dest);
                }

                self.flush_local(registry).map_err(Fault::on(Side::Upstream))?;
                self.regulate(registry, Side::Upstream)?;
                if !trailing.is_empty() {
                    self.local.send(registry, &trailing).map_err(Fault::io(Side::Local))?;
                    self.metrics.record_bytes_to_client(trailing.len());
                    self.regulate(registry, Side::Local)?;
                }
                Ok(())
            }
            HandshakeOutcome::Rejected { status_line } => {
                info!("build http tunnel failed. resp: {}", status_line);
                if handshake::status_code(&status_line) == Some(407) {
                    let hint = if self.credentials.is_some() {
                        "configured proxy credentials were refused"
                    } else {
                        "set proxy_username and proxy_password"
                    };
                    warn!("proxy requires authentication: {}", hint);
                    return Err(Fault {
                        side: Side::Upstream,
                        error: ProxyError::Auth(status_line),
                    });
                }
                Err(Fault {
                    side: Side::Upstream,
                    error: ProxyError::Handshake(status_line),
                })
            }
        }
    }

    fn on_disconnected(&mut self, registry: &mut Registry, side: Side) {
        match side {
            Side::Local => {
                self.local.clear_event_handler(registry);
                self.local.shutdown(registry);
                self.upstream.clear_event_handler(registry);
                if self.status == ProxyStatus::Connected {
                    if let Err(e) = self.flush_local(registry) {
                        debug!("tunnel {} final flush failed: {}", self.id, e);
                    }
                    self.upstream.close_gracefully(registry);
                } else {
                    self.upstream.shutdown(registry);
                }
            }
            Side::Upstream => {
                self.upstream.clear_event_handler(registry);
                self.upstream.shutdown(registry);
                self.cache.clear();
                self.local.clear_event_handler(registry);
                self.local.close_gracefully(registry);
            }
        }
        self.enter(ProxyStatus::Closed);
        debug!("tunnel {} closed by {} side", self.id, side);
    }

    fn on_fault(&mut self, registry: &mut Registry, fault: Fault) {
        match fault.side {
            Side::Local => {
                self.local.clear_event_handler(registry);
                self.local.shutdown(registry);
                self.upstream.clear_event_handler(registry);
                if self.status == ProxyStatus::Connected {
                    if let Err(e) = self.flush_local(registry) {
                        debug!("tunnel {} final flush failed: {}", self.id, e);
                    }
                }
                self.upstream.shutdown(registry);
            }
            Side::Upstream => {
                self.upstream.clear_event_handler(registry);
                self.upstream.shutdown(registry);
                self.cache.clear();
                self.local.clear_event_handler(registry);
                self.local.shutdown(registry);
            }
        }

        // A proxy that was never reached leaves the tunnel Closed.
        if self.status != ProxyStatus::Closed {
            self.enter(ProxyStatus::Error);
        }
        warn!("tunnel {} failed on {} side: {}", self.id, fault.side, fault.error);
    }

    /// Replays staged client bytes upstream until the upstream backlog passes
    /// the high-water mark. Whatever is left stays staged.
    fn flush_local(&mut self, registry: &mut Registry) -> Result<usize, ProxyError> {
        let upstream = &mut self.upstream;
        let high_water = self.max_pending;
        let flushed = self.cache.flush_all(|data| {
            if upstream.pending_bytes() > high_water {
                Ok(0)
            } else {
                upstream.send(registry, data)
            }
        })?;
        if flushed > 0 {
            self.metrics.record_bytes_to_upstream(flushed);
            debug!("tunnel {} flushed {} cached bytes", self.id, flushed);
        }
        Ok(flushed)
    }

    /// Stops reading the peer of `side` while `side` holds more than the
    /// high-water mark of unsent bytes, and resumes it once that backlog is
    /// down to half the mark. Upstream is only relieved after the cache has
    /// been replayed.
    fn regulate(&mut self, registry: &mut Registry, side: Side) -> Result<(), Fault> {
        let high_water = self.max_pending;
        let low_water = high_water / 2;

        if side == Side::Upstream && !self.cache.is_empty() && self.upstream.pending_bytes() <= low_water {
            self.flush_local(registry).map_err(Fault::on(Side::Upstream))?;
        }

        let (sink, source, source_side) = match side {
            Side::Local => (&self.local, &mut self.upstream, Side::Upstream),
            Side::Upstream => (&self.upstream, &mut self.local, Side::Local),
        };
        let pending = sink.pending_bytes();
        if pending > high_water {
            if !source.is_reading_paused() {
                debug!("tunnel {} {} backlog {} bytes, pausing {} side", self.id, side, pending, source_side);
                source.pause_reading(registry);
            }
        } else if pending <= low_water && source.is_reading_paused() && (side == Side::Local || self.cache.is_empty()) {
            debug!("tunnel {} {} backlog drained, resuming {} side", self.id, side, source_side);
            source.resume_reading(registry).map_err(Fault::io(source_side))?;
        }
        Ok(())
    }

    /// Applies a status change the tunnel has already committed to. A
    /// refused change is logged by `transition` and the status is kept.
    fn enter(&mut self, to: ProxyStatus) {
        if let Err(e) = self.transition(to) {
            debug!("tunnel {} status unchanged: {}", self.id, e);
        }
    }

    fn transition(&mut self, to: ProxyStatus) -> Result<(), ProxyError> {
        if !self.status.can_transition_to(to) {
            error!(
                "tunnel {} illegal transition {} -> {}",
                self.id,
                self.status.name(),
                to.name()
            );
            return Err(ProxyError::InvalidTransition {
                from: self.status.name(),
                to: to.name(),
            });
        }
        self.status = to;
        Ok(())
    }

    fn report(&mut self, handler: &mut dyn TunnelHandler, outcome: Outcome) {
        if self.reported {
            return;
        }
        self.reported = true;
        match outcome {
            Outcome::Closed => handler.on_closed(self.id),
            Outcome::Failed => handler.on_error(self.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poller::{EventPoller, NotificationHandler, SelectPoller};
    use crate::connection::RECV_BUFFER_SIZE;
    use std::io::{ErrorKind, Read, Write};
    use std::net::{Shutdown, TcpListener};
    use std::os::unix::io::RawFd;
    use std::thread;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct Recorder {
        closed: Vec<TunnelId>,
        errors: Vec<TunnelId>,
    }

    impl TunnelHandler for Recorder {
        fn on_closed(&mut self, id: TunnelId) {
            self.closed.push(id);
        }

        fn on_error(&mut self, id: TunnelId) {
            self.errors.push(id);
        }
    }

    struct Harness {
        tunnel: ProxyTunnel,
        recorder: Recorder,
    }

    impl NotificationHandler for Harness {
        fn handle_input_notification(&mut self, registry: &mut Registry, _fd: RawFd, token: Token) -> Result<(), ProxyError> {
            let (_, side) = split_token(token);
            self.tunnel.handle_input(registry, side, &mut self.recorder);
            Ok(())
        }

        fn handle_output_notification(&mut self, registry: &mut Registry, _fd: RawFd, token: Token) -> Result<(), ProxyError> {
            let (_, side) = split_token(token);
            self.tunnel.handle_output(registry, side, &mut self.recorder);
            Ok(())
        }
    }

    struct Fixture {
        poller: SelectPoller,
        harness: Harness,
        client: TcpStream,
        proxy: TcpStream,
    }

    impl Fixture {
        fn new(settings: TunnelSettings) -> Self {
            let proxy_listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let local_listener = TcpListener::bind("127.0.0.1:0").unwrap();

            let mut tunnel = ProxyTunnel::new(&settings, Arc::new(TunnelMetrics::new()));
            tunnel.set_proxy_server(proxy_listener.local_addr().unwrap());
            tunnel.set_dest_server(ServerAddr::parse("dest.example:22").unwrap());

            let client = TcpStream::connect(local_listener.local_addr().unwrap()).unwrap();
            let (accepted, _) = local_listener.accept().unwrap();

            let mut poller = SelectPoller::new();
            tunnel.accept_local(poller.registry(), 1, accepted).unwrap();
            let (proxy, _) = proxy_listener.accept().unwrap();

            for s in [&client, &proxy] {
                s.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
            }

            Self {
                poller,
                harness: Harness { tunnel, recorder: Recorder::default() },
                client,
                proxy,
            }
        }

        fn pump(&mut self) {
            for _ in 0..10 {
                self.poller
                    .process_pending_events(Duration::from_millis(10), &mut self.harness)
                    .unwrap();
            }
        }

        fn read_request(&mut self) -> String {
            self.pump();
            let mut buf = vec![0u8; 1024];
            let n = self.proxy.read(&mut buf).unwrap();
            String::from_utf8(buf[..n].to_vec()).unwrap()
        }
    }

    fn read_exactly(stream: &mut TcpStream, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).unwrap();
        buf
    }

    /// Byte `i` of a stream is `i % 251`, so any reordering or gap shows.
    fn pattern(offset: usize, len: usize) -> Vec<u8> {
        (offset..offset + len).map(|i| (i % 251) as u8).collect()
    }

    fn write_pattern(mut stream: TcpStream, total: usize) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            let mut sent = 0;
            while sent < total {
                let len = (total - sent).min(64 * 1024);
                stream.write_all(&pattern(sent, len)).unwrap();
                sent += len;
            }
        })
    }

    /// Non-blocking read of whatever is available, appended to `out`.
    fn read_available(stream: &mut TcpStream, out: &mut Vec<u8>) {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => return,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => return,
                Err(e) => panic!("read failed: {}", e),
            }
        }
    }

    fn assert_eof(stream: &mut TcpStream) {
        let mut buf = [0u8; 16];
        assert_eq!(stream.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_token_encoding() {
        assert_eq!(split_token(tunnel_token(1, Side::Local)), (1, Side::Local));
        assert_eq!(split_token(tunnel_token(77, Side::Upstream)), (77, Side::Upstream));
        assert_ne!(tunnel_token(1, Side::Local), Token(0));
    }

    #[test]
    fn test_transition_table() {
        use ProxyStatus::*;
        assert!(Closed.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connecting.can_transition_to(Error));
        assert!(Connected.can_transition_to(Error));
        assert!(Error.can_transition_to(Closed));
        assert!(!Closed.can_transition_to(Connected));
        assert!(!Closed.can_transition_to(Error));
        assert!(!Error.can_transition_to(Connected));
        assert!(!Connected.can_transition_to(Connecting));
    }

    #[test]
    fn test_illegal_transition_is_rejected() {
        let mut tunnel = ProxyTunnel::new(&TunnelSettings::default(), Arc::new(TunnelMetrics::new()));
        let err = tunnel.transition(ProxyStatus::Connected).unwrap_err();
        assert!(matches!(
            err,
            ProxyError::InvalidTransition { from: "Closed", to: "Connected" }
        ));
        assert_eq!(tunnel.status(), ProxyStatus::Closed);
    }

    #[test]
    fn test_cleanup_on_blank_tunnel_is_noop() {
        let mut registry = Registry::new();
        let mut tunnel = ProxyTunnel::new(&TunnelSettings::default(), Arc::new(TunnelMetrics::new()));
        tunnel.cleanup(&mut registry);
        tunnel.cleanup(&mut registry);
        assert_eq!(tunnel.status(), ProxyStatus::Closed);
        assert_eq!(tunnel.id(), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_accept_without_proxy_fails_cleanly() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let _client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, _) = listener.accept().unwrap();

        let mut registry = Registry::new();
        let mut tunnel = ProxyTunnel::new(&TunnelSettings::default(), Arc::new(TunnelMetrics::new()));
        assert!(tunnel.accept_local(&mut registry, 1, accepted).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_handshake_success_flushes_cache_before_new_data() {
        let mut fx = Fixture::new(TunnelSettings::default());

        let request = fx.read_request();
        assert_eq!(request, "CONNECT dest.example:22 HTTP/1.1\r\nHost: dest.example:22\r\n\r\n");
        assert_eq!(fx.harness.tunnel.status(), ProxyStatus::Connecting);

        fx.client.write_all(b"hello ").unwrap();
        fx.pump();
        fx.client.write_all(b"world").unwrap();
        fx.pump();
        assert_eq!(fx.harness.tunnel.cached_bytes(), 11);

        fx.proxy.write_all(b"HTTP/1.0 200 Connection established\r\n\r\n").unwrap();
        fx.pump();
        assert_eq!(fx.harness.tunnel.status(), ProxyStatus::Connected);
        assert_eq!(fx.harness.tunnel.cached_bytes(), 0);

        fx.client.write_all(b"!").unwrap();
        fx.pump();
        assert_eq!(read_exactly(&mut fx.proxy, 12), b"hello world!");

        fx.proxy.write_all(b"reply").unwrap();
        fx.pump();
        assert_eq!(read_exactly(&mut fx.client, 5), b"reply");
        assert!(fx.harness.recorder.closed.is_empty());
        assert!(fx.harness.recorder.errors.is_empty());
    }

    #[test]
    fn test_trailing_bytes_reach_client() {
        let mut fx = Fixture::new(TunnelSettings::default());
        fx.read_request();

        fx.proxy
            .write_all(b"HTTP/1.1 200 Connection established\r\n\r\nSSH-2.0-OpenSSH\r\n")
            .unwrap();
        fx.pump();
        assert_eq!(read_exactly(&mut fx.client, 17), b"SSH-2.0-OpenSSH\r\n");
    }

    #[test]
    fn test_auth_required_reports_one_error() {
        let mut fx = Fixture::new(TunnelSettings::default());
        fx.read_request();

        fx.client.write_all(b"early bytes").unwrap();
        fx.pump();
        fx.proxy
            .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
            .unwrap();
        fx.pump();

        assert_eq!(fx.harness.recorder.errors, vec![1]);
        assert!(fx.harness.recorder.closed.is_empty());
        assert_eq!(fx.harness.tunnel.status(), ProxyStatus::Error);
        assert_eq!(fx.harness.tunnel.cached_bytes(), 0);
        assert!(fx.poller.registry().is_empty());
        assert_eof(&mut fx.client);
        assert_eof(&mut fx.proxy);

        fx.harness.tunnel.cleanup(fx.poller.registry());
        assert_eq!(fx.harness.tunnel.status(), ProxyStatus::Closed);
    }

    #[test]
    fn test_credentials_are_sent_preemptively() {
        let proxy_listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let local_listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut tunnel = ProxyTunnel::new(&TunnelSettings::default(), Arc::new(TunnelMetrics::new()));
        tunnel.set_proxy_server(proxy_listener.local_addr().unwrap());
        tunnel.set_dest_server(ServerAddr::parse("10.0.0.5:443").unwrap());
        tunnel.set_credentials(Some(Credentials::new("alice", "s3cret").unwrap()));

        let _client = TcpStream::connect(local_listener.local_addr().unwrap()).unwrap();
        let (accepted, _) = local_listener.accept().unwrap();
        let mut poller = SelectPoller::new();
        tunnel.accept_local(poller.registry(), 3, accepted).unwrap();
        let (mut proxy, _) = proxy_listener.accept().unwrap();
        proxy.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

        let mut harness = Harness { tunnel, recorder: Recorder::default() };
        for _ in 0..10 {
            poller
                .process_pending_events(Duration::from_millis(10), &mut harness)
                .unwrap();
        }

        let mut buf = vec![0u8; 1024];
        let n = proxy.read(&mut buf).unwrap();
        let request = String::from_utf8_lossy(&buf[..n]);
        assert!(request.starts_with("CONNECT 10.0.0.5:443 HTTP/1.1\r\n"));
        assert!(request.contains("Proxy-Authorization: Basic YWxpY2U6czNjcmV0\r\n"));
        assert!(request.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_oversized_response_is_a_handshake_error() {
        let mut fx = Fixture::new(TunnelSettings {
            max_header_size: 32,
            ..TunnelSettings::default()
        });
        fx.read_request();

        fx.proxy.write_all(&[b'A'; 64]).unwrap();
        fx.pump();

        assert_eq!(fx.harness.recorder.errors, vec![1]);
        assert!(fx.harness.recorder.closed.is_empty());
        assert_eof(&mut fx.client);
    }

    #[test]
    fn test_upstream_close_before_handshake_discards_cache() {
        let mut fx = Fixture::new(TunnelSettings::default());
        fx.read_request();

        fx.client.write_all(b"never delivered").unwrap();
        fx.pump();
        assert_eq!(fx.harness.tunnel.cached_bytes(), 15);

        fx.proxy.shutdown(Shutdown::Both).unwrap();
        fx.pump();

        assert_eq!(fx.harness.recorder.closed, vec![1]);
        assert!(fx.harness.recorder.errors.is_empty());
        assert_eq!(fx.harness.tunnel.cached_bytes(), 0);
        assert_eof(&mut fx.client);
    }

    #[test]
    fn test_local_close_after_handshake_closes_upstream() {
        let mut fx = Fixture::new(TunnelSettings::default());
        fx.read_request();
        fx.proxy.write_all(b"HTTP/1.1 200 Connection established\r\n\r\n").unwrap();
        fx.pump();

        fx.client.write_all(b"bye").unwrap();
        fx.client.shutdown(Shutdown::Write).unwrap();
        fx.pump();

        assert_eq!(read_exactly(&mut fx.proxy, 3), b"bye");
        assert_eof(&mut fx.proxy);
        assert_eq!(fx.harness.recorder.closed, vec![1]);
        assert_eq!(fx.harness.tunnel.status(), ProxyStatus::Closed);
        assert!(fx.poller.registry().is_empty());
    }

    #[test]
    fn test_spilled_bytes_replay_in_order() {
        let mut fx = Fixture::new(TunnelSettings {
            cache_memory_limit: 8,
            ..TunnelSettings::default()
        });
        fx.read_request();

        let chunks: [&[u8]; 4] = [b"alpha-", b"bravo-", b"charlie-", b"delta"];
        for chunk in chunks {
            fx.client.write_all(chunk).unwrap();
            fx.pump();
        }
        assert_eq!(fx.harness.tunnel.cached_bytes(), 25);
        assert!(fx.harness.tunnel.cache.spilled_bytes() > 0);

        fx.proxy.write_all(b"HTTP/1.0 200 Connection established\r\n\r\n").unwrap();
        fx.pump();
        fx.client.write_all(b"!").unwrap();
        fx.pump();

        assert_eq!(read_exactly(&mut fx.proxy, 26), b"alpha-bravo-charlie-delta!");
        assert!(fx.harness.tunnel.cache.is_empty());
    }

    #[test]
    fn test_stalled_client_bounds_relay_backlog() {
        const TOTAL: usize = 32 * 1024 * 1024;
        let max_pending = 64 * 1024;
        let mut fx = Fixture::new(TunnelSettings {
            max_pending_bytes: max_pending,
            ..TunnelSettings::default()
        });
        fx.read_request();
        fx.proxy.write_all(b"HTTP/1.1 200 Connection established\r\n\r\n").unwrap();
        fx.pump();
        assert_eq!(fx.harness.tunnel.status(), ProxyStatus::Connected);

        let writer = write_pattern(fx.proxy.try_clone().unwrap(), TOTAL);

        let deadline = Instant::now() + Duration::from_secs(10);
        while !fx.harness.tunnel.upstream.is_reading_paused() {
            assert!(Instant::now() < deadline, "upstream never paused");
            fx.pump();
            assert!(fx.harness.tunnel.local.pending_bytes() <= max_pending + RECV_BUFFER_SIZE);
        }
        for _ in 0..5 {
            fx.pump();
        }
        assert!(fx.harness.tunnel.upstream.is_reading_paused());
        assert!(fx.harness.tunnel.local.pending_bytes() <= max_pending + RECV_BUFFER_SIZE);

        fx.client.set_nonblocking(true).unwrap();
        let mut received = Vec::with_capacity(TOTAL);
        let deadline = Instant::now() + Duration::from_secs(30);
        while received.len() < TOTAL {
            assert!(Instant::now() < deadline, "relay stalled at {} bytes", received.len());
            fx.pump();
            assert!(fx.harness.tunnel.local.pending_bytes() <= max_pending + RECV_BUFFER_SIZE);
            read_available(&mut fx.client, &mut received);
        }
        writer.join().unwrap();

        assert!(received == pattern(0, TOTAL), "relayed bytes out of order");
        assert!(!fx.harness.tunnel.upstream.is_reading_paused());
        assert!(fx.harness.recorder.errors.is_empty());
    }

    #[test]
    fn test_large_staged_backlog_replays_without_buffering_it_all() {
        const TOTAL: usize = 24 * 1024 * 1024;
        let max_pending = 64 * 1024;
        let mut fx = Fixture::new(TunnelSettings {
            cache_memory_limit: 64 * 1024,
            max_pending_bytes: max_pending,
            ..TunnelSettings::default()
        });
        fx.read_request();

        let writer = write_pattern(fx.client.try_clone().unwrap(), TOTAL);
        let deadline = Instant::now() + Duration::from_secs(30);
        while fx.harness.tunnel.cached_bytes() < TOTAL {
            assert!(Instant::now() < deadline, "client bytes not staged");
            fx.pump();
        }
        writer.join().unwrap();

        fx.proxy.write_all(b"HTTP/1.1 200 Connection established\r\n\r\n").unwrap();
        fx.pump();
        assert_eq!(fx.harness.tunnel.status(), ProxyStatus::Connected);
        assert!(fx.harness.tunnel.cached_bytes() > 0);
        assert!(fx.harness.tunnel.upstream.pending_bytes() <= max_pending + RECV_BUFFER_SIZE);
        assert!(fx.harness.tunnel.local.is_reading_paused());

        fx.proxy.set_nonblocking(true).unwrap();
        let mut received = Vec::with_capacity(TOTAL);
        let deadline = Instant::now() + Duration::from_secs(30);
        while received.len() < TOTAL {
            assert!(Instant::now() < deadline, "replay stalled at {} bytes", received.len());
            fx.pump();
            assert!(fx.harness.tunnel.upstream.pending_bytes() <= max_pending + RECV_BUFFER_SIZE);
            read_available(&mut fx.proxy, &mut received);
        }

        assert!(received == pattern(0, TOTAL), "replayed bytes out of order");
        assert!(fx.harness.tunnel.cache.is_empty());
        assert!(!fx.harness.tunnel.local.is_reading_paused());
    }

    #[test]
    fn test_unreachable_proxy_reports_error_and_stays_closed() {
        let proxy_listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let proxy_addr = proxy_listener.local_addr().unwrap();
        drop(proxy_listener);
        let local_listener = TcpListener::bind("127.0.0.1:0").unwrap();

        let mut tunnel = ProxyTunnel::new(&TunnelSettings::default(), Arc::new(TunnelMetrics::new()));
        tunnel.set_proxy_server(proxy_addr);
        tunnel.set_dest_server(ServerAddr::parse("dest.example:22").unwrap());
        let mut client = TcpStream::connect(local_listener.local_addr().unwrap()).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let (accepted, _) = local_listener.accept().unwrap();

        let mut poller = SelectPoller::new();
        tunnel.accept_local(poller.registry(), 5, accepted).unwrap();
        let mut harness = Harness { tunnel, recorder: Recorder::default() };
        for _ in 0..10 {
            poller
                .process_pending_events(Duration::from_millis(10), &mut harness)
                .unwrap();
        }

        assert_eq!(harness.recorder.errors, vec![5]);
        assert!(harness.recorder.closed.is_empty());
        assert_eq!(harness.tunnel.status(), ProxyStatus::Closed);
        assert!(poller.registry().is_empty());
        assert_eof(&mut client);
    }
}
