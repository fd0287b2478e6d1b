//! Orchestrator: owns the poller, the listener and every tunnel.
//!
//! A tunnel is always in exactly one place: `active` while it serves a
//! client, `broken` once it reported its end during a dispatch pass, `free`
//! after it was reset. Broken tunnels are only reset after the pass that
//! broke them has returned, so no tunnel is recycled while one of its own
//! handlers is on the stack.

use crate::config::{Config, DEFAULT_LOOP_WAIT_MILLIS, DEFAULT_POOL_CAPACITY, DEFAULT_STATS_INTERVAL_SECS, ServerAddr};
use crate::error::ProxyError;
use crate::handshake::Credentials;
use crate::listener::{AcceptHandler, Listener};
use crate::metrics::{MetricsSummary, TunnelMetrics};
use crate::poller::{EventPoller, NotificationHandler, Registry, SelectPoller, Token};
use crate::tunnel::{ProxyTunnel, TunnelHandler, TunnelId, TunnelSettings, split_token};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

pub const LISTENER_TOKEN: Token = Token(0);

/// Cloneable request to leave `run_loop`, usable from other threads.
#[derive(Debug, Clone, Default)]
pub struct ExitHandle(Arc<AtomicBool>);

impl ExitHandle {
    pub fn exit_loop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_exit_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Closed,
    Failed,
}

/// Captures the one report a tunnel makes during a notification.
#[derive(Default)]
struct Verdict(Option<Outcome>);

impl TunnelHandler for Verdict {
    fn on_closed(&mut self, _id: TunnelId) {
        if self.0.is_none() {
            self.0 = Some(Outcome::Closed);
        }
    }

    fn on_error(&mut self, _id: TunnelId) {
        if self.0.is_none() {
            self.0 = Some(Outcome::Failed);
        }
    }
}

struct Upstream {
    addr: ServerAddr,
    resolved: SocketAddr,
}

struct Tunnels {
    active: HashMap<TunnelId, ProxyTunnel>,
    broken: Vec<ProxyTunnel>,
    free: Vec<ProxyTunnel>,
    pool_capacity: usize,
    next_id: TunnelId,
    dest: Option<ServerAddr>,
    upstream: Option<Upstream>,
    credentials: Option<Credentials>,
    settings: TunnelSettings,
    metrics: Arc<TunnelMetrics>,
}

impl Tunnels {
    fn allocate_id(&mut self) -> TunnelId {
        loop {
            let id = self.next_id;
            self.next_id = if self.next_id >= usize::MAX >> 1 { 1 } else { self.next_id + 1 };
            if !self.active.contains_key(&id) {
                return id;
            }
        }
    }

    fn obtain(&mut self) -> ProxyTunnel {
        match self.free.pop() {
            Some(tunnel) => {
                self.metrics.increment_pool_hits();
                tunnel
            }
            None => {
                self.metrics.increment_pool_misses();
                ProxyTunnel::new(&self.settings, self.metrics.clone())
            }
        }
    }

    fn dispatch(&mut self, registry: &mut Registry, token: Token, writable: bool) {
        let (id, side) = split_token(token);
        let Some(tunnel) = self.active.get_mut(&id) else {
            debug!("no active tunnel for token {:?}", token);
            return;
        };

        let mut verdict = Verdict::default();
        if writable {
            tunnel.handle_output(registry, side, &mut verdict);
        } else {
            tunnel.handle_input(registry, side, &mut verdict);
        }

        match verdict.0 {
            Some(Outcome::Closed) => self.on_closed(id),
            Some(Outcome::Failed) => self.on_error(id),
            None => {}
        }
    }

    fn on_closed(&mut self, id: TunnelId) {
        if let Some(tunnel) = self.active.remove(&id) {
            self.metrics.increment_closed();
            debug!("tunnel {} closed", id);
            self.broken.push(tunnel);
        }
    }

    fn on_error(&mut self, id: TunnelId) {
        if let Some(tunnel) = self.active.remove(&id) {
            self.metrics.increment_failed();
            debug!("tunnel {} failed", id);
            self.broken.push(tunnel);
        }
    }

    /// Resets every broken tunnel and pools it while the pool has room.
    fn reclaim(&mut self, registry: &mut Registry) -> usize {
        let reclaimed = self.broken.len();
        for mut tunnel in self.broken.drain(..) {
            tunnel.cleanup(registry);
            if self.free.len() < self.pool_capacity {
                self.free.push(tunnel);
            } else {
                self.metrics.increment_destroyed();
            }
        }
        self.metrics.set_occupancy(self.active.len(), self.free.len());
        reclaimed
    }

    fn teardown(&mut self, registry: &mut Registry) {
        for (_, mut tunnel) in self.active.drain() {
            tunnel.cleanup(registry);
        }
        for mut tunnel in self.broken.drain(..) {
            tunnel.cleanup(registry);
        }
        self.free.clear();
        self.metrics.set_occupancy(0, 0);
    }
}

impl AcceptHandler for Tunnels {
    fn on_accept(&mut self, registry: &mut Registry, stream: TcpStream, peer: SocketAddr) {
        self.metrics.increment_accepted();

        let mut tunnel = self.obtain();
        if let Some(dest) = self.dest.as_ref() {
            tunnel.set_dest_server(dest.clone());
        }
        if let Some(upstream) = self.upstream.as_ref() {
            tunnel.set_proxy_server(upstream.resolved);
        }
        tunnel.set_credentials(self.credentials.clone());

        let id = self.allocate_id();
        match tunnel.accept_local(registry, id, stream) {
            Ok(()) => {
                info!("client {} accepted as tunnel {}", peer, id);
                self.active.insert(id, tunnel);
            }
            Err(e) => {
                warn!("[ProxyClient] cannot serve client {}: {}", peer, e);
                self.metrics.increment_failed();
                self.broken.push(tunnel);
            }
        }
    }
}

/// Routes one dispatch pass to the listener or to a tunnel.
struct Dispatcher<'a> {
    listener: &'a mut Listener,
    tunnels: &'a mut Tunnels,
}

impl NotificationHandler for Dispatcher<'_> {
    fn handle_input_notification(&mut self, registry: &mut Registry, _fd: RawFd, token: Token) -> Result<(), ProxyError> {
        if token == LISTENER_TOKEN {
            self.listener.handle_input_notification(registry, &mut *self.tunnels);
        } else {
            self.tunnels.dispatch(registry, token, false);
        }
        Ok(())
    }

    fn handle_output_notification(&mut self, registry: &mut Registry, _fd: RawFd, token: Token) -> Result<(), ProxyError> {
        if token == LISTENER_TOKEN {
            return Err(ProxyError::Connection("listener has no write interest".to_string()));
        }
        self.tunnels.dispatch(registry, token, true);
        Ok(())
    }
}

pub struct ProxyClient<P: EventPoller = SelectPoller> {
    poller: P,
    listener: Listener,
    tunnels: Tunnels,
    exit: ExitHandle,
    loop_wait: Duration,
    stats_interval: Duration,
    metrics: Arc<TunnelMetrics>,
}

impl ProxyClient<SelectPoller> {
    pub fn new() -> Self {
        Self::with_poller(SelectPoller::new(), TunnelSettings::default(), DEFAULT_POOL_CAPACITY)
    }

    /// Client configured from `config`, not yet listening.
    pub fn from_config(config: &Config) -> Result<Self, ProxyError> {
        let mut client = Self::with_poller(
            SelectPoller::new(),
            TunnelSettings::from_config(config),
            config.pool_capacity(),
        );
        client.set_loop_wait(Duration::from_millis(config.loop_wait_millis()));
        client.set_stats_interval(Duration::from_secs(config.stats_interval_secs()));

        if let Some(dest) = config.dest_addr.as_ref() {
            client.set_dest_server(&dest.to_string())?;
        }
        if let Some(proxy) = config.proxy_addr.as_ref() {
            client.set_proxy_server(&proxy.to_string())?;
        }
        match (config.proxy_username.as_deref(), config.proxy_password.as_deref()) {
            (Some(username), Some(password)) => client.set_credentials(username, password)?,
            (Some(username), None) => client.set_credentials(username, "")?,
            _ => {}
        }
        Ok(client)
    }
}

impl Default for ProxyClient<SelectPoller> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: EventPoller> ProxyClient<P> {
    pub fn with_poller(poller: P, settings: TunnelSettings, pool_capacity: usize) -> Self {
        let metrics = Arc::new(TunnelMetrics::new());
        Self {
            poller,
            listener: Listener::new(LISTENER_TOKEN),
            tunnels: Tunnels {
                active: HashMap::new(),
                broken: Vec::new(),
                free: Vec::with_capacity(pool_capacity),
                pool_capacity,
                next_id: 1,
                dest: None,
                upstream: None,
                credentials: None,
                settings,
                metrics: metrics.clone(),
            },
            exit: ExitHandle::default(),
            loop_wait: Duration::from_millis(DEFAULT_LOOP_WAIT_MILLIS),
            stats_interval: Duration::from_secs(DEFAULT_STATS_INTERVAL_SECS),
            metrics,
        }
    }

    /// Binds the listening socket and starts watching it.
    pub fn initialise(&mut self, listen: &str) -> Result<(), ProxyError> {
        let addr = ServerAddr::parse(listen)?.resolve()?;
        self.listener.initialise(addr, self.poller.registry())
    }

    pub fn set_dest_server(&mut self, addr: &str) -> Result<(), ProxyError> {
        let dest = ServerAddr::parse(addr)?;
        info!("destination server: {}", dest);
        self.tunnels.dest = Some(dest);
        Ok(())
    }

    /// Resolves the proxy address once; tunnels connect to the result.
    pub fn set_proxy_server(&mut self, addr: &str) -> Result<(), ProxyError> {
        let addr = ServerAddr::parse(addr)?;
        let resolved = addr.resolve()?;
        info!("proxy server: {} ({})", addr, resolved);
        self.tunnels.upstream = Some(Upstream { addr, resolved });
        Ok(())
    }

    pub fn set_credentials(&mut self, username: &str, password: &str) -> Result<(), ProxyError> {
        self.tunnels.credentials = Some(Credentials::new(username, password)?);
        Ok(())
    }

    pub fn set_loop_wait(&mut self, wait: Duration) {
        self.loop_wait = wait;
    }

    pub fn set_stats_interval(&mut self, interval: Duration) {
        self.stats_interval = interval;
    }

    pub fn dest_server(&self) -> Option<&ServerAddr> {
        self.tunnels.dest.as_ref()
    }

    pub fn proxy_server(&self) -> Option<&ServerAddr> {
        self.tunnels.upstream.as_ref().map(|u| &u.addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn metrics(&self) -> Arc<TunnelMetrics> {
        self.metrics.clone()
    }

    pub fn metrics_summary(&self) -> MetricsSummary {
        self.metrics.get_metrics_summary()
    }

    pub fn active_count(&self) -> usize {
        self.tunnels.active.len()
    }

    pub fn pooled_count(&self) -> usize {
        self.tunnels.free.len()
    }

    pub fn exit_handle(&self) -> ExitHandle {
        self.exit.clone()
    }

    pub fn exit_loop(&self) {
        self.exit.exit_loop();
    }

    /// One loop iteration: a bounded wait with dispatch, then reclamation of
    /// the tunnels that broke during it.
    pub fn run_once(&mut self) -> Result<usize, ProxyError> {
        let wait = self.loop_wait;
        let Self { poller, listener, tunnels, .. } = self;
        let mut dispatcher = Dispatcher { listener, tunnels };
        let ready = poller.process_pending_events(wait, &mut dispatcher)?;

        self.tunnels.reclaim(self.poller.registry());

        self.metrics.record_idle_time(self.poller.spare_time());
        self.poller.clear_spare_time();
        Ok(ready)
    }

    pub fn run_loop(&mut self) -> Result<(), ProxyError> {
        if !self.listener.is_initialised() {
            return Err(ProxyError::Config("listener not initialised".to_string()));
        }
        if self.tunnels.dest.is_none() {
            return Err(ProxyError::Config("destination server not set".to_string()));
        }
        if self.tunnels.upstream.is_none() {
            return Err(ProxyError::Config("proxy server not set".to_string()));
        }

        info!("proxy client running");
        let mut last_stats = Instant::now();
        while !self.exit.is_exit_requested() {
            self.run_once()?;

            if !self.stats_interval.is_zero() && last_stats.elapsed() >= self.stats_interval {
                info!("stats: {}", self.metrics_summary().to_json());
                last_stats = Instant::now();
            }
        }

        info!("proxy client leaving loop. stats: {}", self.metrics_summary().to_json());
        Ok(())
    }

    /// Closes every tunnel and the listener. Repeated calls do nothing.
    pub fn finalise(&mut self) {
        let registry = self.poller.registry();
        self.tunnels.teardown(registry);
        self.listener.finalise(registry);
    }
}

impl<P: EventPoller> Drop for ProxyClient<P> {
    fn drop(&mut self) {
        self.finalise();
    }
}
