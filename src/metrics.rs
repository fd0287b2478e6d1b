use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counters for tunnel lifecycle and relay volume. Shared through `Arc` so
/// the entry point can read a summary while the loop runs.
#[derive(Debug)]
pub struct TunnelMetrics {
    pub tunnels_accepted: AtomicU64,
    pub tunnels_established: AtomicU64,
    pub tunnels_failed: AtomicU64,
    pub tunnels_closed: AtomicU64,
    pub pool_hits: AtomicU64,
    pub pool_misses: AtomicU64,
    pub tunnels_destroyed: AtomicU64,
    pub tunnels_active: AtomicU64,
    pub tunnels_pooled: AtomicU64,
    pub bytes_to_upstream: AtomicU64,
    pub bytes_to_client: AtomicU64,
    pub bytes_cached: AtomicU64,
    pub idle_micros: AtomicU64,
}

impl TunnelMetrics {
    pub fn new() -> Self {
        Self {
            tunnels_accepted: AtomicU64::new(0),
            tunnels_established: AtomicU64::new(0),
            tunnels_failed: AtomicU64::new(0),
            tunnels_closed: AtomicU64::new(0),
            pool_hits: AtomicU64::new(0),
            pool_misses: AtomicU64::new(0),
            tunnels_destroyed: AtomicU64::new(0),
            tunnels_active: AtomicU64::new(0),
            tunnels_pooled: AtomicU64::new(0),
            bytes_to_upstream: AtomicU64::new(0),
            bytes_to_client: AtomicU64::new(0),
            bytes_cached: AtomicU64::new(0),
            idle_micros: AtomicU64::new(0),
        }
    }

    pub fn increment_accepted(&self) {
        self.tunnels_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_established(&self) {
        self.tunnels_established.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_failed(&self) {
        self.tunnels_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_closed(&self) {
        self.tunnels_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_pool_hits(&self) {
        self.pool_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_pool_misses(&self) {
        self.pool_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_destroyed(&self) {
        self.tunnels_destroyed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_occupancy(&self, active: usize, pooled: usize) {
        self.tunnels_active.store(active as u64, Ordering::Relaxed);
        self.tunnels_pooled.store(pooled as u64, Ordering::Relaxed);
    }

    pub fn record_bytes_to_upstream(&self, bytes: usize) {
        self.bytes_to_upstream.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_bytes_to_client(&self, bytes: usize) {
        self.bytes_to_client.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_bytes_cached(&self, bytes: usize) {
        self.bytes_cached.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_idle_time(&self, idle: Duration) {
        self.idle_micros.fetch_add(idle.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn get_metrics_summary(&self) -> MetricsSummary {
        MetricsSummary {
            tunnels_accepted: self.tunnels_accepted.load(Ordering::Relaxed),
            tunnels_established: self.tunnels_established.load(Ordering::Relaxed),
            tunnels_failed: self.tunnels_failed.load(Ordering::Relaxed),
            tunnels_closed: self.tunnels_closed.load(Ordering::Relaxed),
            pool_hits: self.pool_hits.load(Ordering::Relaxed),
            pool_misses: self.pool_misses.load(Ordering::Relaxed),
            tunnels_destroyed: self.tunnels_destroyed.load(Ordering::Relaxed),
            tunnels_active: self.tunnels_active.load(Ordering::Relaxed),
            tunnels_pooled: self.tunnels_pooled.load(Ordering::Relaxed),
            bytes_to_upstream: self.bytes_to_upstream.load(Ordering::Relaxed),
            bytes_to_client: self.bytes_to_client.load(Ordering::Relaxed),
            bytes_cached: self.bytes_cached.load(Ordering::Relaxed),
            idle_secs: self.idle_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0,
            timestamp: Utc::now(),
        }
    }
}

impl Default for TunnelMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub tunnels_accepted: u64,
    pub tunnels_established: u64,
    pub tunnels_failed: u64,
    pub tunnels_closed: u64,
    pub pool_hits: u64,
    pub pool_misses: u64,
    pub tunnels_destroyed: u64,
    pub tunnels_active: u64,
    pub tunnels_pooled: u64,
    pub bytes_to_upstream: u64,
    pub bytes_to_client: u64,
    pub bytes_cached: u64,
    pub idle_secs: f64,
    pub timestamp: DateTime<Utc>,
}

impl MetricsSummary {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}
