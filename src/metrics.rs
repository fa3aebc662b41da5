//! Metrics Collection Module
//!
//! Process-wide tunnel counters. Tunnels share one `TunnelMetrics` through an
//! `Arc` and bump it as parties start, finish or get aborted; readers take a
//! serializable snapshot.

use crate::event::TunnelRole;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::SystemTime;

/// Point-in-time copy of the tunnel counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelMetricsSnapshot {
    pub tunnels_started: u64,
    pub tunnels_completed: u64,
    pub tunnels_aborted: u64,
    /// Producers closed by an abort while still alive
    pub origin_shutdown_tunnel_abort: u64,
    pub current_cache_connections: i64,
    pub chunked_parse_errors: u64,
    pub truncated_transfers: u64,
    pub throttle_events: u64,
    pub unthrottle_events: u64,
    pub post_buffer_overflows: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub uptime_seconds: u64,
}

#[derive(Debug)]
pub struct TunnelMetrics {
    start_time: SystemTime,
    tunnels_started: AtomicU64,
    tunnels_completed: AtomicU64,
    tunnels_aborted: AtomicU64,
    origin_shutdown_tunnel_abort: AtomicU64,
    current_cache_connections: AtomicI64,
    chunked_parse_errors: AtomicU64,
    truncated_transfers: AtomicU64,
    throttle_events: AtomicU64,
    unthrottle_events: AtomicU64,
    post_buffer_overflows: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

impl Default for TunnelMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelMetrics {
    pub fn new() -> Self {
        Self {
            start_time: SystemTime::now(),
            tunnels_started: AtomicU64::new(0),
            tunnels_completed: AtomicU64::new(0),
            tunnels_aborted: AtomicU64::new(0),
            origin_shutdown_tunnel_abort: AtomicU64::new(0),
            current_cache_connections: AtomicI64::new(0),
            chunked_parse_errors: AtomicU64::new(0),
            truncated_transfers: AtomicU64::new(0),
            throttle_events: AtomicU64::new(0),
            unthrottle_events: AtomicU64::new(0),
            post_buffer_overflows: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
        }
    }

    pub fn record_tunnel_started(&self) {
        self.tunnels_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tunnel_completed(&self) {
        self.tunnels_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tunnel_aborted(&self) {
        self.tunnels_aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_origin_shutdown_abort(&self) {
        self.origin_shutdown_tunnel_abort
            .fetch_add(1, Ordering::Relaxed);
    }

    /// A cache read or write party was attached
    pub fn cache_connection_opened(&self, role: TunnelRole) {
        if role.is_cache() {
            self.current_cache_connections
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    /// A cache read or write party finished or was closed
    pub fn cache_connection_closed(&self, role: TunnelRole) {
        if role.is_cache() {
            self.current_cache_connections
                .fetch_sub(1, Ordering::Relaxed);
        }
    }

    pub fn record_parse_error(&self) {
        self.chunked_parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_truncation(&self) {
        self.truncated_transfers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_throttle(&self) {
        self.throttle_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unthrottle(&self) {
        self.unthrottle_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_post_buffer_overflow(&self) {
        self.post_buffer_overflows.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bytes_read(&self, n: i64) {
        if n > 0 {
            self.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
        }
    }

    pub fn record_bytes_written(&self, n: i64) {
        if n > 0 {
            self.bytes_written.fetch_add(n as u64, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> TunnelMetricsSnapshot {
        TunnelMetricsSnapshot {
            tunnels_started: self.tunnels_started.load(Ordering::Relaxed),
            tunnels_completed: self.tunnels_completed.load(Ordering::Relaxed),
            tunnels_aborted: self.tunnels_aborted.load(Ordering::Relaxed),
            origin_shutdown_tunnel_abort: self
                .origin_shutdown_tunnel_abort
                .load(Ordering::Relaxed),
            current_cache_connections: self
                .current_cache_connections
                .load(Ordering::Relaxed),
            chunked_parse_errors: self.chunked_parse_errors.load(Ordering::Relaxed),
            truncated_transfers: self.truncated_transfers.load(Ordering::Relaxed),
            throttle_events: self.throttle_events.load(Ordering::Relaxed),
            unthrottle_events: self.unthrottle_events.load(Ordering::Relaxed),
            post_buffer_overflows: self.post_buffer_overflows.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            uptime_seconds: self
                .start_time
                .elapsed()
                .map(|d| d.as_secs())
                .unwrap_or(0),
        }
    }

    /// Snapshot rendered as pretty JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.snapshot())?)
    }
}
