//! Observability and Metrics
//!
//! Per-engine counters for members, frames and failures.
//!
//! Uses atomic counters so workers can record without taking the registry lock.

use std::sync::atomic::{AtomicU64, Ordering};
use serde::Serialize;
use std::time::Instant;
use tracing::info;

/// Metrics collector owned by one engine instance
#[derive(Debug)]
pub struct Metrics {
    /// Members ever registered (accepted clients, connected servers, peers)
    pub members_total: AtomicU64,
    /// Members currently registered
    pub members_active: AtomicU64,
    /// Connections refused because the registry was full
    pub members_rejected: AtomicU64,
    /// Total frames sent
    pub frames_sent: AtomicU64,
    /// Total frames received
    pub frames_received: AtomicU64,
    /// Total bytes sent
    pub bytes_sent: AtomicU64,
    /// Total bytes received (frames only, header included)
    pub bytes_received: AtomicU64,
    /// Failed sends
    pub send_errors: AtomicU64,
    /// Malformed frames or datagrams
    pub protocol_errors: AtomicU64,
    /// Accept, connect and receive failures
    pub connection_errors: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            members_total: AtomicU64::new(0),
            members_active: AtomicU64::new(0),
            members_rejected: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            connection_errors: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn member_added(&self) {
        self.members_total.fetch_add(1, Ordering::Relaxed);
        self.members_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn member_removed(&self) {
        self.members_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn member_rejected(&self) {
        self.members_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_sent(&self, byte_count: u64) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn frame_received(&self, byte_count: u64) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// One datagram may carry several frames.
    pub fn datagram_received(&self, frame_count: u64, byte_count: u64) {
        self.frames_received.fetch_add(frame_count, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn send_error(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_error(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            members_total: self.members_total.load(Ordering::Relaxed),
            members_active: self.members_active.load(Ordering::Relaxed),
            members_rejected: self.members_rejected.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            members_total = snapshot.members_total,
            members_active = snapshot.members_active,
            members_rejected = snapshot.members_rejected,
            frames_sent = snapshot.frames_sent,
            frames_received = snapshot.frames_received,
            bytes_sent = snapshot.bytes_sent,
            bytes_received = snapshot.bytes_received,
            send_errors = snapshot.send_errors,
            protocol_errors = snapshot.protocol_errors,
            connection_errors = snapshot.connection_errors,
            uptime_seconds = snapshot.uptime_seconds,
            "Engine metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
///
/// Serializes to a flat map for status endpoints and JSON logs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub members_total: u64,
    pub members_active: u64,
    pub members_rejected: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub send_errors: u64,
    pub protocol_errors: u64,
    pub connection_errors: u64,
    pub uptime_seconds: u64,
}
