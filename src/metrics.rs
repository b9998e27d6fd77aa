use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Metrics for observability
///
/// Counters and gauges for a single streaming connection. Use `snapshot()` to
/// get a point-in-time view of all metrics, or the individual getters.
///
/// # Example
/// ```ignore
/// let metrics = manager.metrics();
///
/// println!("Reconnections: {}", metrics.reconnections());
/// println!("Handler errors: {}", metrics.handler_errors());
///
/// let snapshot = metrics.snapshot();
/// ```
#[derive(Debug, Default)]
pub struct Metrics {
    connections_total: AtomicU64,
    reconnections_total: AtomicU64,
    reconnect_attempts_total: AtomicU64,
    dial_failures_total: AtomicU64,
    messages_received_total: AtomicU64,
    messages_sent_total: AtomicU64,
    write_errors_total: AtomicU64,
    handler_errors_total: AtomicU64,
    pings_sent_total: AtomicU64,
    pongs_sent_total: AtomicU64,
    pongs_received_total: AtomicU64,
    read_timeouts_total: AtomicU64,

    timestamps: RwLock<Timestamps>,
}

#[derive(Debug, Default)]
struct Timestamps {
    last_connected_at: Option<Instant>,
    last_message_at: Option<Instant>,
    is_connected: bool,
}

impl Metrics {
    /// Create a new Metrics instance
    pub fn new() -> Self {
        Self::default()
    }

    // ========== Getters ==========

    /// Successful handshakes (initial + reconnects)
    pub fn connections(&self) -> u64 {
        self.connections_total.load(Ordering::Relaxed)
    }

    /// Successful reconnect sequences
    pub fn reconnections(&self) -> u64 {
        self.reconnections_total.load(Ordering::Relaxed)
    }

    /// Dial attempts made by the reconnect supervisor
    pub fn reconnect_attempts(&self) -> u64 {
        self.reconnect_attempts_total.load(Ordering::Relaxed)
    }

    /// Failed dials
    pub fn dial_failures(&self) -> u64 {
        self.dial_failures_total.load(Ordering::Relaxed)
    }

    /// Data frames received
    pub fn messages_received(&self) -> u64 {
        self.messages_received_total.load(Ordering::Relaxed)
    }

    /// Frames written to the socket
    pub fn messages_sent(&self) -> u64 {
        self.messages_sent_total.load(Ordering::Relaxed)
    }

    /// Failed writes
    pub fn write_errors(&self) -> u64 {
        self.write_errors_total.load(Ordering::Relaxed)
    }

    /// Handler errors and panics
    pub fn handler_errors(&self) -> u64 {
        self.handler_errors_total.load(Ordering::Relaxed)
    }

    /// Pings written
    pub fn pings_sent(&self) -> u64 {
        self.pings_sent_total.load(Ordering::Relaxed)
    }

    /// Pongs written
    pub fn pongs_sent(&self) -> u64 {
        self.pongs_sent_total.load(Ordering::Relaxed)
    }

    /// Pongs received
    pub fn pongs_received(&self) -> u64 {
        self.pongs_received_total.load(Ordering::Relaxed)
    }

    /// Reads that hit the liveness deadline
    pub fn read_timeouts(&self) -> u64 {
        self.read_timeouts_total.load(Ordering::Relaxed)
    }

    /// Whether a transport is currently live
    pub fn is_connected(&self) -> bool {
        self.timestamps.read().is_connected
    }

    // ========== Recording methods (called internally) ==========

    pub(crate) fn record_connected(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        let mut ts = self.timestamps.write();
        ts.is_connected = true;
        ts.last_connected_at = Some(Instant::now());
    }

    pub(crate) fn record_disconnected(&self) {
        self.timestamps.write().is_connected = false;
    }

    pub(crate) fn record_reconnection(&self) {
        self.reconnections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reconnect_attempt(&self) {
        self.reconnect_attempts_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dial_failure(&self) {
        self.dial_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_message_received(&self) {
        self.messages_received_total.fetch_add(1, Ordering::Relaxed);
        self.timestamps.write().last_message_at = Some(Instant::now());
    }

    pub(crate) fn record_message_sent(&self) {
        self.messages_sent_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_write_error(&self) {
        self.write_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_handler_error(&self) {
        self.handler_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_ping(&self) {
        self.pings_sent_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_pong_sent(&self) {
        self.pongs_sent_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_pong_received(&self) {
        self.pongs_received_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_read_timeout(&self) {
        self.read_timeouts_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a point-in-time snapshot of all metrics for export
    pub fn snapshot(&self) -> MetricsSnapshot {
        let ts = self.timestamps.read();

        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Acquire),
            reconnections_total: self.reconnections_total.load(Ordering::Acquire),
            reconnect_attempts_total: self.reconnect_attempts_total.load(Ordering::Acquire),
            dial_failures_total: self.dial_failures_total.load(Ordering::Acquire),
            messages_received_total: self.messages_received_total.load(Ordering::Acquire),
            messages_sent_total: self.messages_sent_total.load(Ordering::Acquire),
            write_errors_total: self.write_errors_total.load(Ordering::Acquire),
            handler_errors_total: self.handler_errors_total.load(Ordering::Acquire),
            pings_sent_total: self.pings_sent_total.load(Ordering::Acquire),
            pongs_sent_total: self.pongs_sent_total.load(Ordering::Acquire),
            pongs_received_total: self.pongs_received_total.load(Ordering::Acquire),
            read_timeouts_total: self.read_timeouts_total.load(Ordering::Acquire),
            is_connected: ts.is_connected,
            time_since_connected: ts.last_connected_at.map(|t| t.elapsed()),
            time_since_last_message: ts.last_message_at.map(|t| t.elapsed()),
        }
    }
}

/// A point-in-time snapshot of all metrics
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub reconnections_total: u64,
    pub reconnect_attempts_total: u64,
    pub dial_failures_total: u64,
    pub messages_received_total: u64,
    pub messages_sent_total: u64,
    pub write_errors_total: u64,
    pub handler_errors_total: u64,
    pub pings_sent_total: u64,
    pub pongs_sent_total: u64,
    pub pongs_received_total: u64,
    pub read_timeouts_total: u64,
    pub is_connected: bool,
    /// Duration since last successful connection (None if never connected)
    pub time_since_connected: Option<Duration>,
    /// Duration since last data frame (None if no messages)
    pub time_since_last_message: Option<Duration>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_counters() {
        let metrics = Metrics::new();

        metrics.record_connected();
        metrics.record_connected();
        metrics.record_reconnection();

        assert_eq!(metrics.connections(), 2);
        assert_eq!(metrics.reconnections(), 1);
        assert!(metrics.is_connected());

        metrics.record_disconnected();
        assert!(!metrics.is_connected());
    }

    #[test]
    fn test_metrics_snapshot() {
        let metrics = Metrics::new();

        metrics.record_connected();
        metrics.record_message_received();
        metrics.record_handler_error();
        metrics.record_ping();

        let snapshot = metrics.snapshot();

        assert_eq!(snapshot.connections_total, 1);
        assert_eq!(snapshot.messages_received_total, 1);
        assert_eq!(snapshot.handler_errors_total, 1);
        assert_eq!(snapshot.pings_sent_total, 1);
        assert!(snapshot.is_connected);
        assert!(snapshot.time_since_last_message.is_some());
    }

    #[test]
    fn test_snapshot_before_any_connection() {
        let snapshot = Metrics::new().snapshot();

        assert!(!snapshot.is_connected);
        assert!(snapshot.time_since_connected.is_none());
        assert!(snapshot.time_since_last_message.is_none());
        assert_eq!(snapshot.write_errors_total, 0);
    }
}
