use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Metrics for observability
///
/// Counters and connection timing for the managed connection. Use
/// `snapshot()` to get a point-in-time view of everything, or the
/// individual getters for specific values.
///
/// # Example
/// ```ignore
/// let metrics = manager.metrics();
///
/// println!("Connections: {}", metrics.connections());
/// println!("Reconnect attempts: {}", metrics.reconnect_attempts());
///
/// let snapshot = metrics.snapshot();
/// ```
#[derive(Debug, Default)]
pub struct Metrics {
    connections_total: AtomicU64,
    reconnect_attempts_total: AtomicU64,
    transport_errors_total: AtomicU64,
    configuration_failures_total: AtomicU64,
    observer_failures_total: AtomicU64,
    stale_events_total: AtomicU64,

    timing: RwLock<ConnectionTiming>,
}

#[derive(Debug, Default)]
struct ConnectionTiming {
    is_connected: bool,
    last_connected_at: Option<Instant>,
    total_uptime: Duration,
}

impl Metrics {
    /// Create a new Metrics instance
    pub fn new() -> Self {
        Self::default()
    }

    // ========== Getters ==========

    /// Get total connections established
    pub fn connections(&self) -> u64 {
        self.connections_total.load(Ordering::Relaxed)
    }

    /// Get total reconnect attempts scheduled
    pub fn reconnect_attempts(&self) -> u64 {
        self.reconnect_attempts_total.load(Ordering::Relaxed)
    }

    /// Get total transient transport errors
    pub fn transport_errors(&self) -> u64 {
        self.transport_errors_total.load(Ordering::Relaxed)
    }

    /// Get total configuration failures
    pub fn configuration_failures(&self) -> u64 {
        self.configuration_failures_total.load(Ordering::Relaxed)
    }

    /// Get total failed observer callbacks
    pub fn observer_failures(&self) -> u64 {
        self.observer_failures_total.load(Ordering::Relaxed)
    }

    /// Get total transport events discarded because their connection was replaced
    pub fn stale_events(&self) -> u64 {
        self.stale_events_total.load(Ordering::Relaxed)
    }

    /// Whether the connection is currently up
    pub fn is_connected(&self) -> bool {
        self.timing.read().is_connected
    }

    /// Time since the current connection was established (None if down)
    pub fn time_since_connected(&self) -> Option<Duration> {
        let timing = self.timing.read();
        if timing.is_connected {
            timing.last_connected_at.map(|t| t.elapsed())
        } else {
            None
        }
    }

    /// Accumulated uptime, including the current connection
    pub fn total_uptime(&self) -> Duration {
        let timing = self.timing.read();
        match (timing.is_connected, timing.last_connected_at) {
            (true, Some(at)) => timing.total_uptime + at.elapsed(),
            _ => timing.total_uptime,
        }
    }

    // ========== Recording methods (called internally) ==========

    /// Record a successful connection
    pub(crate) fn record_connected(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        let mut timing = self.timing.write();
        timing.is_connected = true;
        timing.last_connected_at = Some(Instant::now());
    }

    /// Record the loss (or release) of the connection
    pub(crate) fn record_disconnected(&self) {
        let mut timing = self.timing.write();
        if timing.is_connected {
            if let Some(at) = timing.last_connected_at {
                timing.total_uptime += at.elapsed();
            }
        }
        timing.is_connected = false;
    }

    pub(crate) fn record_reconnect_attempt(&self) {
        self.reconnect_attempts_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transport_error(&self) {
        self.transport_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_configuration_failure(&self) {
        self.configuration_failures_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_observer_failures(&self, count: usize) {
        if count > 0 {
            self.observer_failures_total
                .fetch_add(count as u64, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_stale_event(&self) {
        self.stale_events_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a point-in-time snapshot of all metrics for export
    ///
    /// This is the recommended way to get metrics for monitoring systems.
    pub fn snapshot(&self) -> MetricsSnapshot {
        // Take the timing lock once to ensure consistency
        let timing = self.timing.read();
        let current = match (timing.is_connected, timing.last_connected_at) {
            (true, Some(at)) => Some(at.elapsed()),
            _ => None,
        };

        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Acquire),
            reconnect_attempts_total: self.reconnect_attempts_total.load(Ordering::Acquire),
            transport_errors_total: self.transport_errors_total.load(Ordering::Acquire),
            configuration_failures_total: self
                .configuration_failures_total
                .load(Ordering::Acquire),
            observer_failures_total: self.observer_failures_total.load(Ordering::Acquire),
            stale_events_total: self.stale_events_total.load(Ordering::Acquire),
            is_connected: timing.is_connected,
            time_since_connected: current,
            total_uptime: timing.total_uptime + current.unwrap_or_default(),
        }
    }
}

/// A point-in-time snapshot of all metrics
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub reconnect_attempts_total: u64,
    pub transport_errors_total: u64,
    pub configuration_failures_total: u64,
    pub observer_failures_total: u64,
    pub stale_events_total: u64,
    pub is_connected: bool,
    pub time_since_connected: Option<Duration>,
    pub total_uptime: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_counters() {
        let metrics = Metrics::new();

        metrics.record_connected();
        metrics.record_disconnected();
        metrics.record_connected();
        metrics.record_reconnect_attempt();
        metrics.record_transport_error();

        assert_eq!(metrics.connections(), 2);
        assert_eq!(metrics.reconnect_attempts(), 1);
        assert_eq!(metrics.transport_errors(), 1);
        assert_eq!(metrics.configuration_failures(), 0);
    }

    #[test]
    fn test_connection_timing() {
        let metrics = Metrics::new();
        assert!(metrics.time_since_connected().is_none());

        metrics.record_connected();
        assert!(metrics.is_connected());
        assert!(metrics.time_since_connected().is_some());

        metrics.record_disconnected();
        assert!(!metrics.is_connected());
        assert!(metrics.time_since_connected().is_none());

        // A second disconnect must not double-count uptime
        let uptime = metrics.total_uptime();
        metrics.record_disconnected();
        assert_eq!(metrics.total_uptime(), uptime);
    }

    #[test]
    fn test_observer_failures_counted_in_bulk() {
        let metrics = Metrics::new();
        metrics.record_observer_failures(0);
        metrics.record_observer_failures(3);
        assert_eq!(metrics.observer_failures(), 3);
    }

    #[test]
    fn test_metrics_snapshot() {
        let metrics = Metrics::new();

        metrics.record_connected();
        metrics.record_stale_event();
        metrics.record_configuration_failure();

        let snapshot = metrics.snapshot();

        assert_eq!(snapshot.connections_total, 1);
        assert_eq!(snapshot.stale_events_total, 1);
        assert_eq!(snapshot.configuration_failures_total, 1);
        assert!(snapshot.is_connected);
    }
}
