//! Prometheus metrics collection for wgmgrd
//!
//! Recording is fire-and-forget; nothing here can fail once the collector
//! is built. The registry is exported by [`crate::metrics_server`].

use prometheus::{Counter, Encoder, Gauge, Histogram, HistogramOpts, Registry, TextEncoder};
use std::sync::Arc;

/// Prometheus metrics collector for wgmgrd
#[derive(Clone)]
pub struct MetricsCollector {
    // Counters
    error_getting_peers: Counter,
    device_errors: Counter,
    rule_errors: Counter,
    events_received: Counter,

    // Gauges
    connected_peers: Gauge,

    // Histograms
    sync_duration_seconds: Histogram,

    registry: Arc<Registry>,
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        // Counters
        let error_getting_peers = Counter::new(
            "wgmgr_error_getting_peers_total",
            "Total failed fetches of the desired peer list",
        )?;
        registry.register(Box::new(error_getting_peers.clone()))?;

        let device_errors = Counter::new(
            "wgmgr_device_errors_total",
            "Total failures reading or configuring a WireGuard interface",
        )?;
        registry.register(Box::new(device_errors.clone()))?;

        let rule_errors = Counter::new(
            "wgmgr_rule_errors_total",
            "Total failures listing, appending or deleting port forwarding rules",
        )?;
        registry.register(Box::new(rule_errors.clone()))?;

        let events_received = Counter::new(
            "wgmgr_events_received_total",
            "Total peer events received from the message queue",
        )?;
        registry.register(Box::new(events_received.clone()))?;

        // Gauges
        let connected_peers = Gauge::new(
            "wgmgr_connected_peers",
            "Peers with a handshake in the last two minutes",
        )?;
        registry.register(Box::new(connected_peers.clone()))?;

        // Histograms
        let sync_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "wgmgr_sync_duration_seconds",
                "Duration of a full synchronization pass in seconds",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0]),
        )?;
        registry.register(Box::new(sync_duration_seconds.clone()))?;

        Ok(Self {
            error_getting_peers,
            device_errors,
            rule_errors,
            events_received,
            connected_peers,
            sync_duration_seconds,
            registry: Arc::new(registry),
        })
    }

    /// Record a failed peer list fetch
    pub fn record_error_getting_peers(&self) {
        self.error_getting_peers.inc();
    }

    /// Record a WireGuard interface failure
    pub fn record_device_error(&self) {
        self.device_errors.inc();
    }

    /// Record a firewall rule failure
    pub fn record_rule_error(&self) {
        self.rule_errors.inc();
    }

    /// Record a received peer event
    pub fn record_event_received(&self) {
        self.events_received.inc();
    }

    /// Set connected peers gauge
    pub fn set_connected_peers(&self, count: usize) {
        self.connected_peers.set(count as f64);
    }

    /// Start synchronization pass timer
    pub fn start_sync_timer(&self) -> prometheus::HistogramTimer {
        self.sync_duration_seconds.start_timer()
    }

    /// Gather metrics in Prometheus text format
    pub fn gather_metrics(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buf = vec![];
        encoder.encode(&self.registry.gather(), &mut buf).ok();
        String::from_utf8(buf).unwrap_or_else(|_| String::from("# Error encoding metrics\n"))
    }
}
