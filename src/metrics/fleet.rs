//! Fleet Metrics
//!
//! Prometheus instruments for discovery passes and polling cycles, kept in a
//! registry owned by the service so each instance (and each test) starts from
//! zero.

use std::time::Duration;

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

use crate::error::{Error, Result};

const NAMESPACE: &str = "rigwatch";

/// Handles to every fleet metric.
#[derive(Clone)]
pub struct FleetMetrics {
    registry: Registry,
    probes: IntCounter,
    confirmed: IntCounter,
    discovery_passes: IntCounterVec,
    discovery_duration: Histogram,
    polls: IntCounterVec,
    poll_cycle_duration: Histogram,
    devices_online: IntGauge,
    devices_registered: IntGauge,
}

impl FleetMetrics {
    /// Create the metrics and register them in a fresh registry.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let probes = IntCounter::with_opts(
            Opts::new("discovery_probes_total", "Addresses probed during discovery")
                .namespace(NAMESPACE),
        )?;
        let confirmed = IntCounter::with_opts(
            Opts::new(
                "discovery_confirmed_total",
                "Addresses confirmed as devices during discovery",
            )
            .namespace(NAMESPACE),
        )?;
        let discovery_passes = IntCounterVec::new(
            Opts::new("discovery_passes_total", "Discovery passes by result")
                .namespace(NAMESPACE),
            &["result"],
        )?;
        let discovery_duration = Histogram::with_opts(
            HistogramOpts::new(
                "discovery_duration_seconds",
                "Wall time of a discovery pass",
            )
            .namespace(NAMESPACE)
            .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0]),
        )?;
        let polls = IntCounterVec::new(
            Opts::new("polls_total", "Device polls by outcome").namespace(NAMESPACE),
            &["outcome"],
        )?;
        let poll_cycle_duration = Histogram::with_opts(
            HistogramOpts::new("poll_cycle_duration_seconds", "Wall time of a polling cycle")
                .namespace(NAMESPACE)
                .buckets(vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
        )?;
        let devices_online = IntGauge::with_opts(
            Opts::new("devices_online", "Devices online after the last polling cycle")
                .namespace(NAMESPACE),
        )?;
        let devices_registered = IntGauge::with_opts(
            Opts::new("devices_registered", "Devices known to the registry")
                .namespace(NAMESPACE),
        )?;

        registry.register(Box::new(probes.clone()))?;
        registry.register(Box::new(confirmed.clone()))?;
        registry.register(Box::new(discovery_passes.clone()))?;
        registry.register(Box::new(discovery_duration.clone()))?;
        registry.register(Box::new(polls.clone()))?;
        registry.register(Box::new(poll_cycle_duration.clone()))?;
        registry.register(Box::new(devices_online.clone()))?;
        registry.register(Box::new(devices_registered.clone()))?;

        Ok(Self {
            registry,
            probes,
            confirmed,
            discovery_passes,
            discovery_duration,
            polls,
            poll_cycle_duration,
            devices_online,
            devices_registered,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Count one finished discovery batch.
    pub fn record_batch(&self, probed: usize, confirmed: usize) {
        self.probes.inc_by(probed as u64);
        self.confirmed.inc_by(confirmed as u64);
    }

    /// Count one finished (or cancelled) discovery pass.
    pub fn record_discovery(&self, cancelled: bool, elapsed: Duration) {
        let result = if cancelled { "cancelled" } else { "completed" };
        self.discovery_passes.with_label_values(&[result]).inc();
        self.discovery_duration.observe(elapsed.as_secs_f64());
    }

    /// Count `count` polls ending in `outcome`.
    pub fn record_polls(&self, outcome: &str, count: usize) {
        if count > 0 {
            self.polls.with_label_values(&[outcome]).inc_by(count as u64);
        }
    }

    pub fn observe_poll_cycle(&self, elapsed: Duration) {
        self.poll_cycle_duration.observe(elapsed.as_secs_f64());
    }

    pub fn set_devices_online(&self, online: usize) {
        self.devices_online.set(online as i64);
    }

    pub fn set_devices_registered(&self, registered: usize) {
        self.devices_registered.set(registered as i64);
    }

    /// Render the registry in the Prometheus text format.
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| Error::Internal(format!("metrics are not valid UTF-8: {}", e)))
    }
}

impl std::fmt::Debug for FleetMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FleetMetrics")
            .field("probes", &self.probes.get())
            .field("devices_online", &self.devices_online.get())
            .finish()
    }
}
