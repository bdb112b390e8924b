//! Fleet Service
//!
//! Wires discovery, registration and polling together and owns the two
//! periodic background loops. The loops are independent tasks: a long
//! discovery pass never delays a polling cycle and vice versa.
//!
//! ```text
//! discovery loop:  ranges ─► DiscoveryEngine ─► register new ─► DeviceRegistry
//! polling loop:    DeviceRegistry ─► PollingOrchestrator ─► TelemetrySink
//! ```

use std::collections::{BTreeSet, HashSet};
use std::future::Future;
use std::net::Ipv4Addr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::FleetConfig;
use crate::discovery::{enumerate_candidates, DiscoveryEngine, DiscoveryReport, IpRange};
use crate::domain::events::DomainEvent;
use crate::domain::ports::{DeviceApi, DeviceIdentity, DeviceRegistry, EventPublisher, TelemetrySink};
use crate::error::Result;
use crate::metrics::FleetMetrics;
use crate::poller::{PollSummary, PollingOrchestrator};
use crate::telemetry::normalize;

/// Outcome of a discovery pass followed by registration.
#[derive(Debug, Clone)]
pub struct DiscoveryPass {
    pub report: DiscoveryReport,
    /// Devices registered by this pass
    pub registered: Vec<DeviceIdentity>,
}

/// The collaborators a fleet runs against.
#[derive(Clone)]
pub struct FleetPorts {
    pub api: Arc<dyn DeviceApi>,
    pub registry: Arc<dyn DeviceRegistry>,
    pub sink: Arc<dyn TelemetrySink>,
    pub events: Arc<dyn EventPublisher>,
}

/// Discovery, registration and polling for one set of ranges.
pub struct Fleet {
    ranges: Vec<IpRange>,
    api: Arc<dyn DeviceApi>,
    registry: Arc<dyn DeviceRegistry>,
    events: Arc<dyn EventPublisher>,
    discovery: DiscoveryEngine,
    poller: PollingOrchestrator,
    discovery_interval: Duration,
    poll_interval: Duration,
    registration_concurrency: usize,
    metrics: Option<FleetMetrics>,
}

impl Fleet {
    /// Build a fleet from configuration. Fails if a range is invalid.
    pub fn new(config: &FleetConfig, ports: FleetPorts) -> Result<Self> {
        let ranges = config.resolve_ranges()?;
        let discovery = DiscoveryEngine::new(ports.api.clone(), config.discovery());
        let poller = PollingOrchestrator::new(
            ports.api.clone(),
            ports.registry.clone(),
            ports.sink,
            ports.events.clone(),
            config.poller(),
        );

        Ok(Self {
            ranges,
            api: ports.api,
            registry: ports.registry,
            events: ports.events,
            discovery,
            poller,
            discovery_interval: config.discovery_interval,
            poll_interval: config.poll_interval,
            registration_concurrency: config.batch_size.max(1),
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: FleetMetrics) -> Self {
        self.discovery = self.discovery.with_metrics(metrics.clone());
        self.poller = self.poller.with_metrics(metrics.clone());
        self.metrics = Some(metrics);
        self
    }

    pub fn ranges(&self) -> &[IpRange] {
        &self.ranges
    }

    /// Every address discovery would probe.
    pub fn candidates(&self) -> BTreeSet<Ipv4Addr> {
        enumerate_candidates(&self.ranges)
    }

    /// Sweep the ranges, then register every newly confirmed device.
    ///
    /// A cancelled sweep registers nothing; its partial report is returned.
    #[instrument(skip_all)]
    pub async fn discover_and_register(&self, cancel: &CancellationToken) -> Result<DiscoveryPass> {
        let candidates = self.candidates();
        info!(
            "Discovery pass over {} addresses in {} ranges",
            candidates.len(),
            self.ranges.len()
        );

        let report = self.discovery.discover(&candidates, cancel).await;
        let registered = if report.cancelled {
            Vec::new()
        } else {
            self.register(report.confirmed.iter().copied()).await?
        };

        let event = DomainEvent::discovery_completed(
            report.probed,
            report.confirmed.len(),
            registered.len(),
            report.cancelled,
            report.elapsed,
        );
        if let Err(e) = self.events.publish(event).await {
            warn!("Failed to publish discovery summary: {}", e);
        }

        Ok(DiscoveryPass { report, registered })
    }

    /// Register the addresses not yet known to the registry.
    ///
    /// Each new address is fetched once to learn its model and hostname; one
    /// that answers nothing is skipped and will be found again next pass.
    pub async fn register<I>(&self, addresses: I) -> Result<Vec<DeviceIdentity>>
    where
        I: IntoIterator<Item = Ipv4Addr>,
    {
        let known: HashSet<Ipv4Addr> = self
            .registry
            .list_devices()
            .await?
            .into_iter()
            .map(|d| d.address)
            .collect();

        let fresh: Vec<Ipv4Addr> = addresses
            .into_iter()
            .filter(|a| !known.contains(a))
            .collect();
        if fresh.is_empty() {
            return Ok(Vec::new());
        }
        debug!("{} newly confirmed addresses", fresh.len());

        let registered: Vec<DeviceIdentity> = stream::iter(fresh)
            .map(|address| {
                AssertUnwindSafe(self.register_one(address))
                    .catch_unwind()
                    .map(move |registered| {
                        registered.unwrap_or_else(|_| {
                            error!("Registration of {} panicked; skipping it", address);
                            None
                        })
                    })
            })
            .buffer_unordered(self.registration_concurrency)
            .filter_map(|registered| async move { registered })
            .collect()
            .await;

        if let Some(metrics) = &self.metrics {
            metrics.set_devices_registered(known.len() + registered.len());
        }
        Ok(registered)
    }

    async fn register_one(&self, address: Ipv4Addr) -> Option<DeviceIdentity> {
        let Some(raw) = self.api.fetch_all(address).await else {
            debug!("{} confirmed but answered nothing on registration", address);
            return None;
        };

        let telemetry = normalize(&raw);
        let identity = DeviceIdentity::from_telemetry(&telemetry);

        if let Err(e) = self.registry.upsert_device(identity.clone()).await {
            error!("Failed to register {}: {}", address, e);
            return None;
        }

        info!(
            "Registered device {} ({})",
            address,
            identity.model.as_deref().unwrap_or("unknown model")
        );
        let event = DomainEvent::device_discovered(
            address,
            identity.model.clone(),
            identity.hostname.clone(),
        );
        if let Err(e) = self.events.publish(event).await {
            warn!("Failed to publish discovery of {}: {}", address, e);
        }

        Some(identity)
    }

    /// Run one polling cycle.
    pub async fn poll(&self, cancel: &CancellationToken) -> Result<PollSummary> {
        self.poller.poll_all(cancel).await
    }

    /// Start the discovery and polling loops.
    ///
    /// Both run their first pass immediately, then on their own interval,
    /// until `cancel` fires.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> FleetHandle {
        info!(
            "Starting fleet loops (discovery every {:?}, polling every {:?})",
            self.discovery_interval, self.poll_interval
        );

        let fleet = self.clone();
        let discovery = spawn_periodic(
            "discovery",
            self.discovery_interval,
            cancel.clone(),
            move |cancel| {
                let fleet = fleet.clone();
                async move {
                    fleet.discover_and_register(&cancel).await.map(|_| ())
                }
            },
        );

        let fleet = self;
        let polling = spawn_periodic(
            "polling",
            fleet.poll_interval,
            cancel.clone(),
            move |cancel| {
                let fleet = fleet.clone();
                async move { fleet.poll(&cancel).await.map(|_| ()) }
            },
        );

        FleetHandle {
            cancel,
            discovery,
            polling,
        }
    }
}

impl std::fmt::Debug for Fleet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fleet")
            .field("ranges", &self.ranges)
            .field("discovery_interval", &self.discovery_interval)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    cancel: CancellationToken,
    mut pass: F,
) -> JoinHandle<()>
where
    F: FnMut(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("{} loop shutting down", name);
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = pass(cancel.clone()).await {
                        error!("{} pass failed: {}", name, e);
                    }
                }
            }
        }
    })
}

/// Handle to the running loops.
#[derive(Debug)]
pub struct FleetHandle {
    cancel: CancellationToken,
    discovery: JoinHandle<()>,
    polling: JoinHandle<()>,
}

impl FleetHandle {
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel both loops and wait for them to stop.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for (name, handle) in [("discovery", self.discovery), ("polling", self.polling)] {
            if let Err(e) = handle.await {
                error!("{} loop ended abnormally: {}", name, e);
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
