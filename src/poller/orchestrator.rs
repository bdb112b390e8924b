//! Polling Orchestrator
//!
//! Refreshes every registered device: fetch all six payloads, normalize,
//! fold the snapshot into the device's identity and hand the record to the
//! telemetry sink. Each device is polled on its own task, so one hung or
//! panicking device never holds up the rest of the fleet.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::PollerConfig;
use crate::domain::events::DomainEvent;
use crate::domain::ports::{DeviceApi, DeviceIdentity, DeviceRegistry, EventPublisher, TelemetrySink};
use crate::error::Result;
use crate::metrics::FleetMetrics;
use crate::telemetry::{normalize, NormalizedTelemetry};

// =============================================================================
// Outcomes
// =============================================================================

/// Result of polling one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PollOutcome {
    /// Answered with the success status; record emitted
    Online,
    /// Answered, but without the success status; record emitted
    Offline,
    /// Nothing answered; no record
    Unreachable,
    /// Poll timed out, panicked, or a collaborator failed
    Failed,
}

impl PollOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            PollOutcome::Online => "online",
            PollOutcome::Offline => "offline",
            PollOutcome::Unreachable => "unreachable",
            PollOutcome::Failed => "failed",
        }
    }
}

/// Tally of one polling cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PollSummary {
    pub polled: usize,
    pub online: usize,
    pub offline: usize,
    pub unreachable: usize,
    pub failed: usize,
    pub cancelled: bool,
}

impl PollSummary {
    pub fn record(&mut self, outcome: PollOutcome) {
        match outcome {
            PollOutcome::Online => self.online += 1,
            PollOutcome::Offline => self.offline += 1,
            PollOutcome::Unreachable => self.unreachable += 1,
            PollOutcome::Failed => self.failed += 1,
        }
    }

    /// Devices whose poll has finished, whatever the outcome.
    pub fn settled(&self) -> usize {
        self.online + self.offline + self.unreachable + self.failed
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Polls every registered device concurrently.
#[derive(Clone)]
pub struct PollingOrchestrator {
    api: Arc<dyn DeviceApi>,
    registry: Arc<dyn DeviceRegistry>,
    sink: Arc<dyn TelemetrySink>,
    events: Arc<dyn EventPublisher>,
    config: PollerConfig,
    permits: Arc<Semaphore>,
    locks: Arc<DashMap<Ipv4Addr, Arc<Mutex<()>>>>,
    metrics: Option<FleetMetrics>,
}

impl PollingOrchestrator {
    /// Create a new polling orchestrator
    pub fn new(
        api: Arc<dyn DeviceApi>,
        registry: Arc<dyn DeviceRegistry>,
        sink: Arc<dyn TelemetrySink>,
        events: Arc<dyn EventPublisher>,
        config: PollerConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_polls.max(1)));
        Self {
            api,
            registry,
            sink,
            events,
            config,
            permits,
            locks: Arc::new(DashMap::new()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: FleetMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    /// Run one polling cycle over every registered device.
    ///
    /// Fails only if the registry cannot be listed. Cancelling aborts the
    /// in-flight device tasks and returns the tally so far.
    #[instrument(skip_all)]
    pub async fn poll_all(&self, cancel: &CancellationToken) -> Result<PollSummary> {
        let started = Instant::now();
        let devices = self.registry.list_devices().await?;
        let mut summary = PollSummary {
            polled: devices.len(),
            ..Default::default()
        };

        if devices.is_empty() {
            debug!("No registered devices to poll");
            return Ok(summary);
        }

        let mut tasks = JoinSet::new();
        for identity in devices {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    summary.cancelled = true;
                    break;
                }
                permit = self.permits.clone().acquire_owned() => permit,
            };
            let permit = match permit {
                Ok(permit) => permit,
                Err(e) => {
                    error!("Poll permits unavailable: {}", e);
                    summary.record(PollOutcome::Failed);
                    continue;
                }
            };

            let this = self.clone();
            tasks.spawn(async move {
                let _permit = permit;
                this.poll_with_deadline(identity).await
            });
        }

        while !tasks.is_empty() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    summary.cancelled = true;
                    tasks.abort_all();
                    break;
                }
                joined = tasks.join_next() => match joined {
                    Some(joined) => summary.record(joined_outcome(joined)),
                    None => break,
                },
            }
        }

        let elapsed = started.elapsed();
        self.finish_cycle(&summary, elapsed).await;
        Ok(summary)
    }

    /// Poll one device under the overall per-device deadline.
    pub async fn poll_with_deadline(&self, identity: DeviceIdentity) -> PollOutcome {
        let address = identity.address;
        match timeout(self.config.poll_timeout, self.poll_device(identity.clone())).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(
                    "Polling {} exceeded {:?}; marking it unreachable",
                    address, self.config.poll_timeout
                );
                let lock = self.lock_for(address);
                let _held = lock.lock().await;
                let identity = self.current(identity).await;
                self.settle_unreachable(identity).await;
                PollOutcome::Failed
            }
        }
    }

    /// Poll one device: fetch, normalize, update identity, emit record.
    #[instrument(skip(self, identity), fields(address = %identity.address))]
    pub async fn poll_device(&self, identity: DeviceIdentity) -> PollOutcome {
        let address = identity.address;
        let lock = self.lock_for(address);
        let _held = lock.lock().await;
        let identity = self.current(identity).await;

        let Some(raw) = self.api.fetch_all(address).await else {
            debug!("{} answered nothing", address);
            return if self.settle_unreachable(identity).await {
                PollOutcome::Unreachable
            } else {
                PollOutcome::Failed
            };
        };

        let telemetry = normalize(&raw);
        let outcome = if telemetry.is_online {
            PollOutcome::Online
        } else {
            PollOutcome::Offline
        };

        if self.settle_answered(identity, telemetry).await {
            outcome
        } else {
            PollOutcome::Failed
        }
    }

    fn lock_for(&self, address: Ipv4Addr) -> Arc<Mutex<()>> {
        self.locks.entry(address).or_default().clone()
    }

    /// Latest registry copy of a device, falling back to what the caller holds.
    async fn current(&self, fallback: DeviceIdentity) -> DeviceIdentity {
        match self.registry.get_device(fallback.address).await {
            Ok(Some(identity)) => identity,
            Ok(None) => fallback,
            Err(e) => {
                warn!("Registry lookup for {} failed: {}", fallback.address, e);
                fallback
            }
        }
    }

    /// Store the snapshot and updated identity. False if a collaborator failed.
    async fn settle_answered(
        &self,
        mut identity: DeviceIdentity,
        telemetry: NormalizedTelemetry,
    ) -> bool {
        let address = identity.address;
        let was_online = identity.is_online;
        identity.apply(&telemetry);
        let now_online = identity.is_online;

        let mut ok = true;
        if let Err(e) = self.registry.upsert_device(identity.clone()).await {
            error!("Failed to update {} in registry: {}", address, e);
            ok = false;
        }
        if let Err(e) = self.sink.append(telemetry).await {
            error!("Failed to store telemetry for {}: {}", address, e);
            ok = false;
        }

        if was_online != now_online {
            self.announce_transition(&identity).await;
        }
        ok
    }

    /// Mark a silent device offline. False if the registry update failed.
    async fn settle_unreachable(&self, mut identity: DeviceIdentity) -> bool {
        let was_online = identity.is_online;
        identity.mark_unreachable();

        let ok = match self.registry.upsert_device(identity.clone()).await {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to update {} in registry: {}", identity.address, e);
                false
            }
        };

        if was_online {
            self.announce_transition(&identity).await;
        }
        ok
    }

    async fn announce_transition(&self, identity: &DeviceIdentity) {
        let event = if identity.is_online {
            DomainEvent::device_came_online(identity.address)
        } else {
            DomainEvent::device_went_offline(identity.address, identity.last_seen)
        };

        if let Err(e) = self.events.publish(event).await {
            warn!("Failed to publish liveness change for {}: {}", identity.address, e);
        }
    }

    async fn finish_cycle(&self, summary: &PollSummary, elapsed: Duration) {
        if let Some(metrics) = &self.metrics {
            metrics.record_polls(PollOutcome::Online.as_str(), summary.online);
            metrics.record_polls(PollOutcome::Offline.as_str(), summary.offline);
            metrics.record_polls(PollOutcome::Unreachable.as_str(), summary.unreachable);
            metrics.record_polls(PollOutcome::Failed.as_str(), summary.failed);
            metrics.set_devices_online(summary.online);
            metrics.set_devices_registered(summary.polled);
            metrics.observe_poll_cycle(elapsed);
        }

        info!(
            "Polled {} devices in {:?}: {} online, {} offline, {} unreachable, {} failed",
            summary.polled,
            elapsed,
            summary.online,
            summary.offline,
            summary.unreachable,
            summary.failed
        );

        let event = DomainEvent::poll_cycle_completed(
            summary.polled,
            summary.online,
            summary.offline,
            summary.unreachable,
            summary.failed,
            elapsed,
        );
        if let Err(e) = self.events.publish(event).await {
            warn!("Failed to publish poll cycle summary: {}", e);
        }
    }
}

fn joined_outcome(joined: std::result::Result<PollOutcome, tokio::task::JoinError>) -> PollOutcome {
    match joined {
        Ok(outcome) => outcome,
        Err(e) => {
            error!("Device poll task failed: {}", e);
            PollOutcome::Failed
        }
    }
}

impl std::fmt::Debug for PollingOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingOrchestrator")
            .field("config", &self.config)
            .field("tracked_devices", &self.locks.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryEventCollector, InMemoryFleetStore};
    use crate::error::Error;
    use crate::mock::{FakeDevice, FakeDeviceApi};
    use assert_matches::assert_matches;
    use async_trait::async_trait;

    fn addr(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(10, 102, 0, last)
    }

    struct Harness {
        api: Arc<FakeDeviceApi>,
        store: Arc<InMemoryFleetStore>,
        events: Arc<InMemoryEventCollector>,
        poller: PollingOrchestrator,
    }

    fn harness(api: FakeDeviceApi, config: PollerConfig) -> Harness {
        let api = Arc::new(api);
        let store = Arc::new(InMemoryFleetStore::new(100));
        let events = Arc::new(InMemoryEventCollector::new());
        let poller = PollingOrchestrator::new(
            api.clone(),
            store.clone(),
            store.clone(),
            events.clone(),
            config,
        );
        Harness {
            api,
            store,
            events,
            poller,
        }
    }

    fn config(poll_timeout: Duration) -> PollerConfig {
        PollerConfig {
            max_concurrent_polls: 8,
            poll_timeout,
        }
    }

    async fn register(store: &InMemoryFleetStore, address: Ipv4Addr, online: bool) {
        let mut identity = DeviceIdentity::new(address);
        identity.is_online = online;
        store.upsert_device(identity).await.unwrap();
    }

    #[tokio::test]
    async fn test_no_data_marks_offline_without_record() {
        let h = harness(FakeDeviceApi::new(), config(Duration::from_secs(5)));
        register(&h.store, addr(1), true).await;

        let summary = h.poller.poll_all(&CancellationToken::new()).await.unwrap();

        assert_eq!(summary.unreachable, 1);
        let identity = h.store.get_device(addr(1)).await.unwrap().unwrap();
        assert!(!identity.is_online);
        assert_eq!(h.store.history_len(addr(1)), 0);
        assert_eq!(h.events.events_of_type("DeviceWentOffline").len(), 1);
    }

    #[tokio::test]
    async fn test_summary_only_device_is_online_with_sparse_record() {
        let api = FakeDeviceApi::new().with_device(addr(2), FakeDevice::SummaryOnly);
        let h = harness(api, config(Duration::from_secs(5)));
        register(&h.store, addr(2), false).await;

        let summary = h.poller.poll_all(&CancellationToken::new()).await.unwrap();

        assert_eq!(summary.online, 1);
        let record = h.store.latest(addr(2)).unwrap();
        assert!(record.is_online);
        assert_eq!(record.model, None);
        assert_eq!(record.hashrate, None);
        assert_eq!(record.power_watts, None);
        assert!(record.pools.is_empty());

        let identity = h.store.get_device(addr(2)).await.unwrap().unwrap();
        assert!(identity.is_online);
        assert!(identity.last_seen.is_some());
        assert_eq!(h.events.events_of_type("DeviceCameOnline").len(), 1);
    }

    #[tokio::test]
    async fn test_non_success_status_is_offline_with_record() {
        let api = FakeDeviceApi::new().with_device(addr(3), FakeDevice::Erroring);
        let h = harness(api, config(Duration::from_secs(5)));
        register(&h.store, addr(3), true).await;

        let summary = h.poller.poll_all(&CancellationToken::new()).await.unwrap();

        assert_eq!(summary.offline, 1);
        assert!(!h.store.latest(addr(3)).unwrap().is_online);
        assert_eq!(h.events.events_of_type("DeviceWentOffline").len(), 1);
    }

    #[tokio::test]
    async fn test_hanging_device_does_not_block_the_others() {
        let mut api = FakeDeviceApi::new().with_device(addr(3), FakeDevice::Hang);
        for last in [1, 2, 4, 5] {
            api = api.with_device(addr(last), FakeDevice::Miner { model: "Antminer S19" });
        }
        let h = harness(api, config(Duration::from_millis(200)));
        for last in 1..=5 {
            register(&h.store, addr(last), true).await;
        }

        let started = Instant::now();
        let summary = h.poller.poll_all(&CancellationToken::new()).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(summary.polled, 5);
        assert_eq!(summary.online, 4);
        assert_eq!(summary.failed, 1);
        for last in [1, 2, 4, 5] {
            assert_eq!(h.store.history_len(addr(last)), 1, "device {}", last);
        }
        assert_eq!(h.store.history_len(addr(3)), 0);
        assert!(!h.store.get_device(addr(3)).await.unwrap().unwrap().is_online);
    }

    #[tokio::test]
    async fn test_panicking_device_is_isolated() {
        let mut api = FakeDeviceApi::new().with_device(addr(5), FakeDevice::Panic);
        for last in 1..=4 {
            api = api.with_device(addr(last), FakeDevice::Miner { model: "Antminer S19" });
        }
        let h = harness(api, config(Duration::from_secs(5)));
        for last in 1..=5 {
            register(&h.store, addr(last), true).await;
        }

        let summary = h.poller.poll_all(&CancellationToken::new()).await.unwrap();

        assert_eq!(summary.online, 4);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.settled(), 5);
        for last in 1..=4 {
            assert_eq!(h.store.history_len(addr(last)), 1);
        }
    }

    #[tokio::test]
    async fn test_model_survives_sparse_poll() {
        let api = FakeDeviceApi::new().with_device(addr(6), FakeDevice::Miner { model: "Antminer L7" });
        let h = harness(api, config(Duration::from_secs(5)));
        register(&h.store, addr(6), true).await;

        h.poller.poll_all(&CancellationToken::new()).await.unwrap();
        h.api.set(addr(6), FakeDevice::SummaryOnly);
        h.poller.poll_all(&CancellationToken::new()).await.unwrap();

        let identity = h.store.get_device(addr(6)).await.unwrap().unwrap();
        assert_eq!(identity.model.as_deref(), Some("Antminer L7"));
        assert_eq!(identity.hostname.as_deref(), Some("rig-6"));
        assert_eq!(h.store.history_len(addr(6)), 2);
        // Online throughout: no transition events.
        assert!(h.events.events_of_type("DeviceCameOnline").is_empty());
        assert!(h.events.events_of_type("DeviceWentOffline").is_empty());
    }

    #[tokio::test]
    async fn test_offline_then_online_emits_both_transitions() {
        let api = FakeDeviceApi::new().with_device(addr(7), FakeDevice::Refuse);
        let h = harness(api, config(Duration::from_secs(5)));
        register(&h.store, addr(7), true).await;

        h.poller.poll_all(&CancellationToken::new()).await.unwrap();
        h.poller.poll_all(&CancellationToken::new()).await.unwrap();
        h.api.set(addr(7), FakeDevice::Miner { model: "Antminer S19" });
        h.poller.poll_all(&CancellationToken::new()).await.unwrap();

        // Offline is reported once, not on every silent cycle.
        assert_eq!(h.events.events_of_type("DeviceWentOffline").len(), 1);
        assert_eq!(h.events.events_of_type("DeviceCameOnline").len(), 1);
        assert_eq!(h.events.events_of_type("PollCycleCompleted").len(), 3);
    }

    #[tokio::test]
    async fn test_polls_of_one_device_are_serialized() {
        let api = FakeDeviceApi::new()
            .with_device(addr(8), FakeDevice::Miner { model: "Antminer S19" })
            .with_delay(Duration::from_millis(30));
        let h = harness(api, config(Duration::from_secs(5)));
        register(&h.store, addr(8), true).await;

        let cancel = CancellationToken::new();
        let (a, b) = tokio::join!(h.poller.poll_all(&cancel), h.poller.poll_all(&cancel));

        assert_eq!(a.unwrap().online, 1);
        assert_eq!(b.unwrap().online, 1);
        assert_eq!(h.api.calls_to(addr(8)), 12);
        assert!(h.api.max_in_flight() <= 6);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let mut api = FakeDeviceApi::new().with_delay(Duration::from_millis(20));
        for last in 1..=6 {
            api = api.with_device(addr(last), FakeDevice::Miner { model: "Antminer S19" });
        }
        let h = harness(
            api,
            PollerConfig {
                max_concurrent_polls: 2,
                poll_timeout: Duration::from_secs(5),
            },
        );
        for last in 1..=6 {
            register(&h.store, addr(last), true).await;
        }

        let summary = h.poller.poll_all(&CancellationToken::new()).await.unwrap();

        assert_eq!(summary.online, 6);
        // Two devices at a time, six commands each.
        assert!(h.api.max_in_flight() <= 12);
    }

    #[tokio::test]
    async fn test_metrics_track_outcomes() {
        let metrics = FleetMetrics::new().unwrap();
        let api = FakeDeviceApi::new().with_device(addr(1), FakeDevice::SummaryOnly);
        let h = harness(api, config(Duration::from_secs(5)));
        let poller = h.poller.clone().with_metrics(metrics.clone());
        register(&h.store, addr(1), true).await;
        register(&h.store, addr(2), true).await;

        poller.poll_all(&CancellationToken::new()).await.unwrap();

        let text = metrics.encode().unwrap();
        assert!(text.contains("rigwatch_polls_total{outcome=\"online\"} 1"));
        assert!(text.contains("rigwatch_polls_total{outcome=\"unreachable\"} 1"));
        assert!(text.contains("rigwatch_devices_online 1"));
        assert!(text.contains("rigwatch_devices_registered 2"));
    }

    struct BrokenRegistry;

    #[async_trait]
    impl DeviceRegistry for BrokenRegistry {
        async fn list_devices(&self) -> Result<Vec<DeviceIdentity>> {
            Err(Error::Registry("database is locked".into()))
        }

        async fn get_device(&self, _address: Ipv4Addr) -> Result<Option<DeviceIdentity>> {
            Ok(None)
        }

        async fn upsert_device(&self, _identity: DeviceIdentity) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_listing_failure_aborts_the_cycle() {
        let store = Arc::new(InMemoryFleetStore::new(10));
        let poller = PollingOrchestrator::new(
            Arc::new(FakeDeviceApi::new()),
            Arc::new(BrokenRegistry),
            store,
            Arc::new(InMemoryEventCollector::new()),
            PollerConfig::default(),
        );

        let result = poller.poll_all(&CancellationToken::new()).await;

        assert_matches!(result, Err(Error::Registry(_)));
    }

    #[tokio::test]
    async fn test_cancellation_aborts_in_flight_polls() {
        let api = FakeDeviceApi::new()
            .with_device(addr(1), FakeDevice::Hang)
            .with_device(addr(2), FakeDevice::Hang);
        let h = harness(api, config(Duration::from_secs(60)));
        register(&h.store, addr(1), true).await;
        register(&h.store, addr(2), true).await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let summary = h.poller.poll_all(&cancel).await.unwrap();

        assert!(summary.cancelled);
        assert_eq!(summary.settled(), 0);
    }
}
