//! Discovery Engine
//!
//! Sweeps candidate addresses in fixed-size batches. Probes within a batch run
//! concurrently, each on its own task under its own timeout; batches run
//! strictly one after another with a short pause in between, so at most one
//! batch of connections is ever open.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace};

use crate::config::DiscoveryConfig;
use crate::domain::ports::{Command, DeviceApi};
use crate::metrics::FleetMetrics;
use crate::telemetry::is_success;

// =============================================================================
// Batches
// =============================================================================

/// One group of candidates probed together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryBatch {
    /// Position of the batch in the pass, from zero
    pub index: usize,
    pub addresses: Vec<Ipv4Addr>,
}

impl DiscoveryBatch {
    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }
}

/// Split candidates into consecutive batches of at most `batch_size`.
///
/// A `batch_size` of zero is treated as one.
pub fn partition<I>(candidates: I, batch_size: usize) -> Vec<DiscoveryBatch>
where
    I: IntoIterator<Item = Ipv4Addr>,
{
    let size = batch_size.max(1);
    let mut batches: Vec<DiscoveryBatch> = Vec::new();

    for address in candidates {
        match batches.last_mut() {
            Some(batch) if batch.len() < size => batch.addresses.push(address),
            _ => batches.push(DiscoveryBatch {
                index: batches.len(),
                addresses: vec![address],
            }),
        }
    }

    batches
}

// =============================================================================
// Report
// =============================================================================

/// Outcome of one discovery pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiscoveryReport {
    /// Addresses that answered `summary` with the success status
    pub confirmed: BTreeSet<Ipv4Addr>,
    /// Addresses whose probe finished
    pub probed: usize,
    pub batches_total: usize,
    pub batches_completed: usize,
    /// True when the pass was cut short; `confirmed` holds what was found
    pub cancelled: bool,
    #[serde(with = "crate::config::duration_str")]
    pub elapsed: Duration,
}

// =============================================================================
// Engine
// =============================================================================

/// Finds live devices among candidate addresses.
#[derive(Clone)]
pub struct DiscoveryEngine {
    api: Arc<dyn DeviceApi>,
    config: DiscoveryConfig,
    metrics: Option<FleetMetrics>,
}

impl DiscoveryEngine {
    /// Create a new discovery engine
    pub fn new(api: Arc<dyn DeviceApi>, config: DiscoveryConfig) -> Self {
        Self {
            api,
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: FleetMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Probe one address with `summary`. Any failure means "not a device".
    pub async fn probe(&self, address: Ipv4Addr) -> bool {
        match timeout(
            self.config.probe_timeout,
            self.api.execute(address, Command::Summary),
        )
        .await
        {
            Ok(Ok(summary)) => is_success(&summary),
            Ok(Err(failure)) => {
                trace!("{} is not a device: {}", address, failure);
                false
            }
            Err(_) => {
                trace!("{} probe exceeded {:?}", address, self.config.probe_timeout);
                false
            }
        }
    }

    /// Run one discovery pass over `candidates`.
    ///
    /// Cancelling `cancel` abandons the in-flight batch and returns what the
    /// completed batches confirmed, with `cancelled` set.
    #[instrument(skip_all, fields(candidates = candidates.len()))]
    pub async fn discover(
        &self,
        candidates: &BTreeSet<Ipv4Addr>,
        cancel: &CancellationToken,
    ) -> DiscoveryReport {
        let started = Instant::now();
        let batches = partition(candidates.iter().copied(), self.config.batch_size);
        let mut report = DiscoveryReport {
            batches_total: batches.len(),
            ..Default::default()
        };

        for batch in &batches {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let mut probes = JoinSet::new();
            for &address in &batch.addresses {
                let engine = self.clone();
                probes.spawn(async move { (address, engine.probe(address).await) });
            }

            // Dropping the set on cancellation aborts the in-flight probes.
            let found = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    report.cancelled = true;
                    break;
                }
                found = settle(probes) => found,
            };

            debug!(
                "Batch {}/{}: {} of {} addresses confirmed",
                batch.index + 1,
                report.batches_total,
                found.len(),
                batch.len()
            );

            if let Some(metrics) = &self.metrics {
                metrics.record_batch(batch.len(), found.len());
            }
            report.probed += batch.len();
            report.batches_completed += 1;
            report.confirmed.extend(found);

            let is_last = batch.index + 1 == report.batches_total;
            if !is_last && !self.config.batch_pause.is_zero() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        report.cancelled = true;
                        break;
                    }
                    _ = sleep(self.config.batch_pause) => {}
                }
            }
        }

        report.elapsed = started.elapsed();
        if let Some(metrics) = &self.metrics {
            metrics.record_discovery(report.cancelled, report.elapsed);
        }

        info!(
            "Discovery {}: {} devices among {} probed addresses in {:?}",
            if report.cancelled { "cancelled" } else { "complete" },
            report.confirmed.len(),
            report.probed,
            report.elapsed
        );

        report
    }
}

/// Collect the confirmed addresses of one batch. A probe task that panicked
/// counts as "not a device".
async fn settle(mut probes: JoinSet<(Ipv4Addr, bool)>) -> Vec<Ipv4Addr> {
    let mut found = Vec::new();
    while let Some(joined) = probes.join_next().await {
        match joined {
            Ok((address, true)) => found.push(address),
            Ok((_, false)) => {}
            Err(e) => debug!("Discovery probe task failed: {}", e),
        }
    }
    found
}

impl std::fmt::Debug for DiscoveryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryEngine")
            .field("config", &self.config)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{CallEvent, FakeDevice, FakeDeviceApi};

    fn addr(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(10, 102, 0, last)
    }

    fn candidates(n: u8) -> BTreeSet<Ipv4Addr> {
        (1..=n).map(addr).collect()
    }

    fn config(batch_size: usize, probe_timeout: Duration) -> DiscoveryConfig {
        DiscoveryConfig {
            batch_size,
            probe_timeout,
            batch_pause: Duration::from_millis(5),
        }
    }

    fn engine(api: Arc<FakeDeviceApi>, config: DiscoveryConfig) -> DiscoveryEngine {
        DiscoveryEngine::new(api, config)
    }

    #[test]
    fn test_partition_sizes() {
        let batches = partition(candidates(31), 10);

        assert_eq!(batches.len(), 4);
        assert_eq!(
            batches.iter().map(DiscoveryBatch::len).collect::<Vec<_>>(),
            vec![10, 10, 10, 1]
        );
        assert_eq!(batches[3].index, 3);
        assert_eq!(batches[3].addresses, vec![addr(31)]);
    }

    #[test]
    fn test_partition_edge_cases() {
        assert!(partition(Vec::new(), 10).is_empty());
        assert_eq!(partition(candidates(3), 0).len(), 3);
        assert_eq!(partition(candidates(3), 100).len(), 1);
    }

    #[tokio::test]
    async fn test_all_timeouts_yield_empty_set() {
        let mut api = FakeDeviceApi::new();
        for last in 1..=8 {
            api = api.with_device(addr(last), FakeDevice::Hang);
        }
        let engine = engine(Arc::new(api), config(4, Duration::from_millis(50)));

        let report = engine
            .discover(&candidates(8), &CancellationToken::new())
            .await;

        assert!(report.confirmed.is_empty());
        assert_eq!(report.probed, 8);
        assert_eq!(report.batches_completed, 2);
        assert!(!report.cancelled);
    }

    #[tokio::test]
    async fn test_single_success_is_the_only_result() {
        let api = FakeDeviceApi::new()
            .with_device(addr(5), FakeDevice::Miner { model: "Antminer S19" })
            .with_device(addr(6), FakeDevice::Erroring)
            .with_device(addr(7), FakeDevice::Hang);
        let engine = engine(Arc::new(api), config(100, Duration::from_millis(100)));

        let report = engine
            .discover(&candidates(20), &CancellationToken::new())
            .await;

        assert_eq!(report.confirmed, BTreeSet::from([addr(5)]));
        assert_eq!(report.probed, 20);
    }

    #[tokio::test]
    async fn test_panicking_address_does_not_abort_the_pass() {
        let api = FakeDeviceApi::new()
            .with_device(addr(1), FakeDevice::Miner { model: "Antminer S19" })
            .with_device(addr(2), FakeDevice::Panic)
            .with_device(addr(5), FakeDevice::Miner { model: "Antminer L7" });
        let engine = engine(Arc::new(api), config(2, Duration::from_secs(1)));

        let report = engine
            .discover(&candidates(6), &CancellationToken::new())
            .await;

        assert_eq!(report.confirmed, BTreeSet::from([addr(1), addr(5)]));
        assert_eq!(report.probed, 6);
        assert_eq!(report.batches_completed, 3);
        assert!(!report.cancelled);
    }

    #[tokio::test]
    async fn test_batches_run_strictly_in_sequence() {
        let api = Arc::new(FakeDeviceApi::new().with_delay(Duration::from_millis(10)));
        let engine = engine(api.clone(), config(5, Duration::from_secs(1)));

        let report = engine
            .discover(&candidates(16), &CancellationToken::new())
            .await;

        assert_eq!(report.batches_total, 4);
        assert_eq!(report.batches_completed, 4);
        assert!(api.max_in_flight() <= 5);

        // Every probe of batch k finishes before any probe of batch k + 1 starts.
        let batches = partition(candidates(16), 5);
        let batch_of = |a: Ipv4Addr| batches.iter().position(|b| b.addresses.contains(&a));
        let mut finished_up_to = None;
        let mut seen_finished = std::collections::HashMap::<usize, usize>::new();
        for event in api.log() {
            match event {
                CallEvent::Started(a, _) => {
                    let k = batch_of(a).unwrap();
                    if k > 0 {
                        assert_eq!(finished_up_to, Some(k - 1), "batch {} started early", k);
                    }
                }
                CallEvent::Finished(a, _) => {
                    let k = batch_of(a).unwrap();
                    let done = seen_finished.entry(k).or_default();
                    *done += 1;
                    if *done == batches[k].len() {
                        finished_up_to = Some(k);
                    }
                }
            }
        }
        assert_eq!(finished_up_to, Some(3));
    }

    #[tokio::test]
    async fn test_only_summary_is_probed() {
        let api = Arc::new(
            FakeDeviceApi::new().with_device(addr(1), FakeDevice::Miner { model: "S9" }),
        );
        let engine = engine(api.clone(), config(10, Duration::from_secs(1)));

        engine.discover(&candidates(1), &CancellationToken::new()).await;

        assert_eq!(
            api.log(),
            vec![
                CallEvent::Started(addr(1), Command::Summary),
                CallEvent::Finished(addr(1), Command::Summary),
            ]
        );
    }

    #[tokio::test]
    async fn test_cancellation_returns_partial_results() {
        let mut api = FakeDeviceApi::new()
            .with_device(addr(1), FakeDevice::Miner { model: "Antminer S19" })
            .with_device(addr(2), FakeDevice::Miner { model: "Antminer S19" });
        for last in 3..=6 {
            api = api.with_device(addr(last), FakeDevice::Hang);
        }
        let engine = engine(Arc::new(api), config(2, Duration::from_secs(30)));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let report = engine.discover(&candidates(6), &cancel).await;

        assert!(report.cancelled);
        assert_eq!(report.confirmed, BTreeSet::from([addr(1), addr(2)]));
        assert_eq!(report.batches_completed, 1);
        assert_eq!(report.probed, 2);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_cancelled_before_start_probes_nothing() {
        let api = Arc::new(FakeDeviceApi::new());
        let engine = engine(api.clone(), config(10, Duration::from_secs(1)));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = engine.discover(&candidates(10), &cancel).await;

        assert!(report.cancelled);
        assert_eq!(report.probed, 0);
        assert!(api.log().is_empty());
    }

    #[tokio::test]
    async fn test_metrics_are_recorded() {
        let metrics = FleetMetrics::new().unwrap();
        let api = FakeDeviceApi::new().with_device(addr(2), FakeDevice::SummaryOnly);
        let engine = engine(Arc::new(api), config(3, Duration::from_secs(1)))
            .with_metrics(metrics.clone());

        engine.discover(&candidates(7), &CancellationToken::new()).await;

        let text = metrics.encode().unwrap();
        assert!(text.contains("rigwatch_discovery_probes_total 7"));
        assert!(text.contains("rigwatch_discovery_confirmed_total 1"));
        assert!(text.contains("rigwatch_discovery_passes_total{result=\"completed\"} 1"));
    }
}
