//! In-memory Fleet Store
//!
//! Implements both persistence ports: the device registry and a bounded
//! per-device telemetry history, plus the read-side queries an operator
//! needs (latest snapshot, history window, fleet totals).

use std::collections::VecDeque;
use std::net::Ipv4Addr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::domain::ports::{DeviceIdentity, DeviceRegistry, TelemetrySink};
use crate::error::Result;
use crate::telemetry::NormalizedTelemetry;

/// Fleet-wide totals.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FleetStats {
    pub total_devices: usize,
    pub online: usize,
    pub offline: usize,
    /// Sum of the online devices' latest headline hashrate (tera-scale)
    pub total_hashrate: f64,
    /// Sum of the online devices' latest power draw (watts)
    pub total_power_watts: f64,
}

/// Registry and telemetry history held in memory.
#[derive(Debug, Default)]
pub struct InMemoryFleetStore {
    devices: DashMap<Ipv4Addr, DeviceIdentity>,
    history: DashMap<Ipv4Addr, VecDeque<NormalizedTelemetry>>,
    /// Records kept per device; zero keeps everything
    history_limit: usize,
}

impl InMemoryFleetStore {
    pub fn new(history_limit: usize) -> Self {
        Self {
            history_limit,
            ..Default::default()
        }
    }

    /// Number of registered devices.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Most recent snapshot of a device.
    pub fn latest(&self, address: Ipv4Addr) -> Option<NormalizedTelemetry> {
        self.history
            .get(&address)
            .and_then(|records| records.back().cloned())
    }

    /// Snapshots collected at or after `since`, oldest first.
    pub fn history_since(
        &self,
        address: Ipv4Addr,
        since: DateTime<Utc>,
    ) -> Vec<NormalizedTelemetry> {
        self.history
            .get(&address)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| r.collected_at >= since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of stored snapshots for a device.
    pub fn history_len(&self, address: Ipv4Addr) -> usize {
        self.history.get(&address).map_or(0, |r| r.len())
    }

    pub fn fleet_stats(&self) -> FleetStats {
        let mut stats = FleetStats {
            total_devices: self.devices.len(),
            ..Default::default()
        };

        for device in self.devices.iter() {
            if !device.is_online {
                stats.offline += 1;
                continue;
            }
            stats.online += 1;
            if let Some(latest) = self.latest(device.address) {
                stats.total_hashrate += latest.hashrate.unwrap_or(0.0);
                stats.total_power_watts += latest.power_watts.unwrap_or(0.0);
            }
        }

        stats
    }
}

#[async_trait]
impl DeviceRegistry for InMemoryFleetStore {
    async fn list_devices(&self) -> Result<Vec<DeviceIdentity>> {
        let mut devices: Vec<DeviceIdentity> =
            self.devices.iter().map(|d| d.value().clone()).collect();
        devices.sort_by_key(|d| d.address);
        Ok(devices)
    }

    async fn get_device(&self, address: Ipv4Addr) -> Result<Option<DeviceIdentity>> {
        Ok(self.devices.get(&address).map(|d| d.value().clone()))
    }

    async fn upsert_device(&self, identity: DeviceIdentity) -> Result<()> {
        self.devices.insert(identity.address, identity);
        Ok(())
    }
}

#[async_trait]
impl TelemetrySink for InMemoryFleetStore {
    async fn append(&self, record: NormalizedTelemetry) -> Result<()> {
        let mut records = self.history.entry(record.address).or_default();
        records.push_back(record);
        if self.history_limit > 0 {
            while records.len() > self.history_limit {
                records.pop_front();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn addr(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(10, 102, 1, last)
    }

    fn snapshot(address: Ipv4Addr, hashrate: f64, power: f64) -> NormalizedTelemetry {
        let mut t = NormalizedTelemetry::empty(address);
        t.is_online = true;
        t.hashrate = Some(hashrate);
        t.power_watts = Some(power);
        t
    }

    #[tokio::test]
    async fn test_upsert_replaces_by_address() {
        let store = InMemoryFleetStore::new(10);

        let mut identity = DeviceIdentity::new(addr(1));
        store.upsert_device(identity.clone()).await.unwrap();
        identity.model = Some("Antminer S19".into());
        store.upsert_device(identity).await.unwrap();

        assert_eq!(store.len(), 1);
        let stored = store.get_device(addr(1)).await.unwrap().unwrap();
        assert_eq!(stored.model.as_deref(), Some("Antminer S19"));
        assert!(store.get_device(addr(2)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_is_sorted_by_address() {
        let store = InMemoryFleetStore::new(10);
        for last in [9, 3, 27] {
            store.upsert_device(DeviceIdentity::new(addr(last))).await.unwrap();
        }

        let listed: Vec<_> = store
            .list_devices()
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.address)
            .collect();
        assert_eq!(listed, vec![addr(3), addr(9), addr(27)]);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let store = InMemoryFleetStore::new(3);
        for i in 0..5 {
            store.append(snapshot(addr(1), i as f64, 0.0)).await.unwrap();
        }

        assert_eq!(store.history_len(addr(1)), 3);
        assert_eq!(store.latest(addr(1)).unwrap().hashrate, Some(4.0));
        assert_eq!(store.history_len(addr(2)), 0);
        assert!(store.latest(addr(2)).is_none());
    }

    #[tokio::test]
    async fn test_history_since_filters_by_time() {
        let store = InMemoryFleetStore::new(0);
        let mut old = snapshot(addr(1), 1.0, 0.0);
        old.collected_at = Utc::now() - Duration::hours(2);
        store.append(old).await.unwrap();
        store.append(snapshot(addr(1), 2.0, 0.0)).await.unwrap();

        let recent = store.history_since(addr(1), Utc::now() - Duration::hours(1));

        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].hashrate, Some(2.0));
    }

    #[tokio::test]
    async fn test_fleet_stats_sum_online_devices_only() {
        let store = InMemoryFleetStore::new(10);

        for (last, online) in [(1, true), (2, true), (3, false)] {
            let mut identity = DeviceIdentity::new(addr(last));
            identity.is_online = online;
            store.upsert_device(identity).await.unwrap();
            store
                .append(snapshot(addr(last), 100.0, 3000.0))
                .await
                .unwrap();
        }

        let stats = store.fleet_stats();

        assert_eq!(stats.total_devices, 3);
        assert_eq!(stats.online, 2);
        assert_eq!(stats.offline, 1);
        assert_eq!(stats.total_hashrate, 200.0);
        assert_eq!(stats.total_power_watts, 6000.0);
    }
}
