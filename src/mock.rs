//! Mock device fleet for unit tests
//!
//! A scripted [`DeviceApi`] that answers per address according to a
//! [`FakeDevice`] behaviour and records every call, so tests can assert on
//! concurrency and ordering without touching the network.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};

use crate::domain::ports::{Command, DeviceApi, ProbeFailure, ProbeResult};

/// How a mocked address behaves.
#[derive(Debug, Clone, PartialEq)]
pub enum FakeDevice {
    /// Answers every command with realistic payloads
    Miner { model: &'static str },
    /// Answers `summary` only
    SummaryOnly,
    /// Answers with a non-success status code
    Erroring,
    /// Never answers
    Hang,
    /// Panics inside the call
    Panic,
    /// Refuses the connection
    Refuse,
}

/// One entry of the call log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallEvent {
    Started(Ipv4Addr, Command),
    Finished(Ipv4Addr, Command),
}

#[derive(Default)]
pub struct FakeDeviceApi {
    devices: RwLock<HashMap<Ipv4Addr, FakeDevice>>,
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    log: Mutex<Vec<CallEvent>>,
}

impl FakeDeviceApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(self, address: Ipv4Addr, device: FakeDevice) -> Self {
        self.devices.write().insert(address, device);
        self
    }

    /// Delay applied to every call before it resolves.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Change an address's behaviour mid-test.
    pub fn set(&self, address: Ipv4Addr, device: FakeDevice) {
        self.devices.write().insert(address, device);
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn log(&self) -> Vec<CallEvent> {
        self.log.lock().clone()
    }

    pub fn calls_to(&self, address: Ipv4Addr) -> usize {
        self.log
            .lock()
            .iter()
            .filter(|e| matches!(e, CallEvent::Started(a, _) if *a == address))
            .count()
    }

    fn device(&self, address: Ipv4Addr) -> FakeDevice {
        self.devices
            .read()
            .get(&address)
            .cloned()
            .unwrap_or(FakeDevice::Refuse)
    }
}

struct InFlight<'a> {
    api: &'a FakeDeviceApi,
    address: Ipv4Addr,
    command: Command,
}

impl<'a> InFlight<'a> {
    fn enter(api: &'a FakeDeviceApi, address: Ipv4Addr, command: Command) -> Self {
        let now = api.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        api.max_in_flight.fetch_max(now, Ordering::SeqCst);
        api.log.lock().push(CallEvent::Started(address, command));
        Self {
            api,
            address,
            command,
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.api.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.api
            .log
            .lock()
            .push(CallEvent::Finished(self.address, self.command));
    }
}

#[async_trait]
impl DeviceApi for FakeDeviceApi {
    async fn execute(&self, address: Ipv4Addr, command: Command) -> ProbeResult {
        let _guard = InFlight::enter(self, address, command);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match self.device(address) {
            FakeDevice::Miner { model } => Ok(miner_payload(address, model, command)),
            FakeDevice::SummaryOnly if command == Command::Summary => {
                Ok(json!({ "STATUS": "S" }))
            }
            FakeDevice::SummaryOnly => Err(ProbeFailure::Connect),
            FakeDevice::Erroring if command == Command::Summary => {
                Ok(json!({ "STATUS": "E", "Msg": "Invalid command" }))
            }
            FakeDevice::Erroring => Err(ProbeFailure::Status(500)),
            FakeDevice::Hang => std::future::pending().await,
            FakeDevice::Panic => panic!("firmware crashed while answering {}", command),
            FakeDevice::Refuse => Err(ProbeFailure::Connect),
        }
    }
}

/// Payloads shaped like a typical air-cooled miner.
pub fn miner_payload(address: Ipv4Addr, model: &str, command: Command) -> Value {
    let host = format!("rig-{}", address.octets()[3]);
    match command {
        Command::Summary => json!({
            "STATUS": "S",
            "Type": model,
            "Hostname": host,
            "SUMMARY": [{
                "Temperature": 70,
                "PCB Temperature": 62,
                "GHS 5s": "100000",
                "GHS av": "99000",
                "Fan Speed In1": 5400,
                "Fan Speed In2": 5460,
                "Elapsed": "3600"
            }]
        }),
        Command::Stats => json!([{ "STATUS": "S", "STATS": [{ "Power": "3250W" }] }]),
        Command::Pools => json!({
            "POOLS": [{
                "URL": "stratum+tcp://pool.example:3333",
                "User": "acct.worker",
                "Status": "Alive",
                "Priority": 0
            }]
        }),
        Command::Devs => json!({
            "DEVS": [{ "ID": 0, "Status": "Alive", "Temperature": 68, "MHS 5s": "33000" }]
        }),
        Command::Version => json!([{ "Type": model }]),
        Command::Network => json!([{ "STATUS": [{ "Status": "connected" }] }]),
    }
}
