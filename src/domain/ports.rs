//! Domain Ports (Port/Adapter Pattern)
//!
//! The traits the discovery and polling core depends on. The HTTP device
//! client, the registry and the telemetry store are all adapters behind these
//! seams, which is also how the tests substitute scripted devices.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Core                                  │
//! │   DiscoveryEngine │ PollingOrchestrator │ Fleet              │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Ports (Traits)                           │
//! │  DeviceApi │ DeviceRegistry │ TelemetrySink │ EventPublisher │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Adapters (Impls)                           │
//! │  DeviceClient │ InMemoryFleetStore │ JsonlTelemetrySink │ …  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;
use std::net::Ipv4Addr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::events::DomainEvent;
use crate::error::Result;
use crate::telemetry::NormalizedTelemetry;

// =============================================================================
// Wire Commands
// =============================================================================

/// The read-only commands of the device control API used for telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Summary,
    Stats,
    Pools,
    Devs,
    Version,
    Network,
}

impl Command {
    /// Every command issued by a full fetch.
    pub const ALL: [Command; 6] = [
        Command::Summary,
        Command::Stats,
        Command::Pools,
        Command::Devs,
        Command::Version,
        Command::Network,
    ];

    /// The name sent in the `command` field of the request body.
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Summary => "summary",
            Command::Stats => "stats",
            Command::Pools => "pools",
            Command::Devs => "devs",
            Command::Version => "version",
            Command::Network => "network",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Probe Outcomes
// =============================================================================

/// Why a command produced no data.
///
/// Every variant is an expected outcome when sweeping address ranges: most
/// addresses are not devices. None of them is an [`Error`](crate::Error).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProbeFailure {
    #[error("timed out")]
    Timeout,

    #[error("connection failed")]
    Connect,

    #[error("HTTP status {0}")]
    Status(u16),

    #[error("undecodable response: {0}")]
    Decode(String),

    #[error("response larger than {0} bytes")]
    TooLarge(usize),

    #[error("transport error: {0}")]
    Transport(String),
}

/// Outcome of a single command round trip.
pub type ProbeResult = std::result::Result<Value, ProbeFailure>;

/// The raw payloads of one full fetch. Any of them may be missing.
#[derive(Debug, Clone, PartialEq)]
pub struct RawProbeResult {
    pub address: Ipv4Addr,
    pub summary: Option<Value>,
    pub stats: Option<Value>,
    pub pools: Option<Value>,
    pub devs: Option<Value>,
    pub version: Option<Value>,
    pub network: Option<Value>,
}

impl RawProbeResult {
    /// A result with no payloads yet.
    pub fn new(address: Ipv4Addr) -> Self {
        Self {
            address,
            summary: None,
            stats: None,
            pools: None,
            devs: None,
            version: None,
            network: None,
        }
    }

    /// Builder-style setter used when assembling results by hand.
    pub fn with(mut self, command: Command, payload: Value) -> Self {
        *self.slot(command) = Some(payload);
        self
    }

    /// Store a command outcome, keeping only successful payloads.
    pub fn record(&mut self, command: Command, outcome: ProbeResult) {
        *self.slot(command) = outcome.ok();
    }

    pub fn get(&self, command: Command) -> Option<&Value> {
        match command {
            Command::Summary => self.summary.as_ref(),
            Command::Stats => self.stats.as_ref(),
            Command::Pools => self.pools.as_ref(),
            Command::Devs => self.devs.as_ref(),
            Command::Version => self.version.as_ref(),
            Command::Network => self.network.as_ref(),
        }
    }

    /// Number of commands that answered.
    pub fn answered(&self) -> usize {
        Command::ALL
            .iter()
            .filter(|c| self.get(**c).is_some())
            .count()
    }

    /// True when no command answered at all.
    pub fn is_empty(&self) -> bool {
        self.answered() == 0
    }

    fn slot(&mut self, command: Command) -> &mut Option<Value> {
        match command {
            Command::Summary => &mut self.summary,
            Command::Stats => &mut self.stats,
            Command::Pools => &mut self.pools,
            Command::Devs => &mut self.devs,
            Command::Version => &mut self.version,
            Command::Network => &mut self.network,
        }
    }
}

// =============================================================================
// Device Identity
// =============================================================================

/// The registry's record of a confirmed device, keyed by address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub address: Ipv4Addr,
    pub model: Option<String>,
    pub hostname: Option<String>,
    pub is_online: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub first_seen: DateTime<Utc>,
}

impl DeviceIdentity {
    /// A freshly confirmed device with no telemetry applied yet.
    pub fn new(address: Ipv4Addr) -> Self {
        Self {
            address,
            model: None,
            hostname: None,
            is_online: false,
            last_seen: None,
            first_seen: Utc::now(),
        }
    }

    /// Identity for a device registered from its first snapshot.
    pub fn from_telemetry(telemetry: &NormalizedTelemetry) -> Self {
        let mut identity = Self::new(telemetry.address);
        identity.apply(telemetry);
        identity.is_online = true;
        identity
    }

    /// Fold a fresh snapshot in. Model and hostname are only ever replaced,
    /// never cleared.
    pub fn apply(&mut self, telemetry: &NormalizedTelemetry) {
        self.is_online = telemetry.is_online;
        self.last_seen = Some(telemetry.collected_at);
        if let Some(model) = &telemetry.model {
            self.model = Some(model.clone());
        }
        if let Some(hostname) = &telemetry.hostname {
            self.hostname = Some(hostname.clone());
        }
    }

    /// The device answered nothing at all.
    pub fn mark_unreachable(&mut self) {
        self.is_online = false;
    }
}

// =============================================================================
// Device API Port
// =============================================================================

/// Port for talking to a device's control API.
///
/// Implementors only provide [`execute`](DeviceApi::execute); the full fetch
/// issues all six commands concurrently, so a hanging command costs one
/// timeout rather than six.
#[async_trait]
pub trait DeviceApi: Send + Sync {
    /// Run one command against one address.
    async fn execute(&self, address: Ipv4Addr, command: Command) -> ProbeResult;

    /// Run every command. `None` when not a single one answered.
    async fn fetch_all(&self, address: Ipv4Addr) -> Option<RawProbeResult> {
        let (summary, stats, pools, devs, version, network) = tokio::join!(
            self.execute(address, Command::Summary),
            self.execute(address, Command::Stats),
            self.execute(address, Command::Pools),
            self.execute(address, Command::Devs),
            self.execute(address, Command::Version),
            self.execute(address, Command::Network),
        );

        let mut raw = RawProbeResult::new(address);
        raw.record(Command::Summary, summary);
        raw.record(Command::Stats, stats);
        raw.record(Command::Pools, pools);
        raw.record(Command::Devs, devs);
        raw.record(Command::Version, version);
        raw.record(Command::Network, network);

        if raw.is_empty() {
            None
        } else {
            Some(raw)
        }
    }
}

// =============================================================================
// Persistence Ports
// =============================================================================

/// Port for the device registry (address is the unique key).
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    /// All registered devices.
    async fn list_devices(&self) -> Result<Vec<DeviceIdentity>>;

    /// One device by address.
    async fn get_device(&self, address: Ipv4Addr) -> Result<Option<DeviceIdentity>>;

    /// Insert or replace the record for `identity.address`.
    async fn upsert_device(&self, identity: DeviceIdentity) -> Result<()>;
}

/// Port for appending telemetry history.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    /// Append one snapshot.
    async fn append(&self, record: NormalizedTelemetry) -> Result<()>;
}

// =============================================================================
// Event Publisher Port
// =============================================================================

/// Port for publishing domain events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a domain event.
    async fn publish(&self, event: DomainEvent) -> Result<()>;

    /// Publish multiple events.
    async fn publish_all(&self, events: Vec<DomainEvent>) -> Result<()>;
}

// =============================================================================
// Tests
// =============================================================================
