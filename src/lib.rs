//! Rigwatch - Fleet monitor for network-attached mining devices
//!
//! Discovers which addresses in configured ranges host a device, polls each
//! known device's JSON-over-HTTP control API on an interval, and normalizes
//! the heterogeneous vendor payloads into one telemetry record per device.
//!
//! # Architecture
//!
//! ```text
//! Range Enumerator → Discovery Engine → Registration → Polling Orchestrator
//!                          │                                   │
//!                          └────────── Device Client ──────────┘
//!                                            │
//!                                  Telemetry Normalizer
//! ```
//!
//! The core depends only on the ports in [`domain::ports`]; the HTTP client,
//! the stores and the event publishers are adapters behind them.
//!
//! # Modules
//!
//! - [`adapters`] - Reference collaborators (in-memory store, JSONL sink, event publishers)
//! - [`client`] - Device control API client
//! - [`config`] - Static fleet configuration
//! - [`discovery`] - Range enumeration and batched discovery
//! - [`domain`] - Ports and domain events
//! - [`error`] - Error types
//! - [`fleet`] - Discovery/registration/polling wiring and background loops
//! - [`metrics`] - Prometheus metrics
//! - [`poller`] - Polling orchestrator
//! - [`telemetry`] - Telemetry normalizer

pub mod adapters;
pub mod client;
pub mod config;
pub mod discovery;
pub mod domain;
pub mod error;
pub mod fleet;
pub mod metrics;
pub mod poller;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod mock;

// Re-export commonly used types
pub use client::DeviceClient;
pub use config::FleetConfig;
pub use discovery::{DiscoveryEngine, DiscoveryReport, IpRange};
pub use error::{Error, Result};
pub use fleet::{Fleet, FleetHandle, FleetPorts};
pub use metrics::FleetMetrics;
pub use poller::{PollSummary, PollingOrchestrator};
pub use telemetry::{normalize, NormalizedTelemetry};
