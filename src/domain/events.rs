//! Domain Events
//!
//! Immutable records of things that happened to the fleet. They flow to the
//! [`EventPublisher`](super::ports::EventPublisher) port, which in the default
//! deployment turns them into leveled log lines.
//!
//! # Example
//!
//! ```ignore
//! let event = DomainEvent::device_went_offline(address, identity.last_seen);
//! event_publisher.publish(event).await?;
//! ```

use std::net::Ipv4Addr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How loudly an event should be surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventSeverity {
    Info,
    Warning,
}

/// Domain event representing a significant occurrence in the fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DomainEvent {
    // =========================================================================
    // Device Events
    // =========================================================================
    /// A new device was confirmed and registered.
    DeviceDiscovered {
        address: String,
        model: Option<String>,
        hostname: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// A device that was online stopped answering.
    DeviceWentOffline {
        address: String,
        last_seen: Option<DateTime<Utc>>,
        timestamp: DateTime<Utc>,
    },

    /// A device that was offline answered again.
    DeviceCameOnline {
        address: String,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Cycle Events
    // =========================================================================
    /// A discovery pass finished (possibly cancelled part-way).
    DiscoveryCompleted {
        probed: usize,
        confirmed: usize,
        registered: usize,
        cancelled: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A polling cycle finished.
    PollCycleCompleted {
        polled: usize,
        online: usize,
        offline: usize,
        unreachable: usize,
        failed: usize,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
}

impl DomainEvent {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            DomainEvent::DeviceDiscovered { timestamp, .. } => *timestamp,
            DomainEvent::DeviceWentOffline { timestamp, .. } => *timestamp,
            DomainEvent::DeviceCameOnline { timestamp, .. } => *timestamp,
            DomainEvent::DiscoveryCompleted { timestamp, .. } => *timestamp,
            DomainEvent::PollCycleCompleted { timestamp, .. } => *timestamp,
        }
    }

    /// Get the event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::DeviceDiscovered { .. } => "DeviceDiscovered",
            DomainEvent::DeviceWentOffline { .. } => "DeviceWentOffline",
            DomainEvent::DeviceCameOnline { .. } => "DeviceCameOnline",
            DomainEvent::DiscoveryCompleted { .. } => "DiscoveryCompleted",
            DomainEvent::PollCycleCompleted { .. } => "PollCycleCompleted",
        }
    }

    /// Get the device address if applicable.
    pub fn address(&self) -> Option<&str> {
        match self {
            DomainEvent::DeviceDiscovered { address, .. } => Some(address),
            DomainEvent::DeviceWentOffline { address, .. } => Some(address),
            DomainEvent::DeviceCameOnline { address, .. } => Some(address),
            _ => None,
        }
    }

    /// Losing a device is the one event operators must see.
    pub fn severity(&self) -> EventSeverity {
        match self {
            DomainEvent::DeviceWentOffline { .. } => EventSeverity::Warning,
            _ => EventSeverity::Info,
        }
    }
}

// =============================================================================
// Event Builders
// =============================================================================

impl DomainEvent {
    /// Create a DeviceDiscovered event.
    pub fn device_discovered(
        address: Ipv4Addr,
        model: Option<String>,
        hostname: Option<String>,
    ) -> Self {
        DomainEvent::DeviceDiscovered {
            address: address.to_string(),
            model,
            hostname,
            timestamp: Utc::now(),
        }
    }

    /// Create a DeviceWentOffline event.
    pub fn device_went_offline(address: Ipv4Addr, last_seen: Option<DateTime<Utc>>) -> Self {
        DomainEvent::DeviceWentOffline {
            address: address.to_string(),
            last_seen,
            timestamp: Utc::now(),
        }
    }

    /// Create a DeviceCameOnline event.
    pub fn device_came_online(address: Ipv4Addr) -> Self {
        DomainEvent::DeviceCameOnline {
            address: address.to_string(),
            timestamp: Utc::now(),
        }
    }

    /// Create a DiscoveryCompleted event.
    pub fn discovery_completed(
        probed: usize,
        confirmed: usize,
        registered: usize,
        cancelled: bool,
        duration: Duration,
    ) -> Self {
        DomainEvent::DiscoveryCompleted {
            probed,
            confirmed,
            registered,
            cancelled,
            duration_ms: duration.as_millis() as u64,
            timestamp: Utc::now(),
        }
    }

    /// Create a PollCycleCompleted event.
    pub fn poll_cycle_completed(
        polled: usize,
        online: usize,
        offline: usize,
        unreachable: usize,
        failed: usize,
        duration: Duration,
    ) -> Self {
        DomainEvent::PollCycleCompleted {
            polled,
            online,
            offline,
            unreachable,
            failed,
            duration_ms: duration.as_millis() as u64,
            timestamp: Utc::now(),
        }
    }
}
