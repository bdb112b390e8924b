//! Infrastructure Adapters
//!
//! This module contains adapter implementations for the domain ports,
//! following the Port/Adapter (Hexagonal) architecture pattern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │  DeviceRegistry │ TelemetrySink │ EventPublisher           │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ InMemoryFleetStore │ JsonlTelemetrySink                    │ │
//! │  │ CompositeTelemetrySink │ LoggingEventPublisher             │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The device client adapter lives in [`crate::client`].
//!
//! # Usage
//!
//! ```ignore
//! use rigwatch::adapters::{InMemoryFleetStore, JsonlTelemetrySink};
//! use rigwatch::domain::ports::DeviceRegistry;
//!
//! let store = Arc::new(InMemoryFleetStore::new(1440));
//! let devices = store.list_devices().await?;
//! ```

mod event_publisher;
mod memory_store;
mod telemetry_sink;

pub use event_publisher::{InMemoryEventCollector, LoggingEventPublisher};
pub use memory_store::{FleetStats, InMemoryFleetStore};
pub use telemetry_sink::{CompositeTelemetrySink, JsonlTelemetrySink};
