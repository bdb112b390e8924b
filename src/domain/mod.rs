//! Domain Layer
//!
//! - **Ports** (`ports.rs`) - Trait abstractions for devices and collaborators
//! - **Events** (`events.rs`) - Domain events for logging and decoupling
//!
//! # Usage
//!
//! ```ignore
//! use rigwatch::domain::ports::{DeviceApi, DeviceRegistry};
//!
//! async fn refresh<A, R>(api: &A, registry: &R, address: Ipv4Addr) -> Result<()>
//! where
//!     A: DeviceApi,
//!     R: DeviceRegistry,
//! {
//!     if let Some(raw) = api.fetch_all(address).await {
//!         // ...
//!     }
//!     Ok(())
//! }
//! ```

pub mod events;
pub mod ports;

pub use events::{DomainEvent, EventSeverity};
pub use ports::{
    Command, DeviceApi, DeviceIdentity, DeviceRegistry, EventPublisher, ProbeFailure,
    ProbeResult, RawProbeResult, TelemetrySink,
};
