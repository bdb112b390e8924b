//! Device client module
//!
//! Provides the HTTP implementation of the [`DeviceApi`] port.

mod device;

pub use crate::domain::ports::{Command, DeviceApi, ProbeFailure, ProbeResult, RawProbeResult};
pub use device::DeviceClient;
