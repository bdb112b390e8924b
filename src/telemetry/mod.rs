//! Telemetry module
//!
//! Normalizes the six raw control-API payloads of one device into a single
//! [`NormalizedTelemetry`] snapshot.

mod fields;
mod normalizer;

pub use fields::{parse_hashrate, FieldRule, Missing, Source, Target, Transform, SCALAR_RULES};
pub use normalizer::{
    is_success, normalize, BoardEntry, NormalizedTelemetry, PoolEntry, MAX_FANS,
    NETWORK_STATUS_UNKNOWN, SUCCESS_MARKER,
};
