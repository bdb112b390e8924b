//! Metrics module
//!
//! Prometheus metrics for discovery and polling.

mod fleet;

pub use fleet::FleetMetrics;
