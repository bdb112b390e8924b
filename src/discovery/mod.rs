//! Discovery module
//!
//! Finds which addresses in the configured ranges host a device.
//!
//! ```text
//! ranges ──► enumerate_candidates ──► partition ──► probe batch ──► pause ──► …
//!                                                        │
//!                                                        ▼
//!                                                 DiscoveryReport
//! ```

mod engine;
mod range;

pub use engine::{partition, DiscoveryBatch, DiscoveryEngine, DiscoveryReport};
pub use range::{enumerate_candidates, IpRange};
