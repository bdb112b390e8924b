//! Poller module
//!
//! Periodic telemetry refresh of every registered device.

mod orchestrator;

pub use orchestrator::{PollOutcome, PollSummary, PollingOrchestrator};
