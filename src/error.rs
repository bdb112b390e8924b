//! Error types for Rigwatch
//!
//! Only failures that an operator or a collaborator must see live here.
//! A device that does not answer is not an error; see
//! [`ProbeFailure`](crate::client::ProbeFailure) for that.

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Rigwatch
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// An address range bound is not an IPv4 literal, or start > end
    #[error("Invalid address range {start}..{end}: {reason}")]
    InvalidRange {
        start: String,
        end: String,
        reason: String,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Duration parse error
    #[error("Failed to parse duration: {0}")]
    DurationParse(String),

    // =========================================================================
    // Collaborator Errors
    // =========================================================================
    /// Device registry failure
    #[error("Device registry error: {0}")]
    Registry(String),

    /// Telemetry persistence failure
    #[error("Telemetry persistence error: {0}")]
    Persistence(String),

    /// Metrics registration or encoding failure
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    // =========================================================================
    // Infrastructure Errors
    // =========================================================================
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML configuration parse error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP client construction error
    #[error("HTTP client error: {0}")]
    Http(#[source] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build an [`Error::InvalidRange`] from the raw bounds.
    pub fn invalid_range(
        start: impl Into<String>,
        end: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Error::InvalidRange {
            start: start.into(),
            end: end.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error comes from operator-supplied configuration.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Error::InvalidRange { .. } | Error::Config(_) | Error::DurationParse(_) | Error::Yaml(_)
        )
    }
}
