//! Fleet configuration
//!
//! A static [`FleetConfig`] is read once at startup (YAML file, then CLI
//! overrides) and handed to each component as its own narrow config struct.
//! There is no hot-reload.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::discovery::IpRange;
use crate::error::{Error, Result};

/// Default device API port.
pub const DEFAULT_API_PORT: u16 = 4028;

// =============================================================================
// Range specification
// =============================================================================

/// One configured address range, as written by the operator.
///
/// Accepted forms:
///
/// ```yaml
/// ranges:
///   - { start: 10.102.0.1, end: 10.102.0.255 }
///   - 10.102.1.1-10.102.1.65
///   - 10.102.2.0/28
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RangeSpec {
    /// Explicit inclusive bounds
    Bounds { start: String, end: String },
    /// `a.b.c.d-e.f.g.h` or CIDR notation
    Notation(String),
}

impl RangeSpec {
    /// Build an explicit inclusive range.
    pub fn bounds(start: impl Into<String>, end: impl Into<String>) -> Self {
        RangeSpec::Bounds {
            start: start.into(),
            end: end.into(),
        }
    }

    /// Resolve into a validated [`IpRange`].
    pub fn resolve(&self) -> Result<IpRange> {
        match self {
            RangeSpec::Bounds { start, end } => IpRange::parse(start, end),
            RangeSpec::Notation(s) => s.parse(),
        }
    }
}

// =============================================================================
// Fleet configuration
// =============================================================================

/// Top-level configuration for discovery and polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// TCP port of the device control API
    pub api_port: u16,

    /// Address ranges swept by discovery
    pub ranges: Vec<RangeSpec>,

    /// Timeout for a single command round trip
    #[serde(with = "duration_str")]
    pub request_timeout: Duration,

    /// Timeout wrapping each discovery probe
    #[serde(with = "duration_str")]
    pub probe_timeout: Duration,

    /// Number of addresses probed concurrently per discovery batch
    pub batch_size: usize,

    /// Pause between discovery batches
    #[serde(with = "duration_str")]
    pub batch_pause: Duration,

    /// Discovery cadence
    #[serde(with = "duration_str")]
    pub discovery_interval: Duration,

    /// Polling cadence
    #[serde(with = "duration_str")]
    pub poll_interval: Duration,

    /// Maximum devices polled at once
    pub max_concurrent_polls: usize,

    /// Upper bound on one device's whole poll (fetch, normalize, persist)
    #[serde(with = "duration_str")]
    pub poll_timeout: Duration,

    /// Telemetry records kept per device by the in-memory store
    pub history_limit: usize,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            api_port: DEFAULT_API_PORT,
            ranges: vec![
                RangeSpec::bounds("10.102.0.1", "10.102.0.255"),
                RangeSpec::bounds("10.102.1.1", "10.102.1.65"),
            ],
            request_timeout: Duration::from_secs(3),
            probe_timeout: Duration::from_secs(4),
            batch_size: 100,
            batch_pause: Duration::from_millis(50),
            discovery_interval: Duration::from_secs(300),
            poll_interval: Duration::from_secs(60),
            max_concurrent_polls: 16,
            poll_timeout: Duration::from_secs(10),
            history_limit: 1440,
        }
    }
}

impl FleetConfig {
    /// Parse a YAML document. Missing keys take their defaults.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: FleetConfig = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Load and validate a YAML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config = Self::from_yaml_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot work. Run once at startup.
    pub fn validate(&self) -> Result<()> {
        if self.api_port == 0 {
            return Err(Error::Config("api_port must be non-zero".into()));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be > 0".into()));
        }
        if self.max_concurrent_polls == 0 {
            return Err(Error::Config("max_concurrent_polls must be > 0".into()));
        }
        for (name, value) in [
            ("request_timeout", self.request_timeout),
            ("probe_timeout", self.probe_timeout),
            ("poll_timeout", self.poll_timeout),
            ("discovery_interval", self.discovery_interval),
            ("poll_interval", self.poll_interval),
        ] {
            if value.is_zero() {
                return Err(Error::Config(format!("{} must be non-zero", name)));
            }
        }
        self.resolve_ranges()?;
        Ok(())
    }

    /// Resolve every configured range, failing on the first invalid one.
    pub fn resolve_ranges(&self) -> Result<Vec<IpRange>> {
        self.ranges.iter().map(RangeSpec::resolve).collect()
    }

    /// Settings for the device client.
    pub fn client(&self) -> ClientConfig {
        ClientConfig {
            api_port: self.api_port,
            request_timeout: self.request_timeout,
        }
    }

    /// Settings for the discovery engine.
    pub fn discovery(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            batch_size: self.batch_size,
            probe_timeout: self.probe_timeout,
            batch_pause: self.batch_pause,
        }
    }

    /// Settings for the polling orchestrator.
    pub fn poller(&self) -> PollerConfig {
        PollerConfig {
            max_concurrent_polls: self.max_concurrent_polls,
            poll_timeout: self.poll_timeout,
        }
    }
}

// =============================================================================
// Component configurations
// =============================================================================

/// Configuration for the device client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Device API port
    pub api_port: u16,

    /// Per-command timeout
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        FleetConfig::default().client()
    }
}

/// Configuration for the discovery engine
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Addresses probed concurrently
    pub batch_size: usize,

    /// Timeout wrapping each probe
    pub probe_timeout: Duration,

    /// Pause between batches
    pub batch_pause: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        FleetConfig::default().discovery()
    }
}

/// Configuration for the polling orchestrator
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Maximum devices polled at once
    pub max_concurrent_polls: usize,

    /// Upper bound on one device's poll
    pub poll_timeout: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        FleetConfig::default().poller()
    }
}

// =============================================================================
// Durations
// =============================================================================

/// Parse a duration string like "50ms", "3s", "5m", "1h30m".
///
/// A trailing bare number is taken as seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::DurationParse("empty duration string".to_string()));
    }

    let mut total_ms: u64 = 0;
    let mut num_buf = String::new();
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            num_buf.push(c);
            continue;
        }

        let num: u64 = num_buf
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;
        num_buf.clear();

        let multiplier = match c {
            'm' | 'M' if matches!(chars.peek(), Some('s') | Some('S')) => {
                chars.next();
                1
            }
            'd' | 'D' => 86_400_000,
            'h' | 'H' => 3_600_000,
            'm' | 'M' => 60_000,
            's' | 'S' => 1_000,
            _ => {
                return Err(Error::DurationParse(format!(
                    "unknown duration unit: {}",
                    c
                )))
            }
        };

        total_ms = accumulate(total_ms, num, multiplier, s)?;
    }

    if !num_buf.is_empty() {
        let num: u64 = num_buf
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;
        total_ms = accumulate(total_ms, num, 1_000, s)?;
    }

    Ok(Duration::from_millis(total_ms))
}

fn accumulate(total_ms: u64, num: u64, multiplier: u64, s: &str) -> Result<u64> {
    num.checked_mul(multiplier)
        .and_then(|ms| total_ms.checked_add(ms))
        .ok_or_else(|| Error::DurationParse(format!("duration out of range: {}", s)))
}

/// Render a duration in the form accepted by [`parse_duration`].
pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms % 1_000 == 0 {
        format!("{}s", ms / 1_000)
    } else {
        format!("{}ms", ms)
    }
}

pub(crate) mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_defaults_match_deployment() {
        let config = FleetConfig::default();

        assert_eq!(config.api_port, 4028);
        assert_eq!(config.ranges.len(), 2);
        assert_eq!(config.request_timeout, Duration::from_secs(3));
        assert!(config.probe_timeout > config.request_timeout);
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.batch_pause, Duration::from_millis(50));
        assert_eq!(config.discovery_interval, Duration::from_secs(300));
        assert_eq!(config.poll_interval, Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("50ms").unwrap(), Duration::from_millis(50));
        assert_eq!(parse_duration("3s").unwrap(), Duration::from_secs(3));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86_400));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_duration(" 2s ").unwrap(), Duration::from_secs(2));
    }

    #[test]
    fn test_parse_duration_errors() {
        assert_matches!(parse_duration(""), Err(Error::DurationParse(_)));
        assert_matches!(parse_duration("5x"), Err(Error::DurationParse(_)));
        assert_matches!(parse_duration("ms"), Err(Error::DurationParse(_)));
    }

    #[test]
    fn test_parse_duration_rejects_overflow() {
        assert_matches!(
            parse_duration("9999999999999999d"),
            Err(Error::DurationParse(_))
        );
        assert_matches!(
            parse_duration("18446744073709551s"),
            Err(Error::DurationParse(_))
        );
        assert_matches!(
            parse_duration("18446744073709551615ms1ms"),
            Err(Error::DurationParse(_))
        );
    }

    #[test]
    fn test_format_duration_round_trips_through_parse() {
        for d in [Duration::from_millis(50), Duration::from_secs(300)] {
            assert_eq!(parse_duration(&format_duration(d)).unwrap(), d);
        }
    }

    #[test]
    fn test_yaml_partial_document_uses_defaults() {
        let yaml = r#"
api_port: 4029
ranges:
  - { start: 192.168.1.10, end: 192.168.1.20 }
  - 192.168.2.1-192.168.2.5
  - 192.168.3.0/30
request_timeout: 1500ms
batch_size: 25
"#;
        let config = FleetConfig::from_yaml_str(yaml).unwrap();

        assert_eq!(config.api_port, 4029);
        assert_eq!(config.request_timeout, Duration::from_millis(1500));
        assert_eq!(config.batch_size, 25);
        assert_eq!(config.poll_interval, Duration::from_secs(60));
        assert_eq!(
            config.ranges[1],
            RangeSpec::Notation("192.168.2.1-192.168.2.5".into())
        );

        let ranges = config.resolve_ranges().unwrap();
        assert_eq!(ranges[0].len(), 11);
        assert_eq!(ranges[1].len(), 5);
        assert_eq!(ranges[2].len(), 4);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = FleetConfig::default();
        config.batch_size = 0;
        assert_matches!(config.validate(), Err(Error::Config(_)));

        let mut config = FleetConfig::default();
        config.request_timeout = Duration::ZERO;
        assert_matches!(config.validate(), Err(Error::Config(_)));

        let mut config = FleetConfig::default();
        config.ranges = vec![RangeSpec::bounds("10.0.0.9", "10.0.0.1")];
        assert_matches!(config.validate(), Err(Error::InvalidRange { .. }));

        let mut config = FleetConfig::default();
        config.ranges = vec![RangeSpec::bounds("10.0.0.1", "not-an-ip")];
        assert_matches!(config.validate(), Err(Error::InvalidRange { .. }));
    }

    #[test]
    fn test_yaml_bad_duration_is_rejected() {
        let result = FleetConfig::from_yaml_str("probe_timeout: soon\n");
        assert_matches!(result, Err(Error::Yaml(_)));
    }

    #[test]
    fn test_component_configs() {
        let config = FleetConfig::default();

        assert_eq!(config.client().api_port, 4028);
        assert_eq!(config.discovery().batch_size, 100);
        assert_eq!(config.poller().max_concurrent_polls, 16);
    }
}
