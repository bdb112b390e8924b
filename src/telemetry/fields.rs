//! Field extraction rules
//!
//! Every scalar telemetry field is one row of [`SCALAR_RULES`]: where to look,
//! where to look next, how to convert, and what to record when nothing
//! usable is found. Rows are evaluated independently, so one malformed field
//! never affects another.

use serde_json::{Map, Value};

use super::normalizer::NormalizedTelemetry;
use crate::domain::ports::RawProbeResult;

// =============================================================================
// Sources
// =============================================================================

/// Where a value lives in the raw payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Top-level key of the summary payload
    Summary(&'static str),
    /// Key of `SUMMARY[0]`
    SummaryEntry(&'static str),
    /// Key of `STATS[0]` inside the stats entry
    StatsEntry(&'static str),
    /// Key of the version entry (or its `VERSION[0]`)
    Version(&'static str),
    /// Key of the network entry
    Network(&'static str),
    /// Key of `STATUS[0]` inside the network entry
    NetworkStatus(&'static str),
}

/// Borrowed view over the payloads with the nested entries resolved once.
pub(crate) struct Payloads<'a> {
    summary: Option<&'a Map<String, Value>>,
    summary_entry: Option<&'a Map<String, Value>>,
    stats_entry: Option<&'a Map<String, Value>>,
    version: Option<&'a Map<String, Value>>,
    network: Option<&'a Map<String, Value>>,
    network_status: Option<&'a Map<String, Value>>,
}

impl<'a> Payloads<'a> {
    pub(crate) fn new(raw: &'a RawProbeResult) -> Self {
        let summary = raw.summary.as_ref().and_then(entry);
        let network = raw.network.as_ref().and_then(entry);
        let version = raw.version.as_ref().and_then(entry);

        Self {
            summary,
            summary_entry: summary.and_then(|s| first_object(s, "SUMMARY")),
            stats_entry: raw
                .stats
                .as_ref()
                .and_then(entry)
                .and_then(|s| first_object(s, "STATS")),
            version,
            network,
            network_status: network.and_then(|n| first_object(n, "STATUS")),
        }
    }

    fn container(&self, source: Source) -> Option<&'a Map<String, Value>> {
        match source {
            Source::Summary(_) => self.summary,
            Source::SummaryEntry(_) => self.summary_entry,
            Source::StatsEntry(_) => self.stats_entry,
            Source::Version(_) => self.version,
            Source::Network(_) => self.network,
            Source::NetworkStatus(_) => self.network_status,
        }
    }

    pub(crate) fn lookup(&self, source: Source) -> Option<&'a Value> {
        let container = self.container(source)?;
        match source {
            Source::Version(key) => container
                .get(key)
                .or_else(|| first_object(container, "VERSION").and_then(|v| v.get(key))),
            Source::Summary(key)
            | Source::SummaryEntry(key)
            | Source::StatsEntry(key)
            | Source::Network(key)
            | Source::NetworkStatus(key) => container.get(key),
        }
    }

    /// Whether the object holding `source` was reported at all.
    pub(crate) fn reported(&self, source: Source) -> bool {
        self.container(source).is_some()
    }

    pub(crate) fn summary_entry(&self) -> Option<&'a Map<String, Value>> {
        self.summary_entry
    }
}

/// Some firmware wraps a response object in a one-element list.
pub(crate) fn entry(value: &Value) -> Option<&Map<String, Value>> {
    match value {
        Value::Object(map) => Some(map),
        Value::Array(items) => items.first().and_then(Value::as_object),
        _ => None,
    }
}

/// `map[key][0]` as an object.
pub(crate) fn first_object<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a Map<String, Value>> {
    map.get(key)?.as_array()?.first()?.as_object()
}

// =============================================================================
// Transforms
// =============================================================================

/// How a raw JSON value becomes a telemetry value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    /// Non-empty string (numbers are rendered)
    Text,
    /// Float, leniently parsed from strings
    Number,
    /// Hashrate normalized to tera-scale
    Hashrate,
    /// Power with an optional `W` suffix
    Watts,
    /// Non-negative integer
    Integer,
}

/// A converted value, before it is assigned to its field.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Extracted {
    Text(String),
    Number(f64),
    Integer(u64),
}

impl Transform {
    pub(crate) fn apply(&self, value: &Value) -> Option<Extracted> {
        match self {
            Transform::Text => as_text(value).map(Extracted::Text),
            Transform::Number => as_number(value).map(Extracted::Number),
            Transform::Hashrate => parse_hashrate(value).map(Extracted::Number),
            Transform::Watts => parse_watts(value).map(Extracted::Number),
            Transform::Integer => as_integer(value).map(Extracted::Integer),
        }
    }

    fn zero(&self) -> Extracted {
        match self {
            Transform::Text => Extracted::Text(String::new()),
            Transform::Integer => Extracted::Integer(0),
            Transform::Number | Transform::Hashrate | Transform::Watts => Extracted::Number(0.0),
        }
    }
}

/// Normalize a vendor hashrate to tera-scale.
///
/// Strings containing the `T` marker are already tera-scale; anything else is
/// giga-scale and divided by 1000. Only the leading number is read.
pub fn parse_hashrate(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().map(|g| g / 1000.0),
        Value::String(s) => {
            let leading = leading_number(s)?;
            if s.contains('T') {
                Some(leading)
            } else {
                Some(leading / 1000.0)
            }
        }
        _ => None,
    }
}

fn parse_watts(value: &Value) -> Option<f64> {
    match value {
        Value::String(s) => s
            .trim()
            .trim_end_matches(['W', 'w'])
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|w| w.is_finite()),
        other => as_number(other),
    }
}

/// Longest numeric prefix of a string, e.g. `"13.5 TH/s"` -> 13.5.
pub(crate) fn leading_number(s: &str) -> Option<f64> {
    let s = s.trim();
    let end = s
        .char_indices()
        .find(|(i, c)| !(c.is_ascii_digit() || *c == '.' || (*i == 0 && (*c == '-' || *c == '+'))))
        .map_or(s.len(), |(i, _)| i);

    s[..end].parse::<f64>().ok().filter(|v| v.is_finite())
}

pub(crate) fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub(crate) fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => leading_number(s),
        _ => None,
    }
}

pub(crate) fn as_integer(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && *f >= 0.0)
                .map(|f| f.trunc() as u64)
        }),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    }
}

// =============================================================================
// Rules
// =============================================================================

/// The telemetry field a rule writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Model,
    Hostname,
    ChipTemperature,
    PcbTemperature,
    Humidity,
    HashrateInstant,
    HashrateAverage,
    Power,
    Uptime,
    NetworkStatus,
}

impl Target {
    fn assign(&self, telemetry: &mut NormalizedTelemetry, value: Extracted) {
        match (self, value) {
            (Target::Model, Extracted::Text(s)) => telemetry.model = Some(s),
            (Target::Hostname, Extracted::Text(s)) => telemetry.hostname = Some(s),
            (Target::NetworkStatus, Extracted::Text(s)) => telemetry.network_status = s,
            (Target::ChipTemperature, Extracted::Number(v)) => telemetry.temp_chip = Some(v),
            (Target::PcbTemperature, Extracted::Number(v)) => telemetry.temp_pcb = Some(v),
            (Target::Humidity, Extracted::Number(v)) => telemetry.humidity = Some(v),
            (Target::HashrateInstant, Extracted::Number(v)) => telemetry.hashrate_instant = Some(v),
            (Target::HashrateAverage, Extracted::Number(v)) => telemetry.hashrate_avg = Some(v),
            (Target::Power, Extracted::Number(v)) => telemetry.power_watts = Some(v),
            (Target::Uptime, Extracted::Integer(v)) => telemetry.uptime_secs = Some(v),
            (target, value) => {
                tracing::debug!("rule for {:?} produced mismatched {:?}", target, value)
            }
        }
    }
}

/// What to record when neither source yields a usable value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Missing {
    /// Leave the field absent
    Absent,
    /// Zero, but only if the object holding the field was reported
    ZeroIfReported,
    /// A fixed sentinel string
    Sentinel(&'static str),
}

/// One extraction rule.
#[derive(Debug, Clone, Copy)]
pub struct FieldRule {
    pub target: Target,
    pub source: Source,
    pub fallback: Option<Source>,
    pub transform: Transform,
    pub missing: Missing,
}

impl FieldRule {
    const fn new(target: Target, source: Source, transform: Transform) -> Self {
        Self {
            target,
            source,
            fallback: None,
            transform,
            missing: Missing::Absent,
        }
    }

    const fn or_from(mut self, fallback: Source) -> Self {
        self.fallback = Some(fallback);
        self
    }

    const fn when_missing(mut self, missing: Missing) -> Self {
        self.missing = missing;
        self
    }

    pub(crate) fn extract(&self, payloads: &Payloads<'_>) -> Option<Extracted> {
        let convert = |source: Source| {
            payloads
                .lookup(source)
                .and_then(|v| self.transform.apply(v))
        };

        convert(self.source)
            .or_else(|| self.fallback.and_then(convert))
            .or_else(|| match self.missing {
                Missing::Absent => None,
                Missing::ZeroIfReported => payloads
                    .reported(self.source)
                    .then(|| self.transform.zero()),
                Missing::Sentinel(s) => Some(Extracted::Text(s.to_string())),
            })
    }

    pub(crate) fn apply(&self, payloads: &Payloads<'_>, telemetry: &mut NormalizedTelemetry) {
        if let Some(value) = self.extract(payloads) {
            self.target.assign(telemetry, value);
        }
    }
}

/// Scalar fields of [`NormalizedTelemetry`], in evaluation order.
pub const SCALAR_RULES: &[FieldRule] = &[
    FieldRule::new(Target::Model, Source::Summary("Type"), Transform::Text)
        .or_from(Source::Version("Type")),
    FieldRule::new(Target::Hostname, Source::Summary("Hostname"), Transform::Text)
        .or_from(Source::Network("Hostname")),
    FieldRule::new(
        Target::ChipTemperature,
        Source::SummaryEntry("Temperature"),
        Transform::Number,
    ),
    FieldRule::new(
        Target::PcbTemperature,
        Source::SummaryEntry("PCB Temperature"),
        Transform::Number,
    ),
    FieldRule::new(Target::Humidity, Source::SummaryEntry("Humidity"), Transform::Number),
    FieldRule::new(
        Target::HashrateInstant,
        Source::SummaryEntry("GHS 5s"),
        Transform::Hashrate,
    ),
    FieldRule::new(
        Target::HashrateAverage,
        Source::SummaryEntry("GHS av"),
        Transform::Hashrate,
    ),
    FieldRule::new(Target::Power, Source::StatsEntry("Power"), Transform::Watts),
    FieldRule::new(Target::Uptime, Source::SummaryEntry("Elapsed"), Transform::Integer)
        .when_missing(Missing::ZeroIfReported),
    FieldRule::new(
        Target::NetworkStatus,
        Source::NetworkStatus("Status"),
        Transform::Text,
    )
    .when_missing(Missing::Sentinel(super::normalizer::NETWORK_STATUS_UNKNOWN)),
];
