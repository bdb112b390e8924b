//! Telemetry Normalizer
//!
//! Pure conversion from a [`RawProbeResult`] to a [`NormalizedTelemetry`].
//! Never fails: a field that cannot be derived is left absent (or at its
//! documented default) and every sibling is still extracted.

use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::fields::{as_integer, as_number, as_text, entry, Payloads, SCALAR_RULES};
use crate::domain::ports::RawProbeResult;

/// Status code of a successful summary response.
pub const SUCCESS_MARKER: &str = "S";

/// Number of `Fan Speed In<n>` slots scanned.
pub const MAX_FANS: usize = 4;

/// Network status recorded when the device reports none.
pub const NETWORK_STATUS_UNKNOWN: &str = "unknown";

/// One configured mining pool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolEntry {
    pub url: String,
    pub user: String,
    pub status: String,
    pub priority: u32,
}

/// Telemetry of one hashing board.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BoardEntry {
    pub id: u32,
    pub status: String,
    pub temperature: f64,
    pub hashrate: f64,
    pub chip_temp: f64,
    pub pcb_temp: f64,
    pub fan_speed: u32,
    pub chain: String,
}

/// Canonical snapshot of one device at one point in time.
///
/// Numeric fields are `None` when the device did not report them; absence is
/// never collapsed to zero. Hashrates are tera-scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedTelemetry {
    pub address: Ipv4Addr,
    pub collected_at: DateTime<Utc>,
    pub is_online: bool,
    pub model: Option<String>,
    pub hostname: Option<String>,
    pub temp_chip: Option<f64>,
    pub temp_pcb: Option<f64>,
    pub temp_max: Option<f64>,
    pub power_watts: Option<f64>,
    pub humidity: Option<f64>,
    pub hashrate: Option<f64>,
    pub hashrate_instant: Option<f64>,
    pub hashrate_avg: Option<f64>,
    pub fan_speeds: Vec<u32>,
    pub pools: Vec<PoolEntry>,
    pub uptime_secs: Option<u64>,
    pub network_status: String,
    pub boards: Vec<BoardEntry>,
}

impl NormalizedTelemetry {
    /// A snapshot with nothing derived yet.
    pub fn empty(address: Ipv4Addr) -> Self {
        Self {
            address,
            collected_at: Utc::now(),
            is_online: false,
            model: None,
            hostname: None,
            temp_chip: None,
            temp_pcb: None,
            temp_max: None,
            power_watts: None,
            humidity: None,
            hashrate: None,
            hashrate_instant: None,
            hashrate_avg: None,
            fan_speeds: Vec::new(),
            pools: Vec::new(),
            uptime_secs: None,
            network_status: NETWORK_STATUS_UNKNOWN.to_string(),
            boards: Vec::new(),
        }
    }
}

/// Whether a summary payload carries the success status.
///
/// Accepts both a bare `"STATUS": "S"` and the `"STATUS": [{"STATUS": "S"}]`
/// envelope.
pub fn is_success(summary: &Value) -> bool {
    let status = match summary.get("STATUS") {
        Some(Value::String(s)) => Some(s.as_str()),
        Some(Value::Array(items)) => items
            .first()
            .and_then(|s| s.get("STATUS"))
            .and_then(Value::as_str),
        _ => None,
    };
    status == Some(SUCCESS_MARKER)
}

/// Normalize one device's raw payloads.
pub fn normalize(raw: &RawProbeResult) -> NormalizedTelemetry {
    let payloads = Payloads::new(raw);
    let mut telemetry = NormalizedTelemetry::empty(raw.address);

    telemetry.is_online = raw.summary.as_ref().is_some_and(is_success);

    for rule in SCALAR_RULES {
        rule.apply(&payloads, &mut telemetry);
    }

    telemetry.hashrate = telemetry.hashrate_instant.or(telemetry.hashrate_avg);
    telemetry.fan_speeds = fan_speeds(payloads.summary_entry());
    telemetry.pools = pools(raw.pools.as_ref());
    telemetry.boards = boards(raw.devs.as_ref());
    telemetry.temp_max = max_temperature(&telemetry);

    telemetry
}

fn fan_speeds(summary_entry: Option<&Map<String, Value>>) -> Vec<u32> {
    let Some(entry) = summary_entry else {
        return Vec::new();
    };

    (1..=MAX_FANS)
        .map_while(|i| {
            entry
                .get(&format!("Fan Speed In{}", i))
                .and_then(as_integer)
                .and_then(|rpm| u32::try_from(rpm).ok())
        })
        .collect()
}

/// Objects of `payload[key]`, skipping anything that is not an object.
fn list<'a>(payload: Option<&'a Value>, key: &str) -> impl Iterator<Item = &'a Map<String, Value>> {
    payload
        .and_then(entry)
        .and_then(|p| p.get(key))
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_object)
}

fn text_or_empty(map: &Map<String, Value>, key: &str) -> String {
    map.get(key).and_then(as_text).unwrap_or_default()
}

fn number_or_zero(map: &Map<String, Value>, key: &str) -> f64 {
    map.get(key).and_then(as_number).unwrap_or(0.0)
}

fn u32_or_zero(map: &Map<String, Value>, key: &str) -> u32 {
    map.get(key)
        .and_then(as_integer)
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(0)
}

fn pools(payload: Option<&Value>) -> Vec<PoolEntry> {
    list(payload, "POOLS")
        .map(|pool| PoolEntry {
            url: text_or_empty(pool, "URL"),
            user: text_or_empty(pool, "User"),
            status: text_or_empty(pool, "Status"),
            priority: u32_or_zero(pool, "Priority"),
        })
        .collect()
}

fn boards(payload: Option<&Value>) -> Vec<BoardEntry> {
    list(payload, "DEVS")
        .map(|dev| BoardEntry {
            id: u32_or_zero(dev, "ID"),
            status: text_or_empty(dev, "Status"),
            temperature: number_or_zero(dev, "Temperature"),
            hashrate: number_or_zero(dev, "MHS 5s"),
            chip_temp: number_or_zero(dev, "Chip Temp"),
            pcb_temp: number_or_zero(dev, "PCB Temp"),
            fan_speed: u32_or_zero(dev, "Fan Speed"),
            chain: text_or_empty(dev, "Chain"),
        })
        .collect()
}

fn max_temperature(telemetry: &NormalizedTelemetry) -> Option<f64> {
    let boards = telemetry
        .boards
        .iter()
        .flat_map(|b| [b.temperature, b.chip_temp, b.pcb_temp])
        .filter(|t| *t > 0.0);

    telemetry
        .temp_chip
        .into_iter()
        .chain(telemetry.temp_pcb)
        .chain(boards)
        .reduce(f64::max)
}

// =============================================================================
// Tests
// =============================================================================
