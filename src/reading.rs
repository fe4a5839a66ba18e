use crate::error::DecodeError;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;

/// One normalized observation from a sensor node.
///
/// Sensor dimensions are optional: a field the node did not report stays
/// `None` and is never coerced to zero.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub air_quality: Option<f64>,
    pub flame_present: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct WireReading {
    #[serde(default)]
    id: Option<WireNodeId>,
    #[serde(default)]
    timestamp: Option<f64>,
    #[serde(default)]
    temp: Option<f64>,
    #[serde(default)]
    humidity: Option<f64>,
    #[serde(default)]
    air: Option<f64>,
    #[serde(default)]
    flame: Option<WireFlag>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireNodeId {
    Str(String),
    Int(i64),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireFlag {
    Bool(bool),
    Num(f64),
}

impl WireFlag {
    fn present(&self) -> bool {
        match self {
            WireFlag::Bool(value) => *value,
            WireFlag::Num(value) => *value >= 0.5,
        }
    }
}

fn epoch_seconds_to_dt(secs: f64) -> Result<DateTime<Utc>, DecodeError> {
    if !secs.is_finite() || secs < 0.0 {
        return Err(DecodeError::InvalidTimestamp(secs));
    }
    let whole = secs.trunc() as i64;
    let nanos = ((secs - secs.trunc()) * 1_000_000_000.0) as u32;
    Utc.timestamp_opt(whole, nanos)
        .single()
        .ok_or(DecodeError::InvalidTimestamp(secs))
}

/// Decodes a sensor topic payload:
/// `{ id, timestamp, temp, humidity, air, flame }`.
pub fn decode_reading(payload: &mut [u8]) -> Result<Reading, DecodeError> {
    if payload.iter().all(u8::is_ascii_whitespace) {
        return Err(DecodeError::Empty);
    }

    let wire: WireReading = simd_json::serde::from_slice(payload)?;

    let node_id = match wire.id {
        Some(WireNodeId::Str(raw)) => raw.trim().to_string(),
        Some(WireNodeId::Int(raw)) => raw.to_string(),
        None => String::new(),
    };
    if node_id.is_empty() {
        return Err(DecodeError::MissingNodeId);
    }

    let timestamp = epoch_seconds_to_dt(wire.timestamp.ok_or(DecodeError::MissingTimestamp)?)?;

    Ok(Reading {
        node_id,
        timestamp,
        temperature: wire.temp,
        humidity: wire.humidity,
        air_quality: wire.air,
        flame_present: wire.flame.as_ref().map(WireFlag::present),
    })
}
