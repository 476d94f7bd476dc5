//! JSON payload parser for readings arriving over the pub/sub transport.
//!
//! Wire schema (field names kept from the deployed collectors):
//!
//! ```json
//! { "estacao": "BREPON", "sensor": "ph", "valor": 7.1, "data_hora": "2024-10-01T12:15:00Z" }
//! ```

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::{ParameterSpec, StationSpec};
use crate::error::{EngineError, Result};

/// One immutable measurement for a station and parameter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    pub station_id: String,
    pub parameter: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl Reading {
    pub fn new(station_id: &str, parameter: &str, value: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            station_id: station_id.to_string(),
            parameter: parameter.to_string(),
            value,
            timestamp,
        }
    }
}

/// Outbound/inbound wire form of a reading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadingPayload {
    pub estacao: Option<String>,
    pub sensor: Option<String>,
    pub valor: Option<serde_json::Value>,
    pub data_hora: Option<String>,
}

impl From<&Reading> for ReadingPayload {
    fn from(r: &Reading) -> Self {
        Self {
            estacao: Some(r.station_id.clone()),
            sensor: Some(r.parameter.clone()),
            valor: serde_json::Number::from_f64(r.value).map(serde_json::Value::Number),
            data_hora: Some(r.timestamp.to_rfc3339()),
        }
    }
}

/// Decodes a raw payload into a [`Reading`].
///
/// # Errors
///
/// Returns [`EngineError::MalformedInput`] if the bytes are not JSON, a field
/// is missing or empty, `valor` is not numeric, or `data_hora` is not a
/// recognised timestamp.
pub fn parse_reading(bytes: &[u8]) -> Result<Reading> {
    let payload: ReadingPayload = serde_json::from_slice(bytes)
        .map_err(|e| EngineError::MalformedInput(format!("not a reading object: {e}")))?;
    reading_from_payload(payload)
}

pub fn reading_from_payload(payload: ReadingPayload) -> Result<Reading> {
    let station_id = required(payload.estacao, "estacao")?;
    let parameter = required(payload.sensor, "sensor")?;
    let raw_time = required(payload.data_hora, "data_hora")?;

    let value = match payload.valor {
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        Some(serde_json::Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .ok_or_else(|| EngineError::MalformedInput(format!("'valor' missing or not numeric for {station_id}/{parameter}")))?;

    let timestamp = parse_timestamp(&raw_time)
        .ok_or_else(|| EngineError::MalformedInput(format!("unrecognised data_hora '{raw_time}'")))?;

    Ok(Reading {
        station_id,
        parameter,
        value,
        timestamp,
    })
}

fn required(field: Option<String>, name: &str) -> Result<String> {
    match field {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(EngineError::MalformedInput(format!("missing field '{name}'"))),
    }
}

/// Accepts RFC 3339 and the zone-less `YYYY-MM-DDTHH:MM:SS` form the
/// hydrology API emits; the latter is taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Builds the station manifest announced on the root topic: one entry per
/// station listing its sensors, with sensors numbered across the deployment.
pub fn build_manifest(
    stations: &[StationSpec],
    parameters: &[ParameterSpec],
    data_interval: &str,
) -> serde_json::Value {
    let entries = stations
        .iter()
        .enumerate()
        .map(|(i, station)| {
            let sensors: Vec<_> = parameters
                .iter()
                .enumerate()
                .map(|(j, parameter)| {
                    json!({
                        "sensor_id": format!("sensor_{:02}", i * parameters.len() + j + 1),
                        "data_type": parameter.name,
                        "data_interval": data_interval,
                    })
                })
                .collect();

            let mut entry = serde_json::Map::new();
            entry.insert(format!("estacao_{:02}", i + 1), json!(station.id));
            entry.insert("sensors".to_string(), json!(sensors));
            serde_json::Value::Object(entry)
        })
        .collect();

    serde_json::Value::Array(entries)
}

/// Extracts the station ids announced in a manifest payload.
pub fn manifest_station_ids(bytes: &[u8]) -> Result<Vec<String>> {
    let value: serde_json::Value = serde_json::from_slice(bytes)
        .map_err(|e| EngineError::MalformedInput(format!("manifest is not JSON: {e}")))?;
    let entries = value
        .as_array()
        .ok_or_else(|| EngineError::MalformedInput("manifest is not an array".into()))?;

    Ok(entries
        .iter()
        .filter_map(|entry| {
            entry
                .as_object()?
                .iter()
                .find(|(key, _)| key.starts_with("estacao"))
                .and_then(|(_, id)| id.as_str())
                .map(str::to_string)
        })
        .collect())
}
