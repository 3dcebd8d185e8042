//! Raw payload to measurement decoding.
//!
//! Every protocol client hands its raw response to [`MeasurementCodec::decode`]
//! together with the protocol it came from. Whole-payload schema violations are
//! `Protocol` errors; a single bad field or token only drops that field.

use chrono::{DateTime, Utc};
use serde_derive::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

use crate::der_data;
use crate::error::{Result, ZapError};
use crate::measurement::{Measurement, MetricKind};
use crate::numeric::{self, Bounds};
use crate::obis::{self, ObisTable};
use crate::protocol::ProtocolKind;

/// A contiguous run of IEEE-754 floats, two registers each, low word first.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegisterBlock {
    pub start: u16,
    pub fields: &'static [RegisterField],
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegisterField {
    pub code: &'static str,
    pub kind: MetricKind,
    pub unit: &'static str,
}

impl RegisterBlock {
    pub fn register_count(&self) -> u16 {
        (self.fields.len() * 2) as u16
    }
}

pub enum RawPayload<'a> {
    Text(&'a str),
    Registers {
        block: &'a RegisterBlock,
        words: &'a [u16],
    },
}

/// Identity fields of the gateway itself, taken from `/api/system`.
#[derive(Debug, Clone, PartialEq)]
pub struct SystemIdentity {
    pub device_id: String,
    pub firmware_version: Option<String>,
    pub sdk_version: Option<String>,
    pub local_ip: Option<String>,
}

#[derive(Deserialize)]
struct ObisEnvelope {
    status: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Clone, Default)]
pub struct MeasurementCodec {
    obis: Arc<ObisTable>,
}

impl MeasurementCodec {
    pub fn new(obis: ObisTable) -> Self {
        Self {
            obis: Arc::new(obis),
        }
    }

    pub fn obis_table(&self) -> &ObisTable {
        &self.obis
    }

    pub fn decode(
        &self,
        kind: ProtocolKind,
        payload: RawPayload<'_>,
        timestamp: DateTime<Utc>,
    ) -> Result<Vec<Measurement>> {
        match (kind, payload) {
            (ProtocolKind::P1, RawPayload::Text(body)) => self.decode_obis(body, timestamp),
            (ProtocolKind::System, RawPayload::Text(body)) => decode_system(body, timestamp),
            (ProtocolKind::Devices, RawPayload::Text(body)) => {
                der_data::decode_device_data(body, timestamp)
            }
            (ProtocolKind::Modbus, RawPayload::Registers { block, words }) => {
                decode_registers(block, words, timestamp)
            }
            (kind, _) => Err(ZapError::protocol(
                kind.to_string(),
                "payload shape does not match protocol",
            )),
        }
    }

    fn decode_obis(&self, body: &str, timestamp: DateTime<Utc>) -> Result<Vec<Measurement>> {
        let target = ProtocolKind::P1.to_string();
        let envelope: ObisEnvelope =
            serde_json::from_str(body).map_err(|e| ZapError::protocol(&target, e))?;
        if envelope.status != "success" {
            return Err(ZapError::protocol(
                target,
                format!("status `{}`", envelope.status),
            ));
        }
        let lines = match envelope.data {
            Value::Array(lines) => lines,
            other => {
                return Err(ZapError::protocol(
                    target,
                    format!("`data` is not an array: {other}"),
                ))
            }
        };
        let tokens: Vec<&str> = lines
            .iter()
            .filter_map(|line| match line.as_str() {
                Some(token) => Some(token),
                None => {
                    warn!(line = %line, "Skipping non-string OBIS line");
                    None
                }
            })
            .collect();
        Ok(obis::decode_tokens(&tokens, &self.obis, timestamp))
    }
}

fn parse_object(target: &str, body: &str) -> Result<serde_json::Map<String, Value>> {
    match serde_json::from_str::<Value>(body).map_err(|e| ZapError::protocol(target, e))? {
        Value::Object(map) => Ok(map),
        other => Err(ZapError::protocol(
            target,
            format!("expected an object, got {other}"),
        )),
    }
}

/// Looks a value up by dotted path (`zap.network.rssi`).
pub(crate) fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(root, |value, key| value.get(key))
}

const SYSTEM_FIELDS: [(&str, &str, MetricKind, &str, Bounds); 5] = [
    (
        "temperature_celsius",
        "system.temperature",
        MetricKind::Temperature,
        "°C",
        Bounds::range(-40.0, 150.0),
    ),
    (
        "uptime_seconds",
        "system.uptime",
        MetricKind::Duration,
        "s",
        Bounds {
            reject_overflow: false,
            ..Bounds::COUNTER
        },
    ),
    (
        "memory_kb.percent_used",
        "system.memory_used",
        MetricKind::Memory,
        "%",
        Bounds::range(0.0, 100.0),
    ),
    (
        "memory_kb.free",
        "system.memory_free",
        MetricKind::Memory,
        "kB",
        Bounds::at_least(0.0),
    ),
    (
        "zap.network.rssi",
        "system.signal_strength",
        MetricKind::SignalStrength,
        "dBm",
        Bounds::range(-120.0, 0.0),
    ),
];

/// Field-by-field extraction of `/api/system`. Missing or implausible fields
/// are simply absent from the result.
pub fn decode_system(body: &str, timestamp: DateTime<Utc>) -> Result<Vec<Measurement>> {
    let root = Value::Object(parse_object(&ProtocolKind::System.to_string(), body)?);
    Ok(SYSTEM_FIELDS
        .iter()
        .filter_map(|(path, code, kind, unit, bounds)| {
            numeric::validate_json(lookup(&root, path), path, *bounds)
                .map(|value| Measurement::new(*code, value, *unit, *kind, timestamp))
        })
        .collect())
}

pub fn decode_system_identity(body: &str) -> Result<SystemIdentity> {
    let target = ProtocolKind::System.to_string();
    let root = Value::Object(parse_object(&target, body)?);
    let text = |path: &str| lookup(&root, path).and_then(Value::as_str).map(str::to_string);
    let device_id = text("zap.deviceId")
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ZapError::protocol(&target, "missing `zap.deviceId`"))?;
    Ok(SystemIdentity {
        device_id,
        firmware_version: text("zap.firmwareVersion"),
        sdk_version: text("zap.sdkVersion"),
        local_ip: text("zap.network.localIP"),
    })
}

/// Joins two registers into a float, low word first.
pub fn merge_u16_f32(low: u16, high: u16) -> f32 {
    let combined: u32 = (low as u32) | ((high as u32) << 16);
    f32::from_bits(combined)
}

pub fn decode_registers(
    block: &RegisterBlock,
    words: &[u16],
    timestamp: DateTime<Utc>,
) -> Result<Vec<Measurement>> {
    if words.len() < block.register_count() as usize {
        return Err(ZapError::protocol(
            ProtocolKind::Modbus.to_string(),
            format!(
                "block at {} returned {} of {} registers",
                block.start,
                words.len(),
                block.register_count()
            ),
        ));
    }
    Ok(block
        .fields
        .iter()
        .zip(words.chunks_exact(2))
        .filter_map(|(field, pair)| {
            let raw = f64::from(merge_u16_f32(pair[0], pair[1]));
            numeric::validate(raw, field.code, Bounds::ANY)
                .map(|value| Measurement::new(field.code, value, field.unit, field.kind, timestamp))
        })
        .collect())
}
