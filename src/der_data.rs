//! Decoding of the gateway's `/api/devices` family of endpoints.
//!
//! Device data is nested by DER type (`pv`, `battery`, `meter`). The sign and
//! range conventions here follow what the gateway firmware reports: PV power is
//! negative for production, battery SoC is a fraction, and a meter embedded in
//! a PV inverter duplicates the inverter's readings.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

use crate::codec::lookup;
use crate::error::{Result, ZapError};
use crate::measurement::{Device, Measurement, MetricKind};
use crate::numeric::{self, Bounds};
use crate::protocol::ProtocolKind;

struct Collector<'a> {
    section: &'a Value,
    section_name: &'static str,
    timestamp: DateTime<Utc>,
    out: Vec<Measurement>,
}

impl<'a> Collector<'a> {
    fn new(section: &'a Value, section_name: &'static str, timestamp: DateTime<Utc>) -> Self {
        Self {
            section,
            section_name,
            timestamp,
            out: Vec::new(),
        }
    }

    fn read(&self, field: &str, bounds: Bounds) -> Option<f64> {
        let name = format!("{}.{field}", self.section_name);
        numeric::validate_json(self.section.get(field), &name, bounds)
    }

    fn push(&mut self, code: &str, value: f64, unit: &str, kind: MetricKind) {
        self.out
            .push(Measurement::new(code, value, unit, kind, self.timestamp));
    }

    fn copy(&mut self, field: &str, code: &str, unit: &str, kind: MetricKind, bounds: Bounds) {
        if let Some(value) = self.read(field, bounds) {
            self.push(code, value, unit, kind);
        }
    }
}

fn decode_pv(section: &Value, timestamp: DateTime<Utc>) -> (Vec<Measurement>, Option<f64>) {
    let mut c = Collector::new(section, "pv", timestamp);
    let power = c.read("W", Bounds::ANY).map(|w| -w);
    c.copy(
        "total_generation_Wh",
        "energy_production",
        "Wh",
        MetricKind::Energy,
        Bounds::COUNTER,
    );
    c.copy(
        "heatsink_C",
        "temperature",
        "°C",
        MetricKind::Temperature,
        Bounds::range(-40.0, 150.0),
    );
    c.copy(
        "rated_power_W",
        "rated_power",
        "W",
        MetricKind::Power,
        Bounds::at_least(0.0),
    );
    for mppt in ["mppt1", "mppt2"] {
        c.copy(
            &format!("{mppt}_V"),
            &format!("{mppt}_voltage"),
            "V",
            MetricKind::Voltage,
            Bounds::range(0.0, 1000.0),
        );
        c.copy(
            &format!("{mppt}_A"),
            &format!("{mppt}_current"),
            "A",
            MetricKind::Current,
            Bounds::ANY,
        );
    }
    c.copy("upper_limit_W", "pv_upper_limit", "W", MetricKind::Power, Bounds::ANY);
    c.copy("lower_limit_W", "pv_lower_limit", "W", MetricKind::Power, Bounds::ANY);
    (c.out, power)
}

fn decode_battery(section: &Value, timestamp: DateTime<Utc>) -> (Vec<Measurement>, Option<f64>) {
    let mut c = Collector::new(section, "battery", timestamp);
    let power = c.read("W", Bounds::ANY);
    if let Some(w) = power {
        c.push("battery_power", w, "W", MetricKind::Power);
    }
    if let Some(fraction) = c.read("SoC_nom_fract", Bounds::range(0.0, 1.0)) {
        c.push("battery_soc", fraction * 100.0, "%", MetricKind::BatterySoc);
    }
    c.copy(
        "V",
        "battery_voltage",
        "V",
        MetricKind::Voltage,
        Bounds::range(0.0, 1000.0),
    );
    c.copy(
        "A",
        "battery_current",
        "A",
        MetricKind::Current,
        Bounds::range(-500.0, 500.0),
    );
    c.copy(
        "total_charge_Wh",
        "battery_charge_total",
        "Wh",
        MetricKind::Energy,
        Bounds::COUNTER,
    );
    c.copy(
        "total_discharge_Wh",
        "battery_discharge_total",
        "Wh",
        MetricKind::Energy,
        Bounds::COUNTER,
    );
    c.copy(
        "heatsink_C",
        "battery_temperature",
        "°C",
        MetricKind::Temperature,
        Bounds::range(-40.0, 150.0),
    );
    c.copy(
        "upper_limit_W",
        "battery_upper_limit",
        "W",
        MetricKind::Power,
        Bounds::ANY,
    );
    c.copy(
        "lower_limit_W",
        "battery_lower_limit",
        "W",
        MetricKind::Power,
        Bounds::ANY,
    );
    (c.out, power)
}

fn decode_meter(section: &Value, timestamp: DateTime<Utc>) -> (Vec<Measurement>, Option<f64>) {
    let mut c = Collector::new(section, "meter", timestamp);
    let power = c.read("W", Bounds::ANY);
    c.copy(
        "total_import_Wh",
        "energy_import",
        "Wh",
        MetricKind::Energy,
        Bounds::COUNTER,
    );
    c.copy(
        "total_export_Wh",
        "energy_export",
        "Wh",
        MetricKind::Energy,
        Bounds::COUNTER,
    );
    c.copy(
        "Hz",
        "grid_frequency",
        "Hz",
        MetricKind::Frequency,
        Bounds::range(45.0, 65.0),
    );
    for phase in ["L1", "L2", "L3"] {
        let prefix = phase.to_ascii_lowercase();
        c.copy(
            &format!("{phase}_V"),
            &format!("{prefix}_voltage"),
            "V",
            MetricKind::Voltage,
            Bounds::range(0.0, 500.0),
        );
        c.copy(
            &format!("{phase}_A"),
            &format!("{prefix}_current"),
            "A",
            MetricKind::Current,
            Bounds::range(-200.0, 200.0),
        );
        c.copy(
            &format!("{phase}_W"),
            &format!("{prefix}_power"),
            "W",
            MetricKind::Power,
            Bounds::ANY,
        );
    }
    (c.out, power)
}

/// Decodes `/api/devices/{sn}/data/json`.
pub fn decode_device_data(body: &str, timestamp: DateTime<Utc>) -> Result<Vec<Measurement>> {
    let target = ProtocolKind::Devices.to_string();
    let root: Value = serde_json::from_str(body).map_err(|e| ZapError::protocol(&target, e))?;
    if !root.is_object() {
        return Err(ZapError::protocol(target, "expected an object"));
    }

    let mut out = Vec::new();
    let mut power: Option<f64> = None;
    let mut add_power = |w: Option<f64>| {
        if let Some(w) = w {
            power = Some(power.unwrap_or(0.0) + w);
        }
    };

    let pv = root.get("pv");
    if let Some(section) = pv {
        let (measurements, w) = decode_pv(section, timestamp);
        out.extend(measurements);
        add_power(w);
    }
    if let Some(section) = root.get("battery") {
        let (measurements, w) = decode_battery(section, timestamp);
        let battery_temperature = measurements
            .iter()
            .find(|m| m.metric_code == "battery_temperature")
            .map(|m| m.value);
        out.extend(measurements);
        add_power(w);
        if let Some(t) = battery_temperature {
            if !out.iter().any(|m| m.metric_code == "temperature") {
                out.push(Measurement::new(
                    "temperature",
                    t,
                    "°C",
                    MetricKind::Temperature,
                    timestamp,
                ));
            }
        }
    }
    // A meter embedded in a PV inverter only mirrors the inverter.
    if pv.is_none() {
        if let Some(section) = root.get("meter") {
            let (measurements, w) = decode_meter(section, timestamp);
            out.extend(measurements);
            add_power(w);
        }
    }

    if let Some(total) = power {
        out.push(Measurement::new(
            "power",
            total,
            "W",
            MetricKind::Power,
            timestamp,
        ));
    }
    Ok(out)
}

/// Decodes `/api/devices/{sn}/ders` into rated power and storage capacity.
pub fn decode_ders(body: &str, timestamp: DateTime<Utc>) -> Result<Vec<Measurement>> {
    let target = ProtocolKind::Devices.to_string();
    let root: Value = serde_json::from_str(body).map_err(|e| ZapError::protocol(&target, e))?;
    let ders: &[Value] = match root.get("ders") {
        Some(Value::Array(ders)) => ders.as_slice(),
        Some(_) => return Err(ZapError::protocol(target, "`ders` is not an array")),
        None => &[],
    };

    let mut out = Vec::new();
    let mut rated = false;
    for der in ders {
        let enabled = der.get("enabled").and_then(Value::as_bool).unwrap_or(false);
        if enabled && !rated {
            if let Some(w) =
                numeric::validate_json(der.get("rated_power"), "der.rated_power", Bounds::at_least(0.0))
            {
                out.push(Measurement::new(
                    "rated_power",
                    w,
                    "W",
                    MetricKind::Power,
                    timestamp,
                ));
                rated = true;
            }
        }
        if der.get("type").and_then(Value::as_str) == Some("battery") {
            if let Some(wh) = numeric::validate_json(
                der.get("capacity"),
                "der.capacity",
                Bounds::at_least(0.0),
            ) {
                out.push(Measurement::new(
                    "capacity",
                    wh,
                    "Wh",
                    MetricKind::Energy,
                    timestamp,
                ));
            }
        }
    }
    Ok(out)
}

/// Reads the manufacturer of each DER section in `/api/devices/{sn}/data/json`.
/// A meter embedded in a PV inverter is skipped, like its readings.
pub fn decode_manufacturers(body: &str) -> Result<BTreeMap<String, String>> {
    let target = ProtocolKind::Devices.to_string();
    let root: Value = serde_json::from_str(body).map_err(|e| ZapError::protocol(&target, e))?;
    if !root.is_object() {
        return Err(ZapError::protocol(target, "expected an object"));
    }

    let has_pv = root.get("pv").is_some();
    let mut makes = BTreeMap::new();
    for section in ["pv", "battery", "meter"] {
        if section == "meter" && has_pv {
            continue;
        }
        let make = root
            .get(section)
            .and_then(|s| s.get("make"))
            .and_then(Value::as_str)
            .filter(|make| !make.is_empty());
        if let Some(make) = make {
            makes.insert(section.to_string(), make.to_string());
        }
    }
    Ok(makes)
}

fn title_case(raw: &str) -> String {
    raw.replace('_', " ")
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

fn der_capabilities(der_type: &str) -> &'static [MetricKind] {
    use MetricKind::*;
    match der_type {
        "pv" => &[Power, Energy, Temperature, Voltage, Current],
        "battery" => &[Power, Energy, BatterySoc, Voltage, Current, Temperature],
        "meter" => &[Power, Energy, Voltage, Current, Frequency],
        "ev_charger" => &[Power, Energy],
        _ => &[],
    }
}

/// Decodes `/api/devices`. Both the bare list and the `{"devices": [...]}`
/// shape are accepted; entries without a serial number are skipped.
pub fn decode_device_list(body: &str) -> Result<Vec<Device>> {
    let target = ProtocolKind::Devices.to_string();
    let root: Value = serde_json::from_str(body).map_err(|e| ZapError::protocol(&target, e))?;
    let entries = match &root {
        Value::Array(entries) => entries,
        Value::Object(_) => match lookup(&root, "devices") {
            Some(Value::Array(entries)) => entries,
            _ => return Err(ZapError::protocol(target, "missing `devices` array")),
        },
        _ => return Err(ZapError::protocol(target, "unexpected device list shape")),
    };

    let mut devices = Vec::new();
    for entry in entries {
        let serial = ["sn", "serial_number"]
            .iter()
            .find_map(|key| entry.get(*key).and_then(Value::as_str))
            .filter(|sn| !sn.is_empty());
        let Some(serial) = serial else {
            warn!(entry = %entry, "Skipping device without serial number");
            continue;
        };
        let text = |key: &str| entry.get(key).and_then(Value::as_str);
        let model = text("profile").or_else(|| text("type"));
        let label = title_case(model.unwrap_or("Device"));

        let capabilities: BTreeSet<MetricKind> = entry
            .get("ders")
            .and_then(Value::as_array)
            .map(|ders| {
                ders.iter()
                    .filter(|der| der.get("enabled").and_then(Value::as_bool).unwrap_or(true))
                    .filter_map(|der| der.get("type").and_then(Value::as_str))
                    .flat_map(|der_type| der_capabilities(der_type).iter().copied())
                    .collect()
            })
            .unwrap_or_default();

        let mut device = Device::new(serial)
            .with_display_name(format!("{label} {serial}"))
            .with_capabilities(capabilities);
        device.model = model.map(str::to_string);
        devices.push(device);
    }
    Ok(devices)
}
