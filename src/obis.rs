//! OBIS token decoding for P1 telegram lines.
//!
//! A line looks like `1-0:1.8.0(00061825.061*kWh)`. Some meters emit several
//! value groups on one line (gas readings carry a capture time first), in which
//! case the last group holds the value.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

use crate::error::ZapError;
use crate::measurement::{Measurement, MetricKind};

/// Codes whose value is text (timestamps, equipment identifiers, messages).
const TEXT_CODES: [&str; 7] = [
    "0-0:1.0.0",
    "0-0:96.1.0",
    "0-0:96.1.1",
    "0-0:96.1.4",
    "0-0:96.13.0",
    "0-0:96.14.0",
    "1-3:0.2.8",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObisCode {
    pub medium: u8,
    pub channel: u8,
    pub quantity: u8,
    pub processing: u8,
    pub tariff: u8,
}

impl FromStr for ObisCode {
    type Err = ZapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = |reason: &str| ZapError::decode(s, reason);
        let (group_a, rest) = s.split_once('-').ok_or_else(|| bad("missing `-`"))?;
        let (group_b, rest) = rest.split_once(':').ok_or_else(|| bad("missing `:`"))?;
        let mut parts = rest.split('.');
        let mut next = |name: &str| -> Result<u8, ZapError> {
            parts
                .next()
                .ok_or_else(|| bad(&format!("missing group {name}")))?
                .parse::<u8>()
                .map_err(|e| bad(&format!("group {name}: {e}")))
        };
        let quantity = next("C")?;
        let processing = next("D")?;
        let tariff = next("E")?;
        if parts.next().is_some() {
            return Err(bad("too many groups"));
        }
        Ok(Self {
            medium: group_a.parse().map_err(|e| bad(&format!("group A: {e}")))?,
            channel: group_b.parse().map_err(|e| bad(&format!("group B: {e}")))?,
            quantity,
            processing,
            tariff,
        })
    }
}

impl fmt::Display for ObisCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}:{}.{}.{}",
            self.medium, self.channel, self.quantity, self.processing, self.tariff
        )
    }
}

/// What a known code means and how its wire value maps to the published one.
#[derive(Debug, Clone, PartialEq)]
pub struct ObisDefinition {
    pub name: &'static str,
    pub kind: MetricKind,
    /// Unit the meter is expected to put after `*`.
    pub wire_unit: &'static str,
    /// Unit of the published measurement after scaling.
    pub unit: &'static str,
    pub scale: f64,
}

impl ObisDefinition {
    pub const fn new(name: &'static str, kind: MetricKind, unit: &'static str) -> Self {
        Self {
            name,
            kind,
            wire_unit: unit,
            unit,
            scale: 1.0,
        }
    }

    pub const fn scaled(
        name: &'static str,
        kind: MetricKind,
        wire_unit: &'static str,
        unit: &'static str,
        scale: f64,
    ) -> Self {
        Self {
            name,
            kind,
            wire_unit,
            unit,
            scale,
        }
    }
}

/// Lookup table from canonical code string to its definition.
#[derive(Debug, Clone, Default)]
pub struct ObisTable {
    definitions: HashMap<String, ObisDefinition>,
}

impl ObisTable {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Definitions for the DSMR/ESMR electricity fields a Zap P1 reader reports.
    pub fn standard() -> Self {
        use MetricKind::*;
        let entries = [
            ("1-0:1.8.0", ObisDefinition::new("Total Energy Import", Energy, "kWh")),
            ("1-0:2.8.0", ObisDefinition::new("Total Energy Export", Energy, "kWh")),
            ("1-0:1.7.0", ObisDefinition::new("Current Power Import", Power, "kW")),
            ("1-0:2.7.0", ObisDefinition::new("Current Power Export", Power, "kW")),
            ("1-0:3.8.0", ObisDefinition::new("Total Reactive Energy Import", ReactiveEnergy, "kvarh")),
            ("1-0:4.8.0", ObisDefinition::new("Total Reactive Energy Export", ReactiveEnergy, "kvarh")),
            ("1-0:3.7.0", ObisDefinition::new("Current Reactive Power Import", ReactivePower, "kvar")),
            ("1-0:4.7.0", ObisDefinition::new("Current Reactive Power Export", ReactivePower, "kvar")),
            ("1-0:32.7.0", ObisDefinition::new("Voltage L1", Voltage, "V")),
            ("1-0:52.7.0", ObisDefinition::new("Voltage L2", Voltage, "V")),
            ("1-0:72.7.0", ObisDefinition::new("Voltage L3", Voltage, "V")),
            ("1-0:31.7.0", ObisDefinition::new("Current L1", Current, "A")),
            ("1-0:51.7.0", ObisDefinition::new("Current L2", Current, "A")),
            ("1-0:71.7.0", ObisDefinition::new("Current L3", Current, "A")),
            ("1-0:21.7.0", ObisDefinition::new("Power L1 Import", Power, "kW")),
            ("1-0:41.7.0", ObisDefinition::new("Power L2 Import", Power, "kW")),
            ("1-0:61.7.0", ObisDefinition::new("Power L3 Import", Power, "kW")),
            ("1-0:22.7.0", ObisDefinition::new("Power L1 Export", Power, "kW")),
            ("1-0:42.7.0", ObisDefinition::new("Power L2 Export", Power, "kW")),
            ("1-0:62.7.0", ObisDefinition::new("Power L3 Export", Power, "kW")),
            ("1-0:23.7.0", ObisDefinition::new("Reactive Power L1 Import", ReactivePower, "kvar")),
            ("1-0:43.7.0", ObisDefinition::new("Reactive Power L2 Import", ReactivePower, "kvar")),
            ("1-0:63.7.0", ObisDefinition::new("Reactive Power L3 Import", ReactivePower, "kvar")),
            ("1-0:24.7.0", ObisDefinition::new("Reactive Power L1 Export", ReactivePower, "kvar")),
            ("1-0:44.7.0", ObisDefinition::new("Reactive Power L2 Export", ReactivePower, "kvar")),
            ("1-0:64.7.0", ObisDefinition::new("Reactive Power L3 Export", ReactivePower, "kvar")),
            ("1-0:14.7.0", ObisDefinition::new("Grid Frequency", Frequency, "Hz")),
        ];
        entries
            .into_iter()
            .fold(Self::empty(), |table, (code, def)| table.with(code, def))
    }

    pub fn with(mut self, code: &str, definition: ObisDefinition) -> Self {
        self.definitions.insert(code.to_string(), definition);
        self
    }

    pub fn get(&self, code: &str) -> Option<&ObisDefinition> {
        self.definitions.get(code)
    }
}

/// Decodes one telegram line. `Ok(None)` means the line is valid but carries
/// no numeric measurement (timestamps, identifiers).
pub fn decode_token(
    token: &str,
    table: &ObisTable,
    timestamp: DateTime<Utc>,
) -> Result<Option<Measurement>, ZapError> {
    let token = token.trim();
    let open = token
        .find('(')
        .ok_or_else(|| ZapError::decode(token, "missing value group"))?;
    if !token.ends_with(')') {
        return Err(ZapError::decode(token, "unterminated value group"));
    }
    let code: ObisCode = token[..open].parse()?;
    let code = code.to_string();
    if TEXT_CODES.contains(&code.as_str()) {
        debug!(code = %code, "Skipping text field");
        return Ok(None);
    }

    let groups = &token[open + 1..token.len() - 1];
    let group = groups.rsplit(")(").next().unwrap_or(groups);
    let (raw_value, wire_unit) = match group.split_once('*') {
        Some((value, unit)) => (value, Some(unit.trim())),
        None => (group, None),
    };

    let value = match raw_value.trim().parse::<f64>() {
        Ok(v) if v.is_finite() => v,
        Ok(_) => return Err(ZapError::decode(token, "value is not finite")),
        Err(e) => return Err(ZapError::decode(token, e)),
    };

    let measurement = match table.get(&code) {
        Some(def) => match wire_unit {
            Some(unit) if !unit.eq_ignore_ascii_case(def.wire_unit) => {
                warn!(
                    code = %code,
                    expected = def.wire_unit,
                    actual = unit,
                    "Unit mismatch, passing value through unscaled"
                );
                Measurement::new(code, value, unit, def.kind, timestamp)
            }
            _ => Measurement::new(code, value * def.scale, def.unit, def.kind, timestamp),
        },
        None => {
            debug!(code = %code, "Unknown OBIS code, passing through");
            Measurement::new(
                code,
                value,
                wire_unit.unwrap_or_default(),
                MetricKind::Other,
                timestamp,
            )
        }
    };
    Ok(Some(measurement))
}

/// Decodes every line, isolating failures to the line that caused them.
pub fn decode_tokens<S: AsRef<str>>(
    tokens: &[S],
    table: &ObisTable,
    timestamp: DateTime<Utc>,
) -> Vec<Measurement> {
    tokens
        .iter()
        .filter_map(|token| match decode_token(token.as_ref(), table, timestamp) {
            Ok(measurement) => measurement,
            Err(e) => {
                warn!("Skipping OBIS line: {e}");
                None
            }
        })
        .collect()
}

/// Renders a measurement back into wire form, undoing the table's scale.
pub fn encode_token(measurement: &Measurement, table: &ObisTable) -> String {
    let code = &measurement.metric_code;
    match table.get(code) {
        Some(def) if def.unit == measurement.unit => {
            format!("{code}({}*{})", measurement.value / def.scale, def.wire_unit)
        }
        _ if measurement.unit.is_empty() => format!("{code}({})", measurement.value),
        _ => format!("{code}({}*{})", measurement.value, measurement.unit),
    }
}
