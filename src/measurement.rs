use chrono::{DateTime, Duration, Utc};
use serde_derive::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// The physical quantity a measurement describes. Used as a device capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Energy,
    Power,
    ReactiveEnergy,
    ReactivePower,
    Voltage,
    Current,
    Frequency,
    PowerFactor,
    BatterySoc,
    Temperature,
    SignalStrength,
    Duration,
    Memory,
    Other,
}

/// A single decoded value. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub metric_code: String,
    pub value: f64,
    pub unit: String,
    pub kind: MetricKind,
    pub timestamp: DateTime<Utc>,
}

impl Measurement {
    pub fn new(
        metric_code: impl Into<String>,
        value: f64,
        unit: impl Into<String>,
        kind: MetricKind,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            metric_code: metric_code.into(),
            value,
            unit: unit.into(),
            kind,
            timestamp,
        }
    }
}

/// A logical device behind a gateway, keyed by its serial number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub serial_number: String,
    pub display_name: Option<String>,
    pub model: Option<String>,
    pub firmware_version: Option<String>,
    pub capabilities: BTreeSet<MetricKind>,
    /// Manufacturer per DER section (`pv`, `battery`, `meter`).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub manufacturers: BTreeMap<String, String>,
}

impl Device {
    pub fn new(serial_number: impl Into<String>) -> Self {
        Self {
            serial_number: serial_number.into(),
            display_name: None,
            model: None,
            firmware_version: None,
            capabilities: BTreeSet::new(),
            manufacturers: BTreeMap::new(),
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_capabilities(mut self, kinds: impl IntoIterator<Item = MetricKind>) -> Self {
        self.capabilities.extend(kinds);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    Degraded,
    Disconnected,
}

/// Merged view of one device. Replaced wholesale on every merge so readers
/// never observe a partially applied tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub serial_number: String,
    pub metrics: BTreeMap<String, Measurement>,
    pub connection_status: ConnectionStatus,
    pub last_success_timestamp: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

impl DeviceSnapshot {
    pub fn empty(serial_number: impl Into<String>) -> Self {
        Self {
            serial_number: serial_number.into(),
            metrics: BTreeMap::new(),
            connection_status: ConnectionStatus::Disconnected,
            last_success_timestamp: None,
            consecutive_failures: 0,
        }
    }

    pub fn get(&self, metric_code: &str) -> Option<&Measurement> {
        self.metrics.get(metric_code)
    }

    pub fn value(&self, metric_code: &str) -> Option<f64> {
        self.get(metric_code).map(|m| m.value)
    }

    /// True when the metric is missing or older than `max_age`, or when the
    /// device is disconnected and no value can be trusted as fresh.
    pub fn is_stale(&self, metric_code: &str, now: DateTime<Utc>, max_age: Duration) -> bool {
        if self.connection_status == ConnectionStatus::Disconnected {
            return true;
        }
        match self.metrics.get(metric_code) {
            Some(m) => now - m.timestamp > max_age,
            None => true,
        }
    }
}
