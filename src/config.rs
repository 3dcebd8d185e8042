//! Per-gateway configuration.
//!
//! A [`GatewayConfig`] is checked once by [`GatewayConfig::validate`] when the
//! gateway is added. Nothing is polled for a configuration that fails.

use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::env;
use std::fmt::Display;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::protocol::ProtocolKind;

pub const MIN_SCAN_INTERVAL_SECONDS: u64 = 1;
pub const MAX_SCAN_INTERVAL_SECONDS: u64 = 3600;

fn default_scan_interval() -> u64 {
    10
}

fn default_endpoints() -> BTreeSet<ProtocolKind> {
    [ProtocolKind::P1, ProtocolKind::System, ProtocolKind::Devices]
        .into_iter()
        .collect()
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_discovery_interval() -> u64 {
    300
}

fn default_unit_id() -> u8 {
    1
}

/// A power meter read directly over Modbus TCP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModbusConfig {
    pub address: SocketAddr,
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
    pub serial_number: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub host: String,
    #[serde(default = "default_scan_interval")]
    pub scan_interval_seconds: u64,
    #[serde(default = "default_endpoints")]
    pub enabled_endpoints: BTreeSet<ProtocolKind>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Consecutive all-source failures before a device is reported disconnected.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_discovery_interval")]
    pub discovery_interval_seconds: u64,
    #[serde(default)]
    pub modbus: Option<ModbusConfig>,
}

impl GatewayConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            scan_interval_seconds: default_scan_interval(),
            enabled_endpoints: default_endpoints(),
            request_timeout_ms: default_request_timeout_ms(),
            failure_threshold: default_failure_threshold(),
            discovery_interval_seconds: default_discovery_interval(),
            modbus: None,
        }
    }

    pub fn with_scan_interval(mut self, seconds: u64) -> Self {
        self.scan_interval_seconds = seconds;
        self
    }

    pub fn with_endpoints(mut self, endpoints: impl IntoIterator<Item = ProtocolKind>) -> Self {
        self.enabled_endpoints = endpoints.into_iter().collect();
        self
    }

    pub fn with_modbus(mut self, modbus: ModbusConfig) -> Self {
        self.enabled_endpoints.insert(ProtocolKind::Modbus);
        self.modbus = Some(modbus);
        self
    }

    /// The host with any scheme prefix and trailing slashes removed.
    pub fn normalized_host(&self) -> &str {
        let host = self.host.trim();
        let host = host
            .strip_prefix("http://")
            .or_else(|| host.strip_prefix("https://"))
            .unwrap_or(host);
        host.trim_end_matches('/')
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.normalized_host().is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        if !(MIN_SCAN_INTERVAL_SECONDS..=MAX_SCAN_INTERVAL_SECONDS)
            .contains(&self.scan_interval_seconds)
        {
            return Err(ConfigError::ScanIntervalOutOfRange(
                self.scan_interval_seconds,
            ));
        }
        if self.enabled_endpoints.is_empty() {
            return Err(ConfigError::NoEndpoints);
        }
        if self.failure_threshold == 0 {
            return Err(ConfigError::ZeroFailureThreshold);
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::ZeroRequestTimeout);
        }
        if self.enabled_endpoints.contains(&ProtocolKind::Modbus) && self.modbus.is_none() {
            return Err(ConfigError::MissingEndpointConfig(ProtocolKind::Modbus));
        }
        Ok(())
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_seconds)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_seconds)
    }

    /// Per-request deadline, always strictly shorter than the scan interval.
    pub fn request_timeout(&self) -> Duration {
        let ceiling_ms = self.scan_interval_seconds.saturating_mul(800);
        Duration::from_millis(self.request_timeout_ms.min(ceiling_ms))
    }

    /// Reads the configuration from `ZAP_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let host = lookup("ZAP_HOST").ok_or(ConfigError::EmptyHost)?;
        let mut config = GatewayConfig::new(host);

        if let Some(seconds) = parse_var(&lookup, "ZAP_SCAN_INTERVAL")? {
            config.scan_interval_seconds = seconds;
        }
        if let Some(list) = lookup("ZAP_ENDPOINTS") {
            config.enabled_endpoints = list
                .split(',')
                .filter(|item| !item.trim().is_empty())
                .map(ProtocolKind::from_str)
                .collect::<Result<_, _>>()?;
        }
        if let Some(ms) = parse_var(&lookup, "ZAP_REQUEST_TIMEOUT_MS")? {
            config.request_timeout_ms = ms;
        }
        if let Some(threshold) = parse_var(&lookup, "ZAP_FAILURE_THRESHOLD")? {
            config.failure_threshold = threshold;
        }
        if let Some(seconds) = parse_var(&lookup, "ZAP_DISCOVERY_INTERVAL")? {
            config.discovery_interval_seconds = seconds;
        }
        if let Some(address) = parse_var::<SocketAddr>(&lookup, "ZAP_MODBUS")? {
            let unit_id = parse_var(&lookup, "ZAP_MODBUS_UNIT")?.unwrap_or_else(default_unit_id);
            let serial_number = lookup("ZAP_MODBUS_SERIAL")
                .filter(|sn| !sn.trim().is_empty())
                .unwrap_or_else(|| address.to_string());
            config.modbus = Some(ModbusConfig {
                address,
                unit_id,
                serial_number,
            });
        }

        config.validate()?;
        Ok(config)
    }
}

/// Missing or blank variables are `None`; anything else must parse.
fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                reason: e.to_string(),
            }),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::new("192.168.1.50");
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.scan_interval(), Duration::from_secs(10));
        assert_eq!(config.failure_threshold, 3);
        assert_eq!(config.request_timeout(), Duration::from_secs(8));
        assert!(!config.enabled_endpoints.contains(&ProtocolKind::Modbus));
    }

    #[test]
    fn test_host_normalization() {
        assert_eq!(
            GatewayConfig::new("http://zap.local/").normalized_host(),
            "zap.local"
        );
        assert_eq!(
            GatewayConfig::new(" https://10.0.0.2:8080// ").normalized_host(),
            "10.0.0.2:8080"
        );
        assert_eq!(
            GatewayConfig::new("http:///").validate(),
            Err(ConfigError::EmptyHost)
        );
        assert_eq!(GatewayConfig::new("").validate(), Err(ConfigError::EmptyHost));
    }

    #[test]
    fn test_scan_interval_bounds() {
        for seconds in [0, 3601, u64::MAX] {
            assert_eq!(
                GatewayConfig::new("zap.local")
                    .with_scan_interval(seconds)
                    .validate(),
                Err(ConfigError::ScanIntervalOutOfRange(seconds))
            );
        }
        for seconds in [1, 3600] {
            assert!(GatewayConfig::new("zap.local")
                .with_scan_interval(seconds)
                .validate()
                .is_ok());
        }
    }

    #[test]
    fn test_rejects_unusable_settings() {
        let no_endpoints = GatewayConfig::new("zap.local").with_endpoints([]);
        assert_eq!(no_endpoints.validate(), Err(ConfigError::NoEndpoints));

        let mut zero_threshold = GatewayConfig::new("zap.local");
        zero_threshold.failure_threshold = 0;
        assert_eq!(
            zero_threshold.validate(),
            Err(ConfigError::ZeroFailureThreshold)
        );

        let mut zero_timeout = GatewayConfig::new("zap.local");
        zero_timeout.request_timeout_ms = 0;
        assert_eq!(zero_timeout.validate(), Err(ConfigError::ZeroRequestTimeout));

        let modbus_without_target =
            GatewayConfig::new("zap.local").with_endpoints([ProtocolKind::Modbus]);
        assert_eq!(
            modbus_without_target.validate(),
            Err(ConfigError::MissingEndpointConfig(ProtocolKind::Modbus))
        );
    }

    #[test]
    fn test_request_timeout_is_clamped_below_interval() {
        let config = GatewayConfig::new("zap.local").with_scan_interval(1);
        assert_eq!(config.request_timeout(), Duration::from_millis(800));

        let mut short = GatewayConfig::new("zap.local").with_scan_interval(60);
        short.request_timeout_ms = 2_500;
        assert_eq!(short.request_timeout(), Duration::from_millis(2_500));
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: GatewayConfig = serde_json::from_str(
            r#"{
                "host": "zap.local",
                "enabled_endpoints": ["p1", "modbus"],
                "modbus": {"address": "192.168.1.60:502", "serial_number": "shelly-1"}
            }"#,
        )
        .unwrap();

        assert_eq!(config.scan_interval_seconds, 10);
        assert_eq!(config.modbus.as_ref().unwrap().unit_id, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_lookup() {
        let config = GatewayConfig::from_lookup(lookup_from(&[
            ("ZAP_HOST", "http://zap.local"),
            ("ZAP_SCAN_INTERVAL", "30"),
            ("ZAP_ENDPOINTS", "P1, system,modbus"),
            ("ZAP_FAILURE_THRESHOLD", "5"),
            ("ZAP_MODBUS", "192.168.1.60:502"),
        ]))
        .unwrap();

        assert_eq!(config.normalized_host(), "zap.local");
        assert_eq!(config.scan_interval_seconds, 30);
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.enabled_endpoints.len(), 3);
        let modbus = config.modbus.unwrap();
        assert_eq!(modbus.unit_id, 1);
        assert_eq!(modbus.serial_number, "192.168.1.60:502");
    }

    #[test]
    fn test_from_lookup_rejects_bad_values() {
        assert_eq!(
            GatewayConfig::from_lookup(lookup_from(&[])),
            Err(ConfigError::EmptyHost)
        );
        assert!(matches!(
            GatewayConfig::from_lookup(lookup_from(&[
                ("ZAP_HOST", "zap.local"),
                ("ZAP_SCAN_INTERVAL", "soon"),
            ])),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            GatewayConfig::from_lookup(lookup_from(&[
                ("ZAP_HOST", "zap.local"),
                ("ZAP_ENDPOINTS", "p1,ocpp"),
            ])),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert_eq!(
            GatewayConfig::from_lookup(lookup_from(&[
                ("ZAP_HOST", "zap.local"),
                ("ZAP_SCAN_INTERVAL", "0"),
            ])),
            Err(ConfigError::ScanIntervalOutOfRange(0))
        );
    }
}
