use async_trait::async_trait;
use serde_derive::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{ConfigError, Result};
use crate::measurement::{Device, Measurement};

/// Wire protocols a gateway can be polled over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    P1,
    System,
    Devices,
    Modbus,
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProtocolKind::P1 => "p1",
            ProtocolKind::System => "system",
            ProtocolKind::Devices => "devices",
            ProtocolKind::Modbus => "modbus",
        };
        f.write_str(name)
    }
}

impl FromStr for ProtocolKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "p1" => Ok(ProtocolKind::P1),
            "system" => Ok(ProtocolKind::System),
            "devices" => Ok(ProtocolKind::Devices),
            "modbus" => Ok(ProtocolKind::Modbus),
            other => Err(ConfigError::InvalidValue {
                key: "endpoint".to_string(),
                reason: format!("unknown protocol `{other}`"),
            }),
        }
    }
}

/// The uniform contract every protocol implementation fulfils.
///
/// The coordinator only ever talks to this trait, so adding a protocol means
/// adding an implementation, never touching the scheduler. Implementations own
/// their transport and must be safe to call concurrently for different devices.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    fn kind(&self) -> ProtocolKind;

    /// Enumerates the devices reachable through this protocol. An empty list
    /// is a valid answer and distinct from an error.
    async fn discover(&self) -> Result<Vec<Device>>;

    /// Reads the latest values for one device in a single bounded request.
    async fn fetch(&self, device: &Device) -> Result<Vec<Measurement>>;

    /// Cheap reachability probe for configuration time.
    async fn test_connection(&self) -> bool;
}
