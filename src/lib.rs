//! Zap gateway telemetry coordination
//!
//! This library polls Sourceful Zap gateways over several local protocols
//! (P1 OBIS, the system and devices REST endpoints, Modbus TCP), decodes the
//! vendor payloads into typed measurements and keeps a per-device snapshot
//! that stays consistent while individual protocols fail.

pub mod codec;
pub mod config;
pub mod coordinator;
pub mod der_data;
pub mod devices_client;
pub mod error;
pub mod manager;
pub mod measurement;
pub mod modbus_client;
pub mod numeric;
pub mod obis;
pub mod p1_client;
pub mod protocol;
pub mod registry;
pub mod snapshot_cache;
pub mod system_client;
pub mod zap_api;

// Re-export commonly used types for easier access
pub use codec::MeasurementCodec;
pub use config::{GatewayConfig, ModbusConfig};
pub use coordinator::{Coordinator, GatewayHandle, GatewaySnapshot, Subscription, TickOutcome};
pub use error::{ConfigError, ZapError};
pub use manager::GatewayManager;
pub use measurement::{ConnectionStatus, Device, DeviceSnapshot, Measurement, MetricKind};
pub use obis::ObisTable;
pub use protocol::{ProtocolClient, ProtocolKind};
