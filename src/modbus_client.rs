use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tokio_modbus::prelude::*;
use tracing::{debug, info, warn};

use crate::codec::{MeasurementCodec, RawPayload, RegisterBlock, RegisterField};
use crate::config::ModbusConfig;
use crate::error::{Result, ZapError};
use crate::measurement::{Device, Measurement, MetricKind};
use crate::protocol::{ProtocolClient, ProtocolKind};

const fn field(code: &'static str, kind: MetricKind, unit: &'static str) -> RegisterField {
    RegisterField { code, kind, unit }
}

const TOTALS: [RegisterField; 3] = [
    field("modbus.total_current", MetricKind::Current, "A"),
    field("modbus.total_active_power", MetricKind::Power, "W"),
    field("modbus.total_apparent_power", MetricKind::Power, "VA"),
];

const fn phase(prefix: &'static [&'static str; 5]) -> [RegisterField; 5] {
    [
        field(prefix[0], MetricKind::Voltage, "V"),
        field(prefix[1], MetricKind::Current, "A"),
        field(prefix[2], MetricKind::Power, "W"),
        field(prefix[3], MetricKind::Power, "VA"),
        field(prefix[4], MetricKind::PowerFactor, ""),
    ]
}

const PHASE_A: [RegisterField; 5] = phase(&[
    "modbus.l1_voltage",
    "modbus.l1_current",
    "modbus.l1_active_power",
    "modbus.l1_apparent_power",
    "modbus.l1_power_factor",
]);
const PHASE_B: [RegisterField; 5] = phase(&[
    "modbus.l2_voltage",
    "modbus.l2_current",
    "modbus.l2_active_power",
    "modbus.l2_apparent_power",
    "modbus.l2_power_factor",
]);
const PHASE_C: [RegisterField; 5] = phase(&[
    "modbus.l3_voltage",
    "modbus.l3_current",
    "modbus.l3_active_power",
    "modbus.l3_apparent_power",
    "modbus.l3_power_factor",
]);

/// Input register layout of a three-phase energy meter (Shelly Pro 3EM).
/// Registers are documented at: https://shelly-api-docs.shelly.cloud/gen2/ComponentsAndServices/EM/#modbus-registers
pub static THREE_PHASE_METER: [RegisterBlock; 4] = [
    RegisterBlock {
        start: 1011,
        fields: &TOTALS,
    },
    RegisterBlock {
        start: 1020,
        fields: &PHASE_A,
    },
    RegisterBlock {
        start: 1040,
        fields: &PHASE_B,
    },
    RegisterBlock {
        start: 1060,
        fields: &PHASE_C,
    },
];

/// Reads a meter over Modbus TCP, keeping one connection open between polls.
pub struct ModbusClient {
    config: ModbusConfig,
    blocks: &'static [RegisterBlock],
    codec: MeasurementCodec,
    connection: Mutex<Option<client::Context>>,
}

impl ModbusClient {
    pub fn new(config: ModbusConfig, codec: MeasurementCodec) -> Self {
        Self::with_blocks(config, &THREE_PHASE_METER, codec)
    }

    pub fn with_blocks(
        config: ModbusConfig,
        blocks: &'static [RegisterBlock],
        codec: MeasurementCodec,
    ) -> Self {
        Self {
            config,
            blocks,
            codec,
            connection: Mutex::new(None),
        }
    }

    fn target(&self) -> String {
        self.config.address.to_string()
    }

    async fn connect(&self) -> Result<client::Context> {
        debug!(address = %self.config.address, unit = self.config.unit_id, "Connecting to Modbus meter");
        let context = tcp::connect_slave(self.config.address, Slave(self.config.unit_id))
            .await
            .map_err(|e| ZapError::connection(self.target(), e))?;
        info!(address = %self.config.address, "Connected to Modbus meter");
        Ok(context)
    }

    /// Reads every register block. Any failure drops the connection so the
    /// next poll starts from a fresh one.
    async fn read_all(&self) -> Result<Vec<Measurement>> {
        let mut connection = self.connection.lock().await;
        if connection.is_none() {
            *connection = Some(self.connect().await?);
        }
        let Some(context) = connection.as_mut() else {
            return Err(ZapError::connection(self.target(), "no connection available"));
        };

        let result = self.read_blocks(context).await;
        if let Err(e) = &result {
            warn!(address = %self.config.address, error = %e, "Modbus read failed, reconnecting next poll");
            *connection = None;
        }
        result
    }

    async fn read_blocks(&self, context: &mut client::Context) -> Result<Vec<Measurement>> {
        let timestamp = Utc::now();
        let mut measurements = Vec::new();
        for block in self.blocks {
            // tokio-modbus returns Result<Result<Vec<u16>, ExceptionCode>, Error>
            let words = match context
                .read_input_registers(block.start, block.register_count())
                .await
            {
                Ok(Ok(words)) => words,
                Ok(Err(exception)) => {
                    return Err(ZapError::protocol(
                        self.target(),
                        format!("Modbus exception at {}: {:?}", block.start, exception),
                    ))
                }
                Err(e) => return Err(ZapError::connection(self.target(), e)),
            };
            measurements.extend(self.codec.decode(
                ProtocolKind::Modbus,
                RawPayload::Registers {
                    block,
                    words: &words,
                },
                timestamp,
            )?);
        }
        Ok(measurements)
    }
}

#[async_trait]
impl ProtocolClient for ModbusClient {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Modbus
    }

    async fn discover(&self) -> Result<Vec<Device>> {
        let measurements = self.read_all().await?;
        let mut device = Device::new(&self.config.serial_number)
            .with_display_name(format!("Meter {}", self.config.serial_number))
            .with_capabilities(measurements.iter().map(|m| m.kind));
        device.model = Some("Modbus meter".to_string());
        Ok(vec![device])
    }

    async fn fetch(&self, _device: &Device) -> Result<Vec<Measurement>> {
        self.read_all().await
    }

    async fn test_connection(&self) -> bool {
        self.connect().await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio_modbus::server::tcp::{accept_tcp_connection, Server};
    use tokio_modbus::server::Service;

    /// Serves fixed float values at register addresses.
    #[derive(Clone)]
    struct MockMeter {
        values: Arc<HashMap<u16, f32>>,
        should_fail: Arc<AtomicBool>,
    }

    impl Service for MockMeter {
        type Request = Request<'static>;
        type Response = Response;
        type Exception = ExceptionCode;
        type Future = std::future::Ready<std::result::Result<Response, ExceptionCode>>;

        fn call(&self, req: Self::Request) -> Self::Future {
            if self.should_fail.load(Ordering::Relaxed) {
                return std::future::ready(Err(ExceptionCode::ServerDeviceFailure));
            }
            let response = match req {
                Request::ReadInputRegisters(start, count) => {
                    let words = (0..count / 2)
                        .flat_map(|i| {
                            let bits = self
                                .values
                                .get(&(start + i * 2))
                                .copied()
                                .unwrap_or(0.0)
                                .to_bits();
                            [(bits & 0xFFFF) as u16, (bits >> 16) as u16]
                        })
                        .collect();
                    Ok(Response::ReadInputRegisters(words))
                }
                _ => Err(ExceptionCode::IllegalFunction),
            };
            std::future::ready(response)
        }
    }

    async fn start_meter(values: &[(u16, f32)]) -> (SocketAddr, Arc<AtomicBool>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let should_fail = Arc::new(AtomicBool::new(false));
        let meter = MockMeter {
            values: Arc::new(values.iter().copied().collect()),
            should_fail: should_fail.clone(),
        };
        tokio::spawn(async move {
            let server = Server::new(listener);
            let new_service = |_socket_addr| Ok(Some(meter.clone()));
            let on_connected = |stream, socket_addr| async move {
                accept_tcp_connection(stream, socket_addr, new_service)
            };
            let _ = server.serve(&on_connected, |_err| {}).await;
        });
        (addr, should_fail)
    }

    fn client_for(addr: SocketAddr) -> ModbusClient {
        ModbusClient::new(
            ModbusConfig {
                address: addr,
                unit_id: 1,
                serial_number: "shelly-1".to_string(),
            },
            MeasurementCodec::default(),
        )
    }

    #[test]
    fn test_register_layout() {
        assert_eq!(THREE_PHASE_METER[0].register_count(), 6);
        for block in &THREE_PHASE_METER[1..] {
            assert_eq!(block.register_count(), 10);
        }
    }

    #[tokio::test]
    async fn test_fetch_reads_all_blocks() {
        let (addr, _) = start_meter(&[
            (1013, 1520.5),
            (1020, 230.1),
            (1024, 500.0),
            (1040, 229.8),
            (1060, 231.0),
        ])
        .await;

        let client = client_for(addr);
        let measurements = client.fetch(&Device::new("shelly-1")).await.unwrap();
        let value = |code: &str| {
            measurements
                .iter()
                .find(|m| m.metric_code == code)
                .map(|m| m.value)
        };

        assert_eq!(measurements.len(), 18);
        assert_eq!(value("modbus.total_active_power"), Some(1520.5));
        assert_eq!(value("modbus.l1_voltage"), Some(f64::from(230.1f32)));
        assert_eq!(value("modbus.l1_active_power"), Some(500.0));
        assert_eq!(value("modbus.l3_voltage"), Some(231.0));
    }

    #[tokio::test]
    async fn test_discover_uses_configured_serial() {
        let (addr, _) = start_meter(&[(1013, 100.0)]).await;

        let client = client_for(addr);
        let devices = client.discover().await.unwrap();

        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].serial_number, "shelly-1");
        assert!(devices[0].capabilities.contains(&MetricKind::Voltage));
        assert!(devices[0].capabilities.contains(&MetricKind::PowerFactor));
        assert!(client.test_connection().await);
    }

    #[tokio::test]
    async fn test_exception_is_protocol_error_and_recovers() {
        let (addr, should_fail) = start_meter(&[(1013, 42.0)]).await;
        let client = client_for(addr);

        should_fail.store(true, Ordering::Relaxed);
        let result = client.fetch(&Device::new("shelly-1")).await;
        assert!(matches!(result, Err(ZapError::Protocol { .. })));

        should_fail.store(false, Ordering::Relaxed);
        let measurements = client.fetch(&Device::new("shelly-1")).await.unwrap();
        assert!(measurements
            .iter()
            .any(|m| m.metric_code == "modbus.total_active_power" && m.value == 42.0));
    }

    #[tokio::test]
    async fn test_unreachable_meter_is_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = client_for(addr);

        assert!(matches!(
            client.fetch(&Device::new("shelly-1")).await,
            Err(ZapError::Connection { .. })
        ));
        assert!(!client.test_connection().await);
    }
}
