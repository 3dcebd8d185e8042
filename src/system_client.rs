use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;

use crate::codec::{self, MeasurementCodec, RawPayload};
use crate::error::Result;
use crate::measurement::{Device, Measurement, MetricKind};
use crate::protocol::{ProtocolClient, ProtocolKind};
use crate::zap_api::ZapApi;

/// Reads the gateway's own health from `/api/system`.
pub struct SystemClient {
    api: Arc<ZapApi>,
    codec: MeasurementCodec,
}

impl SystemClient {
    pub fn new(api: Arc<ZapApi>, codec: MeasurementCodec) -> Self {
        Self { api, codec }
    }
}

#[async_trait]
impl ProtocolClient for SystemClient {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::System
    }

    async fn discover(&self) -> Result<Vec<Device>> {
        let body = self.api.system().await?;
        let identity = codec::decode_system_identity(&body)?;
        self.api.remember_identity(identity.clone());

        let mut device = Device::new(&identity.device_id)
            .with_display_name(format!("Zap {}", identity.device_id))
            .with_capabilities([
                MetricKind::Temperature,
                MetricKind::Duration,
                MetricKind::Memory,
                MetricKind::SignalStrength,
            ]);
        device.model = Some("Zap".to_string());
        device.firmware_version = identity.firmware_version;
        Ok(vec![device])
    }

    async fn fetch(&self, _device: &Device) -> Result<Vec<Measurement>> {
        let body = self.api.system().await?;
        self.codec
            .decode(ProtocolKind::System, RawPayload::Text(&body), Utc::now())
    }

    async fn test_connection(&self) -> bool {
        match self.api.system().await {
            Ok(body) => codec::decode_system_identity(&body).is_ok(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod test_system_client {
    use super::*;
    use crate::error::ZapError;
    use std::time::Duration;

    const SYSTEM_BODY: &str = r#"{
        "temperature_celsius": 45.5,
        "uptime_seconds": 86400,
        "memory_kb": {"percent_used": 65.2, "free": 1024},
        "zap": {
            "deviceId": "zap-0001",
            "firmwareVersion": "1.8.50",
            "network": {"rssi": -45}
        }
    }"#;

    fn client_for(server: &mockito::ServerGuard) -> (SystemClient, Arc<ZapApi>) {
        let api = Arc::new(ZapApi::new(&server.host_with_port(), Duration::from_secs(2)).unwrap());
        (
            SystemClient::new(api.clone(), MeasurementCodec::default()),
            api,
        )
    }

    #[tokio::test]
    async fn test_discover_remembers_identity() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/system")
            .with_status(200)
            .with_body(SYSTEM_BODY)
            .expect(1)
            .create_async()
            .await;

        let (client, api) = client_for(&server);
        let devices = client.discover().await.unwrap();
        let identity = api.identity().await.unwrap();

        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].serial_number, "zap-0001");
        assert_eq!(devices[0].display_name.as_deref(), Some("Zap zap-0001"));
        assert_eq!(identity.device_id, "zap-0001");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_extracts_health_fields() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/system")
            .with_status(200)
            .with_body(SYSTEM_BODY)
            .create_async()
            .await;

        let (client, _) = client_for(&server);
        let measurements = client.fetch(&Device::new("zap-0001")).await.unwrap();
        let value = |code: &str| {
            measurements
                .iter()
                .find(|m| m.metric_code == code)
                .map(|m| m.value)
        };

        assert_eq!(value("system.temperature"), Some(45.5));
        assert_eq!(value("system.uptime"), Some(86400.0));
        assert_eq!(value("system.memory_used"), Some(65.2));
        assert_eq!(value("system.memory_free"), Some(1024.0));
        assert_eq!(value("system.signal_strength"), Some(-45.0));
    }

    #[tokio::test]
    async fn test_missing_device_id_fails_discovery() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/system")
            .with_status(200)
            .with_body(r#"{"temperature_celsius": 40}"#)
            .create_async()
            .await;

        let (client, _) = client_for(&server);

        assert!(matches!(
            client.discover().await,
            Err(ZapError::Protocol { .. })
        ));
        assert!(!client.test_connection().await);
    }
}
