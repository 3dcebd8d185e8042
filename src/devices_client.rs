use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::warn;

use crate::codec::{MeasurementCodec, RawPayload};
use crate::der_data;
use crate::error::Result;
use crate::measurement::{Device, Measurement};
use crate::protocol::{ProtocolClient, ProtocolKind};
use crate::zap_api::ZapApi;

/// Reads the DERs (inverters, batteries, meters) the gateway has paired with.
pub struct DevicesClient {
    api: Arc<ZapApi>,
    codec: MeasurementCodec,
}

impl DevicesClient {
    pub fn new(api: Arc<ZapApi>, codec: MeasurementCodec) -> Self {
        Self { api, codec }
    }
}

#[async_trait]
impl ProtocolClient for DevicesClient {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Devices
    }

    async fn discover(&self) -> Result<Vec<Device>> {
        let mut devices = der_data::decode_device_list(&self.api.devices().await?)?;
        // Manufacturers only appear in the live data, not in the device list.
        for device in &mut devices {
            let sn = device.serial_number.as_str();
            match self
                .api
                .device_data(sn)
                .await
                .and_then(|body| der_data::decode_manufacturers(&body))
            {
                Ok(makes) => device.manufacturers = makes,
                Err(e) => warn!(device = %sn, error = %e, "Could not read device manufacturers"),
            }
        }
        Ok(devices)
    }

    async fn fetch(&self, device: &Device) -> Result<Vec<Measurement>> {
        let sn = device.serial_number.as_str();
        let (data, ders) = tokio::join!(self.api.device_data(sn), self.api.device_ders(sn));
        let timestamp = Utc::now();

        let mut measurements =
            self.codec
                .decode(ProtocolKind::Devices, RawPayload::Text(&data?), timestamp)?;

        // Ratings are static, so a failed `/ders` read does not fail the device.
        let ratings = ders.and_then(|body| der_data::decode_ders(&body, timestamp));
        match ratings {
            Ok(ratings) => {
                for rating in ratings {
                    if !measurements
                        .iter()
                        .any(|m| m.metric_code == rating.metric_code)
                    {
                        measurements.push(rating);
                    }
                }
            }
            Err(e) => warn!(device = %sn, error = %e, "Could not read DER ratings"),
        }
        Ok(measurements)
    }

    async fn test_connection(&self) -> bool {
        self.api.devices().await.is_ok()
    }
}

#[cfg(test)]
mod test_devices_client {
    use super::*;
    use crate::error::ZapError;
    use std::time::Duration;

    const DEVICE_LIST: &str = r#"{"devices": [
        {"sn": "INV001", "profile": "solar_edge", "ders": [{"type": "pv", "enabled": true}]},
        {"serial_number": "BAT001", "type": "battery"}
    ]}"#;

    const DEVICE_DATA: &str = r#"{
        "pv": {"W": -3200, "total_generation_Wh": 1500000, "rated_power_W": 8000},
        "battery": {"W": 500, "SoC_nom_fract": 0.85}
    }"#;

    const DERS: &str = r#"{"ders": [
        {"type": "pv", "enabled": true, "rated_power": 6000},
        {"type": "battery", "enabled": true, "capacity": 10000}
    ]}"#;

    fn client_for(server: &mockito::ServerGuard) -> DevicesClient {
        let api = ZapApi::new(&server.host_with_port(), Duration::from_secs(2)).unwrap();
        DevicesClient::new(Arc::new(api), MeasurementCodec::default())
    }

    #[tokio::test]
    async fn test_discover_lists_paired_devices() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/devices")
            .with_status(200)
            .with_body(DEVICE_LIST)
            .create_async()
            .await;

        let _inverter = server
            .mock("GET", "/api/devices/INV001/data/json")
            .with_status(200)
            .with_body(r#"{"pv": {"make": "solaredge", "W": -3200}}"#)
            .create_async()
            .await;
        let _battery = server
            .mock("GET", "/api/devices/BAT001/data/json")
            .with_status(500)
            .create_async()
            .await;

        let client = client_for(&server);
        let devices = client.discover().await.unwrap();

        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].serial_number, "INV001");
        assert_eq!(devices[0].display_name.as_deref(), Some("Solar Edge INV001"));
        assert_eq!(
            devices[0].manufacturers.get("pv").map(String::as_str),
            Some("solaredge")
        );
        assert_eq!(devices[1].serial_number, "BAT001");
        assert!(devices[1].manufacturers.is_empty());
        assert!(client.test_connection().await);
    }

    #[tokio::test]
    async fn test_fetch_merges_data_and_ratings() {
        let mut server = mockito::Server::new_async().await;
        let _data = server
            .mock("GET", "/api/devices/INV001/data/json")
            .with_status(200)
            .with_body(DEVICE_DATA)
            .create_async()
            .await;
        let _ders = server
            .mock("GET", "/api/devices/INV001/ders")
            .with_status(200)
            .with_body(DERS)
            .create_async()
            .await;

        let client = client_for(&server);
        let measurements = client.fetch(&Device::new("INV001")).await.unwrap();
        let value = |code: &str| {
            measurements
                .iter()
                .find(|m| m.metric_code == code)
                .map(|m| m.value)
        };

        assert_eq!(value("power"), Some(3700.0));
        assert_eq!(value("battery_soc"), Some(85.0));
        assert_eq!(value("capacity"), Some(10000.0));
        // The inverter's own rating wins over the DER table.
        assert_eq!(value("rated_power"), Some(8000.0));
        assert_eq!(
            measurements
                .iter()
                .filter(|m| m.metric_code == "rated_power")
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_ratings_failure_keeps_data() {
        let mut server = mockito::Server::new_async().await;
        let _data = server
            .mock("GET", "/api/devices/INV001/data/json")
            .with_status(200)
            .with_body(DEVICE_DATA)
            .create_async()
            .await;
        let _ders = server
            .mock("GET", "/api/devices/INV001/ders")
            .with_status(404)
            .create_async()
            .await;

        let client = client_for(&server);
        let measurements = client.fetch(&Device::new("INV001")).await.unwrap();

        assert!(measurements.iter().any(|m| m.metric_code == "power"));
        assert!(!measurements.iter().any(|m| m.metric_code == "capacity"));
    }

    #[tokio::test]
    async fn test_data_failure_fails_fetch() {
        let mut server = mockito::Server::new_async().await;
        let _data = server
            .mock("GET", "/api/devices/INV001/data/json")
            .with_status(503)
            .create_async()
            .await;
        let _ders = server
            .mock("GET", "/api/devices/INV001/ders")
            .with_status(200)
            .with_body(DERS)
            .create_async()
            .await;

        let client = client_for(&server);

        assert!(matches!(
            client.fetch(&Device::new("INV001")).await,
            Err(ZapError::Protocol { .. })
        ));
    }
}
