use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

use crate::codec::{MeasurementCodec, RawPayload};
use crate::error::Result;
use crate::measurement::{Device, Measurement, MetricKind};
use crate::protocol::{ProtocolClient, ProtocolKind};
use crate::zap_api::ZapApi;

/// Polls the smart meter attached to the gateway's P1 port.
///
/// The meter has no serial number of its own on the API, so it is reported
/// under the gateway's device id.
pub struct P1Client {
    api: Arc<ZapApi>,
    codec: MeasurementCodec,
}

impl P1Client {
    pub fn new(api: Arc<ZapApi>, codec: MeasurementCodec) -> Self {
        Self { api, codec }
    }

    async fn read(&self) -> Result<Vec<Measurement>> {
        let body = self.api.p1_obis().await?;
        self.codec
            .decode(ProtocolKind::P1, RawPayload::Text(&body), Utc::now())
    }
}

#[async_trait]
impl ProtocolClient for P1Client {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::P1
    }

    async fn discover(&self) -> Result<Vec<Device>> {
        let identity = self.api.identity().await?;
        let measurements = self.read().await?;
        if measurements.is_empty() {
            debug!(gateway = %identity.device_id, "P1 port reports no readings");
            return Ok(Vec::new());
        }
        let capabilities: BTreeSet<MetricKind> = measurements.iter().map(|m| m.kind).collect();
        let mut device = Device::new(&identity.device_id)
            .with_display_name(format!("Zap {}", identity.device_id))
            .with_capabilities(capabilities);
        device.model = Some("Zap".to_string());
        device.firmware_version = identity.firmware_version;
        Ok(vec![device])
    }

    async fn fetch(&self, _device: &Device) -> Result<Vec<Measurement>> {
        self.read().await
    }

    async fn test_connection(&self) -> bool {
        self.read().await.is_ok()
    }
}
