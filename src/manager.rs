use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{info, warn};

use crate::codec::MeasurementCodec;
use crate::config::GatewayConfig;
use crate::coordinator::{Coordinator, GatewayHandle, GatewaySnapshot, Subscription};
use crate::devices_client::DevicesClient;
use crate::error::ConfigError;
use crate::measurement::{Device, DeviceSnapshot};
use crate::modbus_client::ModbusClient;
use crate::p1_client::P1Client;
use crate::protocol::{ProtocolClient, ProtocolKind};
use crate::system_client::SystemClient;
use crate::zap_api::ZapApi;

/// Builds one client per enabled endpoint. The HTTP clients share one
/// transport so the gateway identity is only fetched once.
pub fn build_clients(
    config: &GatewayConfig,
    codec: &MeasurementCodec,
) -> Result<Vec<Arc<dyn ProtocolClient>>, ConfigError> {
    let api = Arc::new(
        ZapApi::new(config.normalized_host(), config.request_timeout()).map_err(|e| {
            ConfigError::InvalidValue {
                key: "host".to_string(),
                reason: e.to_string(),
            }
        })?,
    );

    let mut clients: Vec<Arc<dyn ProtocolClient>> = Vec::new();
    for kind in &config.enabled_endpoints {
        let client: Arc<dyn ProtocolClient> = match kind {
            ProtocolKind::P1 => Arc::new(P1Client::new(api.clone(), codec.clone())),
            ProtocolKind::System => Arc::new(SystemClient::new(api.clone(), codec.clone())),
            ProtocolKind::Devices => Arc::new(DevicesClient::new(api.clone(), codec.clone())),
            ProtocolKind::Modbus => {
                let modbus = config
                    .modbus
                    .clone()
                    .ok_or(ConfigError::MissingEndpointConfig(ProtocolKind::Modbus))?;
                Arc::new(ModbusClient::new(modbus, codec.clone()))
            }
        };
        clients.push(client);
    }
    Ok(clients)
}

/// Requires every client to answer its connection check within `limit`.
async fn check_clients(
    clients: &[Arc<dyn ProtocolClient>],
    limit: Duration,
) -> Result<(), ConfigError> {
    for client in clients {
        let answered = tokio::time::timeout(limit, client.test_connection())
            .await
            .unwrap_or(false);
        if !answered {
            warn!(endpoint = %client.kind(), "Connection check failed");
            return Err(ConfigError::Unreachable(client.kind()));
        }
    }
    Ok(())
}

/// Owns every configured gateway's polling loop.
#[derive(Default)]
pub struct GatewayManager {
    codec: MeasurementCodec,
    gateways: RwLock<HashMap<String, GatewayHandle>>,
}

impl GatewayManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses a custom codec (for example a vendor-specific OBIS table) for
    /// gateways added afterwards.
    pub fn with_codec(codec: MeasurementCodec) -> Self {
        Self {
            codec,
            gateways: RwLock::default(),
        }
    }

    /// Checks that every enabled endpoint of the gateway answers, without
    /// starting anything.
    pub async fn test_gateway(&self, config: &GatewayConfig) -> Result<(), ConfigError> {
        config.validate()?;
        let clients = build_clients(config, &self.codec)?;
        check_clients(&clients, config.request_timeout()).await
    }

    /// Like [`GatewayManager::add_gateway`], but only starts polling once
    /// every enabled endpoint has answered.
    pub async fn connect_gateway(
        &self,
        gateway_id: impl Into<String>,
        config: GatewayConfig,
    ) -> Result<(), ConfigError> {
        config.validate()?;
        let clients = build_clients(&config, &self.codec)?;
        check_clients(&clients, config.request_timeout()).await?;
        self.add_gateway_with_clients(gateway_id, config, clients)
    }

    /// Validates `config` and starts polling. Must be called inside a Tokio runtime.
    pub fn add_gateway(
        &self,
        gateway_id: impl Into<String>,
        config: GatewayConfig,
    ) -> Result<(), ConfigError> {
        config.validate()?;
        let clients = build_clients(&config, &self.codec)?;
        self.add_gateway_with_clients(gateway_id, config, clients)
    }

    pub fn add_gateway_with_clients(
        &self,
        gateway_id: impl Into<String>,
        config: GatewayConfig,
        clients: Vec<Arc<dyn ProtocolClient>>,
    ) -> Result<(), ConfigError> {
        let gateway_id = gateway_id.into();
        let coordinator = Coordinator::new(gateway_id.clone(), &config, clients)?;

        let mut gateways = self.gateways.write().unwrap_or_else(PoisonError::into_inner);
        if gateways.contains_key(&gateway_id) {
            return Err(ConfigError::DuplicateGateway(gateway_id));
        }
        info!(
            gateway = %gateway_id,
            host = config.normalized_host(),
            endpoints = ?config.enabled_endpoints,
            "Adding gateway"
        );
        gateways.insert(gateway_id, coordinator.spawn());
        Ok(())
    }

    /// Stops the gateway's loop and waits for it. Subscribers see end-of-stream.
    pub async fn remove_gateway(&self, gateway_id: &str) -> bool {
        let handle = self
            .gateways
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(gateway_id);
        match handle {
            Some(handle) => {
                handle.shutdown().await;
                info!(gateway = %gateway_id, "Removed gateway");
                true
            }
            None => false,
        }
    }

    /// Snapshots of one gateway, starting with the latest one if any.
    ///
    /// A slow reader does not queue up snapshots: ticks that complete while it
    /// is busy coalesce, and the next read returns the most recent one.
    pub fn subscribe(&self, gateway_id: &str) -> Option<Subscription> {
        self.gateways
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(gateway_id)
            .map(GatewayHandle::subscribe)
    }

    pub fn latest(&self, gateway_id: &str) -> Option<Arc<GatewaySnapshot>> {
        self.gateways
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(gateway_id)
            .and_then(GatewayHandle::latest)
    }

    /// The cached snapshot of a device, whichever gateway it sits behind.
    pub fn current(&self, device_id: &str) -> Option<Arc<DeviceSnapshot>> {
        self.gateways
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .find_map(|handle| handle.current(device_id))
    }

    /// Identity and capabilities of a device as of its gateway's latest tick.
    pub fn device(&self, device_id: &str) -> Option<Device> {
        self.gateways
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter_map(GatewayHandle::latest)
            .find_map(|snapshot| snapshot.device_info(device_id).cloned())
    }

    pub fn request_refresh(&self, gateway_id: &str) -> bool {
        match self
            .gateways
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(gateway_id)
        {
            Some(handle) => {
                handle.request_refresh();
                true
            }
            None => false,
        }
    }

    pub fn set_scan_interval(&self, gateway_id: &str, seconds: u64) -> Result<(), ConfigError> {
        let gateways = self.gateways.read().unwrap_or_else(PoisonError::into_inner);
        let handle = gateways
            .get(gateway_id)
            .ok_or_else(|| ConfigError::InvalidValue {
                key: "gateway".to_string(),
                reason: format!("unknown gateway `{gateway_id}`"),
            })?;
        handle.set_interval(Duration::from_secs(seconds))
    }

    pub fn gateway_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .gateways
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub async fn shutdown(&self) {
        let handles: Vec<GatewayHandle> = self
            .gateways
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in handles {
            handle.shutdown().await;
        }
    }
}
