use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

use crate::codec::{self, SystemIdentity};
use crate::error::{Result, ZapError};

/// HTTP transport for a gateway's local REST API (`http://{host}/api`).
///
/// Bodies are returned as text so decoding stays in the codec.
pub struct ZapApi {
    base_url: String,
    client: reqwest::Client,
    timeout: Duration,
    identity: Mutex<Option<SystemIdentity>>,
}

impl ZapApi {
    pub fn new(host: &str, timeout: Duration) -> Result<Self> {
        let base_url = format!("http://{host}/api");
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ZapError::connection(&base_url, e))?;
        Ok(Self {
            base_url,
            client,
            timeout,
            identity: Mutex::new(None),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_text(&self, endpoint: &str) -> Result<String> {
        let url = format!("{}{}", self.base_url, endpoint);
        let timeout_ms = self.timeout.as_millis() as u64;
        debug!(url = %url, "GET");
        let text = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| ZapError::from_http(&url, timeout_ms, e))?
            .text()
            .await
            .map_err(|e| ZapError::from_http(&url, timeout_ms, e))?;
        Ok(text)
    }

    pub async fn p1_obis(&self) -> Result<String> {
        self.get_text("/data/p1/obis").await
    }

    pub async fn system(&self) -> Result<String> {
        self.get_text("/system").await
    }

    pub async fn devices(&self) -> Result<String> {
        self.get_text("/devices").await
    }

    pub async fn device_data(&self, serial_number: &str) -> Result<String> {
        self.get_text(&format!("/devices/{serial_number}/data/json"))
            .await
    }

    pub async fn device_ders(&self, serial_number: &str) -> Result<String> {
        self.get_text(&format!("/devices/{serial_number}/ders"))
            .await
    }

    /// The gateway's own identity. Fetched once and remembered, since the
    /// device id of a gateway never changes while it is configured.
    pub async fn identity(&self) -> Result<SystemIdentity> {
        if let Some(identity) = self.cached_identity() {
            return Ok(identity);
        }
        let identity = codec::decode_system_identity(&self.system().await?)?;
        self.remember_identity(identity.clone());
        Ok(identity)
    }

    pub(crate) fn remember_identity(&self, identity: SystemIdentity) {
        *self.identity.lock().unwrap_or_else(PoisonError::into_inner) = Some(identity);
    }

    fn cached_identity(&self) -> Option<SystemIdentity> {
        self.identity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
