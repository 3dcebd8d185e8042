//! One polling loop per gateway.
//!
//! Each tick discovers devices when due, fetches every (client, device) pair
//! concurrently with its own deadline, merges the results into the
//! [`SnapshotCache`] and publishes a [`GatewaySnapshot`]. Ticks run one at a
//! time inside a single task, so they never overlap. Discovery and fetching
//! share one deadline per tick that ends before the next tick is due.

use chrono::{DateTime, Utc};
use serde_derive::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{GatewayConfig, MAX_SCAN_INTERVAL_SECONDS, MIN_SCAN_INTERVAL_SECONDS};
use crate::error::{ConfigError, Result, ZapError};
use crate::measurement::{Device, DeviceSnapshot};
use crate::protocol::ProtocolClient;
use crate::registry::DeviceRegistry;
use crate::snapshot_cache::{DeviceUpdate, SnapshotCache};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TickOutcome {
    Success,
    PartialFailure,
    TotalFailure,
}

/// Everything a gateway knew at the end of one tick.
#[derive(Debug, Clone, Serialize)]
pub struct GatewaySnapshot {
    pub gateway_id: String,
    pub tick: u64,
    pub outcome: TickOutcome,
    pub completed_at: DateTime<Utc>,
    pub devices: Vec<Arc<DeviceSnapshot>>,
    /// Identity and capabilities of every known device, in the same order as `devices`.
    pub inventory: Vec<Device>,
}

impl GatewaySnapshot {
    pub fn device(&self, serial_number: &str) -> Option<&Arc<DeviceSnapshot>> {
        self.devices
            .iter()
            .find(|d| d.serial_number == serial_number)
    }

    pub fn device_info(&self, serial_number: &str) -> Option<&Device> {
        self.inventory
            .iter()
            .find(|d| d.serial_number == serial_number)
    }
}

type Published = Option<Arc<GatewaySnapshot>>;

/// A stream of gateway snapshots, one per completed tick.
///
/// The first call to [`Subscription::next`] returns the latest snapshot if one
/// exists. Ticks that complete while nobody is reading coalesce into the most
/// recent one. Returns `None` once the gateway is torn down.
pub struct Subscription {
    rx: watch::Receiver<Published>,
    cancel: CancellationToken,
    pending: Published,
}

impl Subscription {
    fn new(mut rx: watch::Receiver<Published>, cancel: CancellationToken) -> Self {
        let pending = rx.borrow_and_update().clone();
        Self {
            rx,
            cancel,
            pending,
        }
    }

    pub async fn next(&mut self) -> Option<Arc<GatewaySnapshot>> {
        if self.cancel.is_cancelled() {
            return None;
        }
        if let Some(snapshot) = self.pending.take() {
            return Some(snapshot);
        }
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                changed = self.rx.changed() => changed.ok()?,
            }
            if let Some(snapshot) = self.rx.borrow_and_update().clone() {
                return Some(snapshot);
            }
        }
    }

    pub fn latest(&self) -> Option<Arc<GatewaySnapshot>> {
        self.rx.borrow().clone()
    }
}

async fn within<T>(
    deadline: Instant,
    target: String,
    request: impl Future<Output = Result<T>>,
) -> Result<T> {
    let budget = deadline.saturating_duration_since(Instant::now());
    tokio::time::timeout_at(deadline, request)
        .await
        .unwrap_or_else(|_| {
            Err(ZapError::Timeout {
                target,
                timeout_ms: budget.as_millis() as u64,
            })
        })
}

pub struct Coordinator {
    gateway_id: String,
    clients: Vec<Arc<dyn ProtocolClient>>,
    registry: DeviceRegistry,
    cache: Arc<SnapshotCache>,
    scan_interval: Duration,
    request_timeout: Duration,
    discovery_interval: Duration,
    failure_threshold: u32,
    last_discovery: Option<Instant>,
    tick: u64,
    publisher: watch::Sender<Published>,
    cancel: CancellationToken,
}

impl Coordinator {
    /// Fails when `config` does not validate; nothing is started either way.
    pub fn new(
        gateway_id: impl Into<String>,
        config: &GatewayConfig,
        clients: Vec<Arc<dyn ProtocolClient>>,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        let (publisher, _) = watch::channel(None);
        Ok(Self {
            gateway_id: gateway_id.into(),
            clients,
            registry: DeviceRegistry::new(),
            cache: Arc::new(SnapshotCache::new()),
            scan_interval: config.scan_interval(),
            request_timeout: config.request_timeout(),
            discovery_interval: config.discovery_interval(),
            failure_threshold: config.failure_threshold,
            last_discovery: None,
            tick: 0,
            publisher,
            cancel: CancellationToken::new(),
        })
    }

    pub fn gateway_id(&self) -> &str {
        &self.gateway_id
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn cache(&self) -> Arc<SnapshotCache> {
        self.cache.clone()
    }

    pub fn current(&self) -> Option<Arc<GatewaySnapshot>> {
        self.publisher.borrow().clone()
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription::new(self.publisher.subscribe(), self.cancel.clone())
    }

    fn discovery_due(&self) -> bool {
        self.registry.is_empty()
            || self
                .last_discovery
                .map_or(true, |at| at.elapsed() >= self.discovery_interval)
    }

    /// Point in time after which a tick stops waiting on its sources.
    fn tick_deadline(&self, started: Instant) -> Instant {
        started + self.scan_interval * 4 / 5
    }

    fn request_deadline(&self, tick_deadline: Instant) -> Instant {
        tick_deadline.min(Instant::now() + self.request_timeout)
    }

    /// Asks every client for its devices. Returns false when every client failed.
    async fn discover(&mut self, tick_deadline: Instant) -> bool {
        let deadline = self.request_deadline(tick_deadline);
        let mut tasks = JoinSet::new();
        for (source, client) in self.clients.iter().enumerate() {
            let client = client.clone();
            tasks.spawn(async move {
                let target = format!("{} discovery", client.kind());
                (source, within(deadline, target, client.discover()).await)
            });
        }

        let mut results = Vec::with_capacity(self.clients.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => error!(gateway = %self.gateway_id, error = %e, "Discovery task failed"),
            }
        }
        // Register in client order so device order is stable across runs.
        results.sort_by_key(|(source, _)| *source);

        let mut any_succeeded = false;
        for (source, result) in results {
            let protocol = self.clients[source].kind();
            match result {
                Ok(devices) => {
                    any_succeeded = true;
                    for device in devices {
                        let serial = device.serial_number.clone();
                        if self.registry.register(source, device) {
                            info!(gateway = %self.gateway_id, device = %serial, %protocol, "Discovered device");
                        }
                    }
                }
                Err(e) => {
                    warn!(gateway = %self.gateway_id, %protocol, error = %e, "Discovery failed, keeping known devices");
                }
            }
        }
        if any_succeeded {
            self.last_discovery = Some(Instant::now());
        }
        any_succeeded
    }

    /// Runs one poll cycle and publishes its snapshot. Returns `None` when the
    /// gateway was torn down before the cycle finished.
    pub async fn tick(&mut self) -> Option<Arc<GatewaySnapshot>> {
        let tick_deadline = self.tick_deadline(Instant::now());
        let discovery_failed = self.discovery_due() && !self.discover(tick_deadline).await;

        let pairs = self.registry.fetch_pairs();
        let deadline = self.request_deadline(tick_deadline);
        let mut updates: HashMap<String, DeviceUpdate> = HashMap::new();
        let mut tasks = JoinSet::new();
        for (source, device) in pairs.iter().cloned() {
            // Counted as failed until the fetch reports back.
            updates
                .entry(device.serial_number.clone())
                .or_default()
                .failed += 1;
            let client = self.clients[source].clone();
            tasks.spawn(async move {
                let target = format!("{} {}", client.kind(), device.serial_number);
                let result = within(deadline, target, client.fetch(&device)).await;
                (source, device.serial_number, result)
            });
        }

        let mut succeeded = 0usize;
        while let Some(joined) = tasks.join_next().await {
            let (source, serial, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!(gateway = %self.gateway_id, error = %e, "Fetch task failed");
                    continue;
                }
            };
            let protocol = self.clients[source].kind();
            match result {
                Ok(measurements) => {
                    debug!(gateway = %self.gateway_id, device = %serial, %protocol, count = measurements.len(), "Fetched");
                    self.registry
                        .extend_capabilities(&serial, measurements.iter().map(|m| m.kind));
                    succeeded += 1;
                    if let Some(update) = updates.get_mut(&serial) {
                        update.failed -= 1;
                        update.succeeded += 1;
                        update.measurements.extend(measurements);
                    }
                }
                Err(e) => {
                    warn!(gateway = %self.gateway_id, device = %serial, %protocol, error = %e, "Fetch failed");
                }
            }
        }

        if self.cancel.is_cancelled() {
            return None;
        }

        let now = Utc::now();
        let mut devices = Vec::with_capacity(self.registry.len());
        for device in self.registry.devices() {
            let update = updates.remove(&device.serial_number).unwrap_or_default();
            devices.push(self.cache.merge(
                &device.serial_number,
                update,
                self.failure_threshold,
                now,
            ));
        }

        let outcome = if pairs.is_empty() {
            if discovery_failed {
                TickOutcome::TotalFailure
            } else {
                TickOutcome::Success
            }
        } else if succeeded == pairs.len() {
            TickOutcome::Success
        } else if succeeded == 0 {
            TickOutcome::TotalFailure
        } else {
            TickOutcome::PartialFailure
        };

        self.tick += 1;
        let snapshot = Arc::new(GatewaySnapshot {
            gateway_id: self.gateway_id.clone(),
            tick: self.tick,
            outcome,
            completed_at: now,
            devices,
            inventory: self.registry.devices().cloned().collect(),
        });
        debug!(gateway = %self.gateway_id, tick = self.tick, ?outcome, "Tick complete");
        self.publisher.send_replace(Some(snapshot.clone()));
        Some(snapshot)
    }

    /// Starts the polling loop on the runtime.
    pub fn spawn(self) -> GatewayHandle {
        let (interval_tx, interval_rx) = watch::channel(self.scan_interval);
        let refresh = Arc::new(Notify::new());
        let handle_parts = (
            self.gateway_id.clone(),
            self.cancel.clone(),
            self.publisher.subscribe(),
            self.cache.clone(),
        );
        let task = tokio::spawn(self.run(interval_rx, refresh.clone()));
        let (gateway_id, cancel, snapshots, cache) = handle_parts;
        GatewayHandle {
            gateway_id,
            cancel,
            interval_tx,
            refresh,
            snapshots,
            cache,
            task: Some(task),
        }
    }

    async fn run(mut self, mut interval_rx: watch::Receiver<Duration>, refresh: Arc<Notify>) {
        let mut period = *interval_rx.borrow_and_update();
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pending_period: Option<Duration> = None;
        let cancel = self.cancel.clone();
        info!(gateway = %self.gateway_id, interval_s = period.as_secs(), "Polling started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
                _ = refresh.notified() => {
                    debug!(gateway = %self.gateway_id, "Refresh requested");
                    ticker.reset();
                }
                changed = interval_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    pending_period = Some(*interval_rx.borrow_and_update());
                    continue;
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.tick() => {}
            }

            if let Some(next) = pending_period.take() {
                if next != period {
                    period = next;
                    self.scan_interval = period;
                    ticker = interval_at(Instant::now() + period, period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    info!(gateway = %self.gateway_id, interval_s = period.as_secs(), "Scan interval changed");
                }
            }
        }
        info!(gateway = %self.gateway_id, "Polling stopped");
    }
}

/// Control side of a running gateway loop. Dropping it stops the loop.
pub struct GatewayHandle {
    gateway_id: String,
    cancel: CancellationToken,
    interval_tx: watch::Sender<Duration>,
    refresh: Arc<Notify>,
    snapshots: watch::Receiver<Published>,
    cache: Arc<SnapshotCache>,
    task: Option<JoinHandle<()>>,
}

impl GatewayHandle {
    pub fn gateway_id(&self) -> &str {
        &self.gateway_id
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription::new(self.snapshots.clone(), self.cancel.clone())
    }

    pub fn latest(&self) -> Option<Arc<GatewaySnapshot>> {
        self.snapshots.borrow().clone()
    }

    pub fn current(&self, serial_number: &str) -> Option<Arc<DeviceSnapshot>> {
        self.cache.get(serial_number)
    }

    /// Changes the cadence; the tick already scheduled still fires on the old one.
    pub fn set_interval(&self, period: Duration) -> std::result::Result<(), ConfigError> {
        let seconds = period.as_secs();
        if !(MIN_SCAN_INTERVAL_SECONDS..=MAX_SCAN_INTERVAL_SECONDS).contains(&seconds)
            || period.subsec_nanos() != 0
        {
            return Err(ConfigError::ScanIntervalOutOfRange(seconds));
        }
        self.interval_tx.send_replace(period);
        Ok(())
    }

    /// Runs a tick as soon as the current one (if any) finishes.
    pub fn request_refresh(&self) {
        self.refresh.notify_one();
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Cancels the loop, dropping any in-flight fetches, and waits for it to exit.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!(gateway = %self.gateway_id, error = %e, "Polling task ended abnormally");
            }
        }
    }
}

impl Drop for GatewayHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
