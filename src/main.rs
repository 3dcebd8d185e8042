use anyhow::Context;
use std::env;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use zap_coordinator::{GatewayConfig, GatewayManager, GatewaySnapshot};

const GATEWAY_ID: &str = "zap";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = GatewayConfig::from_env().context("Invalid ZAP_* configuration")?;
    let json_output = env::var("ZAP_JSON")
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    info!(
        host = config.normalized_host(),
        interval_s = config.scan_interval_seconds,
        endpoints = ?config.enabled_endpoints,
        "Starting Zap coordinator"
    );

    let manager = GatewayManager::new();
    manager
        .connect_gateway(GATEWAY_ID, config)
        .await
        .context("Could not start gateway")?;
    let mut subscription = manager
        .subscribe(GATEWAY_ID)
        .context("Gateway vanished after start")?;

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
            next = subscription.next() => match next {
                Some(snapshot) => report(&snapshot, json_output),
                None => {
                    warn!("Snapshot stream ended");
                    break;
                }
            }
        }
    }

    manager.shutdown().await;
    Ok(())
}

fn report(snapshot: &GatewaySnapshot, json_output: bool) {
    if json_output {
        match serde_json::to_string(snapshot) {
            Ok(line) => println!("{line}"),
            Err(e) => warn!(error = %e, "Could not serialize snapshot"),
        }
        return;
    }
    info!(
        gateway = %snapshot.gateway_id,
        tick = snapshot.tick,
        outcome = ?snapshot.outcome,
        devices = snapshot.devices.len(),
        "Snapshot"
    );
    for device in &snapshot.devices {
        let name = snapshot
            .device_info(&device.serial_number)
            .and_then(|info| info.display_name.as_deref())
            .unwrap_or_default();
        info!(
            device = %device.serial_number,
            name,
            status = ?device.connection_status,
            metrics = device.metrics.len(),
            failures = device.consecutive_failures,
            "Device"
        );
        for measurement in device.metrics.values() {
            info!(
                device = %device.serial_number,
                "  {} = {} {}",
                measurement.metric_code, measurement.value, measurement.unit
            );
        }
    }
}
