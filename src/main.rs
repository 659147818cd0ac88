use anyhow::Context;
use hover_robot_link::domain::models::PeripheralIdentity;
use hover_robot_link::domain::settings::{LinkSettings, SettingsService};
use hover_robot_link::infrastructure::bluetooth::BleTransport;
use hover_robot_link::infrastructure::logging::init_logger;
use hover_robot_link::{BluetoothService, ScanOutcome};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = SettingsService::new()?;
    let _log_guard = init_logger(&settings.get().log_settings)?;
    info!("Starting Hover Robot Link");

    let transport = platform_transport()?;
    let service = BluetoothService::new(transport, settings.link_config());

    if !service.is_radio_enabled().await {
        anyhow::bail!("Bluetooth radio is off or missing");
    }

    let link = &settings.get().link;
    match find_robot(&service, link).await? {
        Some(robot) if link.connect_after_scan => {
            info!("Connecting to {} ({})", robot.display_name(), robot.address);
            service.connect(robot).await?;
        }
        Some(robot) => info!("Found {} ({}), not connecting", robot.display_name(), robot.address),
        None => warn!("No device named {:?} found", link.target_device_name),
    }

    monitor(&service).await;

    if service.is_connected() {
        service.disconnect().await?;
    }
    info!("Shutting down");
    Ok(())
}

#[cfg(windows)]
fn platform_transport() -> anyhow::Result<Arc<dyn BleTransport>> {
    Ok(Arc::new(
        hover_robot_link::infrastructure::bluetooth::winrt::WinRtTransport::new(),
    ))
}

#[cfg(not(windows))]
fn platform_transport() -> anyhow::Result<Arc<dyn BleTransport>> {
    anyhow::bail!("No BLE backend available for this platform")
}

/// Scans until a device with the configured name shows up or the window ends.
async fn find_robot(
    service: &BluetoothService,
    link: &LinkSettings,
) -> anyhow::Result<Option<PeripheralIdentity>> {
    let mut snapshots = service.discovered_devices();
    let mut status = service.connection_status();

    if service.start_scan().await.context("Failed to start scan")? == ScanOutcome::Stopped {
        return Ok(None);
    }
    info!("Scanning for {:?}", link.target_device_name);

    loop {
        tokio::select! {
            snapshot = snapshots.recv() => match snapshot {
                Ok(devices) => {
                    if let Some(robot) = devices
                        .into_iter()
                        .find(|d| d.name.as_deref() == Some(link.target_device_name.as_str()))
                    {
                        return Ok(Some(robot));
                    }
                }
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return Ok(None),
            },
            changed = status.recv() => {
                if let Ok(s) = changed {
                    if s.is_idle() && !service.is_scanning().await {
                        return Ok(None);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                service.stop_scan().await?;
                return Ok(None);
            }
        }
    }
}

/// Logs status changes and telemetry until Ctrl-C.
async fn monitor(service: &BluetoothService) {
    let mut status = service.connection_status();
    let mut telemetry = service.telemetry();

    loop {
        tokio::select! {
            changed = status.recv() => match changed {
                Ok(s) => info!("Connection status: {:?}", s),
                Err(RecvError::Lagged(n)) => warn!("Missed {} status updates", n),
                Err(RecvError::Closed) => break,
            },
            frame = telemetry.recv() => match frame {
                Ok(f) => info!(
                    "pitch {:.2} roll {:.2} yaw {:.2} speed {}/{}",
                    f.pitch, f.roll, f.yaw, f.speed_left, f.speed_right
                ),
                Err(RecvError::Lagged(n)) => warn!("Dropped {} telemetry frames", n),
                Err(RecvError::Closed) => break,
            },
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    error!("Failed to listen for Ctrl-C: {}", e);
                }
                break;
            }
        }
    }

    let stats = service.frame_stats();
    info!("Frames accepted {}, dropped {}", stats.accepted, stats.dropped);
}
