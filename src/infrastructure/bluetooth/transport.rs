//! BLE Transport Interface
//!
//! The platform stack the link core drives. Request/response operations are
//! async methods that resolve once the platform reports completion; anything
//! the platform raises on its own arrives as a [`TransportEvent`].

use crate::domain::models::{DeviceAddress, GattEndpoint, GattService, PeripheralIdentity};
use crate::infrastructure::bluetooth::error::BleError;
use async_trait::async_trait;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Unsolicited platform callbacks.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// An advertisement was received while scanning.
    Discovered(PeripheralIdentity),
    /// The link to this peripheral dropped without being asked to. May
    /// arrive after a newer link was started.
    LinkLost(DeviceAddress),
    /// A subscribed characteristic pushed a value.
    Notification { characteristic: Uuid, value: Vec<u8> },
}

/// BLE central role as provided by the platform.
///
/// Implementations allow only one link at a time. Callers never issue two
/// GATT operations on the same link concurrently.
#[async_trait]
pub trait BleTransport: Send + Sync + 'static {
    /// Whether the Bluetooth radio is switched on.
    async fn radio_enabled(&self) -> bool;

    async fn start_scan(&self) -> Result<(), BleError>;

    async fn stop_scan(&self) -> Result<(), BleError>;

    /// Establishes the link. Resolves once the platform reports it connected.
    async fn connect(&self, peripheral: &PeripheralIdentity) -> Result<(), BleError>;

    /// Tears the link down. Resolves on acknowledgement; a no-op without a link.
    async fn disconnect(&self) -> Result<(), BleError>;

    /// Lists every service and its characteristics on the current link.
    async fn discover_services(&self) -> Result<Vec<GattService>, BleError>;

    /// Writes the CCCD enable-notifications value for `endpoint`.
    async fn enable_notifications(&self, endpoint: &GattEndpoint) -> Result<(), BleError>;

    /// Writes `data` and resolves when the peripheral acknowledges it.
    async fn write(&self, endpoint: &GattEndpoint, data: &[u8]) -> Result<(), BleError>;

    /// Subscribes to unsolicited events.
    fn events(&self) -> broadcast::Receiver<TransportEvent>;
}
