//! Bluetooth Service Module
//!
//! Main service that coordinates scanning, connection, command writes and
//! telemetry for the robot. This is the API the application layer uses.

use crate::domain::models::{
    ConnectionStatus, OutboundCommand, PeripheralIdentity, ScanSnapshot, TelemetryFrame,
};
use crate::domain::settings::LinkConfig;
use crate::infrastructure::bluetooth::{
    connection::{ConnectionActor, ConnectionHandle},
    dispatcher::{CommandDispatcher, Delivery},
    error::{BleError, DispatchError},
    notifications::{FrameStats, NotificationPipeline},
    scanner::{BleScanner, ScanOutcome},
    status::StatusHub,
    transport::BleTransport,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

/// Main Bluetooth service coordinating all BLE operations
///
/// Must be created inside a tokio runtime; it spawns the connection actor,
/// the command dispatcher and the notification pipeline.
pub struct BluetoothService {
    transport: Arc<dyn BleTransport>,
    status: Arc<StatusHub>,
    scanner: BleScanner,
    connection: ConnectionHandle,
    dispatcher: CommandDispatcher,
    pipeline: Arc<NotificationPipeline>,
    tasks: Vec<JoinHandle<()>>,
}

impl BluetoothService {
    /// Create a new Bluetooth service
    pub fn new(transport: Arc<dyn BleTransport>, config: LinkConfig) -> Self {
        let status = Arc::new(StatusHub::new(config.status_capacity));
        let scanner = BleScanner::new(
            Arc::clone(&transport),
            Arc::clone(&status),
            config.scan_window,
            config.snapshot_capacity,
        );

        let (connection, actor_task) =
            ConnectionActor::spawn(Arc::clone(&transport), Arc::clone(&status));
        let (dispatcher, dispatch_task) = CommandDispatcher::spawn(
            Arc::clone(&transport),
            connection.clone(),
            config.max_pending_must_deliver,
        );

        let pipeline = Arc::new(NotificationPipeline::new(
            config.min_frame_len,
            config.telemetry_capacity,
        ));
        let pipeline_task = Arc::clone(&pipeline).spawn(transport.events(), connection.endpoints());

        info!("Bluetooth service ready (scan window {:?})", config.scan_window);

        Self {
            transport,
            status,
            scanner,
            connection,
            dispatcher,
            pipeline,
            tasks: vec![actor_task, dispatch_task, pipeline_task],
        }
    }

    pub async fn is_radio_enabled(&self) -> bool {
        self.transport.radio_enabled().await
    }

    /// Start scanning for devices, or stop if a scan is running
    pub async fn start_scan(&self) -> Result<ScanOutcome, BleError> {
        self.scanner.start().await
    }

    /// Stop scanning
    pub async fn stop_scan(&self) -> Result<(), BleError> {
        self.scanner.stop().await
    }

    pub async fn is_scanning(&self) -> bool {
        self.scanner.is_scanning().await
    }

    /// Connect to a discovered device
    ///
    /// A running scan is stopped first. Returns once the attempt has started;
    /// watch [`connection_status`](Self::connection_status) for the outcome.
    pub async fn connect(&self, peripheral: PeripheralIdentity) -> Result<(), BleError> {
        if !self.transport.radio_enabled().await {
            return Err(BleError::RadioUnavailable);
        }
        self.scanner.stop().await?;
        self.connection.connect(peripheral).await
    }

    /// Disconnect from the current device
    pub async fn disconnect(&self) -> Result<(), BleError> {
        self.connection.disconnect().await
    }

    /// Send a command and wait for the robot to acknowledge it
    pub async fn send(&self, command: impl Into<OutboundCommand>) -> Result<(), DispatchError> {
        self.dispatcher.send(command.into()).await
    }

    /// Queue a command without waiting for its delivery
    pub fn submit(&self, command: impl Into<OutboundCommand>) -> Result<Delivery, DispatchError> {
        self.dispatcher.submit(command.into())
    }

    pub fn connection_status(&self) -> broadcast::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    pub fn current_status(&self) -> ConnectionStatus {
        self.status.current()
    }

    pub fn discovered_devices(&self) -> broadcast::Receiver<ScanSnapshot> {
        self.scanner.subscribe()
    }

    pub fn latest_snapshot(&self) -> ScanSnapshot {
        self.scanner.snapshot()
    }

    pub fn telemetry(&self) -> broadcast::Receiver<TelemetryFrame> {
        self.pipeline.subscribe()
    }

    pub fn frame_stats(&self) -> FrameStats {
        self.pipeline.stats()
    }

    /// Device of the current link, from the start of the attempt until it drops
    pub fn connected_device(&self) -> Option<PeripheralIdentity> {
        self.connection.connected_device()
    }

    /// Check if connected
    pub fn is_connected(&self) -> bool {
        self.status.link() == ConnectionStatus::Connected
    }
}

impl Drop for BluetoothService {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
