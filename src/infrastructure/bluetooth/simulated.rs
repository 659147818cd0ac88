//! In-process BLE transport
//!
//! A scripted stand-in for the platform stack, used to exercise the link
//! core without hardware. Tests drive it from the outside: advertise
//! peripherals, fail individual GATT steps, hold operations open and push
//! notifications.

use crate::domain::models::{
    DeviceAddress, GattEndpoint, GattService, PeripheralIdentity,
};
use crate::infrastructure::bluetooth::error::BleError;
use crate::infrastructure::bluetooth::protocol::{
    NOTIFY_CHAR_UUID, READ_CHAR_UUID, SERVICE_UUID, WRITE_CHAR_UUID,
};
use crate::infrastructure::bluetooth::transport::{BleTransport, TransportEvent};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::{broadcast, Semaphore};
use uuid::Uuid;

/// Holds an operation open until the test releases it.
#[derive(Debug)]
struct Gate {
    closed: AtomicBool,
    permits: Semaphore,
}

impl Gate {
    fn new() -> Self {
        Self {
            closed: AtomicBool::new(false),
            permits: Semaphore::new(0),
        }
    }

    async fn pass(&self) {
        if self.closed.load(Ordering::SeqCst) {
            if let Ok(permit) = self.permits.acquire().await {
                permit.forget();
            }
        }
    }
}

#[derive(Debug, Default)]
struct SimState {
    radio_enabled: bool,
    scanning: bool,
    services: Vec<GattService>,
    connected: Option<DeviceAddress>,
    connect_error: Option<BleError>,
    discovery_error: Option<BleError>,
    notify_error: Option<BleError>,
    write_error: Option<BleError>,
    connects: Vec<DeviceAddress>,
    disconnects: usize,
    subscriptions: Vec<GattEndpoint>,
    writes: Vec<Vec<u8>>,
}

pub struct SimulatedTransport {
    state: Mutex<SimState>,
    events: broadcast::Sender<TransportEvent>,
    connect_gate: Gate,
    discovery_gate: Gate,
    write_gate: Gate,
    outstanding: AtomicUsize,
    max_outstanding: AtomicUsize,
}

impl SimulatedTransport {
    /// A radio with no peripheral services configured.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            state: Mutex::new(SimState {
                radio_enabled: true,
                ..Default::default()
            }),
            events,
            connect_gate: Gate::new(),
            discovery_gate: Gate::new(),
            write_gate: Gate::new(),
            outstanding: AtomicUsize::new(0),
            max_outstanding: AtomicUsize::new(0),
        }
    }

    /// A radio whose peripherals expose the full robot control service.
    pub fn robot() -> Self {
        let transport = Self::new();
        transport.set_services(vec![GattService {
            uuid: SERVICE_UUID,
            characteristics: vec![READ_CHAR_UUID, NOTIFY_CHAR_UUID, WRITE_CHAR_UUID],
        }]);
        transport
    }

    pub fn set_radio_enabled(&self, enabled: bool) {
        self.lock().radio_enabled = enabled;
    }

    pub fn set_services(&self, services: Vec<GattService>) {
        self.lock().services = services;
    }

    /// Fails the next `connect` call.
    pub fn fail_next_connect(&self, error: BleError) {
        self.lock().connect_error = Some(error);
    }

    pub fn fail_next_discovery(&self, error: BleError) {
        self.lock().discovery_error = Some(error);
    }

    pub fn fail_next_subscribe(&self, error: BleError) {
        self.lock().notify_error = Some(error);
    }

    pub fn fail_next_write(&self, error: BleError) {
        self.lock().write_error = Some(error);
    }

    /// Makes `connect` wait for [`release_connects`](Self::release_connects).
    pub fn hold_connects(&self) {
        self.connect_gate.closed.store(true, Ordering::SeqCst);
    }

    pub fn release_connects(&self, n: usize) {
        self.connect_gate.permits.add_permits(n);
    }

    /// Makes `discover_services` wait for [`release_discovery`](Self::release_discovery).
    pub fn hold_discovery(&self) {
        self.discovery_gate.closed.store(true, Ordering::SeqCst);
    }

    pub fn release_discovery(&self, n: usize) {
        self.discovery_gate.permits.add_permits(n);
    }

    /// Makes every write wait for an acknowledgement released by the test.
    pub fn hold_writes(&self) {
        self.write_gate.closed.store(true, Ordering::SeqCst);
    }

    pub fn ack_writes(&self, n: usize) {
        self.write_gate.permits.add_permits(n);
    }

    /// Emits an advertisement. Ignored unless scanning, like a real radio.
    pub fn advertise(&self, peripheral: PeripheralIdentity) -> bool {
        if !self.lock().scanning {
            return false;
        }
        let _ = self.events.send(TransportEvent::Discovered(peripheral));
        true
    }

    /// Pushes a value on the telemetry characteristic.
    pub fn notify(&self, value: &[u8]) {
        self.notify_on(NOTIFY_CHAR_UUID, value);
    }

    pub fn notify_on(&self, characteristic: Uuid, value: &[u8]) {
        let _ = self.events.send(TransportEvent::Notification {
            characteristic,
            value: value.to_vec(),
        });
    }

    /// Simulates the peripheral going out of range.
    pub fn drop_link(&self) {
        let dropped = self.lock().connected.take();
        if let Some(address) = dropped {
            self.lose_link(address);
        }
    }

    /// Emits a loss notice for `address` without touching the current link,
    /// like a late callback from a link that was already replaced.
    pub fn lose_link(&self, address: DeviceAddress) {
        let _ = self.events.send(TransportEvent::LinkLost(address));
    }

    pub fn is_scanning(&self) -> bool {
        self.lock().scanning
    }

    pub fn connected(&self) -> Option<DeviceAddress> {
        self.lock().connected
    }

    pub fn connects(&self) -> Vec<DeviceAddress> {
        self.lock().connects.clone()
    }

    pub fn disconnects(&self) -> usize {
        self.lock().disconnects
    }

    pub fn subscriptions(&self) -> Vec<GattEndpoint> {
        self.lock().subscriptions.clone()
    }

    /// Every payload handed to `write`, in the order the writes started.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.lock().writes.clone()
    }

    /// Highest number of writes observed in flight at once.
    pub fn max_outstanding_writes(&self) -> usize {
        self.max_outstanding.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn require_link(&self) -> Result<(), BleError> {
        if self.lock().connected.is_some() {
            Ok(())
        } else {
            Err(BleError::transport("not connected"))
        }
    }
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BleTransport for SimulatedTransport {
    async fn radio_enabled(&self) -> bool {
        self.lock().radio_enabled
    }

    async fn start_scan(&self) -> Result<(), BleError> {
        let mut state = self.lock();
        if !state.radio_enabled {
            return Err(BleError::RadioUnavailable);
        }
        state.scanning = true;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        self.lock().scanning = false;
        Ok(())
    }

    async fn connect(&self, peripheral: &PeripheralIdentity) -> Result<(), BleError> {
        self.lock().connects.push(peripheral.address);
        self.connect_gate.pass().await;

        let mut state = self.lock();
        if let Some(err) = state.connect_error.take() {
            return Err(err);
        }
        state.connected = Some(peripheral.address);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BleError> {
        let mut state = self.lock();
        state.disconnects += 1;
        state.connected = None;
        Ok(())
    }

    async fn discover_services(&self) -> Result<Vec<GattService>, BleError> {
        self.require_link()?;
        self.discovery_gate.pass().await;

        let mut state = self.lock();
        if let Some(err) = state.discovery_error.take() {
            return Err(err);
        }
        Ok(state.services.clone())
    }

    async fn enable_notifications(&self, endpoint: &GattEndpoint) -> Result<(), BleError> {
        self.require_link()?;
        let mut state = self.lock();
        if let Some(err) = state.notify_error.take() {
            return Err(err);
        }
        state.subscriptions.push(*endpoint);
        Ok(())
    }

    async fn write(&self, _endpoint: &GattEndpoint, data: &[u8]) -> Result<(), BleError> {
        self.require_link()?;
        self.lock().writes.push(data.to_vec());

        let now = self.outstanding.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_outstanding.fetch_max(now, Ordering::SeqCst);
        self.write_gate.pass().await;
        self.outstanding.fetch_sub(1, Ordering::SeqCst);

        match self.lock().write_error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}
