//! BLE Scanner Module
//!
//! Time-bounded discovery of robot peripherals. Each scan window starts from
//! an empty registry and publishes the full list every time it grows.

use crate::domain::models::{ConnectionStatus, PeripheralIdentity, ScanSnapshot};
use crate::domain::registry::DeviceRegistry;
use crate::infrastructure::bluetooth::error::BleError;
use crate::infrastructure::bluetooth::status::StatusHub;
use crate::infrastructure::bluetooth::transport::{BleTransport, TransportEvent};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What a call to [`BleScanner::start`] ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    Started,
    /// A scan was already running and has been stopped instead.
    Stopped,
}

struct ScanSession {
    id: u64,
    pump: JoinHandle<()>,
    timer: JoinHandle<()>,
}

struct ScanInner {
    transport: Arc<dyn BleTransport>,
    status: Arc<StatusHub>,
    registry: StdMutex<DeviceRegistry>,
    snapshots: broadcast::Sender<ScanSnapshot>,
    window: Duration,
    session: Mutex<Option<ScanSession>>,
    next_id: AtomicU64,
}

/// BLE Scanner for discovering robots
pub struct BleScanner {
    inner: Arc<ScanInner>,
}

impl BleScanner {
    /// Create a new scanner
    ///
    /// # Arguments
    /// * `window` - How long a scan runs before stopping on its own
    /// * `snapshot_capacity` - Snapshots buffered per lagging subscriber
    pub fn new(
        transport: Arc<dyn BleTransport>,
        status: Arc<StatusHub>,
        window: Duration,
        snapshot_capacity: usize,
    ) -> Self {
        let (snapshots, _) = broadcast::channel(snapshot_capacity.max(1));
        Self {
            inner: Arc::new(ScanInner {
                transport,
                status,
                registry: StdMutex::new(DeviceRegistry::new()),
                snapshots,
                window,
                session: Mutex::new(None),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Start scanning, or stop the running scan.
    pub async fn start(&self) -> Result<ScanOutcome, BleError> {
        let mut session = self.inner.session.lock().await;

        if let Some(running) = session.take() {
            info!("Scan already running, stopping it");
            running.timer.abort();
            self.inner.finish(running.pump).await?;
            return Ok(ScanOutcome::Stopped);
        }

        if !self.inner.transport.radio_enabled().await {
            warn!("Cannot scan: Bluetooth radio is off");
            return Err(BleError::RadioUnavailable);
        }

        let link = self.inner.status.link();
        if link.is_establishing() {
            warn!("Cannot scan while link is {:?}", link);
            return Err(BleError::RadioBusy(link));
        }

        // Subscribe first so no advertisement slips between start and pump
        let events = self.inner.transport.events();
        self.inner.transport.start_scan().await?;

        self.inner.reset_registry();
        self.inner.status.publish_scan(ConnectionStatus::Scanning);

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let window = self.inner.window;
        info!("Starting BLE scan #{} for {:?}", id, window);

        let pump = tokio::spawn(Arc::clone(&self.inner).pump(events));
        let timer = tokio::spawn({
            let inner = Arc::clone(&self.inner);
            async move {
                tokio::time::sleep(window).await;
                inner.expire(id).await;
            }
        });

        *session = Some(ScanSession { id, pump, timer });
        Ok(ScanOutcome::Started)
    }

    /// Stop scanning. A no-op when idle.
    pub async fn stop(&self) -> Result<(), BleError> {
        let mut session = self.inner.session.lock().await;
        match session.take() {
            Some(running) => {
                info!("Stopping BLE scan #{}", running.id);
                running.timer.abort();
                self.inner.finish(running.pump).await
            }
            None => Ok(()),
        }
    }

    /// Check if currently scanning
    pub async fn is_scanning(&self) -> bool {
        self.inner.session.lock().await.is_some()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScanSnapshot> {
        self.inner.snapshots.subscribe()
    }

    /// Devices found since the last scan start.
    pub fn snapshot(&self) -> ScanSnapshot {
        self.inner.lock_registry().snapshot()
    }
}

impl Drop for BleScanner {
    fn drop(&mut self) {
        if let Ok(mut session) = self.inner.session.try_lock() {
            if let Some(running) = session.take() {
                running.timer.abort();
                running.pump.abort();
            }
        }
    }
}

impl ScanInner {
    fn lock_registry(&self) -> std::sync::MutexGuard<'_, DeviceRegistry> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn reset_registry(&self) {
        let snapshot = {
            let mut registry = self.lock_registry();
            registry.clear();
            registry.snapshot()
        };
        let _ = self.snapshots.send(snapshot);
    }

    fn admit(&self, device: PeripheralIdentity) {
        let (snapshot, found) = {
            let mut registry = self.lock_registry();
            if !registry.admit(device.clone()) {
                return;
            }
            (registry.snapshot(), registry.len())
        };
        info!(
            "Discovered {} ({}), {} device(s) so far",
            device.display_name(),
            device.address,
            found
        );
        let _ = self.snapshots.send(snapshot);
    }

    async fn pump(self: Arc<Self>, mut events: broadcast::Receiver<TransportEvent>) {
        loop {
            match events.recv().await {
                Ok(TransportEvent::Discovered(device)) => self.admit(device),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Scanner lagged, {} transport events skipped", missed);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Auto-stop at the end of the window.
    async fn expire(&self, id: u64) {
        let mut session = self.session.lock().await;
        if session.as_ref().map(|s| s.id) != Some(id) {
            return;
        }
        if let Some(running) = session.take() {
            info!("Scan #{} window elapsed", id);
            // Leave the timer handle alone: it is the task running this.
            if let Err(e) = self.finish(running.pump).await {
                warn!("Failed to stop scan: {}", e);
            }
        }
    }

    async fn finish(&self, pump: JoinHandle<()>) -> Result<(), BleError> {
        pump.abort();
        let result = self.transport.stop_scan().await;
        if !self.status.publish_scan(ConnectionStatus::Disconnected) {
            debug!("Scan ended while a link is active, status left untouched");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::DeviceAddress;
    use crate::infrastructure::bluetooth::simulated::SimulatedTransport;

    fn setup(window_ms: u64) -> (Arc<SimulatedTransport>, Arc<StatusHub>, BleScanner) {
        let sim = Arc::new(SimulatedTransport::robot());
        let status = Arc::new(StatusHub::new(32));
        let scanner = BleScanner::new(
            sim.clone(),
            status.clone(),
            Duration::from_millis(window_ms),
            32,
        );
        (sim, status, scanner)
    }

    fn robot(raw: u64) -> PeripheralIdentity {
        PeripheralIdentity::new(DeviceAddress::new(raw), Some(format!("robot-{}", raw)))
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_start_publishes_full_snapshots() {
        let (sim, status, scanner) = setup(10_000);
        let mut status_rx = status.subscribe();
        let mut snapshots = scanner.subscribe();

        assert_eq!(scanner.start().await.unwrap(), ScanOutcome::Started);
        assert_eq!(status_rx.recv().await.unwrap(), ConnectionStatus::Scanning);
        assert!(snapshots.recv().await.unwrap().is_empty());

        sim.advertise(robot(1));
        sim.advertise(robot(2));
        sim.advertise(robot(1));
        settle().await;

        assert_eq!(snapshots.recv().await.unwrap().len(), 1);
        let full = snapshots.recv().await.unwrap();
        assert_eq!(
            full.iter().map(|d| d.address.as_u64()).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert!(snapshots.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_start_toggles_and_stop_is_noop_when_idle() {
        let (sim, status, scanner) = setup(10_000);

        scanner.stop().await.unwrap();
        assert_eq!(status.current(), ConnectionStatus::Uninitialized);

        assert_eq!(scanner.start().await.unwrap(), ScanOutcome::Started);
        assert_eq!(scanner.start().await.unwrap(), ScanOutcome::Stopped);
        assert!(!scanner.is_scanning().await);
        assert!(!sim.is_scanning());
        assert_eq!(status.current(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_radio_off_changes_nothing() {
        let (sim, status, scanner) = setup(10_000);
        sim.set_radio_enabled(false);

        assert_eq!(scanner.start().await, Err(BleError::RadioUnavailable));
        assert!(!scanner.is_scanning().await);
        assert_eq!(status.current(), ConnectionStatus::Uninitialized);
    }

    #[tokio::test]
    async fn test_refused_while_connecting() {
        let (_sim, status, scanner) = setup(10_000);
        status.publish_link(ConnectionStatus::ServiceDiscovery);

        assert_eq!(
            scanner.start().await,
            Err(BleError::RadioBusy(ConnectionStatus::ServiceDiscovery))
        );
    }

    #[tokio::test]
    async fn test_restart_resets_registry() {
        let (sim, _status, scanner) = setup(10_000);

        scanner.start().await.unwrap();
        sim.advertise(robot(5));
        settle().await;
        assert_eq!(scanner.snapshot().len(), 1);

        scanner.stop().await.unwrap();
        scanner.start().await.unwrap();
        assert!(scanner.snapshot().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_stop_after_window() {
        let (sim, status, scanner) = setup(10_000);
        let mut status_rx = status.subscribe();

        scanner.start().await.unwrap();
        assert_eq!(status_rx.recv().await.unwrap(), ConnectionStatus::Scanning);

        tokio::time::sleep(Duration::from_millis(9_999)).await;
        assert!(scanner.is_scanning().await);
        assert!(status_rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(2)).await;
        settle().await;
        assert!(!scanner.is_scanning().await);
        assert!(!sim.is_scanning());
        assert_eq!(status_rx.try_recv().unwrap(), ConnectionStatus::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_auto_stop() {
        let (_sim, status, scanner) = setup(10_000);
        let mut status_rx = status.subscribe();

        scanner.start().await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        scanner.stop().await.unwrap();
        assert_eq!(status_rx.recv().await.unwrap(), ConnectionStatus::Scanning);
        assert_eq!(status_rx.recv().await.unwrap(), ConnectionStatus::Disconnected);

        // A second scan must not be cut short by the first one's timer
        scanner.start().await.unwrap();
        tokio::time::sleep(Duration::from_secs(8)).await;
        settle().await;
        assert!(scanner.is_scanning().await);
        assert_eq!(status_rx.recv().await.unwrap(), ConnectionStatus::Scanning);
        assert!(status_rx.try_recv().is_err());
    }
}
